//! SEGGER RTT control block layout and host-side ring buffer access
//!
//! Layout on a 32-bit little-endian target:
//!
//! ```text
//! 0x00  char acID[16]            "SEGGER RTT" padded with NUL
//! 0x10  i32  MaxNumUpBuffers
//! 0x14  i32  MaxNumDownBuffers
//! 0x18  SEGGER_RTT_BUFFER_UP   aUp[MaxNumUpBuffers]
//!       SEGGER_RTT_BUFFER_DOWN aDown[MaxNumDownBuffers]
//! ```
//!
//! Each buffer descriptor is `sName`, `pBuffer`, `SizeOfBuffer`, `WrOff`, `RdOff`, `Flags`,
//! all 32-bit. The writer owns `WrOff`, the reader owns `RdOff`; one byte of every buffer is
//! kept free so that `WrOff == RdOff` always means empty.

use thiserror::Error;
use tracing::{debug, trace};

use crate::error::{transport_codes, TransportError};
use crate::rtt::channel::{ChannelInfo, ChannelTable, Direction};

/// Identifier at the start of every control block
pub const CONTROL_BLOCK_ID: &[u8; 16] = b"SEGGER RTT\0\0\0\0\0\0";

pub const HEADER_SIZE: usize = 24;
pub const DESCRIPTOR_SIZE: usize = 24;

/// Longest channel name read from the target, terminator included
pub const MAX_NAME_LEN: usize = 32;

/// Upper bound on channel counts before the header is treated as garbage
pub const MAX_CHANNELS: u32 = 255;

const OFFSET_NAME: u64 = 0;
const OFFSET_BUFFER: u64 = 4;
const OFFSET_SIZE: u64 = 8;
const OFFSET_WRITE: u64 = 12;
const OFFSET_READ: u64 = 16;
const OFFSET_FLAGS: u64 = 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlBlockError {
    #[error("control block identifier mismatch")]
    BadSignature,

    #[error("control block truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("implausible channel counts (up {up}, down {down})")]
    TooManyChannels { up: i32, down: i32 },

    #[error("{direction} buffer {index} is corrupt: {reason}")]
    CorruptDescriptor {
        direction: Direction,
        index: u32,
        reason: String,
    },

    #[error(transparent)]
    Memory(#[from] TransportError),
}

impl From<ControlBlockError> for TransportError {
    fn from(error: ControlBlockError) -> Self {
        match error {
            ControlBlockError::Memory(e) => e,
            other => TransportError::new(transport_codes::RTT_FAILED, other.to_string()),
        }
    }
}

/// Byte-addressed access to target memory
pub trait TargetMemory {
    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<(), TransportError>;
    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), TransportError>;

    fn read_u32(&mut self, address: u64) -> Result<u32, TransportError> {
        let mut word = [0u8; 4];
        self.read(address, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    fn write_u32(&mut self, address: u64, value: u32) -> Result<(), TransportError> {
        self.write(address, &value.to_le_bytes())
    }
}

/// A contiguous region of target RAM held on the host
#[derive(Debug, Clone)]
pub struct MemoryImage {
    base: u64,
    bytes: Vec<u8>,
}

impl MemoryImage {
    pub fn new(base: u64, len: usize) -> Self {
        Self {
            base,
            bytes: vec![0; len],
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn contains(&self, address: u64, len: usize) -> bool {
        address
            .checked_add(len as u64)
            .is_some_and(|end| address >= self.base && end <= self.end())
    }

    fn range(&self, address: u64, len: usize) -> Result<std::ops::Range<usize>, TransportError> {
        if !self.contains(address, len) {
            return Err(TransportError::new(
                transport_codes::MEMORY_ACCESS_FAILED,
                format!(
                    "access of {} bytes at 0x{:08X} outside RAM 0x{:08X}..0x{:08X}",
                    len,
                    address,
                    self.base,
                    self.end()
                ),
            ));
        }
        let start = (address - self.base) as usize;
        Ok(start..start + len)
    }
}

impl TargetMemory for MemoryImage {
    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<(), TransportError> {
        let range = self.range(address, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), TransportError> {
        let range = self.range(address, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }
}

/// One up or down buffer descriptor as found in the control block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub direction: Direction,
    pub index: u32,
    /// Address of the descriptor itself, used to refresh the offsets
    pub address: u64,
    pub name_ptr: u32,
    pub buffer_ptr: u32,
    pub size: u32,
    pub write_offset: u32,
    pub read_offset: u32,
    pub flags: u32,
}

impl BufferDescriptor {
    fn parse(direction: Direction, index: u32, address: u64, raw: &[u8]) -> Self {
        let word = |offset: u64| {
            let at = offset as usize;
            u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
        };
        Self {
            direction,
            index,
            address,
            name_ptr: word(OFFSET_NAME),
            buffer_ptr: word(OFFSET_BUFFER),
            size: word(OFFSET_SIZE),
            write_offset: word(OFFSET_WRITE),
            read_offset: word(OFFSET_READ),
            flags: word(OFFSET_FLAGS),
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> ControlBlockError {
        ControlBlockError::CorruptDescriptor {
            direction: self.direction,
            index: self.index,
            reason: reason.into(),
        }
    }

    /// A descriptor with no buffer is an unused slot
    pub fn is_configured(&self) -> bool {
        self.buffer_ptr != 0 && self.size != 0
    }

    fn check_offsets(&self, write: u32, read: u32) -> Result<(), ControlBlockError> {
        if write >= self.size || read >= self.size {
            return Err(self.corrupt(format!(
                "offsets out of range (write {}, read {}, size {})",
                write, read, self.size
            )));
        }
        Ok(())
    }

    fn used(&self, write: u32, read: u32) -> u32 {
        if write >= read {
            write - read
        } else {
            self.size - read + write
        }
    }

    /// Bytes currently buffered, from live offsets
    pub fn available<M: TargetMemory + ?Sized>(&self, mem: &mut M) -> Result<u32, ControlBlockError> {
        let write = mem.read_u32(self.address + OFFSET_WRITE)?;
        let read = mem.read_u32(self.address + OFFSET_READ)?;
        self.check_offsets(write, read)?;
        Ok(self.used(write, read))
    }

    /// Space left for the writer, from live offsets
    pub fn free<M: TargetMemory + ?Sized>(&self, mem: &mut M) -> Result<u32, ControlBlockError> {
        Ok(self.size - 1 - self.available(mem)?)
    }

    /// Consume up to `out.len()` bytes starting at `RdOff`; returns how many were copied
    pub fn read<M: TargetMemory + ?Sized>(
        &self,
        mem: &mut M,
        out: &mut [u8],
    ) -> Result<usize, ControlBlockError> {
        if !self.is_configured() {
            return Err(self.corrupt("buffer not configured"));
        }
        let write = mem.read_u32(self.address + OFFSET_WRITE)?;
        let read = mem.read_u32(self.address + OFFSET_READ)?;
        self.check_offsets(write, read)?;

        let count = (self.used(write, read) as usize).min(out.len());
        if count == 0 {
            return Ok(0);
        }

        let first = count.min((self.size - read) as usize);
        mem.read(self.buffer_ptr as u64 + read as u64, &mut out[..first])?;
        if count > first {
            mem.read(self.buffer_ptr as u64, &mut out[first..count])?;
        }

        let next = ((read as usize + count) % self.size as usize) as u32;
        mem.write_u32(self.address + OFFSET_READ, next)?;
        trace!(
            "{} buffer {}: read {} bytes, RdOff {} -> {}",
            self.direction, self.index, count, read, next
        );
        Ok(count)
    }

    /// Append as much of `data` as fits at `WrOff`; returns how many bytes were accepted
    pub fn write<M: TargetMemory + ?Sized>(
        &self,
        mem: &mut M,
        data: &[u8],
    ) -> Result<usize, ControlBlockError> {
        if !self.is_configured() {
            return Err(self.corrupt("buffer not configured"));
        }
        let write = mem.read_u32(self.address + OFFSET_WRITE)?;
        let read = mem.read_u32(self.address + OFFSET_READ)?;
        self.check_offsets(write, read)?;

        let free = self.size - 1 - self.used(write, read);
        let count = (free as usize).min(data.len());
        if count == 0 {
            return Ok(0);
        }

        let first = count.min((self.size - write) as usize);
        mem.write(self.buffer_ptr as u64 + write as u64, &data[..first])?;
        if count > first {
            mem.write(self.buffer_ptr as u64, &data[first..count])?;
        }

        let next = ((write as usize + count) % self.size as usize) as u32;
        mem.write_u32(self.address + OFFSET_WRITE, next)?;
        trace!(
            "{} buffer {}: wrote {} bytes, WrOff {} -> {}",
            self.direction, self.index, count, write, next
        );
        Ok(count)
    }
}

/// A parsed control block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlBlock {
    pub address: u64,
    pub up: Vec<BufferDescriptor>,
    pub down: Vec<BufferDescriptor>,
}

impl ControlBlock {
    /// Size in bytes of a control block with the given channel counts
    pub fn byte_len(max_up: u32, max_down: u32) -> usize {
        HEADER_SIZE + DESCRIPTOR_SIZE * (max_up + max_down) as usize
    }

    /// Read and parse the control block at `address`
    pub fn read_from<M: TargetMemory + ?Sized>(
        mem: &mut M,
        address: u64,
    ) -> Result<Self, ControlBlockError> {
        let mut header = [0u8; HEADER_SIZE];
        mem.read(address, &mut header)?;
        let (max_up, max_down) = parse_header(&header)?;

        let mut bytes = vec![0u8; Self::byte_len(max_up, max_down)];
        mem.read(address, &mut bytes)?;
        parse_control_block(address, &bytes)
    }

    pub fn descriptor(&self, direction: Direction, index: u32) -> Option<&BufferDescriptor> {
        let descriptors = match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        };
        descriptors.get(index as usize)
    }

    /// Channel listing with names resolved from target memory. Unused slots are skipped.
    pub fn channels<M: TargetMemory + ?Sized>(
        &self,
        mem: &mut M,
    ) -> Result<ChannelTable, ControlBlockError> {
        let mut table = ChannelTable::default();
        for descriptor in self.up.iter().chain(self.down.iter()) {
            if !descriptor.is_configured() {
                continue;
            }
            let name = if descriptor.name_ptr == 0 {
                String::new()
            } else {
                read_c_string(mem, descriptor.name_ptr as u64, MAX_NAME_LEN)?
            };
            let info = ChannelInfo {
                channel_index: descriptor.index,
                direction: descriptor.direction,
                name,
                size: descriptor.size,
            };
            match descriptor.direction {
                Direction::Up => table.up.push(info),
                Direction::Down => table.down.push(info),
            }
        }
        Ok(table)
    }
}

fn parse_header(bytes: &[u8]) -> Result<(u32, u32), ControlBlockError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ControlBlockError::Truncated {
            needed: HEADER_SIZE,
            got: bytes.len(),
        });
    }
    if &bytes[..CONTROL_BLOCK_ID.len()] != CONTROL_BLOCK_ID {
        return Err(ControlBlockError::BadSignature);
    }
    let up = i32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let down = i32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    if up < 0 || down < 0 || up as u32 > MAX_CHANNELS || down as u32 > MAX_CHANNELS {
        return Err(ControlBlockError::TooManyChannels { up, down });
    }
    Ok((up as u32, down as u32))
}

/// Parse a control block from a byte image that starts at `address`
pub fn parse_control_block(address: u64, bytes: &[u8]) -> Result<ControlBlock, ControlBlockError> {
    let (max_up, max_down) = parse_header(bytes)?;
    let needed = ControlBlock::byte_len(max_up, max_down);
    if bytes.len() < needed {
        return Err(ControlBlockError::Truncated {
            needed,
            got: bytes.len(),
        });
    }

    let descriptor_at = |slot: u32, direction: Direction, index: u32| {
        let start = HEADER_SIZE + DESCRIPTOR_SIZE * slot as usize;
        BufferDescriptor::parse(
            direction,
            index,
            address + start as u64,
            &bytes[start..start + DESCRIPTOR_SIZE],
        )
    };

    let up: Vec<_> = (0..max_up)
        .map(|i| descriptor_at(i, Direction::Up, i))
        .collect();
    let down: Vec<_> = (0..max_down)
        .map(|i| descriptor_at(max_up + i, Direction::Down, i))
        .collect();

    for descriptor in up.iter().chain(down.iter()) {
        if descriptor.is_configured() {
            descriptor.check_offsets(descriptor.write_offset, descriptor.read_offset)?;
        }
    }

    debug!(
        "Parsed control block at 0x{:08X}: {} up, {} down",
        address, max_up, max_down
    );
    Ok(ControlBlock { address, up, down })
}

/// Scan a RAM image for the control block identifier at 4-byte aligned addresses
pub fn find_control_block(memory: &[u8], base: u64) -> Option<u64> {
    let id_len = CONTROL_BLOCK_ID.len();
    if memory.len() < id_len {
        return None;
    }
    let first = ((4 - (base % 4)) % 4) as usize;
    (first..=memory.len() - id_len)
        .step_by(4)
        .find(|&offset| &memory[offset..offset + id_len] == CONTROL_BLOCK_ID)
        .map(|offset| base + offset as u64)
}

/// Read a NUL-terminated string of at most `max` bytes, terminator included
pub fn read_c_string<M: TargetMemory + ?Sized>(
    mem: &mut M,
    address: u64,
    max: usize,
) -> Result<String, TransportError> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    for offset in 0..max.saturating_sub(1) {
        mem.read(address + offset as u64, &mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
