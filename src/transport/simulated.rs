//! In-memory RTT target
//!
//! Models a microcontroller's RAM holding a real SEGGER control block, plus loopback
//! firmware that echoes every down channel onto the up channel with the same index.
//! The firmware runs one step before every transport call, which is enough to mirror how
//! a real target drains and fills its buffers between probe accesses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{transport_codes, TransportError};
use crate::rtt::channel::{ChannelTable, Direction};
use crate::rtt::control_block::{
    find_control_block, BufferDescriptor, ControlBlock, MemoryImage,
    TargetMemory, CONTROL_BLOCK_ID, DESCRIPTOR_SIZE, HEADER_SIZE, MAX_NAME_LEN,
};
use crate::transport::{ProbeConnection, ProbeTransport, TransferBuffer};

pub const RAM_BASE: u64 = 0x2000_0000;
pub const RAM_SIZE: usize = 0x1_0000;
pub const CONTROL_BLOCK_ADDRESS: u64 = RAM_BASE + 0x1000;

const NAMES_ADDRESS: u64 = RAM_BASE + 0x100;
const BUFFERS_ADDRESS: u64 = RAM_BASE + 0x2000;

/// Serial number of the target that [`SimulatedProbe::demo`] exposes
pub const DEMO_SERIAL: u32 = 682_000_001;

/// A channel pair the firmware sets up: one up and one down buffer sharing a name
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub size: u32,
}

impl ChannelSpec {
    pub fn new(name: &str, size: u32) -> Self {
        Self {
            name: name.to_string(),
            size,
        }
    }
}

/// A simulated target behind one probe
#[derive(Debug, Clone)]
pub struct SimulatedTarget {
    ram: MemoryImage,
    channels: Vec<ChannelSpec>,
    rtt_enabled: bool,
    loopback: bool,
    greeting: Option<Vec<u8>>,
    init_delay: Duration,
    fail_after: Option<usize>,
    booted_at: Option<Instant>,
    installed: bool,
    connected: bool,
    transfers: usize,
    resets: usize,
}

impl SimulatedTarget {
    /// Loopback firmware with one channel pair per spec
    pub fn loopback(channels: &[ChannelSpec]) -> Self {
        Self {
            ram: MemoryImage::new(RAM_BASE, RAM_SIZE),
            channels: channels.to_vec(),
            rtt_enabled: true,
            loopback: true,
            greeting: None,
            init_delay: Duration::ZERO,
            fail_after: None,
            booted_at: None,
            installed: false,
            connected: false,
            transfers: 0,
            resets: 0,
        }
    }

    /// Firmware that never sets up a control block
    pub fn without_rtt() -> Self {
        let mut target = Self::loopback(&[]);
        target.rtt_enabled = false;
        target
    }

    /// Bytes the firmware prints on up channel 0 right after boot
    pub fn with_greeting(mut self, greeting: &[u8]) -> Self {
        self.greeting = Some(greeting.to_vec());
        self
    }

    /// Time between reset and the control block becoming visible
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    /// Disable the echo so down channels only fill up
    pub fn without_loopback(mut self) -> Self {
        self.loopback = false;
        self
    }

    /// Drop the link on the transfer after `count` successful ones
    pub fn fail_transfers_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    fn reset(&mut self) {
        self.ram = MemoryImage::new(RAM_BASE, RAM_SIZE);
        self.booted_at = Some(Instant::now());
        self.installed = false;
        self.transfers = 0;
        self.resets += 1;
    }

    /// Lay out names, buffers and the control block the way `SEGGER_RTT_Init` does
    fn install_control_block(&mut self) -> Result<(), TransportError> {
        let count = self.channels.len() as u32;
        let cb = CONTROL_BLOCK_ADDRESS;
        self.ram.write_u32(cb + 16, count)?;
        self.ram.write_u32(cb + 20, count)?;

        let mut name_at = NAMES_ADDRESS;
        let mut buffer_at = BUFFERS_ADDRESS;
        for (i, spec) in self.channels.clone().iter().enumerate() {
            let mut name = spec.name.as_bytes()[..spec.name.len().min(MAX_NAME_LEN - 1)].to_vec();
            name.push(0);
            self.ram.write(name_at, &name)?;

            for slot in [i as u64, (count as usize + i) as u64] {
                let descriptor = cb + HEADER_SIZE as u64 + DESCRIPTOR_SIZE as u64 * slot;
                self.ram.write_u32(descriptor, name_at as u32)?;
                self.ram.write_u32(descriptor + 4, buffer_at as u32)?;
                self.ram.write_u32(descriptor + 8, spec.size)?;
                self.ram.write_u32(descriptor + 12, 0)?;
                self.ram.write_u32(descriptor + 16, 0)?;
                self.ram.write_u32(descriptor + 20, 0)?;
                buffer_at += spec.size as u64;
            }
            name_at += name.len() as u64;
        }

        // The ID goes in last so a host never sees a half-initialised block
        self.ram.write(cb, CONTROL_BLOCK_ID)?;
        self.installed = true;
        debug!("Simulated firmware installed control block at 0x{:08X}", cb);

        if let Some(greeting) = self.greeting.clone() {
            let block = ControlBlock::read_from(&mut self.ram, cb)?;
            if let Some(up) = block.descriptor(Direction::Up, 0) {
                up.write(&mut self.ram, &greeting)?;
            }
        }
        Ok(())
    }

    /// One firmware main-loop iteration
    fn service(&mut self) -> Result<(), TransportError> {
        if !self.rtt_enabled {
            return Ok(());
        }
        if !self.installed {
            let booted = self.booted_at.map(|t| t.elapsed() >= self.init_delay).unwrap_or(false);
            if !booted {
                return Ok(());
            }
            self.install_control_block()?;
        }
        if self.loopback {
            let block = ControlBlock::read_from(&mut self.ram, CONTROL_BLOCK_ADDRESS)?;
            for (up, down) in block.up.iter().zip(block.down.iter()) {
                echo(&mut self.ram, down, up)?;
            }
        }
        Ok(())
    }
}

fn echo(ram: &mut MemoryImage, from: &BufferDescriptor, to: &BufferDescriptor) -> Result<(), TransportError> {
    let room = to.free(ram)? as usize;
    if room == 0 {
        return Ok(());
    }
    let mut pending = vec![0u8; room];
    let count = from.read(ram, &mut pending)?;
    to.write(ram, &pending[..count])?;
    Ok(())
}

/// A set of simulated probes keyed by serial number
#[derive(Debug, Clone, Default)]
pub struct SimulatedProbe {
    targets: Arc<Mutex<HashMap<u32, SimulatedTarget>>>,
}

impl SimulatedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// One loopback target on [`DEMO_SERIAL`] that greets on boot
    pub fn demo() -> Self {
        Self::new().with_target(
            DEMO_SERIAL,
            SimulatedTarget::loopback(&[ChannelSpec::new("Terminal", 1024)])
                .with_greeting(b"RTT loopback ready\n"),
        )
    }

    pub fn with_target(self, serial_number: u32, target: SimulatedTarget) -> Self {
        lock(&self.targets).insert(serial_number, target);
        self
    }

    pub fn serial_numbers(&self) -> Vec<u32> {
        let mut serials: Vec<_> = lock(&self.targets).keys().copied().collect();
        serials.sort_unstable();
        serials
    }

    pub fn is_connected(&self, serial_number: u32) -> bool {
        lock(&self.targets)
            .get(&serial_number)
            .map(|t| t.connected)
            .unwrap_or(false)
    }

    /// How many times the target has been reset by a connect
    pub fn reset_count(&self, serial_number: u32) -> usize {
        lock(&self.targets)
            .get(&serial_number)
            .map(|t| t.resets)
            .unwrap_or(0)
    }
}

fn lock(targets: &Mutex<HashMap<u32, SimulatedTarget>>) -> MutexGuard<'_, HashMap<u32, SimulatedTarget>> {
    // A panic in another test thread must not wedge the remaining ones
    targets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ProbeTransport for SimulatedProbe {
    type Connection = SimulatedConnection;

    async fn connect(&self, serial_number: u32) -> Result<SimulatedConnection, TransportError> {
        let mut targets = lock(&self.targets);
        let target = targets.get_mut(&serial_number).ok_or_else(|| {
            TransportError::new(
                transport_codes::PROBE_NOT_FOUND,
                format!("No probe with serial number {} is connected", serial_number),
            )
        })?;
        if target.connected {
            return Err(TransportError::new(
                transport_codes::PROBE_OPEN_FAILED,
                format!("Probe {} is already in use", serial_number),
            ));
        }
        target.connected = true;
        target.reset();
        info!("Simulated probe {} connected, target reset", serial_number);

        Ok(SimulatedConnection {
            serial_number,
            targets: self.targets.clone(),
            control_block: None,
        })
    }
}

/// Connection to one simulated target
#[derive(Debug)]
pub struct SimulatedConnection {
    serial_number: u32,
    targets: Arc<Mutex<HashMap<u32, SimulatedTarget>>>,
    control_block: Option<ControlBlock>,
}

impl SimulatedConnection {
    fn with_target<R>(
        &self,
        f: impl FnOnce(&mut SimulatedTarget) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut targets = lock(&self.targets);
        let target = targets.get_mut(&self.serial_number).ok_or_else(|| {
            TransportError::new(
                transport_codes::LINK_LOST,
                format!("Probe {} disappeared", self.serial_number),
            )
        })?;
        f(target)
    }
}

#[async_trait]
impl ProbeConnection for SimulatedConnection {
    async fn locate_control_block(&mut self, hint: Option<u64>) -> Result<Option<u64>, TransportError> {
        let located = self.with_target(|target| {
            target.service()?;
            let address = match hint {
                Some(address) => {
                    if !target.ram.contains(address, HEADER_SIZE) {
                        return Err(TransportError::new(
                            transport_codes::MEMORY_ACCESS_FAILED,
                            format!("0x{:08X} is not in target RAM", address),
                        ));
                    }
                    let mut id = [0u8; 16];
                    target.ram.read(address, &mut id)?;
                    if &id != CONTROL_BLOCK_ID {
                        return Ok(None);
                    }
                    address
                }
                None => match find_control_block(target.ram.as_bytes(), target.ram.base()) {
                    Some(address) => address,
                    None => return Ok(None),
                },
            };
            Ok(Some(ControlBlock::read_from(&mut target.ram, address)?))
        })?;

        let address = located.as_ref().map(|cb| cb.address);
        self.control_block = located;
        Ok(address)
    }

    async fn enumerate_channels(&mut self) -> Result<ChannelTable, TransportError> {
        let block = self.control_block.clone().ok_or_else(|| {
            TransportError::new(transport_codes::RTT_FAILED, "Control block has not been located")
        })?;
        self.with_target(|target| Ok(block.channels(&mut target.ram)?))
    }

    async fn transfer(
        &mut self,
        channel: u32,
        buffer: TransferBuffer<'_>,
    ) -> Result<usize, TransportError> {
        let block = self.control_block.clone().ok_or_else(|| {
            TransportError::new(transport_codes::RTT_FAILED, "Control block has not been located")
        })?;
        let direction = buffer.direction();
        let descriptor = block.descriptor(direction, channel).cloned().ok_or_else(|| {
            TransportError::new(
                transport_codes::RTT_FAILED,
                format!("No {} buffer {} in control block", direction, channel),
            )
        })?;

        self.with_target(|target| {
            if let Some(limit) = target.fail_after {
                if target.transfers >= limit {
                    warn!("Simulated probe {} dropping link", self.serial_number);
                    return Err(TransportError::new(
                        transport_codes::LINK_LOST,
                        "Lost connection to the probe",
                    ));
                }
            }
            target.transfers += 1;
            target.service()?;
            let moved = match buffer {
                TransferBuffer::Up(out) => descriptor.read(&mut target.ram, out)?,
                TransferBuffer::Down(data) => descriptor.write(&mut target.ram, data)?,
            };
            Ok(moved)
        })
    }

    async fn close(self) -> Result<(), TransportError> {
        info!("Simulated probe {} disconnected", self.serial_number);
        Ok(())
    }
}

impl Drop for SimulatedConnection {
    fn drop(&mut self) {
        if let Some(target) = lock(&self.targets).get_mut(&self.serial_number) {
            target.connected = false;
        }
    }
}
