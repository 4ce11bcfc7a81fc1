//! Hardware transport using the probe-rs RTT API

use async_trait::async_trait;
use probe_rs::rtt::{Rtt, ScanRegion};
use probe_rs::{MemoryInterface, Permissions, Session};
use tracing::{debug, error, info, warn};

use crate::config::ProbeConfig;
use crate::error::{transport_codes, TransportError};
use crate::probe::discovery::ProbeDiscovery;
use crate::rtt::channel::{ChannelInfo, ChannelTable, Direction};
use crate::rtt::control_block::CONTROL_BLOCK_ID;
use crate::transport::{ProbeConnection, ProbeTransport, TransferBuffer};

/// Connects to real probes (J-Link, ST-Link, CMSIS-DAP, ...) through probe-rs
#[derive(Debug, Clone)]
pub struct ProbeRsTransport {
    settings: ProbeConfig,
}

impl ProbeRsTransport {
    pub fn new(settings: ProbeConfig) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ProbeTransport for ProbeRsTransport {
    type Connection = ProbeRsConnection;

    async fn connect(&self, serial_number: u32) -> Result<ProbeRsConnection, TransportError> {
        debug!("Connecting to probe {} for target '{}'", serial_number, self.settings.target_chip);

        let probe_info = ProbeDiscovery::find_by_serial(serial_number)?;
        info!("Opening probe: {}", probe_info.identifier);

        let mut probe = probe_info.open().map_err(|e| {
            error!("Failed to open probe '{}': {}", probe_info.identifier, e);
            TransportError::from(e)
        })?;

        match probe.set_speed(self.settings.speed_khz) {
            Ok(actual) => debug!("Probe speed set to {} kHz", actual),
            Err(e) => warn!("Could not set probe speed to {} kHz: {}", self.settings.speed_khz, e),
        }

        let mut session = probe
            .attach(self.settings.target_chip.as_str(), Permissions::default())
            .map_err(|e| {
                error!("Failed to attach to target '{}': {}", self.settings.target_chip, e);
                TransportError::new(
                    transport_codes::TARGET_ATTACH_FAILED,
                    format!("Failed to attach to target '{}': {}", self.settings.target_chip, e),
                )
            })?;

        if self.settings.reset_on_connect {
            let mut core = session.core(0)?;
            core.reset()?;
            debug!("Target reset after attach");
        }

        info!("Connected to probe {} ({})", serial_number, self.settings.target_chip);
        Ok(ProbeRsConnection {
            serial_number,
            session,
            rtt: None,
        })
    }
}

/// An attached probe-rs session with its RTT instance once located
pub struct ProbeRsConnection {
    serial_number: u32,
    session: Session,
    rtt: Option<Rtt>,
}

impl std::fmt::Debug for ProbeRsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRsConnection")
            .field("serial_number", &self.serial_number)
            .field("rtt_attached", &self.rtt.is_some())
            .finish()
    }
}

fn not_located() -> TransportError {
    TransportError::new(transport_codes::RTT_FAILED, "Control block has not been located")
}

#[async_trait]
impl ProbeConnection for ProbeRsConnection {
    async fn locate_control_block(&mut self, hint: Option<u64>) -> Result<Option<u64>, TransportError> {
        let mut core = self.session.core(0)?;

        let region = match hint {
            Some(address) => {
                // Verify the identifier first so a wrong pin never turns into a scan
                let mut id = [0u8; 16];
                core.read(address, &mut id).map_err(|e| {
                    TransportError::new(
                        transport_codes::MEMORY_ACCESS_FAILED,
                        format!("Failed to read control block at 0x{:08X}: {}", address, e),
                    )
                })?;
                if &id != CONTROL_BLOCK_ID {
                    debug!("No RTT identifier at 0x{:08X}, found: {:02X?}", address, &id[..10]);
                    return Ok(None);
                }
                ScanRegion::Exact(address)
            }
            None => ScanRegion::Ram,
        };

        debug!("Attempting RTT attach with scan region: {:?}", region);
        match Rtt::attach_region(&mut core, &region) {
            Ok(rtt) => {
                let address = hint.unwrap_or(rtt.ptr() as u64);
                info!("Attached to RTT control block at 0x{:08X}", address);
                self.rtt = Some(rtt);
                Ok(Some(address))
            }
            Err(probe_rs::rtt::Error::ControlBlockNotFound) => {
                debug!("RTT control block not found yet");
                Ok(None)
            }
            Err(e) => {
                error!("RTT attachment failed: {}", e);
                Err(e.into())
            }
        }
    }

    async fn enumerate_channels(&mut self) -> Result<ChannelTable, TransportError> {
        let rtt = self.rtt.as_mut().ok_or_else(not_located)?;
        let mut table = ChannelTable::default();

        for (i, channel) in rtt.up_channels().iter().enumerate() {
            table.up.push(ChannelInfo {
                channel_index: i as u32,
                direction: Direction::Up,
                name: channel.name().unwrap_or_default().to_string(),
                size: channel.buffer_size() as u32,
            });
        }
        for (i, channel) in rtt.down_channels().iter().enumerate() {
            table.down.push(ChannelInfo {
                channel_index: i as u32,
                direction: Direction::Down,
                name: channel.name().unwrap_or_default().to_string(),
                size: channel.buffer_size() as u32,
            });
        }

        info!(
            "RTT channels: {} up, {} down",
            table.up.len(),
            table.down.len()
        );
        Ok(table)
    }

    async fn transfer(
        &mut self,
        channel: u32,
        buffer: TransferBuffer<'_>,
    ) -> Result<usize, TransportError> {
        let rtt = self.rtt.as_mut().ok_or_else(not_located)?;
        let mut core = self.session.core(0)?;

        match buffer {
            TransferBuffer::Up(out) => {
                let up_channel = rtt.up_channels().get_mut(channel as usize).ok_or_else(|| {
                    TransportError::new(transport_codes::RTT_FAILED, format!("Up channel {} not found", channel))
                })?;
                let read = up_channel.read(&mut core, out)?;
                if read > 0 {
                    debug!("Read {} bytes from RTT up channel {}", read, channel);
                }
                Ok(read)
            }
            TransferBuffer::Down(data) => {
                let down_channel = rtt.down_channels().get_mut(channel as usize).ok_or_else(|| {
                    TransportError::new(transport_codes::RTT_FAILED, format!("Down channel {} not found", channel))
                })?;
                let written = down_channel.write(&mut core, data)?;
                debug!("Wrote {} bytes to RTT down channel {}", written, channel);
                Ok(written)
            }
        }
    }

    async fn close(self) -> Result<(), TransportError> {
        let serial_number = self.serial_number;
        drop(self.rtt);
        drop(self.session);
        info!("Probe {} released", serial_number);
        Ok(())
    }
}
