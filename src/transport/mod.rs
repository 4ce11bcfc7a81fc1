//! Probe transports
//!
//! A transport opens a connection to a probe-attached target by serial number. The
//! connection locates the RTT control block, lists its channels and moves bytes. Every
//! call may block on hardware; callers serialize access (see [`crate::rtt::RttSession`]).

pub mod hardware;
pub mod simulated;

use async_trait::async_trait;

use crate::config::{BackendKind, Config};
use crate::error::TransportError;
use crate::probe::{ProbeDiscovery, ProbeInfo};
use crate::utils::{JLINK_PID, SEGGER_VID};
use crate::rtt::channel::{ChannelTable, Direction};

pub use hardware::{ProbeRsConnection, ProbeRsTransport};
pub use simulated::{SimulatedConnection, SimulatedProbe, SimulatedTarget};

/// Buffer handed to [`ProbeConnection::transfer`]; the variant selects the direction
#[derive(Debug)]
pub enum TransferBuffer<'a> {
    /// Read from an up channel into the buffer
    Up(&'a mut [u8]),
    /// Write the buffer to a down channel
    Down(&'a [u8]),
}

impl TransferBuffer<'_> {
    pub fn direction(&self) -> Direction {
        match self {
            TransferBuffer::Up(_) => Direction::Up,
            TransferBuffer::Down(_) => Direction::Down,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TransferBuffer::Up(buf) => buf.len(),
            TransferBuffer::Down(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opens connections to targets
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    type Connection: ProbeConnection;

    /// Connect to the target behind the probe with `serial_number`. Resets the target.
    async fn connect(&self, serial_number: u32) -> Result<Self::Connection, TransportError>;
}

/// An open connection to one target
#[async_trait]
pub trait ProbeConnection: Send {
    /// Look for the control block, at exactly `hint` when given, otherwise by scanning RAM.
    /// `Ok(None)` means not found yet; the firmware may still be initialising.
    async fn locate_control_block(&mut self, hint: Option<u64>) -> Result<Option<u64>, TransportError>;

    /// Channels described by the located control block
    async fn enumerate_channels(&mut self) -> Result<ChannelTable, TransportError>;

    /// Move bytes on `channel`; returns how many were transferred
    async fn transfer(
        &mut self,
        channel: u32,
        buffer: TransferBuffer<'_>,
    ) -> Result<usize, TransportError>;

    /// Release the probe
    async fn close(self) -> Result<(), TransportError>;
}

/// Transport chosen at runtime from configuration
pub enum Backend {
    ProbeRs(ProbeRsTransport),
    Simulated(SimulatedProbe),
}

impl Backend {
    pub fn from_config(config: &Config) -> Self {
        match config.probe.backend {
            BackendKind::ProbeRs => Backend::ProbeRs(ProbeRsTransport::new(config.probe.clone())),
            BackendKind::Simulated => Backend::Simulated(SimulatedProbe::demo()),
        }
    }

    /// Probes this backend can connect to
    pub fn list_probes(&self) -> Vec<ProbeInfo> {
        match self {
            Backend::ProbeRs(_) => ProbeDiscovery::list_probes(),
            Backend::Simulated(probe) => probe
                .serial_numbers()
                .into_iter()
                .map(|serial| ProbeInfo {
                    identifier: format!("Simulated probe {}", serial),
                    vendor_id: SEGGER_VID,
                    product_id: JLINK_PID,
                    serial_number: Some(serial.to_string()),
                    probe_type: "Simulated".to_string(),
                })
                .collect(),
        }
    }
}

pub enum BackendConnection {
    ProbeRs(ProbeRsConnection),
    Simulated(SimulatedConnection),
}

#[async_trait]
impl ProbeTransport for Backend {
    type Connection = BackendConnection;

    async fn connect(&self, serial_number: u32) -> Result<Self::Connection, TransportError> {
        match self {
            Backend::ProbeRs(transport) => transport
                .connect(serial_number)
                .await
                .map(BackendConnection::ProbeRs),
            Backend::Simulated(transport) => transport
                .connect(serial_number)
                .await
                .map(BackendConnection::Simulated),
        }
    }
}

#[async_trait]
impl ProbeConnection for BackendConnection {
    async fn locate_control_block(&mut self, hint: Option<u64>) -> Result<Option<u64>, TransportError> {
        match self {
            BackendConnection::ProbeRs(c) => c.locate_control_block(hint).await,
            BackendConnection::Simulated(c) => c.locate_control_block(hint).await,
        }
    }

    async fn enumerate_channels(&mut self) -> Result<ChannelTable, TransportError> {
        match self {
            BackendConnection::ProbeRs(c) => c.enumerate_channels().await,
            BackendConnection::Simulated(c) => c.enumerate_channels().await,
        }
    }

    async fn transfer(
        &mut self,
        channel: u32,
        buffer: TransferBuffer<'_>,
    ) -> Result<usize, TransportError> {
        match self {
            BackendConnection::ProbeRs(c) => c.transfer(channel, buffer).await,
            BackendConnection::Simulated(c) => c.transfer(channel, buffer).await,
        }
    }

    async fn close(self) -> Result<(), TransportError> {
        match self {
            BackendConnection::ProbeRs(c) => c.close().await,
            BackendConnection::Simulated(c) => c.close().await,
        }
    }
}
