//! RTT session manager
//!
//! One [`RttSession`] owns at most one open probe connection. Every operation takes the
//! session's internal lock for its whole duration, so concurrent calls are queued and run
//! to completion one at a time in the order they were submitted (tokio's mutex is FIFO
//! fair). Nothing is retried here: a read that finds no data returns empty, and a write
//! reports exactly how many bytes the target buffer accepted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::RttConfig;
use crate::error::{ErrorCode, Operation, Result, RttError, Traced, TracedError, TransportError};
use crate::rtt::channel::{ChannelTable, Direction, ReadResult, WriteData, WriteResult};
use crate::transport::{ProbeConnection, ProbeTransport, TransferBuffer};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Stopped,
    Starting,
    Active,
    Stopping,
}

/// Options for [`RttSession::start`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    /// Only accept a control block at exactly this address
    pub control_block_location: Option<u64>,
}

impl StartOptions {
    pub fn at(address: u64) -> Self {
        Self {
            control_block_location: Some(address),
        }
    }
}

/// Timing knobs of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// How long start keeps looking for the control block after connecting
    pub control_block_timeout: Duration,
    pub poll_interval: Duration,
    /// Longest wait behind other calls before failing with [`RttError::Busy`]
    pub queue_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&RttConfig::default())
    }
}

impl From<&RttConfig> for SessionOptions {
    fn from(config: &RttConfig) -> Self {
        Self {
            control_block_timeout: config.control_block_timeout(),
            poll_interval: config.poll_interval(),
            queue_timeout: config.queue_timeout(),
        }
    }
}

/// Claim on "the" active RTT session. Sessions sharing a slot exclude each other.
#[derive(Debug, Clone, Default)]
pub struct SessionSlot(Arc<AtomicBool>);

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot shared by every session created with [`RttSession::new`]
    pub fn global() -> Self {
        static GLOBAL: OnceLock<SessionSlot> = OnceLock::new();
        GLOBAL.get_or_init(SessionSlot::new).clone()
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Diagnostic trace of the most recent operation
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    lines: Vec<String>,
}

impl OperationLog {
    fn reset(&mut self) {
        self.lines.clear();
    }

    fn record(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!("{}", line);
        self.lines.push(line);
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Snapshot of a session for status reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub status: Status,
    pub serial_number: Option<u32>,
    pub control_block_address: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub down_channels: usize,
    pub up_channels: usize,
}

struct Inner<C> {
    status: Status,
    connection: Option<C>,
    serial_number: Option<u32>,
    control_block_address: Option<u64>,
    started_at: Option<Instant>,
    started_wall: Option<DateTime<Utc>>,
    channels: ChannelTable,
    log: OperationLog,
}

impl<C> Inner<C> {
    fn new() -> Self {
        Self {
            status: Status::Stopped,
            connection: None,
            serial_number: None,
            control_block_address: None,
            started_at: None,
            started_wall: None,
            channels: ChannelTable::default(),
            log: OperationLog::default(),
        }
    }

    /// Start instant of the active session, or `NotStarted`
    fn active_since(&self) -> Result<Instant> {
        match (self.status, self.started_at) {
            (Status::Active, Some(started_at)) => Ok(started_at),
            _ => Err(RttError::NotStarted),
        }
    }
}

struct Discovered<C> {
    connection: C,
    address: u64,
    channels: ChannelTable,
    started_at: Instant,
}

/// RTT session over a probe transport
pub struct RttSession<T: ProbeTransport> {
    transport: T,
    options: SessionOptions,
    slot: SessionSlot,
    inner: Mutex<Inner<T::Connection>>,
}

impl<T: ProbeTransport> RttSession<T> {
    /// Session bound to the process-wide slot: only one can be active at a time
    pub fn new(transport: T, options: SessionOptions) -> Self {
        Self::with_slot(transport, options, SessionSlot::global())
    }

    pub fn with_slot(transport: T, options: SessionOptions, slot: SessionSlot) -> Self {
        Self {
            transport,
            options,
            slot,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Inner<T::Connection>>> {
        match self.options.queue_timeout {
            Some(limit) => tokio::time::timeout(limit, self.inner.lock()).await.map_err(|_| {
                warn!("RTT call waited more than {:?} behind other calls", limit);
                RttError::Busy
            }),
            None => Ok(self.inner.lock().await),
        }
    }

    /// Connect to the target behind `serial_number`, find its control block and list channels.
    ///
    /// The target is reset by the connect. On failure the connection is released and the
    /// session stays stopped. If the returned future is dropped before it completes the
    /// session is left `Starting`; [`RttSession::stop`] releases it.
    pub async fn start(&self, serial_number: u32, options: StartOptions) -> Result<ChannelTable> {
        self.start_traced(serial_number, options).await.map_err(|failure| failure.error)
    }

    /// [`RttSession::start`], with the trace of a failed attempt attached to the error
    pub async fn start_traced(&self, serial_number: u32, options: StartOptions) -> Traced<ChannelTable> {
        let mut guard = self.lock().await?;
        guard.log.reset();
        let result = self.start_locked(&mut guard, serial_number, options).await;
        result.map_err(|error| TracedError::new(error, &guard.log))
    }

    async fn start_locked(
        &self,
        inner: &mut Inner<T::Connection>,
        serial_number: u32,
        options: StartOptions,
    ) -> Result<ChannelTable> {
        if inner.status != Status::Stopped {
            inner.log.record(format!("Start refused: session is {:?}", inner.status));
            return Err(RttError::AlreadyStarted);
        }
        if !self.slot.try_claim() {
            inner.log.record("Start refused: another RTT session is active in this process");
            return Err(RttError::AlreadyStarted);
        }

        inner.status = Status::Starting;
        info!("Starting RTT session on probe {}", serial_number);

        match self.open(&mut inner.log, serial_number, &options).await {
            Ok(discovered) => {
                inner.connection = Some(discovered.connection);
                inner.serial_number = Some(serial_number);
                inner.control_block_address = Some(discovered.address);
                inner.channels = discovered.channels.clone();
                inner.started_at = Some(discovered.started_at);
                inner.started_wall = Some(Utc::now());
                inner.status = Status::Active;
                info!(
                    "RTT session active: {} down, {} up channels",
                    discovered.channels.down.len(),
                    discovered.channels.up.len()
                );
                Ok(discovered.channels)
            }
            Err(e) => {
                error!("Failed to start RTT session on probe {}: {}", serial_number, e);
                inner.status = Status::Stopped;
                self.slot.release();
                Err(e)
            }
        }
    }

    async fn open(
        &self,
        log: &mut OperationLog,
        serial_number: u32,
        options: &StartOptions,
    ) -> Result<Discovered<T::Connection>> {
        log.record(format!("Connecting to probe {}", serial_number));
        let mut connection = self
            .transport
            .connect(serial_number)
            .await
            .map_err(|source| {
                log.record(format!("Connect failed: {}", source));
                RttError::Transport {
                    operation: Operation::Connect,
                    code: ErrorCode::CouldNotConnectToDevice,
                    source,
                }
            })?;
        log.record("Connected, target reset");

        let discovered = self.discover(&mut connection, log, options).await;
        match discovered {
            Ok((address, channels, started_at)) => Ok(Discovered {
                connection,
                address,
                channels,
                started_at,
            }),
            Err(e) => {
                if let Err(close_error) = connection.close().await {
                    warn!("Failed to release probe after failed start: {}", close_error);
                    log.record(format!("Release failed: {}", close_error));
                }
                Err(e)
            }
        }
    }

    async fn discover(
        &self,
        connection: &mut T::Connection,
        log: &mut OperationLog,
        options: &StartOptions,
    ) -> Result<(u64, ChannelTable, Instant)> {
        let pinned = options.control_block_location;
        let started_at = Instant::now();
        let deadline = started_at + self.options.control_block_timeout;

        match pinned {
            Some(address) => log.record(format!("Checking for control block at 0x{:08X}", address)),
            None => log.record("Scanning RAM for control block"),
        }

        let address = loop {
            match connection.locate_control_block(pinned).await {
                Ok(Some(address)) => break address,
                Ok(None) => {}
                Err(source) => {
                    log.record(format!("Control block lookup failed: {}", source));
                    return Err(match pinned {
                        Some(address) => RttError::ControlBlockNotAtAddress {
                            address,
                            reason: source.to_string(),
                        },
                        None => RttError::Transport {
                            operation: Operation::LocateControlBlock,
                            code: ErrorCode::CouldNotStartRtt,
                            source,
                        },
                    });
                }
            }

            if Instant::now() >= deadline {
                let waited_ms = started_at.elapsed().as_millis() as u64;
                log.record(format!("No control block after {} ms", waited_ms));
                return Err(match pinned {
                    Some(address) => RttError::ControlBlockNotAtAddress {
                        address,
                        reason: format!("no control block identifier after {} ms", waited_ms),
                    },
                    None => RttError::ControlBlockNotFound { waited_ms },
                });
            }
            tokio::time::sleep(self.options.poll_interval).await;
        };
        log.record(format!("Control block found at 0x{:08X}", address));

        let channels = connection.enumerate_channels().await.map_err(|source| {
            log.record(format!("Channel enumeration failed: {}", source));
            RttError::Transport {
                operation: Operation::EnumerateChannels,
                code: ErrorCode::CouldNotGetChannelInformation,
                source,
            }
        })?;
        log.record(format!(
            "Found {} down and {} up channels",
            channels.down.len(),
            channels.up.len()
        ));
        if channels.is_empty() {
            warn!("Control block at 0x{:08X} describes no channels", address);
        }

        Ok((address, channels, started_at))
    }

    /// Close the connection. Fails with `NotStarted` when nothing is open.
    pub async fn stop(&self) -> Result<()> {
        self.stop_traced().await.map_err(|failure| failure.error)
    }

    pub async fn stop_traced(&self) -> Traced<()> {
        let mut guard = self.lock().await?;
        guard.log.reset();
        let result = self.stop_locked(&mut guard).await;
        result.map_err(|error| TracedError::new(error, &guard.log))
    }

    async fn stop_locked(&self, inner: &mut Inner<T::Connection>) -> Result<()> {
        if inner.status == Status::Stopped {
            inner.log.record("Stop refused: no RTT session is open");
            return Err(RttError::NotStarted);
        }

        inner.status = Status::Stopping;
        inner.log.record("Stopping RTT session");
        self.teardown(inner).await.map_err(|source| RttError::Transport {
            operation: Operation::Stop,
            code: ErrorCode::CouldNotCallFunction,
            source,
        })?;
        info!("RTT session stopped");
        Ok(())
    }

    /// Back to `Stopped` no matter what; reports the close failure, if any
    async fn teardown(&self, inner: &mut Inner<T::Connection>) -> std::result::Result<(), TransportError> {
        let connection = inner.connection.take();
        inner.status = Status::Stopped;
        inner.serial_number = None;
        inner.control_block_address = None;
        inner.started_at = None;
        inner.started_wall = None;
        inner.channels.clear();
        self.slot.release();

        match connection {
            Some(connection) => connection.close().await.inspect_err(|e| {
                inner.log.record(format!("Release failed: {}", e));
            }),
            None => Ok(()),
        }
    }

    /// Read whatever is buffered on up channel `channel_index`, at most `max_length` bytes.
    /// An empty result means no data was buffered.
    pub async fn read(&self, channel_index: u32, max_length: usize) -> Result<ReadResult> {
        self.read_traced(channel_index, max_length).await.map_err(|failure| failure.error)
    }

    pub async fn read_traced(&self, channel_index: u32, max_length: usize) -> Traced<ReadResult> {
        let mut guard = self.lock().await?;
        guard.log.reset();
        let result = self.read_locked(&mut guard, channel_index, max_length).await;
        result.map_err(|error| TracedError::new(error, &guard.log))
    }

    async fn read_locked(
        &self,
        inner: &mut Inner<T::Connection>,
        channel_index: u32,
        max_length: usize,
    ) -> Result<ReadResult> {
        let started_at = inner.active_since()?;
        let capacity = match inner.channels.get(Direction::Up, channel_index) {
            Some(channel) => channel.size as usize,
            None => {
                inner.log.record(format!("Up channel {} is unknown", channel_index));
                return Err(RttError::UnknownChannel {
                    direction: Direction::Up,
                    index: channel_index,
                });
            }
        };

        let elapsed_us = started_at.elapsed().as_micros() as u64;
        // A ring never holds more than its size, so larger requests cannot return more
        let mut buffer = vec![0u8; max_length.min(capacity)];
        let transfer = TransferBuffer::Up(&mut buffer);
        if transfer.is_empty() {
            return Ok(ReadResult::new(Vec::new(), elapsed_us));
        }

        let connection = inner.connection.as_mut().ok_or(RttError::NotStarted)?;
        let outcome = connection.transfer(channel_index, transfer).await;

        match outcome {
            Ok(count) => {
                buffer.truncate(count);
                inner.log.record(format!("Read {} bytes from up channel {}", count, channel_index));
                Ok(ReadResult::new(buffer, elapsed_us))
            }
            Err(source) => Err(self.fail_transfer(inner, Operation::Read, source).await),
        }
    }

    /// Write to down channel `channel_index`. Returns how many bytes the target buffer took,
    /// which is less than the payload when the buffer is full.
    pub async fn write(&self, channel_index: u32, data: impl Into<WriteData>) -> Result<WriteResult> {
        self.write_traced(channel_index, data).await.map_err(|failure| failure.error)
    }

    pub async fn write_traced(&self, channel_index: u32, data: impl Into<WriteData>) -> Traced<WriteResult> {
        let data = data.into();
        let mut guard = self.lock().await?;
        guard.log.reset();
        let result = self.write_locked(&mut guard, channel_index, data).await;
        result.map_err(|error| TracedError::new(error, &guard.log))
    }

    async fn write_locked(
        &self,
        inner: &mut Inner<T::Connection>,
        channel_index: u32,
        data: WriteData,
    ) -> Result<WriteResult> {
        let started_at = inner.active_since()?;
        if inner.channels.get(Direction::Down, channel_index).is_none() {
            inner.log.record(format!("Down channel {} is unknown", channel_index));
            return Err(RttError::UnknownChannel {
                direction: Direction::Down,
                index: channel_index,
            });
        }

        let elapsed_us = started_at.elapsed().as_micros() as u64;
        if data.is_empty() {
            return Ok(WriteResult { bytes_written: 0, elapsed_us });
        }

        let connection = inner.connection.as_mut().ok_or(RttError::NotStarted)?;
        let outcome = connection
            .transfer(channel_index, TransferBuffer::Down(data.as_bytes()))
            .await;

        match outcome {
            Ok(bytes_written) => {
                inner.log.record(format!(
                    "Wrote {} of {} bytes to down channel {}",
                    bytes_written,
                    data.len(),
                    channel_index
                ));
                Ok(WriteResult { bytes_written, elapsed_us })
            }
            Err(source) => Err(self.fail_transfer(inner, Operation::Write, source).await),
        }
    }

    /// A failed transfer leaves the link in an unknown state, so the session is torn down
    async fn fail_transfer(
        &self,
        inner: &mut Inner<T::Connection>,
        operation: Operation,
        source: TransportError,
    ) -> RttError {
        error!("RTT {} failed, closing session: {}", operation, source);
        inner.log.record(format!("{} failed: {}", operation, source));
        if let Err(close_error) = self.teardown(inner).await {
            warn!("Failed to release probe after transfer error: {}", close_error);
        }
        RttError::Transport {
            operation,
            code: ErrorCode::CouldNotCallFunction,
            source,
        }
    }

    pub async fn status(&self) -> Status {
        self.inner.lock().await.status
    }

    /// Channels discovered by the active session
    pub async fn channels(&self) -> Result<ChannelTable> {
        let inner = self.lock().await?;
        inner.active_since()?;
        Ok(inner.channels.clone())
    }

    pub async fn info(&self) -> SessionInfo {
        let inner = self.inner.lock().await;
        SessionInfo {
            status: inner.status,
            serial_number: inner.serial_number,
            control_block_address: inner.control_block_address,
            started_at: inner.started_wall,
            down_channels: inner.channels.down.len(),
            up_channels: inner.channels.up.len(),
        }
    }

    /// Diagnostic trace of the most recent operation
    pub async fn last_log(&self) -> String {
        self.inner.lock().await.log.text()
    }
}

impl<T: ProbeTransport> Drop for RttSession<T> {
    fn drop(&mut self) {
        if self.inner.get_mut().status != Status::Stopped {
            // The connection itself is released by its own drop
            self.slot.release();
        }
    }
}
