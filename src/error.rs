//! Error types for RTT sessions and the MCP server

use serde::Serialize;
use thiserror::Error;

use crate::rtt::channel::Direction;

/// Main error type for RTT session operations
#[derive(Error, Debug)]
pub enum RttError {
    #[error("There is no RTT connection open")]
    NotStarted,

    #[error("An RTT session is already active")]
    AlreadyStarted,

    #[error("{direction} channel {index} was not discovered in this session")]
    UnknownChannel { direction: Direction, index: u32 },

    #[error("RTT control block not found after {waited_ms} ms")]
    ControlBlockNotFound { waited_ms: u64 },

    #[error("No RTT control block at 0x{address:08X}: {reason}")]
    ControlBlockNotAtAddress { address: u64, reason: String },

    #[error("{operation} failed: {source}")]
    Transport {
        operation: Operation,
        code: ErrorCode,
        #[source]
        source: TransportError,
    },

    #[error("Could not execute the function due to too many calls in line")]
    Busy,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("ELF error: {0}")]
    Elf(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, RttError>;

/// Coarse classification of an [`RttError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller misuse; never touches hardware
    Usage,
    /// Control block could not be located
    Discovery,
    /// The probe link reported a failure
    Transport,
    /// Too many calls queued ahead; retrying later may succeed
    Load,
    /// Configuration, file system or serialization
    Environment,
}

impl RttError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RttError::NotStarted
            | RttError::AlreadyStarted
            | RttError::UnknownChannel { .. } => ErrorKind::Usage,
            RttError::Busy => ErrorKind::Load,
            RttError::ControlBlockNotFound { .. } | RttError::ControlBlockNotAtAddress { .. } => {
                ErrorKind::Discovery
            }
            RttError::Transport { .. } => ErrorKind::Transport,
            RttError::InvalidConfig(_)
            | RttError::Elf(_)
            | RttError::Io(_)
            | RttError::Serialization(_) => ErrorKind::Environment,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            RttError::NotStarted => ErrorCode::NotInitialized,
            RttError::AlreadyStarted => ErrorCode::CouldNotStartRtt,
            RttError::UnknownChannel { .. } => ErrorCode::CouldNotCallFunction,
            RttError::ControlBlockNotFound { .. } | RttError::ControlBlockNotAtAddress { .. } => {
                ErrorCode::CouldNotFindControlBlock
            }
            RttError::Transport { code, .. } => *code,
            RttError::Busy => ErrorCode::CouldNotExecuteDueToLoad,
            RttError::InvalidConfig(_)
            | RttError::Elf(_)
            | RttError::Io(_)
            | RttError::Serialization(_) => ErrorCode::CouldNotCallFunction,
        }
    }

    /// Low-level diagnostic of the transport, if the failure came from there
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            RttError::Transport { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Build the report returned to callers, attaching the operation's trace
    pub fn report(&self, operation: Operation, log: &str) -> ErrorReport {
        let code = self.code();
        let operation = match self {
            RttError::Transport { operation, .. } => *operation,
            _ => operation,
        };
        let transport = self.transport_error();
        ErrorReport {
            errno: code.errno(),
            errcode: code.name().to_string(),
            erroroperation: operation.to_string(),
            errmsg: self.to_string(),
            lowlevel_error_no: transport.map(|t| t.code),
            lowlevel_error: transport.map(|t| t.message.clone()),
            log: log.to_string(),
        }
    }
}

/// Error codes exposed to callers, numbered as the nrfjprog RTT bindings number them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    CouldNotLoadHighlevelLibrary,
    CouldNotOpenHighlevelLibrary,
    CouldNotGetDeviceInformation,
    CouldNotLoadLibrary,
    CouldNotOpenLibrary,
    CouldNotConnectToDevice,
    CouldNotStartRtt,
    CouldNotFindControlBlock,
    CouldNotGetChannelInformation,
    CouldNotCallFunction,
    NotInitialized,
    CouldNotExecuteDueToLoad,
}

impl ErrorCode {
    pub fn errno(self) -> i32 {
        match self {
            ErrorCode::Success => 0,
            ErrorCode::CouldNotLoadHighlevelLibrary => 1,
            ErrorCode::CouldNotOpenHighlevelLibrary => 2,
            ErrorCode::CouldNotGetDeviceInformation => 3,
            ErrorCode::CouldNotLoadLibrary => 4,
            ErrorCode::CouldNotOpenLibrary => 5,
            ErrorCode::CouldNotConnectToDevice => 6,
            ErrorCode::CouldNotStartRtt => 7,
            ErrorCode::CouldNotFindControlBlock => 8,
            ErrorCode::CouldNotGetChannelInformation => 9,
            ErrorCode::CouldNotCallFunction => 10,
            ErrorCode::NotInitialized => 11,
            ErrorCode::CouldNotExecuteDueToLoad => 12,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Success => "RTTSuccess",
            ErrorCode::CouldNotLoadHighlevelLibrary => "RTTCouldNotLoadHighlevelLibrary",
            ErrorCode::CouldNotOpenHighlevelLibrary => "RTTCouldNotOpenHighlevelLibrary",
            ErrorCode::CouldNotGetDeviceInformation => "RTTCouldNotGetDeviceInformation",
            ErrorCode::CouldNotLoadLibrary => "RTTCouldNotLoadnRFjprogLibrary",
            ErrorCode::CouldNotOpenLibrary => "RTTCouldNotOpennRFjprogLibrary",
            ErrorCode::CouldNotConnectToDevice => "RTTCouldNotConnectToDevice",
            ErrorCode::CouldNotStartRtt => "RTTCouldNotStartRTT",
            ErrorCode::CouldNotFindControlBlock => "RTTCouldNotFindControlBlock",
            ErrorCode::CouldNotGetChannelInformation => "RTTCouldNotGetChannelInformation",
            ErrorCode::CouldNotCallFunction => "RTTCouldNotCallFunction",
            ErrorCode::NotInitialized => "RTTNotInitialized",
            ErrorCode::CouldNotExecuteDueToLoad => "RTTCouldNotExecuteDueToLoad",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::CouldNotLoadHighlevelLibrary => "Could Not Load Highlevel Library",
            ErrorCode::CouldNotOpenHighlevelLibrary => "Could Not Open Highlevel Library",
            ErrorCode::CouldNotGetDeviceInformation => "Could Not Get Device Information",
            ErrorCode::CouldNotLoadLibrary => "Could Not Load nRFjprog Library",
            ErrorCode::CouldNotOpenLibrary => "Could Not Open nRFjprog Library",
            ErrorCode::CouldNotConnectToDevice => "Could Not Connect To Device",
            ErrorCode::CouldNotStartRtt => "Could Not Start RTT",
            ErrorCode::CouldNotFindControlBlock => "Could Not Find Control Block",
            ErrorCode::CouldNotGetChannelInformation => "Could Not Get Channel Information",
            ErrorCode::CouldNotCallFunction => "Could Not Call Function",
            ErrorCode::NotInitialized => "There is no RTT connection open",
            ErrorCode::CouldNotExecuteDueToLoad => {
                "Could not execute the function due to too many calls in line"
            }
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.message())
    }
}

/// Internal step of a session operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Connect,
    LocateControlBlock,
    EnumerateChannels,
    Read,
    Write,
    Stop,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Start => "start",
            Operation::Connect => "connect",
            Operation::LocateControlBlock => "locate_control_block",
            Operation::EnumerateChannels => "enumerate_channels",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// Failure reported by a probe transport, passed through verbatim
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct TransportError {
    pub code: i32,
    pub message: String,
}

impl TransportError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Transport error codes used by the bundled backends
pub mod transport_codes {
    pub const PROBE_NOT_FOUND: i32 = -1;
    pub const PROBE_OPEN_FAILED: i32 = -2;
    pub const TARGET_ATTACH_FAILED: i32 = -3;
    pub const MEMORY_ACCESS_FAILED: i32 = -4;
    pub const RTT_FAILED: i32 = -5;
    pub const LINK_LOST: i32 = -6;
    pub const PROBE_ERROR: i32 = -7;
}

impl From<probe_rs::Error> for TransportError {
    fn from(error: probe_rs::Error) -> Self {
        TransportError::new(transport_codes::PROBE_ERROR, error.to_string())
    }
}

impl From<probe_rs::probe::DebugProbeError> for TransportError {
    fn from(error: probe_rs::probe::DebugProbeError) -> Self {
        TransportError::new(transport_codes::PROBE_OPEN_FAILED, error.to_string())
    }
}

impl From<probe_rs::rtt::Error> for TransportError {
    fn from(error: probe_rs::rtt::Error) -> Self {
        TransportError::new(transport_codes::RTT_FAILED, error.to_string())
    }
}

/// Error payload handed back to callers of the session operations
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub errno: i32,
    pub errcode: String,
    pub erroroperation: String,
    pub errmsg: String,
    pub lowlevel_error_no: Option<i32>,
    pub lowlevel_error: Option<String>,
    pub log: String,
}

/// A failed session operation together with the trace it recorded
#[derive(Error, Debug)]
#[error("{error}")]
pub struct TracedError {
    #[source]
    pub error: RttError,
    pub log: String,
}

/// Result of a session operation that keeps its trace on failure
pub type Traced<T> = std::result::Result<T, TracedError>;

impl TracedError {
    pub fn new(error: RttError, log: &crate::rtt::OperationLog) -> Self {
        Self {
            error,
            log: log.text(),
        }
    }

    pub fn report(&self, operation: Operation) -> ErrorReport {
        self.error.report(operation, &self.log)
    }
}

/// Failures before the operation ran (e.g. `Busy`) have no trace
impl From<RttError> for TracedError {
    fn from(error: RttError) -> Self {
        Self {
            error,
            log: String::new(),
        }
    }
}
