//! RTT Link
//!
//! Talks to firmware through SEGGER RTT (Real-Time Transfer) buffers over a debug probe.
//! [`rtt::RttSession`] manages one session: start, read, write and stop, serialized in call
//! order. The `rtt-link` binary exposes it as a Model Context Protocol server.

pub mod config;
pub mod error;
pub mod utils;
pub mod probe;
pub mod rtt;
pub mod transport;
pub mod tools;

pub use error::{ErrorCode, Operation, Result, RttError, TracedError, TransportError};
pub use config::Config;
pub use rtt::{RttSession, SessionOptions, StartOptions, Status};
pub use tools::RttToolHandler;
