//! RTT MCP tools
//!
//! A single tool handler built on the RMCP 0.3.2 router macros.

pub mod rtt_tools;
pub mod types;

pub use rtt_tools::RttToolHandler;
pub use types::*;
