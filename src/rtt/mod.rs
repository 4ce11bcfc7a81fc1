//! RTT (Real-Time Transfer) sessions
//!
//! Control block layout, channel types and the session manager that drives a probe
//! transport through start, read, write and stop.

pub mod channel;
pub mod control_block;
pub mod elf_parser;
pub mod session;

pub use channel::{ChannelInfo, ChannelTable, Direction, ReadResult, WriteData, WriteResult};
pub use elf_parser::control_block_address_from_elf;
pub use session::{
    OperationLog, RttSession, SessionInfo, SessionOptions, SessionSlot, StartOptions, Status,
};
