//! Debug probe enumeration

pub mod discovery;

pub use discovery::{ProbeDiscovery, ProbeInfo};
