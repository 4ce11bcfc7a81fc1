//! Debug probe discovery and lookup by serial number

use probe_rs::probe::list::Lister;
use probe_rs::probe::DebugProbeInfo;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{transport_codes, TransportError};
use crate::utils::ProbeType;

/// Information about a discovered debug probe
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeInfo {
    pub identifier: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub probe_type: String,
}

impl From<&DebugProbeInfo> for ProbeInfo {
    fn from(probe_info: &DebugProbeInfo) -> Self {
        let probe_type = ProbeType::from_vid_pid(probe_info.vendor_id, probe_info.product_id);
        ProbeInfo {
            identifier: probe_info.identifier.clone(),
            vendor_id: probe_info.vendor_id,
            product_id: probe_info.product_id,
            serial_number: probe_info.serial_number.clone(),
            probe_type: probe_type.to_string(),
        }
    }
}

/// Debug probe discovery utility
pub struct ProbeDiscovery;

impl ProbeDiscovery {
    /// List all available debug probes
    pub fn list_probes() -> Vec<ProbeInfo> {
        debug!("Discovering debug probes");

        let probes: Vec<ProbeInfo> = Lister::new().list_all().iter().map(ProbeInfo::from).collect();

        info!("Found {} debug probes", probes.len());
        for probe in &probes {
            debug!("  {} - {} ({})",
                   probe.identifier,
                   probe.probe_type,
                   probe.serial_number.as_deref().unwrap_or("no serial"));
        }
        probes
    }

    /// Find the probe whose serial number equals `serial_number`
    pub fn find_by_serial(serial_number: u32) -> Result<DebugProbeInfo, TransportError> {
        debug!("Finding probe with serial number {}", serial_number);

        let mut matching: Vec<DebugProbeInfo> = Lister::new()
            .list_all()
            .into_iter()
            .filter(|probe| {
                probe
                    .serial_number
                    .as_deref()
                    .map(|serial| serial_matches(serial, serial_number))
                    .unwrap_or(false)
            })
            .collect();

        if matching.is_empty() {
            return Err(TransportError::new(
                transport_codes::PROBE_NOT_FOUND,
                format!("No probe with serial number {} is connected", serial_number),
            ));
        }
        if matching.len() > 1 {
            warn!("Multiple probes report serial number {}, using the first one", serial_number);
        }
        Ok(matching.remove(0))
    }
}

/// Serial strings are compared by numeric value so that J-Link's zero padding
/// ("000683123456") matches 683123456
pub fn serial_matches(reported: &str, serial_number: u32) -> bool {
    let reported = reported.trim();
    match reported.parse::<u64>() {
        Ok(value) => value == u64::from(serial_number),
        Err(_) => reported == serial_number.to_string(),
    }
}
