//! Probe identification and address parsing helpers

pub const SEGGER_VID: u16 = 0x1366;
pub const JLINK_PID: u16 = 0x0101;
const ARM_DAPLINK_VID: u16 = 0x0D28;
const ST_VID: u16 = 0x0483;
const ST_LINK_PIDS: [u16; 3] = [0x3748, 0x374A, 0x374B];
const BLACKMAGIC: (u16, u16) = (0x1D50, 0x6018);
const FTDI_VID: u16 = 0x0403;

/// Debug probe family, detected from USB vendor and product IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeType {
    JLink,
    DapLink,
    StLink,
    Blackmagic,
    Ftdi,
    Unknown,
}

impl ProbeType {
    pub fn from_vid_pid(vendor_id: u16, product_id: u16) -> Self {
        match vendor_id {
            SEGGER_VID => ProbeType::JLink,
            ARM_DAPLINK_VID => ProbeType::DapLink,
            ST_VID if ST_LINK_PIDS.contains(&product_id) => ProbeType::StLink,
            FTDI_VID => ProbeType::Ftdi,
            _ if (vendor_id, product_id) == BLACKMAGIC => ProbeType::Blackmagic,
            _ => ProbeType::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProbeType::JLink => "J-Link",
            ProbeType::DapLink => "DAPLink",
            ProbeType::StLink => "ST-Link",
            ProbeType::Blackmagic => "Black Magic Probe",
            ProbeType::Ftdi => "FTDI",
            ProbeType::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ProbeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Parse an address given as `0x`-prefixed hex or decimal
pub fn parse_address(addr_str: &str) -> Result<u64, String> {
    let addr_str = addr_str.trim();

    if let Some(hex) = addr_str.strip_prefix("0x").or_else(|| addr_str.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|e| format!("Invalid hex address: {}", e))
    } else {
        addr_str.parse::<u64>()
            .map_err(|e| format!("Invalid decimal address: {}", e))
    }
}
