//! Control block address lookup from firmware ELF files
//!
//! The SEGGER RTT library places its control block in a global named `_SEGGER_RTT`.
//! Reading that symbol lets start pin the exact address instead of scanning RAM.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{Result, RttError};

/// Symbol of the control block in firmware built with SEGGER RTT
pub const RTT_SYMBOL_NAME: &str = "_SEGGER_RTT";

/// Cortex-M SRAM alias region
const RAM_START: u64 = 0x2000_0000;
const RAM_END: u64 = 0x2FFF_FFFF;

/// Address of `_SEGGER_RTT` in the ELF file at `elf_path`
pub fn control_block_address_from_elf(elf_path: &Path) -> Result<u64> {
    debug!("Parsing ELF file for RTT symbol: {}", elf_path.display());

    let elf_data = std::fs::read(elf_path).map_err(|e| {
        RttError::Elf(format!("Failed to read ELF file {}: {}", elf_path.display(), e))
    })?;

    match control_block_address(&elf_data)? {
        Some(address) => {
            info!("Found {} at 0x{:08X} in {}", RTT_SYMBOL_NAME, address, elf_path.display());
            Ok(address)
        }
        None => Err(RttError::Elf(format!(
            "{} symbol not found in {}. Firmware may not have RTT enabled or symbols may be stripped.",
            RTT_SYMBOL_NAME,
            elf_path.display()
        ))),
    }
}

/// Address of `_SEGGER_RTT` in an in-memory ELF image, `None` if the symbol is absent
pub fn control_block_address(elf_data: &[u8]) -> Result<Option<u64>> {
    let elf = goblin::elf::Elf::parse(elf_data)
        .map_err(|e| RttError::Elf(format!("Failed to parse ELF file: {}", e)))?;
    debug!("ELF entry 0x{:08X}, {} symbols", elf.entry, elf.syms.len());

    let address = elf
        .syms
        .iter()
        .find(|sym| elf.strtab.get_at(sym.st_name) == Some(RTT_SYMBOL_NAME))
        .map(|sym| sym.st_value);

    if let Some(address) = address {
        if !is_ram_address(address) {
            warn!(
                "{} at 0x{:08X} is outside the usual RAM range 0x{:08X}-0x{:08X}",
                RTT_SYMBOL_NAME, address, RAM_START, RAM_END
            );
        }
    }
    Ok(address)
}

fn is_ram_address(address: u64) -> bool {
    (RAM_START..=RAM_END).contains(&address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_range() {
        assert!(is_ram_address(0x2000_0000));
        assert!(is_ram_address(0x2000_A000));
        assert!(!is_ram_address(0x0800_0000)); // flash
        assert!(!is_ram_address(0x4000_0000)); // peripherals
    }

    #[test]
    fn test_garbage_is_not_an_elf() {
        let err = control_block_address(b"definitely not an ELF file").unwrap_err();
        assert!(matches!(err, RttError::Elf(_)));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = control_block_address_from_elf(Path::new("/nonexistent/firmware.elf")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/firmware.elf"));
    }
}
