//! Type definitions for RTT MCP tools

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::rtt::{ReadResult, WriteData};

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListProbesArgs {
    // No parameters needed
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RttStartArgs {
    /// Serial number of the debug probe (as printed on J-Link, e.g. 683123456)
    pub serial_number: u32,
    /// Exact RTT control block address, e.g. "0x20000400". RAM is scanned when omitted.
    pub control_block_location: Option<String>,
    /// Firmware ELF file; the address of `_SEGGER_RTT` is used as control block location
    pub elf_path: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RttStopArgs {
    // No parameters needed
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RttReadArgs {
    /// Up channel index (0 is the default terminal)
    #[serde(default)]
    pub channel_index: u32,
    /// Maximum bytes to read
    #[serde(default = "default_read_length")]
    pub length: usize,
}

fn default_read_length() -> usize { 1024 }

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RttWriteArgs {
    /// Down channel index (0 is the default terminal)
    #[serde(default)]
    pub channel_index: u32,
    /// Data to write
    pub data: String,
    /// Data encoding: "utf8", "hex", "binary"
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

fn default_encoding() -> String { "utf8".to_string() }

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RttChannelsArgs {
    // No parameters needed
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RttStatusArgs {
    // No parameters needed
}

// =============================================================================
// Response Types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResponse {
    pub channel_index: u32,
    pub text: String,
    pub raw: Vec<u8>,
    pub raw_hex: String,
    pub length: usize,
    pub elapsed_us: u64,
}

impl ReadResponse {
    pub fn new(channel_index: u32, result: &ReadResult) -> Self {
        Self {
            channel_index,
            text: result.text.clone(),
            raw: result.raw.clone(),
            raw_hex: hex::encode(&result.raw),
            length: result.raw.len(),
            elapsed_us: result.elapsed_us,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResponse {
    pub channel_index: u32,
    pub bytes_requested: usize,
    pub bytes_written: usize,
    pub elapsed_us: u64,
}

/// Turn tool input into bytes for a down channel
pub fn decode_write_data(data: &str, encoding: &str) -> Result<WriteData, String> {
    match encoding {
        "utf8" => Ok(WriteData::Text(data.to_string())),
        "hex" => {
            let digits: String = data
                .trim_start_matches("0x")
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            hex::decode(&digits)
                .map(WriteData::Bytes)
                .map_err(|e| format!("Invalid hex data '{}': {}", data, e))
        }
        "binary" => {
            // "10110011 11001100"
            let bits = data.replace(' ', "");
            if bits.len() % 8 != 0 {
                return Err(format!("Binary data must be a multiple of 8 bits: '{}'", data));
            }
            bits.as_bytes()
                .chunks(8)
                .map(|chunk| {
                    let byte = std::str::from_utf8(chunk).unwrap_or_default();
                    u8::from_str_radix(byte, 2)
                        .map_err(|e| format!("Invalid binary byte '{}': {}", byte, e))
                })
                .collect::<Result<Vec<u8>, String>>()
                .map(WriteData::Bytes)
        }
        _ => Err(format!(
            "Unsupported encoding '{}'. Use 'utf8', 'hex', or 'binary'",
            encoding
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_encodings() {
        assert_eq!(decode_write_data("hi", "utf8").unwrap().as_bytes(), b"hi");
        assert_eq!(decode_write_data("de ad BE EF", "hex").unwrap().as_bytes(), &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(decode_write_data("0x0a0d", "hex").unwrap().as_bytes(), &[0x0A, 0x0D]);
        assert_eq!(decode_write_data("00000001 11111111", "binary").unwrap().as_bytes(), &[0x01, 0xFF]);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(decode_write_data("abc", "hex").is_err());
        assert!(decode_write_data("0101", "binary").is_err());
        assert!(decode_write_data("00000002", "binary").is_err());
        assert!(decode_write_data("x", "base64").is_err());
    }

    #[test]
    fn test_read_response_carries_hex() {
        let response = ReadResponse::new(0, &ReadResult::new(b"ok\n".to_vec(), 12));
        assert_eq!(response.raw, b"ok\n".to_vec());
        assert_eq!(response.raw_hex, "6f6b0a");
        assert_eq!(response.length, 3);
        assert_eq!(response.text, "ok\n");
    }
}
