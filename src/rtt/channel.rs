//! RTT channel descriptions and transfer results

use serde::{Deserialize, Serialize};

/// Transfer direction of an RTT channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,   // Target to Host
    Down, // Host to Target
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

/// A channel discovered in the control block. Immutable for the life of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub channel_index: u32,
    pub direction: Direction,
    pub name: String,
    pub size: u32,
}

/// Channels of both directions, in control block order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTable {
    pub down: Vec<ChannelInfo>,
    pub up: Vec<ChannelInfo>,
}

impl ChannelTable {
    pub fn get(&self, direction: Direction, index: u32) -> Option<&ChannelInfo> {
        let channels = match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        };
        channels.iter().find(|c| c.channel_index == index)
    }

    pub fn is_empty(&self) -> bool {
        self.down.is_empty() && self.up.is_empty()
    }

    pub fn clear(&mut self) {
        self.down.clear();
        self.up.clear();
    }
}

/// Payload of a write: text is sent as its UTF-8 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteData {
    Text(String),
    Bytes(Vec<u8>),
}

impl WriteData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            WriteData::Text(text) => text.as_bytes(),
            WriteData::Bytes(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for WriteData {
    fn from(text: &str) -> Self {
        WriteData::Text(text.to_string())
    }
}

impl From<String> for WriteData {
    fn from(text: String) -> Self {
        WriteData::Text(text)
    }
}

impl From<Vec<u8>> for WriteData {
    fn from(bytes: Vec<u8>) -> Self {
        WriteData::Bytes(bytes)
    }
}

impl From<&[u8]> for WriteData {
    fn from(bytes: &[u8]) -> Self {
        WriteData::Bytes(bytes.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for WriteData {
    fn from(bytes: [u8; N]) -> Self {
        WriteData::Bytes(bytes.to_vec())
    }
}

/// Result of a read from an up channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResult {
    /// Lossy UTF-8 decoding of `raw`
    pub text: String,
    pub raw: Vec<u8>,
    /// Microseconds between session start and the start of this transfer
    pub elapsed_us: u64,
}

impl ReadResult {
    pub fn new(raw: Vec<u8>, elapsed_us: u64) -> Self {
        Self {
            text: String::from_utf8_lossy(&raw).into_owned(),
            raw,
            elapsed_us,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// Result of a write to a down channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub bytes_written: usize,
    pub elapsed_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_and_bytes_produce_same_wire_bytes() {
        let text = WriteData::from("abc");
        let bytes = WriteData::from(vec![b'a', b'b', b'c']);
        assert_eq!(text.as_bytes(), bytes.as_bytes());
        assert_eq!(text.len(), 3);
    }

    #[test]
    fn test_lookup_respects_direction() {
        let table = ChannelTable {
            down: vec![ChannelInfo {
                channel_index: 0,
                direction: Direction::Down,
                name: "Terminal".to_string(),
                size: 16,
            }],
            up: vec![],
        };
        assert!(table.get(Direction::Down, 0).is_some());
        assert!(table.get(Direction::Up, 0).is_none());
        assert!(table.get(Direction::Down, 1).is_none());
        assert!(!table.is_empty());
        assert!(ChannelTable::default().is_empty());
    }

    #[test]
    fn test_read_result_decodes_lossily() {
        let result = ReadResult::new(vec![0x68, 0x69, 0xFF], 10);
        assert_eq!(result.raw, vec![0x68, 0x69, 0xFF]);
        assert!(result.text.starts_with("hi"));
        assert!(!result.is_empty());
    }
}
