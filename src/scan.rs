//! Tag memory reads and payload extraction.
//!
//! Tags are read in three 16-byte windows starting at blocks 4, 8 and 12.
//! Only windows answered with status `0x90 ..` contribute bytes, and of
//! those only printable ASCII survives.

use std::fmt;

/// Blocks read per attempt, in order.
pub const READ_BLOCKS: [u8; 3] = [4, 8, 12];

/// Bytes requested per read command.
pub const WINDOW_LEN: u8 = 0x10;

pub const SW1_SUCCESS: u8 = 0x90;

const PRINTABLE: std::ops::RangeInclusive<u8> = 32..=126;

/// `READ BINARY` as understood by PC/SC contactless readers.
pub fn read_command(block: u8) -> [u8; 5] {
    [0xFF, 0xB0, 0x00, block, WINDOW_LEN]
}

/// A transmit response split into data and status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl ApduResponse {
    /// Splits the trailing status word off a raw response.
    ///
    /// Returns `None` when the response is too short to carry one.
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        let split = raw.len().checked_sub(2)?;
        let (data, status) = raw.split_at(split);
        Some(Self {
            data: data.to_vec(),
            sw1: status[0],
            sw2: status[1],
        })
    }

    pub fn is_success(&self) -> bool {
        self.sw1 == SW1_SUCCESS
    }

    /// Data bytes this window contributes, or nothing when the read failed
    /// or returned a different length than requested.
    pub fn accepted_bytes(&self) -> &[u8] {
        if self.is_success() && self.data.len() == usize::from(WINDOW_LEN) {
            &self.data
        } else {
            &[]
        }
    }
}

/// Printable bytes gathered over one scan attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    bytes: Vec<u8>,
}

impl ScanResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the printable part of an accepted window. Returns how many
    /// bytes were kept.
    pub fn push_window(&mut self, response: &ApduResponse) -> usize {
        let before = self.bytes.len();
        self.bytes.extend(
            response
                .accepted_bytes()
                .iter()
                .copied()
                .filter(|b| PRINTABLE.contains(b)),
        );
        self.bytes.len() - before
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Printable ASCII is valid UTF-8, so this never loses data.
    pub fn as_text(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or_default()
    }
}

/// Formats tag text into a deliverable URL.
#[derive(Debug, Clone)]
pub struct PayloadFormat {
    pub scheme: String,
    pub artifact_prefix: String,
}

impl Default for PayloadFormat {
    fn default() -> Self {
        Self {
            scheme: "https://".into(),
            artifact_prefix: ")%U".into(),
        }
    }
}

impl PayloadFormat {
    /// Builds a payload, or `None` when the scan holds only whitespace.
    pub fn build(&self, scan: &ScanResult) -> Option<Payload> {
        let trimmed = scan.as_text().trim();
        if trimmed.is_empty() {
            return None;
        }
        let body = strip_artifact(trimmed, &self.artifact_prefix);
        Some(Payload(format!("{}{}", self.scheme, body)))
    }
}

/// Removes one leading `prefix`; other strings pass through unchanged.
pub fn strip_artifact<'a>(text: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return text;
    }
    text.strip_prefix(prefix).unwrap_or(text)
}

/// Non-empty text ready for the clipboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(String);

impl Payload {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
