//! Frame codec for the queue log.
//!
//! Each frame is one line:
//!
//! ```text
//! <checksum: 16 hex chars> <event: JSON>\n
//! ```
//!
//! The checksum is the first 8 bytes of SHA-256 over the JSON bytes. A frame
//! is only valid when its newline is present and the checksum matches, so a
//! write cut short by a crash can never be read back as a complete event.

use crate::store::QueueEntry;
use crate::{Sequence, Timestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const CHECKSUM_BYTES: usize = 8;
const CHECKSUM_HEX_LEN: usize = CHECKSUM_BYTES * 2;

/// One persisted change to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum LogEvent {
    /// A new entry was appended.
    Append { entry: QueueEntry },
    /// A delivery attempt failed.
    #[serde(rename_all = "camelCase")]
    Attempt {
        seq: Sequence,
        attempts: u32,
        next_attempt_at: Option<Timestamp>,
        last_error: Option<String>,
    },
    /// The entry was delivered and is gone.
    Remove { seq: Sequence },
}

/// Encode an event as a complete frame, newline included.
pub fn encode_frame(event: &LogEvent) -> serde_json::Result<Vec<u8>> {
    let body = serde_json::to_vec(event)?;
    let mut frame = Vec::with_capacity(CHECKSUM_HEX_LEN + 2 + body.len());
    frame.extend_from_slice(checksum(&body).as_bytes());
    frame.push(b' ');
    frame.extend_from_slice(&body);
    frame.push(b'\n');
    Ok(frame)
}

/// Decode a single frame without its trailing newline.
pub fn decode_frame(line: &[u8]) -> Result<LogEvent, String> {
    if line.len() <= CHECKSUM_HEX_LEN || line[CHECKSUM_HEX_LEN] != b' ' {
        return Err("malformed frame header".to_string());
    }
    let (sum, rest) = line.split_at(CHECKSUM_HEX_LEN);
    let body = &rest[1..];

    if sum != checksum(body).as_bytes() {
        return Err("checksum mismatch".to_string());
    }

    serde_json::from_slice(body).map_err(|e| format!("undecodable event: {e}"))
}

fn checksum(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    hex::encode(&digest[..CHECKSUM_BYTES])
}

/// Result of scanning a log image.
#[derive(Debug, Default)]
pub struct Scan {
    /// Events of every valid frame, in file order.
    pub events: Vec<LogEvent>,
    /// Length of the valid prefix in bytes.
    pub valid_len: u64,
    /// Bytes after the valid prefix that belong to a torn final frame.
    pub torn_bytes: u64,
}

/// A bad frame that is not the last one in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptFrame {
    pub offset: u64,
    pub reason: String,
}

/// Scan a whole log image.
///
/// A bad final frame is a torn write and is reported through
/// [`Scan::torn_bytes`]. A bad frame with valid data after it is corruption.
pub fn scan(bytes: &[u8]) -> Result<Scan, CorruptFrame> {
    let mut scan = Scan::default();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let Some(newline) = bytes[offset..].iter().position(|b| *b == b'\n') else {
            // Final frame never got its newline.
            break;
        };
        let end = offset + newline;

        match decode_frame(&bytes[offset..end]) {
            Ok(event) => {
                scan.events.push(event);
                offset = end + 1;
            }
            Err(_) if end + 1 == bytes.len() => break,
            Err(reason) => {
                return Err(CorruptFrame {
                    offset: offset as u64,
                    reason,
                })
            }
        }
    }

    scan.valid_len = offset as u64;
    scan.torn_bytes = (bytes.len() - offset) as u64;
    Ok(scan)
}
