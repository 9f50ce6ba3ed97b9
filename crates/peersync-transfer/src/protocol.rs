/// Wire format for the bulk transfer phase.
///
/// ```text
/// File frame:
///   [0..10]   "PSYNC-FILE" marker
///   [10..14]  Relative path length (u32 BE)
///   [14..n]   Relative path (UTF-8)
///   [n..n+8]  Plaintext file length (u64 BE)
///   then ceil(length / 8192) encrypted windows of 8224 bytes each
///
/// Completion frame:
///   [0..10]   "PSYNC-DONE" marker
///
/// Acknowledgment (receiver -> sender):
///   [0..8]    Fixed-width signed decimal, e.g. "00000003", "-0000999"
/// ```
///
/// Each window is 8192 plaintext bytes encrypted on its own with a fresh
/// IV: 16 (IV) + 8192 + 16 (one full PKCS#5 padding block) = 8224 bytes.
use std::fmt;
use std::time::Duration;

use peersync_crypto::{AES_BLOCK_SIZE, IV_SIZE};

use crate::error::{Result, TransferError};

/// Port the responder listens on when none is configured.
pub const DEFAULT_PORT: u16 = 8888;

/// Bound on connect / accept.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness window enforced by the receiver during bulk transfer.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Reconnect attempts allowed after the first post-handshake failure.
pub const MAX_RETRIES: u32 = 3;

pub const MARKER_LEN: usize = 10;

/// Precedes every file frame.
pub const FILE_MARKER: [u8; MARKER_LEN] = *b"PSYNC-FILE";

/// Sent once after the last file of the plan.
pub const COMPLETE_MARKER: [u8; MARKER_LEN] = *b"PSYNC-DONE";

/// Plaintext bytes per encrypted window.
pub const WINDOW_SIZE: usize = 8192;

/// Ciphertext bytes per window on the wire.
pub const ENCRYPTED_WINDOW_SIZE: usize = IV_SIZE + WINDOW_SIZE + AES_BLOCK_SIZE;

/// Width of an acknowledgment code.
pub const ACK_LEN: usize = 8;

/// Largest count an 8-character decimal acknowledgment can carry.
pub const MAX_ACK_COUNT: u64 = 99_999_999;

/// Upper bound accepted for a relative path in a file header.
pub const MAX_PATH_LEN: usize = 16 * 1024;

/// Number of encrypted windows carrying a file of `length` bytes.
pub fn windows_for_len(length: u64) -> u64 {
    length.div_ceil(WINDOW_SIZE as u64)
}

/// Frame kind announced by a 10-byte marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    File,
    Complete,
}

impl Marker {
    pub fn decode(bytes: &[u8; MARKER_LEN]) -> Option<Self> {
        match *bytes {
            FILE_MARKER => Some(Self::File),
            COMPLETE_MARKER => Some(Self::Complete),
            _ => None,
        }
    }
}

/// Header of one file frame (everything between the marker and the first window).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub relative_path: String,
    pub length: u64,
}

impl FileHeader {
    /// Encode marker + path length + path + file length.
    pub fn encode(&self) -> Vec<u8> {
        let path = self.relative_path.as_bytes();
        let mut buf = Vec::with_capacity(MARKER_LEN + 4 + path.len() + 8);
        buf.extend_from_slice(&FILE_MARKER);
        buf.extend_from_slice(&(path.len() as u32).to_be_bytes());
        buf.extend_from_slice(path);
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf
    }
}

/// Acknowledgment / abort code sent by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// Cumulative number of files received (always positive).
    Received(u64),
    /// Whole session received; sent in answer to the completion marker.
    Complete,
    /// Receiver read something other than a marker where one was due.
    Desync,
    /// Receiver could not create or write a destination file.
    StorageFailure,
    /// Receiver refused a path escaping its output directory.
    UnsafePath,
    /// Receiver's heartbeat saw no data for a whole interval.
    Distress,
    /// Negative code this build does not know.
    Other(i64),
}

impl AckCode {
    pub fn from_value(value: i64) -> Self {
        match value {
            0 => Self::Complete,
            -1 => Self::Desync,
            -2 => Self::StorageFailure,
            -3 => Self::UnsafePath,
            -999 => Self::Distress,
            v if v > 0 => Self::Received(v as u64),
            v => Self::Other(v),
        }
    }

    pub fn value(&self) -> i64 {
        match *self {
            Self::Received(count) => count as i64,
            Self::Complete => 0,
            Self::Desync => -1,
            Self::StorageFailure => -2,
            Self::UnsafePath => -3,
            Self::Distress => -999,
            Self::Other(v) => v,
        }
    }

    pub fn is_abort(&self) -> bool {
        self.value() < 0
    }

    /// Aborts caused by the link rather than by either device's environment.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Desync | Self::Distress)
    }

    /// Fixed-width decimal encoding, zero padded after the sign.
    pub fn encode(&self) -> Result<[u8; ACK_LEN]> {
        if let Self::Received(count) = *self {
            if count == 0 || count > MAX_ACK_COUNT {
                return Err(TransferError::Malformed(format!(
                    "acknowledgment count {} out of range",
                    count
                )));
            }
        }
        let text = format!("{:0width$}", self.value(), width = ACK_LEN);
        text.as_bytes().try_into().map_err(|_| {
            TransferError::Malformed(format!("acknowledgment {:?} is not {} bytes", text, ACK_LEN))
        })
    }

    pub fn decode(bytes: &[u8; ACK_LEN]) -> Result<Self> {
        let value = std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                TransferError::Desync(format!(
                    "invalid acknowledgment {:?}",
                    bytes.escape_ascii().to_string()
                ))
            })?;
        Ok(Self::from_value(value))
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received(count) => write!(f, "received {}", count),
            Self::Complete => write!(f, "complete"),
            Self::Desync => write!(f, "desync (-1)"),
            Self::StorageFailure => write!(f, "storage failure (-2)"),
            Self::UnsafePath => write!(f, "unsafe path (-3)"),
            Self::Distress => write!(f, "heartbeat distress (-999)"),
            Self::Other(v) => write!(f, "code {}", v),
        }
    }
}
