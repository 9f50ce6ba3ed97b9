use std::io;

use peersync_crypto::CryptoError;
use thiserror::Error;

use crate::protocol::AckCode;

/// Failure of a handshake or transfer attempt.
///
/// Variants follow the failure classes of the protocol: handshake
/// violations are never retried, transport-level trouble after the session
/// key exists is.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Software version mismatch: local {local}, peer {peer}")]
    VersionMismatch { local: String, peer: String },

    #[error("Handshake out of order: expected step {expected}, got {got}")]
    UnexpectedStep { expected: u32, got: u32 },

    #[error("Checksum verification failed for step {0}")]
    ChecksumMismatch(u32),

    #[error("Peer public key not trusted (credential mismatch)")]
    CredentialMismatch,

    #[error("Key confirmation failed at step {0}")]
    ConfirmationMismatch(u32),

    #[error("Malformed handshake message: {0}")]
    Malformed(String),

    #[error("Handshake closed before completion")]
    HandshakeIncomplete,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Timed out establishing connection to {0}")]
    ConnectTimeout(String),

    #[error("Connection stalled: no data within heartbeat window")]
    Stalled,

    #[error("Stream out of sync: {0}")]
    Desync(String),

    #[error("Local storage error: {0}")]
    Storage(io::Error),

    #[error("Refusing unsafe relative path {0:?}")]
    UnsafePath(String),

    #[error("Cannot read source file {path}: {source}")]
    Source { path: String, source: io::Error },

    #[error("Peer aborted the transfer ({0})")]
    PeerAbort(AckCode),
}

impl TransferError {
    /// Whether a new connection can be expected to get past this failure.
    ///
    /// Credential, version and cryptographic failures never heal on retry,
    /// and neither do local filesystem faults on either side.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::ConnectTimeout(_) | Self::Stalled | Self::Desync(_) => true,
            Self::PeerAbort(code) => code.is_retryable(),
            _ => false,
        }
    }

    /// Code the receiver sends before giving up on this error, if any.
    pub fn abort_code(&self) -> Option<AckCode> {
        match self {
            Self::Desync(_) => Some(AckCode::Desync),
            Self::Storage(_) => Some(AckCode::StorageFailure),
            Self::UnsafePath(_) => Some(AckCode::UnsafePath),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
