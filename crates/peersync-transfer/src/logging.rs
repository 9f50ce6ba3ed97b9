/// Progress log for a pairing session.
///
/// The session emits one structured entry per visible step (connecting,
/// handshake steps, per-file progress, retries, outcome). Embedders inject
/// a `TransferLogger` to render them; nothing here affects the protocol.
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Local};

/// Structured log entry for a session.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub at: DateTime<Local>,
    pub event: TransferEvent,
}

impl TransferLog {
    pub fn new(component: &'static str, event: TransferEvent) -> Self {
        Self { component, at: Local::now(), event }
    }

    /// Human-readable, timestamped line.
    pub fn line(&self) -> String {
        format!("{} [{}] {}", self.at.format("%H:%M:%S%.3f"), self.component, self.event)
    }
}

/// Session events that can be logged.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Initiator: dialing the responder
    Connecting { addr: String },
    /// Responder: waiting for the initiator
    Listening { addr: String },
    /// Connection established
    Connected { peer: String },
    /// Handshake message written
    HandshakeSent { step: u32 },
    /// Handshake message read
    HandshakeReceived { step: u32 },
    /// Handshake message passed every check
    HandshakeVerified { step: u32 },
    /// Handshake aborted
    HandshakeFailed { reason: String },
    /// Session key established
    HandshakeComplete,
    /// Bulk phase starting, skipping already acknowledged files
    TransferStarted { resume_from: u64 },
    /// Sender: plan entry does not exist any more
    FileSkipped { path: String },
    /// Sender: file frame written
    FileSent { index: u64, path: String, bytes: u64 },
    /// Receiver: file written to disk
    FileReceived { index: u64, path: String, bytes: u64 },
    /// Sender: cumulative acknowledgment from the receiver
    Acknowledged { count: u64 },
    /// Sender: every file sent, completion marker written
    AllFilesSent { files: u64 },
    /// Receiver: no data within the heartbeat window
    HeartbeatStalled,
    /// Peer sent a negative acknowledgment
    PeerAborted { code: i64 },
    /// Receiver: giving up and telling the peer why
    AbortSent { code: i64 },
    /// Receiver: local credential invalidated after a full sync
    CredentialReset,
    /// Supervisor: reconnecting after a post-handshake failure
    Retrying { attempt: u32, max: u32, acknowledged: u64 },
    /// Session finished successfully
    SessionComplete { files: u64, bytes: u64 },
    /// Session finished with an error
    SessionFailed { message: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting { addr } => write!(f, "connecting to {}", addr),
            Self::Listening { addr } => write!(f, "listening on {}", addr),
            Self::Connected { peer } => write!(f, "connected to {}", peer),
            Self::HandshakeSent { step } => write!(f, "handshake step {} sent", step),
            Self::HandshakeReceived { step } => write!(f, "handshake step {} received", step),
            Self::HandshakeVerified { step } => write!(f, "handshake step {} verified", step),
            Self::HandshakeFailed { reason } => write!(f, "handshake failed: {}", reason),
            Self::HandshakeComplete => write!(f, "handshake complete, session key established"),
            Self::TransferStarted { resume_from } => {
                write!(f, "encrypted transfer started (resume_from={})", resume_from)
            }
            Self::FileSkipped { path } => write!(f, "skipping missing path {}", path),
            Self::FileSent { index, path, bytes } => {
                write!(f, "sent #{} {} ({} B)", index, path, bytes)
            }
            Self::FileReceived { index, path, bytes } => {
                write!(f, "received #{} {} ({} B)", index, path, bytes)
            }
            Self::Acknowledged { count } => write!(f, "peer acknowledged {} file(s)", count),
            Self::AllFilesSent { files } => write!(f, "all files sent ({} in plan)", files),
            Self::HeartbeatStalled => write!(f, "no data within heartbeat window, closing"),
            Self::PeerAborted { code } => write!(f, "peer aborted with code {}", code),
            Self::AbortSent { code } => write!(f, "aborting transfer, sent code {}", code),
            Self::CredentialReset => write!(f, "local password reset after full sync"),
            Self::Retrying { attempt, max, acknowledged } => write!(
                f,
                "{} file(s) synced, interrupted; retry {}/{}",
                acknowledged, attempt, max
            ),
            Self::SessionComplete { files, bytes } => {
                write!(f, "sync complete: {} file(s), {} B", files, bytes)
            }
            Self::SessionFailed { message } => write!(f, "sync failed: {}", message),
        }
    }
}

/// Sink for session progress. Implementations can render to a UI,
/// write to tracing, or discard.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);

    /// Timestamp `event` now and log it.
    fn emit(&self, component: &'static str, event: TransferEvent) {
        self.log(TransferLog::new(component, event));
    }
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        match &entry.event {
            TransferEvent::HandshakeFailed { .. }
            | TransferEvent::HeartbeatStalled
            | TransferEvent::PeerAborted { .. }
            | TransferEvent::AbortSent { .. }
            | TransferEvent::FileSkipped { .. }
            | TransferEvent::Retrying { .. }
            | TransferEvent::SessionFailed { .. } => {
                tracing::warn!(component = entry.component, "{}", entry.event);
            }
            TransferEvent::HandshakeSent { .. }
            | TransferEvent::HandshakeReceived { .. }
            | TransferEvent::Acknowledged { .. } => {
                tracing::debug!(component = entry.component, "{}", entry.event);
            }
            _ => {
                tracing::info!(component = entry.component, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

/// Keeps every entry in memory, for log views and tests.
#[derive(Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<TransferLog>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransferEvent> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().map(|e| e.event.clone()).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|e| e.event.clone()).collect(),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().map(TransferLog::line).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(TransferLog::line).collect(),
        }
    }
}

impl TransferLogger for MemoryLogger {
    fn log(&self, entry: TransferLog) {
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}
