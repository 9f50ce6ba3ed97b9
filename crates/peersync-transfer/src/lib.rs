/// Peersync Transfer: paired LAN file sync over a single TCP connection.
///
/// Provides:
/// - 4-step RSA/HMAC pairing handshake deriving an AES-128 session key
/// - Framed file stream in independently encrypted 8192-byte windows
/// - Cumulative acknowledgments and resume from the acknowledged count
/// - Receiver heartbeat with a distress code on stall
/// - Session supervisor with a bounded reconnect budget

pub mod connection;
pub mod credential;
pub mod error;
pub mod handshake;
pub mod heartbeat;
pub mod logging;
pub mod message;
pub mod plan;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;

// Re-export key types for convenience.
pub use connection::{accept, connect, Connection, ShutdownHandle};
pub use credential::{CredentialStore, MemoryCredential};
pub use error::{Result, TransferError};
pub use handshake::{run_handshake, HandshakeEngine, HandshakePhase, Role};
pub use logging::{
    MemoryLogger, NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger,
};
pub use message::{Envelope, Payload};
pub use plan::{PlanEntry, TransferPlan};
pub use protocol::{
    AckCode, FileHeader, Marker, ACK_LEN, COMPLETE_MARKER, DEFAULT_PORT, ENCRYPTED_WINDOW_SIZE,
    FILE_MARKER, MARKER_LEN, WINDOW_SIZE,
};
pub use receiver::{receive_files, send_ack, FileReceiver, ReceiveStep, ReceiverProgress};
pub use sender::{send_files, SenderProgress};
pub use session::{
    Endpoint, SessionConfig, SessionSummary, SessionSupervisor, PROTOCOL_VERSION,
};
