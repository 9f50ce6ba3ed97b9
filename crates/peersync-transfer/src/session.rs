/// Session supervisor: one logical sync, possibly over several connections.
///
/// The first connection runs the handshake. After that the session key is
/// kept, and each reconnect goes straight to the file stream with the
/// acknowledged count as resume offset. Failures before the first key are
/// final; later transport failures spend the retry budget.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use peersync_crypto::SessionKey;

use crate::connection::{self, Connection};
use crate::credential::CredentialStore;
use crate::error::Result;
use crate::handshake::{run_handshake, HandshakeEngine, Role};
use crate::logging::{TransferEvent, TransferLogger};
use crate::plan::{PlanEntry, TransferPlan};
use crate::protocol::{CONNECT_TIMEOUT, DEFAULT_PORT, HEARTBEAT_INTERVAL, MAX_RETRIES};
use crate::receiver::{receive_files, ReceiverProgress};
use crate::sender::{send_files, SenderProgress};

/// Version string both peers must agree on.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Role-specific half of the configuration.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Dial `peer_addr` and write received files under `output_dir`.
    Initiator { peer_addr: SocketAddr, output_dir: PathBuf },
    /// Listen on `listen_addr` and send `plan`.
    Responder { listen_addr: SocketAddr, plan: TransferPlan },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: Endpoint,
    /// Digest of the password the operator entered for the peer.
    pub peer_digest: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_retries: u32,
    pub software_version: String,
}

impl SessionConfig {
    pub fn initiator(
        peer_addr: SocketAddr,
        output_dir: impl Into<PathBuf>,
        peer_digest: impl Into<String>,
    ) -> Self {
        Self::new(
            Endpoint::Initiator { peer_addr, output_dir: output_dir.into() },
            peer_digest.into(),
        )
    }

    pub fn responder(
        listen_addr: SocketAddr,
        plan: TransferPlan,
        peer_digest: impl Into<String>,
    ) -> Self {
        Self::new(Endpoint::Responder { listen_addr, plan }, peer_digest.into())
    }

    fn new(endpoint: Endpoint, peer_digest: String) -> Self {
        Self {
            endpoint,
            peer_digest,
            connect_timeout: CONNECT_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            max_retries: MAX_RETRIES,
            software_version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Any interface, port 8888.
    pub fn default_listen_addr() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_software_version(mut self, version: impl Into<String>) -> Self {
        self.software_version = version.into();
        self
    }

    pub fn role(&self) -> Role {
        match self.endpoint {
            Endpoint::Initiator { .. } => Role::Initiator,
            Endpoint::Responder { .. } => Role::Responder,
        }
    }
}

/// What a finished session accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub role: Role,
    /// Files acknowledged by the receiver over all attempts.
    pub files_acknowledged: u64,
    /// Plaintext bytes sent or written over all attempts.
    pub bytes: u64,
    /// Connections used, including the first.
    pub attempts: u32,
}

pub struct SessionSupervisor {
    config: SessionConfig,
    credential: Arc<dyn CredentialStore>,
    logger: Arc<dyn TransferLogger>,
}

/// State carried from one attempt to the next.
struct Carry {
    session_key: Option<SessionKey>,
    entries: Vec<PlanEntry>,
    sent: SenderProgress,
    received: ReceiverProgress,
}

impl SessionSupervisor {
    pub fn new(
        config: SessionConfig,
        credential: Arc<dyn CredentialStore>,
        logger: Arc<dyn TransferLogger>,
    ) -> Self {
        Self { config, credential, logger }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run to completion. `on_complete` is called exactly once with the
    /// outcome, which is also returned.
    pub fn run<F>(self, on_complete: F) -> Result<SessionSummary>
    where
        F: FnOnce(&Result<SessionSummary>),
    {
        let outcome = self.supervise();
        let component = self.component();
        match &outcome {
            Ok(summary) => self.logger.emit(
                component,
                TransferEvent::SessionComplete {
                    files: summary.files_acknowledged,
                    bytes: summary.bytes,
                },
            ),
            Err(e) => {
                self.logger.emit(component, TransferEvent::SessionFailed { message: e.to_string() })
            }
        }
        on_complete(&outcome);
        outcome
    }

    fn supervise(&self) -> Result<SessionSummary> {
        let entries = match &self.config.endpoint {
            Endpoint::Responder { plan, .. } => plan.expand(self.logger.as_ref(), self.component()),
            Endpoint::Initiator { .. } => Vec::new(),
        };
        let mut carry = Carry {
            session_key: None,
            entries,
            sent: SenderProgress::new(),
            received: ReceiverProgress::new(),
        };

        let max = self.config.max_retries;
        let mut retries_left = max;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.attempt(&mut carry) {
                Ok(()) => return Ok(self.summary(&carry, attempts)),
                Err(e) => {
                    let keyed = carry.session_key.is_some();
                    if !keyed || !e.is_retryable() || retries_left == 0 {
                        tracing::debug!(attempts, keyed, error = %e, "giving up");
                        return Err(e);
                    }
                    retries_left -= 1;
                    tracing::info!(error = %e, "transfer interrupted, reconnecting");
                    self.logger.emit(
                        self.component(),
                        TransferEvent::Retrying {
                            attempt: max - retries_left,
                            max,
                            acknowledged: self.acknowledged(&carry),
                        },
                    );
                }
            }
        }
    }

    fn attempt(&self, carry: &mut Carry) -> Result<()> {
        let component = self.component();
        let logger = self.logger.as_ref();
        let mut conn = self.establish()?;
        logger.emit(component, TransferEvent::Connected { peer: conn.peer_addr().to_string() });

        let key = match carry.session_key {
            Some(key) => key,
            None => {
                let engine = HandshakeEngine::new(
                    self.config.role(),
                    self.config.software_version.clone(),
                    self.credential.local_digest(),
                    self.config.peer_digest.clone(),
                )?;
                let key = run_handshake(&mut conn, engine, logger)?;
                logger.emit(component, TransferEvent::HandshakeComplete);
                carry.session_key = Some(key);
                key
            }
        };

        match &self.config.endpoint {
            Endpoint::Initiator { output_dir, .. } => receive_files(
                conn,
                &key,
                output_dir,
                &carry.received,
                self.credential.as_ref(),
                self.config.heartbeat_interval,
                logger,
            ),
            Endpoint::Responder { .. } => {
                send_files(conn, &key, &carry.entries, &carry.sent, logger)
            }
        }
    }

    fn establish(&self) -> Result<Connection> {
        let logger = self.logger.as_ref();
        match &self.config.endpoint {
            Endpoint::Initiator { peer_addr, .. } => {
                let addr = peer_addr.to_string();
                logger.emit(self.component(), TransferEvent::Connecting { addr });
                connection::connect(*peer_addr, self.config.connect_timeout)
            }
            Endpoint::Responder { listen_addr, .. } => {
                let addr = listen_addr.to_string();
                logger.emit(self.component(), TransferEvent::Listening { addr });
                connection::accept(*listen_addr, self.config.connect_timeout)
            }
        }
    }

    fn acknowledged(&self, carry: &Carry) -> u64 {
        match self.config.role() {
            Role::Initiator => carry.received.received(),
            Role::Responder => carry.sent.acknowledged(),
        }
    }

    fn summary(&self, carry: &Carry, attempts: u32) -> SessionSummary {
        use std::sync::atomic::Ordering;

        let bytes = match self.config.role() {
            Role::Initiator => carry.received.bytes_received.load(Ordering::Relaxed),
            Role::Responder => carry.sent.bytes_sent.load(Ordering::Relaxed),
        };
        SessionSummary {
            role: self.config.role(),
            files_acknowledged: self.acknowledged(carry),
            bytes,
            attempts,
        }
    }

    fn component(&self) -> &'static str {
        self.config.role().component()
    }
}
