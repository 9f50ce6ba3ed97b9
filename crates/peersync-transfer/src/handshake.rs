/// Four-step pairing handshake.
///
/// ```text
/// Initiator                                   Responder
///   1  pk_I, nonce_A, HMAC(pw, pk_I)   ───►
///                                      ◄───   2  pk_R, RSA(nonce_B), HMAC(pw, pk_R)
///   3  RSA(pre_master), AES("I trust your data")  [signed by I]  ───►
///                                      ◄───   4  AES("Encryption begins")  [signed by R]
/// ```
///
/// `HandshakeEngine` is the socket-free state machine. `run_handshake`
/// drives one over a connection with a reader thread (validates, owns the
/// engine) and a writer thread, joined by a single-slot mailbox.
use std::io::{BufRead, Write};

use crossbeam_channel::bounded;
use peersync_crypto::{
    decrypt, derive_session_key, encrypt, hmac_sha256, public_key_from_base64, rsa_encrypt,
    secure_random_bytes, verify_hmac_sha256, RsaKeyPair, RsaPublicKey, SessionKey, NONCE_SIZE,
    PRE_MASTER_SECRET_SIZE,
};

use crate::connection::Connection;
use crate::error::{Result, TransferError};
use crate::logging::{TransferEvent, TransferLogger};
use crate::message::{Envelope, Payload};

/// Confirmation the initiator encrypts under the new session key (step 3).
pub const INITIATOR_CONFIRMATION: &str = "I trust your data";

/// Confirmation the responder encrypts under the new session key (step 4).
pub const RESPONDER_CONFIRMATION: &str = "Encryption begins";

/// Which side of the pairing this device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects out, receives files.
    Initiator,
    /// Listens, sends files.
    Responder,
}

impl Role {
    /// Component name used in progress logs.
    pub fn component(&self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Start,
    /// Waiting for the envelope with this step id.
    Awaiting(u32),
    Done,
    Aborted,
}

/// Per-connection handshake state. Keys and nonces are fresh per engine.
pub struct HandshakeEngine {
    role: Role,
    version: String,
    keys: RsaKeyPair,
    local_digest: Option<String>,
    peer_digest: String,
    nonce_a: Vec<u8>,
    nonce_b: Vec<u8>,
    pre_master: Vec<u8>,
    peer_key: Option<RsaPublicKey>,
    session_key: Option<SessionKey>,
    phase: HandshakePhase,
}

impl HandshakeEngine {
    /// `local_digest` keys the HMAC over our own public key; `peer_digest`
    /// verifies the peer's. `None` locally means the password was reset.
    pub fn new(
        role: Role,
        version: impl Into<String>,
        local_digest: Option<String>,
        peer_digest: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self::with_keys(role, version, RsaKeyPair::generate()?, local_digest, peer_digest))
    }

    pub fn with_keys(
        role: Role,
        version: impl Into<String>,
        keys: RsaKeyPair,
        local_digest: Option<String>,
        peer_digest: impl Into<String>,
    ) -> Self {
        Self {
            role,
            version: version.into(),
            keys,
            local_digest,
            peer_digest: peer_digest.into(),
            nonce_a: Vec::new(),
            nonce_b: Vec::new(),
            pre_master: Vec::new(),
            peer_key: None,
            session_key: None,
            phase: HandshakePhase::Start,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Trusted session key, available once the phase is `Done`.
    pub fn session_key(&self) -> Option<SessionKey> {
        match self.phase {
            HandshakePhase::Done => self.session_key,
            _ => None,
        }
    }

    /// Leave `Start`. The initiator gets its step 1 envelope back.
    pub fn start(&mut self) -> Result<Option<Envelope>> {
        if self.phase != HandshakePhase::Start {
            return Err(TransferError::Malformed(format!(
                "handshake already started ({:?})",
                self.phase
            )));
        }
        match self.role {
            Role::Initiator => match self.hello() {
                Ok(envelope) => {
                    self.phase = HandshakePhase::Awaiting(2);
                    Ok(Some(envelope))
                }
                Err(e) => {
                    self.phase = HandshakePhase::Aborted;
                    Err(e)
                }
            },
            Role::Responder => {
                self.phase = HandshakePhase::Awaiting(1);
                Ok(None)
            }
        }
    }

    /// Validate a peer envelope and produce our reply, if the role sends one.
    /// Any failure moves the engine to `Aborted` for good.
    pub fn handle(&mut self, envelope: &Envelope) -> Result<Option<Envelope>> {
        let outcome = self.process(envelope);
        if outcome.is_err() {
            self.phase = HandshakePhase::Aborted;
        }
        outcome
    }

    fn process(&mut self, envelope: &Envelope) -> Result<Option<Envelope>> {
        let expected = match self.phase {
            HandshakePhase::Awaiting(step) => step,
            phase => {
                return Err(TransferError::Malformed(format!(
                    "no handshake message expected ({:?})",
                    phase
                )));
            }
        };

        // Version first: an incompatible peer is reported as such even if
        // its envelope would also fail the cryptographic checks.
        if envelope.version != self.version {
            return Err(TransferError::VersionMismatch {
                local: self.version.clone(),
                peer: envelope.version.clone(),
            });
        }
        if envelope.step != expected {
            return Err(TransferError::UnexpectedStep { expected, got: envelope.step });
        }

        match expected {
            1 => {
                let reply = self.accept_hello(envelope)?;
                self.phase = HandshakePhase::Awaiting(3);
                Ok(Some(reply))
            }
            2 => {
                let reply = self.accept_hello_reply(envelope)?;
                self.phase = HandshakePhase::Awaiting(4);
                Ok(Some(reply))
            }
            3 => {
                let reply = self.accept_key_exchange(envelope)?;
                self.phase = HandshakePhase::Done;
                Ok(Some(reply))
            }
            4 => {
                self.accept_confirmation(envelope)?;
                self.phase = HandshakePhase::Done;
                Ok(None)
            }
            other => Err(TransferError::UnexpectedStep { expected: 4, got: other }),
        }
    }

    // ── Initiator: step 1 ──────────────────────────────────────────────
    fn hello(&mut self) -> Result<Envelope> {
        self.nonce_a = secure_random_bytes(NONCE_SIZE);
        self.pre_master = secure_random_bytes(PRE_MASTER_SECRET_SIZE);

        let public_key = self.keys.public_key_base64()?;
        let payload = Payload {
            another_info: Some(self.credential_mac(&public_key)?),
            initiator_public_key: Some(public_key),
            nonce_a: Some(self.nonce_a.clone()),
            ..Default::default()
        };
        Envelope::sealed(&self.version, 1, payload)
    }

    // ── Responder: validate step 1, answer with step 2 ─────────────────
    fn accept_hello(&mut self, envelope: &Envelope) -> Result<Envelope> {
        if !envelope.verify_digest()? {
            return Err(TransferError::ChecksumMismatch(1));
        }
        let payload = &envelope.payload;
        let peer_public = required(&payload.initiator_public_key, "initiator_public_key", 1)?;
        let nonce_a = required(&payload.nonce_a, "nonce_a", 1)?;
        let mac = required(&payload.another_info, "another_info", 1)?;
        self.check_peer_credential(peer_public, mac)?;
        if nonce_a.len() != NONCE_SIZE {
            return Err(TransferError::Malformed(format!("nonce_a is {} bytes", nonce_a.len())));
        }

        let peer_key = public_key_from_base64(peer_public)?;
        self.nonce_a = nonce_a.clone();
        self.nonce_b = secure_random_bytes(NONCE_SIZE);

        let public_key = self.keys.public_key_base64()?;
        let reply = Payload {
            another_info: Some(self.credential_mac(&public_key)?),
            responder_public_key: Some(public_key),
            nonce_b_encrypted: Some(rsa_encrypt(&self.nonce_b, &peer_key)?),
            ..Default::default()
        };
        self.peer_key = Some(peer_key);
        Envelope::sealed(&self.version, 2, reply)
    }

    // ── Initiator: validate step 2, answer with step 3 ─────────────────
    fn accept_hello_reply(&mut self, envelope: &Envelope) -> Result<Envelope> {
        if !envelope.verify_digest()? {
            return Err(TransferError::ChecksumMismatch(2));
        }
        let payload = &envelope.payload;
        let peer_public = required(&payload.responder_public_key, "responder_public_key", 2)?;
        let nonce_b_encrypted = required(&payload.nonce_b_encrypted, "nonce_b_encrypted", 2)?;
        let mac = required(&payload.another_info, "another_info", 2)?;
        self.check_peer_credential(peer_public, mac)?;

        let peer_key = public_key_from_base64(peer_public)?;
        let nonce_b = self.keys.decrypt(nonce_b_encrypted)?;
        if nonce_b.len() != NONCE_SIZE {
            return Err(TransferError::Malformed(format!("nonce_b is {} bytes", nonce_b.len())));
        }
        self.nonce_b = nonce_b;

        let key = derive_session_key(&self.pre_master, &self.nonce_a, &self.nonce_b);
        let reply = Payload {
            pre_master_encrypted: Some(rsa_encrypt(&self.pre_master, &peer_key)?),
            another_info: Some(encrypt(&key, INITIATOR_CONFIRMATION.as_bytes())?),
            ..Default::default()
        };
        self.peer_key = Some(peer_key);
        self.session_key = Some(key);
        Envelope::signed(&self.version, 3, reply, &self.keys)
    }

    // ── Responder: validate step 3, answer with step 4 ─────────────────
    fn accept_key_exchange(&mut self, envelope: &Envelope) -> Result<Envelope> {
        let peer_key = self.peer_key.as_ref().ok_or(TransferError::HandshakeIncomplete)?;
        if !envelope.verify_signature(peer_key)? {
            return Err(TransferError::ChecksumMismatch(3));
        }
        let payload = &envelope.payload;
        let pre_master_encrypted =
            required(&payload.pre_master_encrypted, "pre_master_encrypted", 3)?;
        let confirmation = required(&payload.another_info, "another_info", 3)?;

        let pre_master = self.keys.decrypt(pre_master_encrypted)?;
        if pre_master.len() != PRE_MASTER_SECRET_SIZE {
            return Err(TransferError::Malformed(format!(
                "pre-master secret is {} bytes",
                pre_master.len()
            )));
        }
        self.pre_master = pre_master;

        let key = derive_session_key(&self.pre_master, &self.nonce_a, &self.nonce_b);
        expect_confirmation(&key, confirmation, INITIATOR_CONFIRMATION, 3)?;

        let reply = Payload {
            another_info: Some(encrypt(&key, RESPONDER_CONFIRMATION.as_bytes())?),
            ..Default::default()
        };
        self.session_key = Some(key);
        Envelope::signed(&self.version, 4, reply, &self.keys)
    }

    // ── Initiator: validate step 4 ─────────────────────────────────────
    fn accept_confirmation(&mut self, envelope: &Envelope) -> Result<()> {
        let peer_key = self.peer_key.as_ref().ok_or(TransferError::HandshakeIncomplete)?;
        if !envelope.verify_signature(peer_key)? {
            return Err(TransferError::ChecksumMismatch(4));
        }
        let confirmation = required(&envelope.payload.another_info, "another_info", 4)?;
        let key = self.session_key.ok_or(TransferError::HandshakeIncomplete)?;
        expect_confirmation(&key, confirmation, RESPONDER_CONFIRMATION, 4)
    }

    /// HMAC(local digest, base64 public key): vouches for our key.
    fn credential_mac(&self, public_key_base64: &str) -> Result<Vec<u8>> {
        let digest = self.local_digest.as_deref().ok_or(TransferError::CredentialMismatch)?;
        Ok(hmac_sha256(digest.as_bytes(), public_key_base64.as_bytes())?.to_vec())
    }

    fn check_peer_credential(&self, peer_public_base64: &str, mac: &[u8]) -> Result<()> {
        let trusted = verify_hmac_sha256(
            self.peer_digest.as_bytes(),
            peer_public_base64.as_bytes(),
            mac,
        )?;
        if trusted {
            Ok(())
        } else {
            Err(TransferError::CredentialMismatch)
        }
    }
}

fn required<'a, T>(field: &'a Option<T>, name: &str, step: u32) -> Result<&'a T> {
    field
        .as_ref()
        .ok_or_else(|| TransferError::Malformed(format!("step {} is missing {}", step, name)))
}

fn expect_confirmation(
    key: &SessionKey,
    ciphertext: &[u8],
    expected: &str,
    step: u32,
) -> Result<()> {
    match decrypt(key, ciphertext) {
        Ok(plaintext) if plaintext == expected.as_bytes() => Ok(()),
        _ => Err(TransferError::ConfirmationMismatch(step)),
    }
}

/// Run the handshake on a fresh connection and return the session key.
///
/// Both threads are joined before returning. On a validation failure the
/// socket is shut down so the peer's blocked read ends too.
pub fn run_handshake(
    conn: &mut Connection,
    mut engine: HandshakeEngine,
    logger: &dyn TransferLogger,
) -> Result<SessionKey> {
    let component = engine.role().component();
    let killer = conn.shutdown_handle()?;
    let (reader, writer) = conn.split();
    let (outbox_tx, outbox_rx) = bounded::<Envelope>(1);

    std::thread::scope(|s| {
        // ── Writer thread ──────────────────────────────────────────────
        let killer_writer = &killer;
        let writer_handle = s.spawn(move || -> Result<()> {
            for envelope in outbox_rx {
                let line = envelope.encode_line()?;
                if let Err(e) = writer.write_all(line.as_bytes()).and_then(|_| writer.flush()) {
                    killer_writer.shutdown();
                    return Err(e.into());
                }
                logger.emit(component, TransferEvent::HandshakeSent { step: envelope.step });
            }
            Ok(())
        });

        // ── Reader thread ──────────────────────────────────────────────
        let killer_reader = &killer;
        let reader_handle = s.spawn(move || -> Result<SessionKey> {
            let outcome = drive_engine(&mut engine, reader, &outbox_tx, component, logger);
            // Closing the mailbox lets the writer drain and exit.
            drop(outbox_tx);
            if let Err(e) = &outcome {
                logger.emit(component, TransferEvent::HandshakeFailed { reason: e.to_string() });
                killer_reader.shutdown();
            }
            outcome
        });

        let read_result = reader_handle
            .join()
            .map_err(|_| TransferError::Malformed("handshake reader thread panicked".into()))?;
        let write_result = writer_handle
            .join()
            .map_err(|_| TransferError::Malformed("handshake writer thread panicked".into()))?;

        let key = read_result?;
        write_result?;
        Ok(key)
    })
}

fn drive_engine(
    engine: &mut HandshakeEngine,
    reader: &mut impl BufRead,
    outbox: &crossbeam_channel::Sender<Envelope>,
    component: &'static str,
    logger: &dyn TransferLogger,
) -> Result<SessionKey> {
    let mailbox_closed = || TransferError::Transport(std::io::ErrorKind::BrokenPipe.into());

    if let Some(first) = engine.start()? {
        outbox.send(first).map_err(|_| mailbox_closed())?;
    }

    let mut line = String::new();
    while engine.phase() != HandshakePhase::Done {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(TransferError::HandshakeIncomplete);
        }
        let envelope = Envelope::decode_line(&line)?;
        logger.emit(component, TransferEvent::HandshakeReceived { step: envelope.step });

        let reply = engine.handle(&envelope)?;
        logger.emit(component, TransferEvent::HandshakeVerified { step: envelope.step });
        if let Some(reply) = reply {
            outbox.send(reply).map_err(|_| mailbox_closed())?;
        }
    }

    engine.session_key().ok_or(TransferError::HandshakeIncomplete)
}
