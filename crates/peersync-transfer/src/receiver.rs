/// Initiator side of the file stream: 2 threads per attempt.
///
/// ```text
/// [Content]   read marker → header → 8224-byte frames → decrypt → disk → ack
/// [Heartbeat] every interval: anything read since last look? else -999 + close
/// ```
///
/// Used on its own (`FileReceiver`) by callers that drive the stream step by
/// step, and through `receive_files` by the session supervisor.
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::net::TcpStream;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::bounded;
use peersync_crypto::{decrypt, SessionKey};

use crate::connection::Connection;
use crate::credential::CredentialStore;
use crate::error::{Result, TransferError};
use crate::heartbeat;
use crate::logging::{TransferEvent, TransferLogger};
use crate::protocol::*;

const COMPONENT: &str = "initiator";

/// Receiver progress. `received` survives reconnects and is echoed in acks.
#[derive(Debug, Default)]
pub struct ReceiverProgress {
    pub received: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Relative paths in delivery order; entry `n - 1` is file `n`.
    delivered: Mutex<Vec<String>>,
}

impl ReceiverProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Record file `index` as acknowledged. Anything recorded past it is
    /// dropped: a rewound count means those files are being sent again.
    pub fn record(&self, index: u64, relative_path: &str, bytes: u64) {
        let mut delivered = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
        delivered.truncate(index.saturating_sub(1) as usize);
        delivered.push(relative_path.to_string());
        self.received.store(index, Ordering::Release);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Outcome of reading one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveStep {
    /// A file was written. `index` is the new cumulative count to acknowledge.
    File { index: u64, relative_path: String, bytes: u64 },
    /// The peer sent the completion marker.
    Complete,
}

/// Reads file frames and writes them under `output_dir`.
pub struct FileReceiver<R> {
    reader: R,
    output_dir: PathBuf,
    key: SessionKey,
    received: u64,
    delivered: Vec<String>,
    /// Next file is the first of a resumed stream.
    resuming: bool,
    activity: Arc<AtomicBool>,
}

impl<R: Read> FileReceiver<R> {
    /// `received` is the count already acknowledged on earlier attempts.
    pub fn new(reader: R, output_dir: impl Into<PathBuf>, key: SessionKey, received: u64) -> Self {
        Self {
            reader,
            output_dir: output_dir.into(),
            key,
            received,
            delivered: Vec::new(),
            resuming: false,
            activity: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Continue after files already delivered on earlier attempts.
    ///
    /// An acknowledgment lost with the connection leaves the sender behind
    /// this count, so it resumes with a file we already have. The first
    /// file of the stream is looked up in `delivered`; a match rewinds the
    /// count to the sender's offset instead of counting the file twice.
    pub fn with_history(mut self, delivered: Vec<String>) -> Self {
        self.received = delivered.len() as u64;
        self.resuming = !delivered.is_empty();
        self.delivered = delivered;
        self
    }

    /// Set after every completed fixed-size read.
    pub fn activity(&self) -> Arc<AtomicBool> {
        self.activity.clone()
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Read the next frame. Does not acknowledge it.
    pub fn receive_next(&mut self) -> Result<ReceiveStep> {
        let mut marker = [0u8; MARKER_LEN];
        self.read_fixed(&mut marker)?;
        match Marker::decode(&marker) {
            Some(Marker::Complete) => Ok(ReceiveStep::Complete),
            Some(Marker::File) => self.receive_file(),
            None => Err(TransferError::Desync(format!(
                "expected a frame marker, got {:?}",
                marker.escape_ascii().to_string()
            ))),
        }
    }

    fn receive_file(&mut self) -> Result<ReceiveStep> {
        let mut len_buf = [0u8; 4];
        self.read_fixed(&mut len_buf)?;
        let path_len = u32::from_be_bytes(len_buf) as usize;
        if path_len == 0 || path_len > MAX_PATH_LEN {
            return Err(TransferError::Desync(format!("path length {} out of range", path_len)));
        }

        let mut path_buf = vec![0u8; path_len];
        self.read_fixed(&mut path_buf)?;
        let relative_path = String::from_utf8(path_buf)
            .map_err(|_| TransferError::Desync("relative path is not UTF-8".into()))?;

        let mut length_buf = [0u8; 8];
        self.read_fixed(&mut length_buf)?;
        let length = u64::from_be_bytes(length_buf);

        let target = safe_join(&self.output_dir, &relative_path)?;
        if std::mem::take(&mut self.resuming) {
            if let Some(pos) = self.delivered.iter().rposition(|p| *p == relative_path) {
                tracing::debug!(
                    path = %relative_path,
                    counted = self.received,
                    resend_of = pos + 1,
                    "file delivered again after a lost acknowledgment"
                );
                self.received = pos as u64;
                self.delivered.truncate(pos);
            }
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(TransferError::Storage)?;
        }
        let mut out = BufWriter::new(File::create(&target).map_err(TransferError::Storage)?);

        let mut frame = vec![0u8; ENCRYPTED_WINDOW_SIZE];
        let mut remaining = length;
        while remaining > 0 {
            self.read_fixed(&mut frame)?;
            let plaintext = decrypt(&self.key, &frame)
                .map_err(|e| TransferError::Desync(format!("window does not decrypt: {}", e)))?;
            let take = remaining.min(WINDOW_SIZE as u64) as usize;
            if plaintext.len() < take {
                return Err(TransferError::Desync(format!(
                    "window holds {} bytes, {} still owed",
                    plaintext.len(),
                    remaining
                )));
            }
            out.write_all(&plaintext[..take]).map_err(TransferError::Storage)?;
            remaining -= take as u64;
        }
        out.flush().map_err(TransferError::Storage)?;

        self.received += 1;
        self.delivered.push(relative_path.clone());
        Ok(ReceiveStep::File { index: self.received, relative_path, bytes: length })
    }

    /// Fill `buf` completely. End of stream is a transport failure.
    fn read_fixed(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf)?;
        self.activity.store(true, Ordering::Release);
        Ok(())
    }
}

/// Resolve `relative` under `root`, refusing anything that could escape it.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut target = root.to_path_buf();
    let mut depth = 0;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                target.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::UnsafePath(relative.to_string()));
            }
        }
    }
    if depth == 0 {
        return Err(TransferError::UnsafePath(relative.to_string()));
    }
    Ok(target)
}

/// Write one acknowledgment code.
pub fn send_ack(writer: &mut impl Write, code: AckCode) -> Result<()> {
    writer.write_all(&code.encode()?)?;
    writer.flush()?;
    Ok(())
}

/// Receive until the completion marker, acknowledging every file.
///
/// On completion the local credential is invalidated before the final `0`
/// acknowledgment goes out.
pub fn receive_files(
    conn: Connection,
    key: &SessionKey,
    output_dir: &Path,
    progress: &ReceiverProgress,
    credential: &dyn CredentialStore,
    heartbeat_interval: Duration,
    logger: &dyn TransferLogger,
) -> Result<()> {
    let resume_from = progress.received();
    let killer = conn.shutdown_handle()?;
    let (reader, writer) = conn.into_parts();
    let writer = Mutex::new(writer);
    let mut receiver = FileReceiver::new(reader, output_dir, *key, resume_from)
        .with_history(progress.delivered());
    let activity = receiver.activity();
    let (stop_tx, stop_rx) = bounded::<()>(1);

    logger.emit(COMPONENT, TransferEvent::TransferStarted { resume_from });

    std::thread::scope(|s| {
        // ── Heartbeat thread ───────────────────────────────────────────
        let writer_hb = &writer;
        let killer_hb = &killer;
        let heartbeat_handle = s.spawn(move || {
            heartbeat::watch(heartbeat_interval, &activity, &stop_rx, || {
                logger.emit(COMPONENT, TransferEvent::HeartbeatStalled);
                // A writer stuck mid-ack holds the lock; skip the code then.
                if let Ok(mut stream) = writer_hb.try_lock() {
                    if let Ok(code) = AckCode::Distress.encode() {
                        let _ = stream.write_all(&code);
                    }
                }
                killer_hb.shutdown();
            })
        });

        // ── Content thread ─────────────────────────────────────────────
        let content_handle = s.spawn(|| {
            let outcome = consume_stream(&mut receiver, &writer, progress, credential, logger);
            // Stop the watchdog either way.
            drop(stop_tx);
            outcome
        });

        let content = content_handle.join().map_err(|_| {
            TransferError::Transport(std::io::Error::other("content thread panicked"))
        });
        let stalled = heartbeat_handle.join().unwrap_or(false);

        match content? {
            Err(TransferError::Transport(_)) if stalled => Err(TransferError::Stalled),
            outcome => outcome,
        }
    })
}

fn consume_stream<R: Read>(
    receiver: &mut FileReceiver<R>,
    writer: &Mutex<TcpStream>,
    progress: &ReceiverProgress,
    credential: &dyn CredentialStore,
    logger: &dyn TransferLogger,
) -> Result<()> {
    let ack = |code: AckCode| -> Result<()> {
        let mut stream = writer.lock().unwrap_or_else(PoisonError::into_inner);
        send_ack(&mut *stream, code)
    };

    loop {
        match receiver.receive_next() {
            Ok(ReceiveStep::File { index, relative_path, bytes }) => {
                // Counted only once the acknowledgment is out.
                ack(AckCode::Received(index))?;
                progress.record(index, &relative_path, bytes);
                logger.emit(
                    COMPONENT,
                    TransferEvent::FileReceived { index, path: relative_path, bytes },
                );
            }
            Ok(ReceiveStep::Complete) => {
                credential.invalidate();
                logger.emit(COMPONENT, TransferEvent::CredentialReset);
                // Everything is on disk; a lost final ack does not undo that.
                if let Err(e) = ack(AckCode::Complete) {
                    tracing::warn!(error = %e, "final acknowledgment not delivered");
                }
                return Ok(());
            }
            Err(e) => {
                if let Some(code) = e.abort_code() {
                    logger.emit(COMPONENT, TransferEvent::AbortSent { code: code.value() });
                    let _ = ack(code);
                }
                return Err(e);
            }
        }
    }
}
