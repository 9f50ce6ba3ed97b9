/// Responder side of the file stream: 2 threads per attempt.
///
/// ```text
/// [Content] ─── file frames, completion marker ───► peer
/// [Monitor] ◄── 8-byte acknowledgments ─────────── peer
/// ```
///
/// The content thread reads each plan file in 8192-byte windows and writes
/// every window as its own AES frame. The monitor records cumulative
/// acknowledgments; a negative code stops the attempt.
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use peersync_crypto::{encrypt, SessionKey};

use crate::connection::Connection;
use crate::error::{Result, TransferError};
use crate::logging::{TransferEvent, TransferLogger};
use crate::plan::PlanEntry;
use crate::protocol::*;

const COMPONENT: &str = "responder";

/// Sender progress. Survives reconnects: `acknowledged` is the resume offset.
#[derive(Debug, Default)]
pub struct SenderProgress {
    pub acknowledged: AtomicU64,
    pub files_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl SenderProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::Acquire)
    }
}

/// Send every plan entry after the acknowledged prefix, then the completion
/// marker. Returns once the peer acknowledges the whole session with `0`.
pub fn send_files(
    conn: Connection,
    key: &SessionKey,
    entries: &[PlanEntry],
    progress: &SenderProgress,
    logger: &dyn TransferLogger,
) -> Result<()> {
    let resume_from = progress.acknowledged();
    let killer = conn.shutdown_handle()?;
    let (mut reader, mut writer) = conn.into_parts();

    logger.emit(COMPONENT, TransferEvent::TransferStarted { resume_from });

    std::thread::scope(|s| {
        // ── Content thread ─────────────────────────────────────────────
        let killer_content = &killer;
        let content_handle = s.spawn(move || -> Result<()> {
            let outcome = stream_plan(&mut writer, key, entries, resume_from, progress, logger);
            if outcome.is_err() {
                killer_content.shutdown();
            }
            outcome
        });

        // ── Monitor thread ─────────────────────────────────────────────
        let killer_monitor = &killer;
        let monitor_handle = s.spawn(move || -> Result<()> {
            let outcome = monitor_acks(&mut reader, progress, logger);
            if outcome.is_err() {
                killer_monitor.shutdown();
            }
            outcome
        });

        let content = join(content_handle.join(), "content");
        let monitor = join(monitor_handle.join(), "monitor");
        settle(content, monitor)
    })
}

/// The monitor has the final word; a local content failure (which only
/// shows up at the monitor as a closed socket) takes precedence over that.
fn settle(content: Result<()>, monitor: Result<()>) -> Result<()> {
    match (content, monitor) {
        (_, Ok(())) => Ok(()),
        (Err(local), Err(_)) if !matches!(local, TransferError::Transport(_)) => Err(local),
        (_, Err(e)) => Err(e),
    }
}

fn join(joined: std::thread::Result<Result<()>>, name: &str) -> Result<()> {
    joined.map_err(|_| {
        TransferError::Transport(std::io::Error::other(format!("{} thread panicked", name)))
    })?
}

fn stream_plan(
    stream: &mut impl Write,
    key: &SessionKey,
    entries: &[PlanEntry],
    resume_from: u64,
    progress: &SenderProgress,
    logger: &dyn TransferLogger,
) -> Result<()> {
    let mut out = BufWriter::with_capacity(4 * ENCRYPTED_WINDOW_SIZE, stream);
    let mut window = vec![0u8; WINDOW_SIZE];
    let skip = usize::try_from(resume_from).unwrap_or(usize::MAX);

    for (index, entry) in entries.iter().enumerate().skip(skip) {
        let source_err = |source: std::io::Error| TransferError::Source {
            path: entry.source.display().to_string(),
            source,
        };
        let mut file = File::open(&entry.source).map_err(source_err)?;
        let length = file.metadata().map_err(source_err)?.len();

        let header = FileHeader { relative_path: entry.relative.clone(), length };
        out.write_all(&header.encode())?;

        let mut remaining = length;
        while remaining > 0 {
            let take = remaining.min(WINDOW_SIZE as u64) as usize;
            file.read_exact(&mut window[..take]).map_err(source_err)?;
            // Short final window: pad with zeros, the header length marks the end.
            window[take..].fill(0);
            out.write_all(&encrypt(key, &window)?)?;
            remaining -= take as u64;
        }
        out.flush()?;

        progress.files_sent.fetch_add(1, Ordering::Relaxed);
        progress.bytes_sent.fetch_add(length, Ordering::Relaxed);
        logger.emit(
            COMPONENT,
            TransferEvent::FileSent {
                index: index as u64 + 1,
                path: entry.relative.clone(),
                bytes: length,
            },
        );
    }

    out.write_all(&COMPLETE_MARKER)?;
    out.flush()?;
    logger.emit(COMPONENT, TransferEvent::AllFilesSent { files: entries.len() as u64 });
    Ok(())
}

fn monitor_acks(
    stream: &mut impl Read,
    progress: &SenderProgress,
    logger: &dyn TransferLogger,
) -> Result<()> {
    let mut buf = [0u8; ACK_LEN];
    loop {
        stream.read_exact(&mut buf)?;
        match AckCode::decode(&buf)? {
            AckCode::Received(count) => {
                progress.acknowledged.fetch_max(count, Ordering::AcqRel);
                logger.emit(COMPONENT, TransferEvent::Acknowledged { count });
            }
            AckCode::Complete => return Ok(()),
            code => {
                logger.emit(COMPONENT, TransferEvent::PeerAborted { code: code.value() });
                return Err(TransferError::PeerAbort(code));
            }
        }
    }
}
