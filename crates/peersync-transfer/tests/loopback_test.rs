/// Integration tests: both roles over TCP loopback.
///
/// Each test picks a free port, runs one or both sides as a full session
/// supervisor, and plays the other side by hand where it needs to misbehave.

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use peersync_crypto::{encrypt, password_digest, SessionKey};
use peersync_transfer::{
    accept, connect, run_handshake, send_ack, AckCode, CredentialStore, FileHeader,
    FileReceiver, HandshakeEngine, MemoryCredential, MemoryLogger, NullLogger, ReceiveStep, Role,
    SessionConfig, SessionSummary, SessionSupervisor, TransferError, TransferEvent, TransferPlan,
    COMPLETE_MARKER, PROTOCOL_VERSION, WINDOW_SIZE,
};

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("peersync_{}_{}", tag, uuid::Uuid::new_v4()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener); // release so the responder can bind
    addr
}

/// Create a file with a known pattern.
fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    fs::write(&path, data).unwrap();
    path
}

fn spawn_supervisor(
    config: SessionConfig,
    credential: Arc<dyn CredentialStore>,
    logger: Arc<MemoryLogger>,
) -> thread::JoinHandle<peersync_transfer::Result<SessionSummary>> {
    thread::spawn(move || SessionSupervisor::new(config, credential, logger).run(|_| {}))
}

/// Like `spawn_supervisor`, also counting completion callbacks.
fn spawn_counted(
    config: SessionConfig,
    credential: Arc<dyn CredentialStore>,
    logger: Arc<MemoryLogger>,
) -> (thread::JoinHandle<peersync_transfer::Result<SessionSummary>>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handle = thread::spawn(move || {
        SessionSupervisor::new(config, credential, logger).run(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    });
    (handle, calls)
}

/// Write one file frame the way a responder does.
fn write_frame(writer: &mut impl Write, key: &SessionKey, path: &str, data: &[u8]) {
    let header = FileHeader { relative_path: path.to_string(), length: data.len() as u64 };
    writer.write_all(&header.encode()).unwrap();
    for chunk in data.chunks(WINDOW_SIZE) {
        let mut window = vec![0u8; WINDOW_SIZE];
        window[..chunk.len()].copy_from_slice(chunk);
        writer.write_all(&encrypt(key, &window).unwrap()).unwrap();
    }
    writer.flush().unwrap();
}

fn read_ack(reader: &mut impl Read) -> AckCode {
    let mut code = [0u8; 8];
    reader.read_exact(&mut code).unwrap();
    AckCode::decode(&code).unwrap()
}

fn acknowledgments(events: &[TransferEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::Acknowledged { count } => Some(*count),
            _ => None,
        })
        .collect()
}

fn sent_indices(events: &[TransferEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::FileSent { index, .. } => Some(*index),
            _ => None,
        })
        .collect()
}

#[test]
fn full_sync_of_three_files() {
    let src = temp_dir("a_src");
    let out = temp_dir("a_out");
    let files = [
        write_file(&src, "empty.bin", 0),
        write_file(&src, "window.bin", 8192),
        write_file(&src, "tail.bin", 20_000),
    ];

    let addr = free_addr();
    let digest = password_digest("shared secret");
    let responder_log = Arc::new(MemoryLogger::new());
    let initiator_log = Arc::new(MemoryLogger::new());
    let initiator_credential = Arc::new(MemoryCredential::new(digest.clone()));

    let responder = spawn_supervisor(
        SessionConfig::responder(addr, TransferPlan::new(files.iter()), digest.clone()),
        Arc::new(MemoryCredential::new(digest.clone())),
        responder_log.clone(),
    );
    let initiator = spawn_supervisor(
        SessionConfig::initiator(addr, &out, digest.clone()),
        initiator_credential.clone(),
        initiator_log.clone(),
    );

    let sent = responder.join().unwrap().unwrap();
    let received = initiator.join().unwrap().unwrap();

    assert_eq!(sent.role, Role::Responder);
    assert_eq!(sent.files_acknowledged, 3);
    assert_eq!(sent.bytes, 28_192);
    assert_eq!(sent.attempts, 1);
    assert_eq!(received.role, Role::Initiator);
    assert_eq!(received.files_acknowledged, 3);
    assert_eq!(received.bytes, 28_192);

    assert_eq!(acknowledgments(&responder_log.events()), vec![1, 2, 3]);
    assert!(initiator_log.events().contains(&TransferEvent::HandshakeComplete));
    assert!(responder_log.events().contains(&TransferEvent::AllFilesSent { files: 3 }));

    for file in &files {
        let name = file.file_name().unwrap();
        assert_eq!(fs::read(out.join(name)).unwrap(), fs::read(file).unwrap());
    }

    // The receiving device is now the authoritative copy.
    assert_eq!(initiator_credential.local_digest(), None);
    assert!(initiator_log.events().contains(&TransferEvent::CredentialReset));

    let _ = fs::remove_dir_all(&src);
    let _ = fs::remove_dir_all(&out);
}

#[test]
fn directory_plan_is_synced_recursively() {
    let src = temp_dir("dir_src");
    let out = temp_dir("dir_out");
    let album = src.join("album");
    fs::create_dir_all(album.join("raw")).unwrap();
    write_file(&album, "cover.jpg", 3000);
    write_file(&album.join("raw"), "0001.dng", 50_000);

    let addr = free_addr();
    let digest = password_digest("pw");
    let responder = spawn_supervisor(
        SessionConfig::responder(addr, TransferPlan::new([&album]), digest.clone()),
        Arc::new(MemoryCredential::new(digest.clone())),
        Arc::new(MemoryLogger::new()),
    );
    let initiator = spawn_supervisor(
        SessionConfig::initiator(addr, &out, digest.clone()),
        Arc::new(MemoryCredential::new(digest)),
        Arc::new(MemoryLogger::new()),
    );

    assert_eq!(responder.join().unwrap().unwrap().files_acknowledged, 2);
    assert_eq!(initiator.join().unwrap().unwrap().files_acknowledged, 2);
    assert_eq!(
        fs::read(out.join("album/raw/0001.dng")).unwrap(),
        fs::read(album.join("raw/0001.dng")).unwrap()
    );
    assert_eq!(fs::read(out.join("album/cover.jpg")).unwrap().len(), 3000);

    let _ = fs::remove_dir_all(&src);
    let _ = fs::remove_dir_all(&out);
}

#[test]
fn retry_resumes_after_acknowledged_files() {
    let src = temp_dir("b_src");
    let out = temp_dir("b_out");
    let files: Vec<PathBuf> =
        (1..=5).map(|i| write_file(&src, &format!("f{}.bin", i), 1000 * i)).collect();

    let addr = free_addr();
    let digest = password_digest("resume");
    let responder_log = Arc::new(MemoryLogger::new());
    let responder = spawn_supervisor(
        SessionConfig::responder(addr, TransferPlan::new(files.iter()), digest.clone()),
        Arc::new(MemoryCredential::new(digest.clone())),
        responder_log.clone(),
    );

    // ── First connection: take two files, then vanish ─────────────────
    let mut conn = connect(addr, Duration::from_secs(10)).unwrap();
    let engine = HandshakeEngine::new(
        Role::Initiator,
        PROTOCOL_VERSION,
        Some(digest.clone()),
        digest.clone(),
    )
    .unwrap();
    let key = run_handshake(&mut conn, engine, &NullLogger).unwrap();
    let (reader, mut writer) = conn.into_parts();
    let mut receiver = FileReceiver::new(reader, &out, key, 0);
    for expected in 1..=2 {
        match receiver.receive_next().unwrap() {
            ReceiveStep::File { index, .. } => {
                assert_eq!(index, expected);
                send_ack(&mut writer, AckCode::Received(index)).unwrap();
            }
            ReceiveStep::Complete => panic!("completed early"),
        }
    }
    // Let the monitor see ack 2 before the connection drops.
    thread::sleep(Duration::from_millis(300));
    drop(receiver);
    drop(writer);

    // ── Second connection: same key, no handshake ──────────────────────
    let conn = connect(addr, Duration::from_secs(10)).unwrap();
    let (reader, mut writer) = conn.into_parts();
    let mut receiver = FileReceiver::new(reader, &out, key, 2);
    let mut resumed = Vec::new();
    loop {
        match receiver.receive_next().unwrap() {
            ReceiveStep::File { index, relative_path, .. } => {
                resumed.push((index, relative_path));
                send_ack(&mut writer, AckCode::Received(index)).unwrap();
            }
            ReceiveStep::Complete => {
                send_ack(&mut writer, AckCode::Complete).unwrap();
                break;
            }
        }
    }

    let summary = responder.join().unwrap().unwrap();
    assert_eq!(summary.attempts, 2);
    assert_eq!(summary.files_acknowledged, 5);
    assert_eq!(
        resumed,
        vec![(3, "f3.bin".to_string()), (4, "f4.bin".to_string()), (5, "f5.bin".to_string())]
    );

    let events = responder_log.events();
    let retry_at = events
        .iter()
        .position(|e| matches!(e, TransferEvent::Retrying { .. }))
        .expect("responder never retried");
    assert_eq!(
        events[retry_at],
        TransferEvent::Retrying { attempt: 1, max: 3, acknowledged: 2 }
    );
    assert_eq!(sent_indices(&events[retry_at..]), vec![3, 4, 5]);
    assert_eq!(acknowledgments(&events[..retry_at]), vec![1, 2]);
    assert_eq!(acknowledgments(&events[retry_at..]), vec![3, 4, 5]);
    assert!(events[retry_at..].contains(&TransferEvent::TransferStarted { resume_from: 2 }));
    assert_eq!(
        events.iter().filter(|e| **e == TransferEvent::HandshakeComplete).count(),
        1
    );

    for file in &files {
        let name = file.file_name().unwrap();
        assert_eq!(fs::read(out.join(name)).unwrap(), fs::read(file).unwrap());
    }

    let _ = fs::remove_dir_all(&src);
    let _ = fs::remove_dir_all(&out);
}

#[test]
fn mismatched_passwords_abort_without_files() {
    let src = temp_dir("c_src");
    let out = temp_dir("c_out");
    let file = write_file(&src, "secret.bin", 4096);

    let addr = free_addr();
    let responder_log = Arc::new(MemoryLogger::new());
    let initiator_credential = Arc::new(MemoryCredential::from_password("alpha"));
    let responder = spawn_supervisor(
        SessionConfig::responder(addr, TransferPlan::new([&file]), password_digest("bravo")),
        Arc::new(MemoryCredential::from_password("bravo")),
        responder_log.clone(),
    );
    let initiator = spawn_supervisor(
        SessionConfig::initiator(addr, &out, password_digest("alpha")),
        initiator_credential.clone(),
        Arc::new(MemoryLogger::new()),
    );

    let responder_outcome = responder.join().unwrap();
    let initiator_outcome = initiator.join().unwrap();

    assert!(matches!(responder_outcome, Err(TransferError::CredentialMismatch)));
    assert!(initiator_outcome.is_err());

    let events = responder_log.events();
    assert!(events.iter().any(|e| matches!(e, TransferEvent::HandshakeFailed { .. })));
    assert!(!events.iter().any(|e| matches!(e, TransferEvent::Retrying { .. })));
    assert!(sent_indices(&events).is_empty());
    assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    // Nothing completed, so nothing was reset.
    assert!(initiator_credential.local_digest().is_some());

    let _ = fs::remove_dir_all(&src);
    let _ = fs::remove_dir_all(&out);
}

#[test]
fn version_mismatch_is_not_retried() {
    let out = temp_dir("version_out");
    let addr = free_addr();
    let digest = password_digest("pw");

    let responder = spawn_supervisor(
        SessionConfig::responder(addr, TransferPlan::default(), digest.clone())
            .with_software_version("0.9.0"),
        Arc::new(MemoryCredential::new(digest.clone())),
        Arc::new(MemoryLogger::new()),
    );
    let initiator = spawn_supervisor(
        SessionConfig::initiator(addr, &out, digest.clone()),
        Arc::new(MemoryCredential::new(digest)),
        Arc::new(MemoryLogger::new()),
    );

    match responder.join().unwrap() {
        Err(TransferError::VersionMismatch { local, peer }) => {
            assert_eq!(local, "0.9.0");
            assert_eq!(peer, PROTOCOL_VERSION);
        }
        other => panic!("expected version mismatch, got {:?}", other),
    }
    assert!(initiator.join().unwrap().is_err());

    let _ = fs::remove_dir_all(&out);
}

#[test]
fn exhausted_retries_report_failure_once() {
    let src = temp_dir("d_src");
    let file = write_file(&src, "big.bin", 64 * 1024);

    let addr = free_addr();
    let digest = password_digest("pw");
    let responder_log = Arc::new(MemoryLogger::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let config = SessionConfig::responder(addr, TransferPlan::new([&file]), digest.clone())
        .with_connect_timeout(Duration::from_millis(300));
    let credential = Arc::new(MemoryCredential::new(digest.clone()));
    let calls_cb = calls.clone();
    let logger = responder_log.clone();
    let responder = thread::spawn(move || {
        SessionSupervisor::new(config, credential, logger).run(move |outcome| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
            assert!(outcome.is_err());
        })
    });

    // Complete the handshake, then disappear for good.
    let mut conn = connect(addr, Duration::from_secs(10)).unwrap();
    let engine =
        HandshakeEngine::new(Role::Initiator, PROTOCOL_VERSION, Some(digest.clone()), digest)
            .unwrap();
    run_handshake(&mut conn, engine, &NullLogger).unwrap();
    drop(conn);

    let outcome = responder.join().unwrap();
    assert!(outcome.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let events = responder_log.events();
    let retries: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::Retrying { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2, 3]);
    assert_eq!(
        events.iter().filter(|e| matches!(e, TransferEvent::SessionFailed { .. })).count(),
        1
    );

    let _ = fs::remove_dir_all(&src);
}

#[test]
fn silent_sender_trips_heartbeat() {
    let out = temp_dir("hb_out");
    let addr = free_addr();
    let digest = password_digest("pw");
    let initiator_log = Arc::new(MemoryLogger::new());

    let initiator = spawn_supervisor(
        SessionConfig::initiator(addr, &out, digest.clone())
            .with_heartbeat_interval(Duration::from_millis(300))
            .with_max_retries(0),
        Arc::new(MemoryCredential::new(digest.clone())),
        initiator_log.clone(),
    );

    // Play a responder that completes the handshake and then never sends.
    let mut conn = accept(addr, Duration::from_secs(10)).unwrap();
    let engine =
        HandshakeEngine::new(Role::Responder, PROTOCOL_VERSION, Some(digest.clone()), digest)
            .unwrap();
    run_handshake(&mut conn, engine, &NullLogger).unwrap();
    let (mut reader, _writer) = conn.into_parts();

    let mut code = [0u8; 8];
    reader.read_exact(&mut code).unwrap();
    assert_eq!(&code, b"-0000999");
    assert_eq!(AckCode::decode(&code).unwrap(), AckCode::Distress);

    let outcome = initiator.join().unwrap();
    assert!(matches!(outcome, Err(TransferError::Stalled)));
    assert!(initiator_log.events().contains(&TransferEvent::HeartbeatStalled));

    let _ = fs::remove_dir_all(&out);
}

#[test]
fn lost_ack_then_second_failure_delivers_every_file() {
    let out = temp_dir("lost_ack_out");
    let addr = free_addr();
    let digest = password_digest("pw");
    let initiator_log = Arc::new(MemoryLogger::new());
    let (initiator, calls) = spawn_counted(
        SessionConfig::initiator(addr, &out, digest.clone()),
        Arc::new(MemoryCredential::new(digest.clone())),
        initiator_log.clone(),
    );
    let files: [(&str, &[u8]); 3] = [("f1.bin", b"one"), ("f2.bin", b"two"), ("f3.bin", b"three")];

    // ── Attempt 1: f1 is written, but its ack never counts ─────────────
    let mut conn = accept(addr, Duration::from_secs(10)).unwrap();
    let engine =
        HandshakeEngine::new(Role::Responder, PROTOCOL_VERSION, Some(digest.clone()), digest)
            .unwrap();
    let key = run_handshake(&mut conn, engine, &NullLogger).unwrap();
    let (mut reader, mut writer) = conn.into_parts();
    write_frame(&mut writer, &key, files[0].0, files[0].1);
    // Drained but ignored, as if it were lost with the link.
    assert_eq!(read_ack(&mut reader), AckCode::Received(1));
    drop(reader);
    drop(writer);

    // ── Attempt 2: resume at 0, deliver f1 and f2, fail again ──────────
    let conn = accept(addr, Duration::from_secs(10)).unwrap();
    let (mut reader, mut writer) = conn.into_parts();
    write_frame(&mut writer, &key, files[0].0, files[0].1);
    write_frame(&mut writer, &key, files[1].0, files[1].1);
    assert_eq!(read_ack(&mut reader), AckCode::Received(1));
    assert_eq!(read_ack(&mut reader), AckCode::Received(2));
    drop(reader);
    drop(writer);

    // ── Attempt 3: resume at 2 ─────────────────────────────────────────
    let conn = accept(addr, Duration::from_secs(10)).unwrap();
    let (mut reader, mut writer) = conn.into_parts();
    write_frame(&mut writer, &key, files[2].0, files[2].1);
    writer.write_all(&COMPLETE_MARKER).unwrap();
    writer.flush().unwrap();
    assert_eq!(read_ack(&mut reader), AckCode::Received(3));
    assert_eq!(read_ack(&mut reader), AckCode::Complete);

    let summary = initiator.join().unwrap().unwrap();
    assert_eq!(summary.files_acknowledged, 3);
    assert_eq!(summary.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for (name, data) in files {
        assert_eq!(fs::read(out.join(name)).unwrap(), data);
    }

    let _ = fs::remove_dir_all(&out);
}

#[test]
fn storage_failure_is_terminal_on_both_sides() {
    let src = temp_dir("storage_src");
    let file = write_file(&src, "photo.jpg", 100);
    // Output "directory" is a regular file, so nothing can be created under it.
    let blocker = src.join("not-a-dir");
    fs::write(&blocker, b"x").unwrap();

    let addr = free_addr();
    let digest = password_digest("pw");
    let responder_log = Arc::new(MemoryLogger::new());
    let initiator_log = Arc::new(MemoryLogger::new());

    let (responder, responder_calls) = spawn_counted(
        SessionConfig::responder(addr, TransferPlan::new([&file]), digest.clone()),
        Arc::new(MemoryCredential::new(digest.clone())),
        responder_log.clone(),
    );
    let (initiator, initiator_calls) = spawn_counted(
        SessionConfig::initiator(addr, &blocker, digest.clone()),
        Arc::new(MemoryCredential::new(digest)),
        initiator_log.clone(),
    );

    let responder_outcome = responder.join().unwrap();
    let initiator_outcome = initiator.join().unwrap();

    assert!(matches!(
        responder_outcome,
        Err(TransferError::PeerAbort(AckCode::StorageFailure))
    ));
    assert!(matches!(initiator_outcome, Err(TransferError::Storage(_))));
    assert_eq!(responder_calls.load(Ordering::SeqCst), 1);
    assert_eq!(initiator_calls.load(Ordering::SeqCst), 1);

    for events in [responder_log.events(), initiator_log.events()] {
        assert!(!events.iter().any(|e| matches!(e, TransferEvent::Retrying { .. })));
    }
    assert!(initiator_log.events().contains(&TransferEvent::AbortSent { code: -2 }));
    assert!(responder_log.events().contains(&TransferEvent::PeerAborted { code: -2 }));

    let _ = fs::remove_dir_all(&src);
}
