//! End-to-end behaviour of the transfer core through the public `Relay` API.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uplink_protocol::{
    BatchState, CancelStatus, ChunkHeader, FileDescriptor, FileState, TransferEvent, TransferState,
    encode_chunk_frame,
};
use uplink_transfer::{
    Inbound, MemorySink, Relay, SessionConfig, StaticSampler, TransferConfig, TransferError,
    TransferHandle,
};

const MB: u64 = 1_000_000;

struct Setup {
    relay: Relay,
    sink: MemorySink,
    sampler: Arc<StaticSampler>,
}

fn setup_with(available: u64, session: SessionConfig) -> Setup {
    let sampler = Arc::new(StaticSampler::new(available, available));
    let sink = MemorySink::new();
    let config = TransferConfig {
        session,
        ..TransferConfig::default()
    };
    let relay = Relay::new(&config, sampler.clone(), Arc::new(sink.clone())).unwrap();
    Setup {
        relay,
        sink,
        sampler,
    }
}

fn setup() -> Setup {
    setup_with(1 << 40, SessionConfig::default())
}

fn file(name: &str, size: u64) -> FileDescriptor {
    FileDescriptor {
        declared_size: size,
        content_type: "application/octet-stream".into(),
        filename: name.into(),
    }
}

fn chunk(transfer_id: &str, seq: u64, data: &[u8]) -> Inbound {
    let header = ChunkHeader {
        transfer_id: transfer_id.into(),
        seq,
    };
    Inbound::Chunk(encode_chunk_frame(&header, data).unwrap())
}

/// Reads events until the channel closes and returns them all.
async fn collect(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    events
}

async fn open(
    relay: &Relay,
    fd: &FileDescriptor,
) -> (
    Arc<TransferHandle>,
    mpsc::Sender<Inbound>,
    mpsc::UnboundedReceiver<TransferEvent>,
) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (handle, tx) = relay.open(fd, events_tx).await.unwrap();
    (handle, tx, events_rx)
}

#[tokio::test]
async fn tenth_transfer_is_denied_when_budget_fits_nine() {
    // Development tier: no reserve, 100% ceiling, footprint 10% of declared.
    let s = setup_with(95 * MB, SessionConfig::default());

    let mut handles = Vec::new();
    for i in 0..9 {
        handles.push(s.relay.prepare(&file(&format!("f{i}.bin"), 100 * MB)).await.unwrap());
    }
    let err = s.relay.prepare(&file("f9.bin", 100 * MB)).await.unwrap_err();
    assert!(matches!(err, TransferError::AdmissionDenied { requested, .. } if requested == 10 * MB));
    assert!(err.is_retryable());

    let stats = s.relay.stats().admission;
    assert_eq!(stats.active_slots, 9);
    assert_eq!(stats.reserved_bytes, 90 * MB);

    // Memory frees up on the host: the same request now fits.
    s.sampler.set_total(200 * MB);
    s.sampler.set_available(200 * MB);
    assert!(s.relay.prepare(&file("f9.bin", 100 * MB)).await.is_ok());
}

#[tokio::test]
async fn single_transfer_round_trip() {
    let s = setup();
    let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let (handle, tx, mut events) = open(&s.relay, &file("blob.bin", data.len() as u64)).await;
    let id = handle.transfer_id().to_string();

    for (seq, part) in data.chunks(1_000).enumerate() {
        tx.send(chunk(&id, seq as u64, part)).await.unwrap();
    }
    tx.send(Inbound::EndOfStream).await.unwrap();

    let events = collect(&mut events).await;
    let reference = format!("mem://{id}/blob.bin");
    assert_eq!(events.last(), Some(&TransferEvent::Success(reference.clone())));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.contains(&TransferEvent::Progress(100.0)));
    assert_eq!(s.sink.object(&reference).unwrap(), data);
    assert_eq!(handle.state(), TransferState::Completed);
    assert_eq!(handle.destination(), Some(reference.as_str()));
}

#[tokio::test]
async fn slots_are_conserved_across_every_exit_path() {
    let s = setup();
    let before = s.relay.stats().admission;

    // Completed.
    let (h, tx, mut ev) = open(&s.relay, &file("ok.bin", 3)).await;
    tx.send(chunk(h.transfer_id(), 0, b"abc")).await.unwrap();
    tx.send(Inbound::EndOfStream).await.unwrap();
    collect(&mut ev).await;

    // Failed: sink rejects the write.
    s.sink.fail_writes_after(Some(0));
    let (h, tx, mut ev) = open(&s.relay, &file("bad.bin", 3)).await;
    tx.send(chunk(h.transfer_id(), 0, b"abc")).await.unwrap();
    collect(&mut ev).await;
    s.sink.fail_writes_after(None);

    // Failed: transport closed early.
    let (h, tx, mut ev) = open(&s.relay, &file("cut.bin", 6)).await;
    tx.send(chunk(h.transfer_id(), 0, b"abc")).await.unwrap();
    drop(tx);
    collect(&mut ev).await;

    // Cancelled.
    let (h, _tx, mut ev) = open(&s.relay, &file("stop.bin", 6)).await;
    assert_eq!(s.relay.request_cancel(h.transfer_id()), CancelStatus::Accepted);
    assert_eq!(collect(&mut ev).await, vec![TransferEvent::Cancelled]);

    let after = s.relay.stats().admission;
    assert_eq!(after.active_slots, before.active_slots);
    assert_eq!(after.reserved_bytes, before.reserved_bytes);
    assert_eq!(after.admitted_total, 4);
    assert_eq!(after.released_total, 4);
    assert_eq!(s.relay.stats().pool.checked_out(), 0);
}

#[tokio::test]
async fn batch_with_truncated_member_reports_failed() {
    let s = setup();
    let (batch_id, results) = s
        .relay
        .create_batch(&[file("one.bin", 6), file("two.bin", 6), file("three.bin", 6)])
        .await;
    assert!(results.iter().all(|r| r.admitted));
    let ids: Vec<String> = results.iter().map(|r| r.transfer_id.clone().unwrap()).collect();

    let attach = |id: &str| {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (handle, tx) = s.relay.attach(id, events_tx).unwrap();
        (handle, tx, events_rx)
    };
    let (h1, tx1, mut ev1) = attach(&ids[0]);
    let (h2, tx2, _ev2) = attach(&ids[1]);
    let (h3, tx3, _ev3) = attach(&ids[2]);

    tx1.send(chunk(&ids[0], 0, b"abcdef")).await.unwrap();
    tx1.send(Inbound::EndOfStream).await.unwrap();
    tx2.send(chunk(&ids[1], 0, b"abc")).await.unwrap();
    tx2.send(Inbound::Closed("connection reset".into())).await.unwrap();
    tx3.send(chunk(&ids[2], 0, b"abc")).await.unwrap();

    assert!(matches!(collect(&mut ev1).await.last(), Some(TransferEvent::Success(_))));
    assert_eq!(h1.wait_terminal().await, TransferState::Completed);
    assert_eq!(h2.wait_terminal().await, TransferState::Failed);
    while h3.bytes_received() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let status = s.relay.batch_status(&batch_id).unwrap();
    assert_eq!(status.state, BatchState::Failed);
    let states: Vec<FileState> = status.files.iter().map(|f| f.state).collect();
    assert_eq!(
        states,
        vec![FileState::Completed, FileState::Failed, FileState::Streaming]
    );

    // A failed sibling does not touch the others; the batch cannot be
    // deleted until the last member is done.
    assert!(s.relay.delete_batch(&batch_id).is_err());
    tx3.send(chunk(&ids[2], 1, b"def")).await.unwrap();
    tx3.send(Inbound::EndOfStream).await.unwrap();
    assert_eq!(h3.wait_terminal().await, TransferState::Completed);
    assert_eq!(s.relay.batch_status(&batch_id).unwrap().state, BatchState::Failed);
    s.relay.delete_batch(&batch_id).unwrap();
    assert!(matches!(
        s.relay.batch_status(&batch_id),
        Err(TransferError::UnknownBatch(_))
    ));
}

#[tokio::test]
async fn partially_admitted_batch() {
    // 25 MB budget, 10 MB footprint each: two of three fit.
    let s = setup_with(25 * MB, SessionConfig::default());
    let files = [file("a", 100 * MB), file("b", 100 * MB), file("c", 100 * MB)];
    let (batch_id, results) = s.relay.create_batch(&files).await;

    assert_eq!(results.iter().filter(|r| r.admitted).count(), 2);
    assert!(!results[2].admitted);
    assert!(results[2].reason.as_deref().unwrap().starts_with("insufficient memory"));

    let status = s.relay.batch_status(&batch_id).unwrap();
    assert_eq!(status.state, BatchState::Running);
    assert_eq!(status.files[2].state, FileState::Rejected);
    assert!(status.files[2].transfer_id.is_none());
}

#[tokio::test]
async fn batch_cancellation_fans_out() {
    let s = setup();
    let (batch_id, results) = s
        .relay
        .create_batch(&[file("a", 6), file("b", 6)])
        .await;
    let ids: Vec<String> = results.iter().map(|r| r.transfer_id.clone().unwrap()).collect();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (_h, _tx) = s.relay.attach(&ids[0], events_tx).unwrap();

    assert_eq!(s.relay.cancel_batch(&batch_id).unwrap(), 2);
    assert_eq!(collect(&mut events_rx).await, vec![TransferEvent::Cancelled]);
    for id in &ids {
        let handle = s.relay.transfer(id).unwrap();
        handle.wait_terminal().await;
    }
    assert_eq!(s.relay.batch_status(&batch_id).unwrap().state, BatchState::Cancelled);
    assert_eq!(s.relay.stats().admission.active_slots, 0);
}

#[tokio::test]
async fn shutdown_cancels_every_live_transfer() {
    let s = setup();
    s.relay.start();
    let (streaming, tx, mut events) = open(&s.relay, &file("live.bin", 100)).await;
    tx.send(chunk(streaming.transfer_id(), 0, &[7u8; 10])).await.unwrap();
    let waiting = s.relay.prepare(&file("waiting.bin", 100)).await.unwrap();

    assert_eq!(s.relay.shutdown(), 2);
    assert_eq!(collect(&mut events).await.last(), Some(&TransferEvent::Cancelled));
    streaming.wait_terminal().await;
    waiting.wait_terminal().await;
    assert_eq!(waiting.state(), TransferState::Cancelled);
    assert_eq!(streaming.state(), TransferState::Cancelled);

    let stats = s.relay.stats();
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.admission.active_slots, 0);
    assert_eq!(s.relay.shutdown(), 0);
}

#[tokio::test(start_paused = true)]
async fn retrieved_batches_are_forgotten_after_retention() {
    let s = setup_with(
        1 << 40,
        SessionConfig {
            reap_interval_ms: 1_000,
            terminal_retention_ms: 10_000,
            ..SessionConfig::default()
        },
    );
    s.relay.start();

    let (done, _) = s.relay.create_batch(&[file("a", 6), file("b", 6)]).await;
    let (unread, _) = s.relay.create_batch(&[file("c", 6)]).await;
    assert_eq!(s.relay.cancel_batch(&done).unwrap(), 2);
    assert_eq!(s.relay.cancel_batch(&unread).unwrap(), 1);
    assert_eq!(s.relay.batch_status(&done).unwrap().state, BatchState::Cancelled);
    assert_eq!(s.relay.stats().batches, 2);

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(matches!(
        s.relay.batch_status(&done),
        Err(TransferError::UnknownBatch(_))
    ));
    // Never retrieved, so still held.
    assert_eq!(s.relay.stats().batches, 1);
    assert_eq!(s.relay.batch_status(&unread).unwrap().state, BatchState::Cancelled);
    s.relay.shutdown();
}

#[tokio::test]
async fn attach_rules() {
    let s = setup();
    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(matches!(
        s.relay.attach("missing", tx),
        Err(TransferError::UnknownTransfer(_))
    ));

    let handle = s.relay.prepare(&file("x.bin", 3)).await.unwrap();
    let (tx1, _rx1) = mpsc::unbounded_channel();
    let (tx2, _rx2) = mpsc::unbounded_channel();
    assert!(s.relay.attach(handle.transfer_id(), tx1).is_ok());
    assert!(matches!(
        s.relay.attach(handle.transfer_id(), tx2),
        Err(TransferError::AlreadyAttached(_))
    ));
}

#[tokio::test]
async fn traversal_names_are_refused_before_admission() {
    let s = setup();
    let err = s.relay.prepare(&file("../../etc/passwd", 3)).await.unwrap_err();
    assert_eq!(err.code(), 400);
    assert_eq!(s.relay.stats().admission.admitted_total, 0);
}

#[tokio::test(start_paused = true)]
async fn unresponsive_session_is_force_cancelled() {
    let s = setup_with(
        1 << 40,
        SessionConfig {
            cancel_timeout_ms: 2_000,
            ..SessionConfig::default()
        },
    );
    s.sink.set_write_delay(Some(Duration::from_secs(3_600)));

    let (handle, tx, mut events) = open(&s.relay, &file("slow.bin", 6)).await;
    tx.send(chunk(handle.transfer_id(), 0, b"abc")).await.unwrap();
    while s.relay.stats().pool.checked_out() == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(s.relay.request_cancel(handle.transfer_id()), CancelStatus::Accepted);
    assert_eq!(handle.wait_terminal().await, TransferState::Cancelled);

    assert_eq!(collect(&mut events).await, vec![TransferEvent::Cancelled]);
    let stats = s.relay.stats();
    assert_eq!(stats.forced_teardowns, 1);
    assert_eq!(stats.admission.active_slots, 0);
    assert_eq!(
        s.relay.request_cancel(handle.transfer_id()),
        CancelStatus::AlreadyTerminal
    );
}

#[tokio::test(start_paused = true)]
async fn abandoned_transfers_are_reaped() {
    let s = setup_with(
        1 << 40,
        SessionConfig {
            idle_timeout_ms: 30_000,
            reap_interval_ms: 1_000,
            ..SessionConfig::default()
        },
    );
    s.relay.start();

    let (handle, tx, mut events) = open(&s.relay, &file("idle.bin", 6)).await;
    tx.send(chunk(handle.transfer_id(), 0, b"abc")).await.unwrap();

    assert_eq!(handle.wait_terminal().await, TransferState::Failed);
    match collect(&mut events).await.last() {
        Some(TransferEvent::Error(msg)) => assert!(msg.contains("idle timeout")),
        other => panic!("expected idle timeout error, got {other:?}"),
    }
    assert_eq!(s.relay.stats().reaped, 1);
    assert_eq!(s.relay.stats().admission.active_slots, 0);
    s.relay.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_racing_the_final_chunk_resolves_once() {
    let s = setup();
    for round in 0..25 {
        let (handle, tx, mut events) = open(&s.relay, &file(&format!("r{round}.bin"), 4)).await;
        let id = handle.transfer_id().to_string();

        let feeder = {
            let id = id.clone();
            tokio::spawn(async move {
                let _ = tx.send(chunk(&id, 0, b"data")).await;
                let _ = tx.send(Inbound::EndOfStream).await;
            })
        };
        let relay = s.relay.clone();
        let canceller = tokio::spawn(async move { relay.request_cancel(&id) });

        feeder.await.unwrap();
        canceller.await.unwrap();
        let events = collect(&mut events).await;
        let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1, "round {round}: {events:?}");

        let state = handle.wait_terminal().await;
        match terminal[0] {
            TransferEvent::Success(_) => assert_eq!(state, TransferState::Completed),
            TransferEvent::Cancelled => assert_eq!(state, TransferState::Cancelled),
            other => panic!("round {round}: unexpected terminal event {other:?}"),
        }
    }
    assert_eq!(s.relay.stats().admission.active_slots, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_stays_bounded_under_concurrent_transfers() {
    let s = setup();
    let mut tasks = Vec::new();
    for i in 0..24 {
        let relay = s.relay.clone();
        tasks.push(tokio::spawn(async move {
            let payload = vec![i as u8; 200_000];
            let (handle, tx, mut events) = open(&relay, &file(&format!("p{i}.bin"), 1_000_000)).await;
            for seq in 0..5u64 {
                tx.send(chunk(handle.transfer_id(), seq, &payload)).await.unwrap();
                let stats = relay.pool().stats();
                for tier in &stats.tiers {
                    assert!(tier.resident <= tier.max_buffers);
                    assert!(tier.idle <= tier.max_buffers);
                }
            }
            tx.send(Inbound::EndOfStream).await.unwrap();
            collect(&mut events).await
        }));
    }
    for task in tasks {
        let events = task.await.unwrap();
        assert!(matches!(events.last(), Some(TransferEvent::Success(_))));
    }
    assert_eq!(s.relay.stats().pool.checked_out(), 0);
    assert_eq!(s.sink.object_count(), 24);
}
