//! Full round trips: a real relay on an OS-assigned port, driven by
//! `uplink-client`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uplink_client::{ClientError, ControlClient, TransferClient};
use uplink_protocol::{BatchState, CancelStatus, FileDescriptor, FileState, TransferEvent};
use uplink_relay_server::{RelayServer, ServerConfig};
use uplink_transfer::{FsSink, Relay, StaticSampler, TransferConfig};

const MB: u64 = 1_000_000;

struct Harness {
    server: Arc<RelayServer>,
    url: String,
    dir: TempDir,
}

impl Harness {
    async fn start(available: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let relay = Relay::new(
            &TransferConfig::default(),
            Arc::new(StaticSampler::new(available, available)),
            Arc::new(FsSink::new(dir.path().join("objects"))),
        )
        .unwrap();
        let server = RelayServer::new(ServerConfig::default(), relay);
        let listener = server.bind().await.unwrap();
        let url = format!("ws://127.0.0.1:{}", server.port().await);
        let runner = Arc::clone(&server);
        tokio::spawn(async move { runner.serve(listener).await });
        Self { server, url, dir }
    }

    fn write_file(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    async fn wait_for_file_state(&self, control: &ControlClient, batch_id: &str, index: usize, state: FileState) {
        for _ in 0..200 {
            let status = control.batch_status(batch_id).await.unwrap();
            if status.files[index].state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("file {index} of batch {batch_id} never reached {state:?}");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

fn descriptor(name: &str, size: u64) -> FileDescriptor {
    FileDescriptor {
        declared_size: size,
        content_type: "application/octet-stream".into(),
        filename: name.into(),
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn upload_file_lands_in_the_sink() {
    let h = Harness::start(1 << 40).await;
    let data = pattern(3 * 1024 * 1024 + 17);
    let path = h.write_file("video.bin", &data);

    let reference = TransferClient::upload_file(&h.url, &path, "video/mp4")
        .await
        .unwrap();
    assert!(reference.ends_with("video.bin"));
    assert_eq!(std::fs::read(Path::new(&reference)).unwrap(), data);

    let stats = h.server.relay().stats();
    assert_eq!(stats.admission.active_slots, 0);
    assert_eq!(stats.pool.checked_out(), 0);
}

#[tokio::test]
async fn events_are_monotonic_and_end_the_channel() {
    let h = Harness::start(1 << 40).await;
    let data = pattern(1024 * 1024);
    let mut client = TransferClient::init(&h.url, &descriptor("a.bin", data.len() as u64))
        .await
        .unwrap();
    assert!(client.destination().ends_with("a.bin"));
    assert!(client.max_chunk_size() >= client.chunk_size());

    for chunk in data.chunks(64 * 1024) {
        client.send_chunk(chunk).await.unwrap();
    }
    client.finish().await.unwrap();

    let mut events = Vec::new();
    while let Some(ev) = client.next_event().await {
        events.push(ev);
    }
    let progress: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[0] < w[1]), "{progress:?}");
    assert_eq!(progress.last(), Some(&100.0));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(matches!(events.last(), Some(TransferEvent::Success(_))));
}

#[tokio::test]
async fn tenth_concurrent_init_is_refused_with_503() {
    // Ten percent footprint: nine 100 MB transfers fit into 95 MB.
    let h = Harness::start(95 * MB).await;
    let mut open = Vec::new();
    for i in 0..9 {
        let client = TransferClient::init(&h.url, &descriptor(&format!("f{i}"), 100 * MB))
            .await
            .unwrap();
        open.push(client);
    }

    let err = TransferClient::init(&h.url, &descriptor("f9", 100 * MB))
        .await
        .err()
        .unwrap();
    assert!(err.is_admission_denied(), "{err}");
    assert!(err.to_string().contains("insufficient memory"));

    // Dropping a channel fails its transfer and frees its slot.
    drop(open.pop());
    for _ in 0..200 {
        if h.server.relay().stats().admission.active_slots == 8 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(TransferClient::init(&h.url, &descriptor("f9", 100 * MB)).await.is_ok());
}

#[tokio::test]
async fn short_stream_fails_with_protocol_violation() {
    let h = Harness::start(1 << 40).await;
    let mut client = TransferClient::init(&h.url, &descriptor("short.bin", 10))
        .await
        .unwrap();
    client.send_chunk(b"12345").await.unwrap();
    client.finish().await.unwrap();

    match client.wait_terminal().await.unwrap() {
        TransferEvent::Error(msg) => assert!(msg.contains("end-of-stream after 5 bytes"), "{msg}"),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(client.next_event().await.is_none());
}

#[tokio::test]
async fn cancel_from_control_channel() {
    let h = Harness::start(1 << 40).await;
    let control = ControlClient::connect(&h.url).await.unwrap();
    control.ping().await.unwrap();

    let mut client = TransferClient::init(&h.url, &descriptor("big.bin", 10 * MB))
        .await
        .unwrap();
    client.send_chunk(&pattern(4096)).await.unwrap();

    let ack = control.cancel_transfer(client.transfer_id()).await.unwrap();
    assert_eq!(ack.status, CancelStatus::Accepted);
    assert_eq!(client.wait_terminal().await.unwrap(), TransferEvent::Cancelled);

    let again = control.cancel_transfer(client.transfer_id()).await.unwrap();
    assert_eq!(again.status, CancelStatus::AlreadyTerminal);
    let unknown = control.cancel_transfer("no-such-transfer").await.unwrap();
    assert_eq!(unknown.status, CancelStatus::Unknown);
    assert_eq!(h.server.relay().stats().admission.active_slots, 0);
}

#[tokio::test]
async fn batch_with_one_broken_member() {
    let h = Harness::start(1 << 40).await;
    let control = ControlClient::connect(&h.url).await.unwrap();

    let one = pattern(200_000);
    let three = pattern(300_000);
    let created = control
        .create_batch(vec![
            descriptor("one.bin", one.len() as u64),
            descriptor("two.bin", 50_000),
            descriptor("three.bin", three.len() as u64),
        ])
        .await
        .unwrap();
    assert!(created.results.iter().all(|r| r.admitted));
    let ids: Vec<String> = created
        .results
        .iter()
        .map(|r| r.transfer_id.clone().unwrap())
        .collect();

    let path_one = h.write_file("one.bin", &one);
    TransferClient::upload_attached(&h.url, &ids[0], &path_one)
        .await
        .unwrap();

    // The second member's client goes away halfway.
    let mut broken = TransferClient::attach(&h.url, &ids[1]).await.unwrap();
    broken.send_chunk(&pattern(10_000)).await.unwrap();
    broken.close().await;
    drop(broken);
    h.wait_for_file_state(&control, &created.batch_id, 1, FileState::Failed)
        .await;

    let path_three = h.write_file("three.bin", &three);
    TransferClient::upload_attached(&h.url, &ids[2], &path_three)
        .await
        .unwrap();

    let status = control.batch_status(&created.batch_id).await.unwrap();
    assert_eq!(status.state, BatchState::Failed);
    let states: Vec<FileState> = status.files.iter().map(|f| f.state).collect();
    assert_eq!(
        states,
        vec![FileState::Completed, FileState::Failed, FileState::Completed]
    );

    assert!(control.delete_batch(&created.batch_id).await.unwrap().success);
    let err = control.batch_status(&created.batch_id).await.err().unwrap();
    assert!(matches!(err, ClientError::Relay { code: 404, .. }));
}

#[tokio::test]
async fn batch_member_attaches_once() {
    let h = Harness::start(1 << 40).await;
    let control = ControlClient::connect(&h.url).await.unwrap();
    let created = control
        .create_batch(vec![descriptor("x.bin", 10)])
        .await
        .unwrap();
    let id = created.results[0].transfer_id.clone().unwrap();

    let _first = TransferClient::attach(&h.url, &id).await.unwrap();
    let err = TransferClient::attach(&h.url, &id).await.err().unwrap();
    assert!(matches!(err, ClientError::Relay { code: 409, .. }), "{err}");

    let err = TransferClient::attach(&h.url, "missing").await.err().unwrap();
    assert!(matches!(err, ClientError::Relay { code: 404, .. }), "{err}");
}

#[tokio::test]
async fn traversal_filename_is_refused() {
    let h = Harness::start(1 << 40).await;
    let err = TransferClient::init(&h.url, &descriptor("../escape.bin", 10))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ClientError::Relay { code: 400, .. }), "{err}");
    assert_eq!(h.server.relay().stats().admission.admitted_total, 0);
}
