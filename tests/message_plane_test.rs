// End-to-end message plane tests: real TCP between nodes, an in-process
// coordination directory, and recording containers.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use rusty_mesh::coordination::MemorySession;
use rusty_mesh::stats::AtomicStatsCollector;
use rusty_mesh::{ClusterId, Container, KeyedMessage, MeshConfig, MeshNode, MeshNodeBuilder, Result};

struct RecordingContainer {
    seen: Mutex<Vec<Vec<u8>>>,
}

impl RecordingContainer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.seen.lock().len()
    }

    fn payloads(&self) -> Vec<Vec<u8>> {
        self.seen.lock().clone()
    }
}

impl Container for RecordingContainer {
    fn deliver(&self, message: &KeyedMessage) -> Result<()> {
        self.seen.lock().push(message.payload.to_vec());
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn message(key: &[u8], payload: Vec<u8>, types: &[&str]) -> KeyedMessage {
    KeyedMessage::new(
        Bytes::copy_from_slice(key),
        Bytes::from(payload),
        types.iter().map(|t| t.to_string()).collect(),
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Dispatch probe messages until one lands in the container, proving the
/// route from `from` is established end to end.
async fn establish_route(from: &MeshNode, sink: &RecordingContainer, types: &[&str]) {
    let arrived = wait_until(|| {
        let _ = from.dispatch(&message(b"probe", b"probe".to_vec(), types));
        sink.count() > 0
    })
    .await;
    assert!(arrived, "route never became available");
}

fn numbered(seen: &[Vec<u8>]) -> Vec<u32> {
    seen.iter()
        .filter(|p| p.len() == 5 && p[0] == b'#')
        .map(|p| u32::from_be_bytes([p[1], p[2], p[3], p[4]]))
        .collect()
}

fn numbered_payload(n: u32) -> Vec<u8> {
    let mut payload = vec![b'#'];
    payload.extend_from_slice(&n.to_be_bytes());
    payload
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_node_round_trip_preserves_order() {
    init_tracing();
    let directory = MemorySession::new();

    let sink = RecordingContainer::new();
    let host = MeshNodeBuilder::new(MeshConfig::default(), Arc::new(directory.attach()))
        .add_container(
            ClusterId::new("mesh", "sink"),
            vec!["Event".to_string()],
            sink.clone(),
        )
        .start()
        .await
        .unwrap();

    // Adaptor-only node: dispatches, hosts nothing.
    let adaptor = MeshNodeBuilder::new(MeshConfig::default(), Arc::new(directory.attach()))
        .start()
        .await
        .unwrap();

    establish_route(&adaptor, &sink, &["Event"]).await;

    let total = 50u32;
    for n in 0..total {
        adaptor
            .dispatch(&message(b"key-1", numbered_payload(n), &["Event"]))
            .unwrap();
    }

    assert!(wait_until(|| numbered(&sink.payloads()).len() == total as usize).await);
    let got = numbered(&sink.payloads());
    assert_eq!(got, (0..total).collect::<Vec<_>>(), "delivery reordered");

    adaptor.stop().await;
    host.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_colocated_clusters_share_one_frame() {
    init_tracing();
    let directory = MemorySession::new();

    let alpha = RecordingContainer::new();
    let beta = RecordingContainer::new();
    let host = MeshNodeBuilder::new(MeshConfig::default(), Arc::new(directory.attach()))
        .add_container(
            ClusterId::new("mesh", "alpha"),
            vec!["A".to_string()],
            alpha.clone(),
        )
        .add_container(
            ClusterId::new("mesh", "beta"),
            vec!["B".to_string()],
            beta.clone(),
        )
        .start()
        .await
        .unwrap();

    let stats = Arc::new(AtomicStatsCollector::new());
    let adaptor = MeshNodeBuilder::new(MeshConfig::default(), Arc::new(directory.attach()))
        .stats(stats.clone())
        .start()
        .await
        .unwrap();

    establish_route(&adaptor, &alpha, &["A"]).await;

    // Let the probes' asynchronous send accounting settle before
    // measuring.
    let mut settled = stats.sent();
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let now = stats.sent();
        if now == settled {
            break;
        }
        settled = now;
    }

    // Both clusters live on the host node: one message with both types
    // must cross the wire exactly once.
    let sent_before = stats.sent();
    let alpha_before = alpha.count();
    let beta_before = beta.count();

    adaptor
        .dispatch(&message(b"key-9", b"both".to_vec(), &["A", "B"]))
        .unwrap();

    assert!(wait_until(|| alpha.count() > alpha_before && beta.count() > beta_before).await);
    assert!(wait_until(|| stats.sent() == sent_before + 1).await);
    assert_eq!(
        stats.sent(),
        sent_before + 1,
        "co-located clusters must share one send"
    );

    adaptor.stop().await;
    host.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_per_container_order_across_the_wire() {
    init_tracing();
    let directory = MemorySession::new();

    let alpha = RecordingContainer::new();
    let beta = RecordingContainer::new();
    let host = MeshNodeBuilder::new(MeshConfig::default(), Arc::new(directory.attach()))
        .add_container(
            ClusterId::new("mesh", "alpha"),
            vec!["A".to_string()],
            alpha.clone(),
        )
        .add_container(
            ClusterId::new("mesh", "beta"),
            vec!["B".to_string()],
            beta.clone(),
        )
        .start()
        .await
        .unwrap();

    let adaptor = MeshNodeBuilder::new(MeshConfig::default(), Arc::new(directory.attach()))
        .start()
        .await
        .unwrap();

    establish_route(&adaptor, &alpha, &["A"]).await;
    establish_route(&adaptor, &beta, &["B"]).await;

    // Alternate targets; each container must see its own subsequence in
    // dispatch order even though deserialization runs in parallel.
    let total = 200u32;
    for n in 0..total {
        let types: &[&str] = if n % 2 == 0 { &["A"] } else { &["B"] };
        adaptor
            .dispatch(&message(b"key-1", numbered_payload(n), types))
            .unwrap();
    }

    assert!(wait_until(|| {
        numbered(&alpha.payloads()).len() + numbered(&beta.payloads()).len() == total as usize
    })
    .await);

    let got_alpha = numbered(&alpha.payloads());
    let got_beta = numbered(&beta.payloads());
    assert_eq!(got_alpha, (0..total).step_by(2).collect::<Vec<_>>());
    assert_eq!(got_beta, (1..total).step_by(2).collect::<Vec<_>>());

    adaptor.stop().await;
    host.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_departed_node_routes_to_nothing() {
    init_tracing();
    let directory = MemorySession::new();

    let sink = RecordingContainer::new();
    let host = MeshNodeBuilder::new(MeshConfig::default(), Arc::new(directory.attach()))
        .add_container(
            ClusterId::new("mesh", "sink"),
            vec!["Event".to_string()],
            sink.clone(),
        )
        .start()
        .await
        .unwrap();

    let stats = Arc::new(AtomicStatsCollector::new());
    let adaptor = MeshNodeBuilder::new(MeshConfig::default(), Arc::new(directory.attach()))
        .stats(stats.clone())
        .start()
        .await
        .unwrap();

    establish_route(&adaptor, &sink, &["Event"]).await;

    host.stop().await;

    // Once the adaptor's reconciler drops the departed host, dispatches
    // become routing misses.
    let missed = wait_until(|| {
        let before = stats.not_sent();
        let _ = adaptor.dispatch(&message(b"key-1", b"late".to_vec(), &["Event"]));
        stats.not_sent() > before
    })
    .await;
    assert!(missed, "dispatch after departure should count a miss");

    adaptor.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disrupt_then_reconnect() {
    init_tracing();
    let directory = MemorySession::new();

    let sink = RecordingContainer::new();
    let host = MeshNodeBuilder::new(MeshConfig::default(), Arc::new(directory.attach()))
        .add_container(
            ClusterId::new("mesh", "sink"),
            vec!["Event".to_string()],
            sink.clone(),
        )
        .start()
        .await
        .unwrap();

    let adaptor = MeshNodeBuilder::new(MeshConfig::default(), Arc::new(directory.attach()))
        .start()
        .await
        .unwrap();

    establish_route(&adaptor, &sink, &["Event"]).await;

    // Force-close the adaptor's inbound connection at the host.
    assert!(host.disrupt(adaptor.address()).await);

    // The sender reconnects with backoff; a fresh message eventually
    // lands. Some in-flight messages may be lost, never duplicated.
    let before = numbered(&sink.payloads()).len();
    let mut n = 1000u32;
    let recovered = wait_until(|| {
        n += 1;
        let _ = adaptor.dispatch(&message(b"key-1", numbered_payload(n), &["Event"]));
        numbered(&sink.payloads()).len() > before
    })
    .await;
    assert!(recovered, "sender never recovered after disrupt");

    adaptor.stop().await;
    host.stop().await;
}
