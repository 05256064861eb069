// Outbound senders
//
// One sender per remote node: a bounded queue drained by a writer task
// that serializes, frames, and writes each message. Write failures drop
// queued messages and reconnect with exponential backoff; the routing
// layer keeps handing messages to the sender and observes failures
// through statistics until the reconciler replaces or removes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::frame::encode_frame;
use crate::error::{MeshError, Result};
use crate::serializer::Serializer;
use crate::stats::StatsCollector;
use crate::types::{NodeAddress, RoutedMessage};

const SEND_QUEUE_DEPTH: usize = 1024;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Sender for one remote node.
pub struct Sender {
    addr: NodeAddress,
    queue: mpsc::Sender<RoutedMessage>,
    connected: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    flush_on_stop: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Sender {
    /// Start the writer task for `addr`. The connection is established
    /// lazily by the task; messages queued meanwhile wait or are dropped
    /// on connect failure.
    pub fn open(
        addr: NodeAddress,
        serializer: Arc<dyn Serializer>,
        stats: Arc<dyn StatsCollector>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let connected = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let flush_on_stop = Arc::new(AtomicBool::new(false));
        let stop_notify = Arc::new(Notify::new());

        let task = tokio::spawn(writer_loop(
            addr.clone(),
            rx,
            serializer,
            Arc::clone(&connected),
            Arc::clone(&stopped),
            Arc::clone(&flush_on_stop),
            Arc::clone(&stop_notify),
            stats,
        ));

        Arc::new(Self {
            addr,
            queue: tx,
            connected,
            stopped,
            flush_on_stop,
            stop_notify,
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    pub fn address(&self) -> &NodeAddress {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queue a message for the writer. Non-blocking; a full queue or a
    /// stopped sender is a failure the caller may ignore.
    pub fn send(&self, message: RoutedMessage) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(MeshError::ShutdownInProgress);
        }
        self.queue
            .try_send(message)
            .map_err(|_| MeshError::SenderUnavailable(self.addr.to_string()))
    }

    /// Stop the writer; `flush` writes out what is already queued first.
    /// Idempotent.
    pub async fn stop(&self, flush: bool) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flush_on_stop.store(flush, Ordering::Release);
        self.stop_notify.notify_one();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(SHUTDOWN_WAIT, task).await.is_err() {
                warn!("sender for {} did not stop within {:?}", self.addr, SHUTDOWN_WAIT);
            }
        }
    }
}

enum WriteFailure {
    /// This message cannot be written; the connection is fine.
    Message(MeshError),
    /// The connection is gone.
    Connection(std::io::Error),
}

#[allow(clippy::too_many_arguments)]
async fn writer_loop(
    addr: NodeAddress,
    mut rx: mpsc::Receiver<RoutedMessage>,
    serializer: Arc<dyn Serializer>,
    connected: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    flush_on_stop: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    stats: Arc<dyn StatsCollector>,
) {
    let target = addr.socket_addr_string();
    let mut backoff = INITIAL_BACKOFF;
    let mut out = BytesMut::with_capacity(8 * 1024);

    'reconnect: loop {
        if stopped.load(Ordering::Acquire) {
            break;
        }

        let connect = tokio::select! {
            _ = stop_notify.notified() => break,
            conn = TcpStream::connect(target.as_str()) => conn,
        };
        let mut stream = match connect {
            Ok(stream) => {
                configure_socket(&stream, &addr);
                connected.store(true, Ordering::Release);
                backoff = INITIAL_BACKOFF;
                debug!("connected to {}", addr);
                stream
            }
            Err(e) => {
                debug!("connect to {} failed: {}", addr, e);
                connected.store(false, Ordering::Release);
                drop_queued(&mut rx, &stats);
                tokio::select! {
                    _ = stop_notify.notified() => break,
                    _ = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        loop {
            let message = tokio::select! {
                _ = stop_notify.notified() => {
                    if flush_on_stop.load(Ordering::Acquire) {
                        flush_remaining(&mut rx, &mut stream, &serializer, &addr, &mut out, &stats).await;
                    } else {
                        drop_queued(&mut rx, &stats);
                    }
                    let _ = stream.shutdown().await;
                    break 'reconnect;
                }
                m = rx.recv() => match m {
                    Some(m) => m,
                    None => {
                        let _ = stream.shutdown().await;
                        break 'reconnect;
                    }
                },
            };

            match write_one(&message, &mut stream, &serializer, &addr, &mut out).await {
                Ok(()) => stats.message_sent(),
                Err(WriteFailure::Message(e)) => {
                    warn!("dropping message for {}: {}", addr, e);
                    stats.message_not_sent();
                }
                Err(WriteFailure::Connection(e)) => {
                    warn!("write to {} failed: {}", addr, e);
                    connected.store(false, Ordering::Release);
                    stats.message_not_sent();
                    drop_queued(&mut rx, &stats);
                    tokio::select! {
                        _ = stop_notify.notified() => break 'reconnect,
                        _ = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue 'reconnect;
                }
            }
        }
    }

    connected.store(false, Ordering::Release);
    debug!("sender for {} exited", addr);
}

async fn write_one(
    message: &RoutedMessage,
    stream: &mut TcpStream,
    serializer: &Arc<dyn Serializer>,
    addr: &NodeAddress,
    out: &mut BytesMut,
) -> std::result::Result<(), WriteFailure> {
    let payload = serializer
        .serialize(message)
        .map_err(WriteFailure::Message)?;

    out.clear();
    encode_frame(&payload, addr.max_message_size, out).map_err(WriteFailure::Message)?;
    stream
        .write_all(out)
        .await
        .map_err(WriteFailure::Connection)
}

async fn flush_remaining(
    rx: &mut mpsc::Receiver<RoutedMessage>,
    stream: &mut TcpStream,
    serializer: &Arc<dyn Serializer>,
    addr: &NodeAddress,
    out: &mut BytesMut,
    stats: &Arc<dyn StatsCollector>,
) {
    while let Ok(message) = rx.try_recv() {
        match write_one(&message, stream, serializer, addr, out).await {
            Ok(()) => stats.message_sent(),
            Err(WriteFailure::Message(_)) => stats.message_not_sent(),
            Err(WriteFailure::Connection(_)) => {
                stats.message_not_sent();
                drop_queued(rx, stats);
                return;
            }
        }
    }
}

fn drop_queued(rx: &mut mpsc::Receiver<RoutedMessage>, stats: &Arc<dyn StatsCollector>) {
    while rx.try_recv().is_ok() {
        stats.message_not_sent();
    }
}

fn configure_socket(stream: &TcpStream, addr: &NodeAddress) {
    // Nagle off for dispatch latency.
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", addr, e);
    }

    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!("set_tcp_keepalive failed for {}: {}", addr, e);
    }
    if addr.recv_buffer_size > 0 {
        if let Err(e) = sock.set_send_buffer_size(addr.recv_buffer_size) {
            debug!("set_send_buffer_size failed for {}: {}", addr, e);
        }
    }
}

/// Guid-keyed pool of senders. The reconciler is the only writer.
pub struct SenderPool {
    senders: DashMap<String, Arc<Sender>>,
    serializer: Arc<dyn Serializer>,
    stats: Arc<dyn StatsCollector>,
    stopped: AtomicBool,
}

impl SenderPool {
    pub fn new(serializer: Arc<dyn Serializer>, stats: Arc<dyn StatsCollector>) -> Arc<Self> {
        Arc::new(Self {
            senders: DashMap::new(),
            serializer,
            stats,
            stopped: AtomicBool::new(false),
        })
    }

    /// Existing sender for the node, or a freshly opened one.
    pub fn open(&self, addr: &NodeAddress) -> Result<Arc<Sender>> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(MeshError::ShutdownInProgress);
        }
        if let Some(existing) = self.senders.get(&addr.guid) {
            return Ok(Arc::clone(existing.value()));
        }
        info!("opening sender for {}", addr);
        let sender = Sender::open(
            addr.clone(),
            Arc::clone(&self.serializer),
            Arc::clone(&self.stats),
        );
        self.senders.insert(addr.guid.clone(), Arc::clone(&sender));
        Ok(sender)
    }

    /// Stop and remove the sender for `addr`, if any.
    pub async fn stop_sender(&self, addr: &NodeAddress, flush: bool) {
        if let Some((_, sender)) = self.senders.remove(&addr.guid) {
            info!("stopping sender for {}", addr);
            sender.stop(flush).await;
        }
    }

    /// Stop every sender. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let all: Vec<Arc<Sender>> = self.senders.iter().map(|e| Arc::clone(e.value())).collect();
        self.senders.clear();
        for sender in all {
            sender.stop(false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::BincodeSerializer;
    use crate::stats::AtomicStatsCollector;
    use crate::transport::frame::{Decoded, FrameDecoder};
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_addr(guid: &str, port: u16) -> NodeAddress {
        NodeAddress::new(guid, "127.0.0.1", port, 1, 65536, 8 * 1024 * 1024)
    }

    fn test_message(tag: u8) -> RoutedMessage {
        RoutedMessage {
            container_indexes: vec![0],
            key: Bytes::from(vec![tag]),
            payload: Bytes::from(vec![tag; 32]),
        }
    }

    async fn read_frames(listener: TcpListener, count: usize) -> Vec<Vec<u8>> {
        let (mut stream, peer) = listener.accept().await.unwrap();
        let mut decoder = FrameDecoder::new(peer.to_string(), 8 * 1024 * 1024);
        let mut acc = BytesMut::new();
        let mut frames = Vec::new();
        while frames.len() < count {
            match decoder.decode(&acc).unwrap() {
                Decoded::Frame { start, end } => {
                    frames.push(acc[start..end].to_vec());
                    let rest = acc.split_off(end);
                    acc = rest;
                }
                Decoded::NeedMore(_) => {
                    let n = stream.read_buf(&mut acc).await.unwrap();
                    assert!(n > 0, "peer closed early");
                }
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_send_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let reader = tokio::spawn(read_frames(listener, 2));

        let serializer: Arc<dyn Serializer> = Arc::new(BincodeSerializer::new());
        let stats = Arc::new(AtomicStatsCollector::new());
        let sender = Sender::open(test_addr("peer", port), Arc::clone(&serializer), stats.clone());

        sender.send(test_message(1)).unwrap();
        sender.send(test_message(2)).unwrap();

        let frames = reader.await.unwrap();
        let first = serializer.deserialize(&frames[0]).unwrap();
        let second = serializer.deserialize(&frames[1]).unwrap();
        assert_eq!(first, test_message(1));
        assert_eq!(second, test_message(2));

        sender.stop(false).await;
        assert_eq!(stats.sent(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_peer_drops_queued() {
        // Nothing listens on the target port.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let stats = Arc::new(AtomicStatsCollector::new());
        let sender = Sender::open(
            test_addr("peer", port),
            Arc::new(BincodeSerializer::new()),
            stats.clone(),
        );

        for i in 0..5 {
            sender.send(test_message(i)).unwrap();
        }

        let mut dropped = false;
        for _ in 0..200 {
            if stats.not_sent() == 5 {
                dropped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dropped, "queued messages not dropped after connect failure");
        assert!(!sender.is_connected());

        sender.stop(false).await;
    }

    #[tokio::test]
    async fn test_send_after_stop_fails() {
        let stats = Arc::new(AtomicStatsCollector::new());
        let sender = Sender::open(
            test_addr("peer", 1),
            Arc::new(BincodeSerializer::new()),
            stats,
        );
        sender.stop(false).await;
        assert!(sender.send(test_message(0)).is_err());
        // Idempotent.
        sender.stop(false).await;
    }

    #[tokio::test]
    async fn test_pool_reuses_sender_per_guid() {
        let pool = SenderPool::new(
            Arc::new(BincodeSerializer::new()),
            Arc::new(AtomicStatsCollector::new()),
        );

        let a = pool.open(&test_addr("n1", 9001)).unwrap();
        let b = pool.open(&test_addr("n1", 9001)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = pool.open(&test_addr("n2", 9002)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));

        pool.shutdown().await;
        assert!(pool.open(&test_addr("n3", 9003)).is_err());
    }
}
