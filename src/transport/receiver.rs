// Framed TCP receiver
//
// One acceptor task owns the listening socket and round-robins accepted
// connections to N reader tasks. A reader owns its connections, frames
// their byte streams, and hands each complete frame to the listener as a
// one-shot lazy reader. Corrupt frames close only the offending
// connection.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::buffer::{BufferPool, PooledBuffer};
use super::frame::{Decoded, FrameDecoder};
use super::Listener;
use crate::config::{self, ReceiverConfig};
use crate::error::{MeshError, Result};
use crate::types::NodeAddress;

const COMMAND_DEPTH: usize = 64;
const POOL_RETAIN: usize = 64;
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

enum ReaderCommand {
    NewConnection(TcpStream, SocketAddr),
    Disrupt {
        host: IpAddr,
        reply: oneshot::Sender<bool>,
    },
}

/// Multi-reader framed receiver.
pub struct FramedReceiver {
    local_addr: SocketAddr,
    reader_txs: parking_lot::Mutex<Vec<mpsc::Sender<ReaderCommand>>>,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
    acceptor_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    reader_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    pool: Arc<BufferPool>,
}

impl FramedReceiver {
    /// Bind per `config` and start the acceptor and reader tasks.
    pub async fn start(config: &ReceiverConfig, listener: Arc<dyn Listener>) -> Result<Self> {
        let ip = config::resolve_bind_ip(config.network_interface.as_deref())?;
        let socket = TcpListener::bind((ip, config.bind_port))
            .await
            .map_err(|e| MeshError::Bind(format!("{}:{}: {}", ip, config.bind_port, e)))?;
        let local_addr = socket.local_addr()?;

        let pool = BufferPool::new(config.recv_buffer_size, POOL_RETAIN);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut reader_txs = Vec::new();
        let mut reader_tasks = Vec::new();
        for id in 0..config.num_handlers.max(1) {
            let (tx, rx) = mpsc::channel(COMMAND_DEPTH);
            reader_txs.push(tx);
            reader_tasks.push(tokio::spawn(reader_loop(
                id,
                rx,
                Arc::clone(&listener),
                Arc::clone(&pool),
                config.max_message_size,
            )));
        }

        let acceptor_task = tokio::spawn(acceptor_loop(socket, reader_txs.clone(), shutdown_rx));
        info!(
            "receiver listening on {} with {} readers",
            local_addr,
            reader_txs.len()
        );

        Ok(Self {
            local_addr,
            reader_txs: parking_lot::Mutex::new(reader_txs),
            shutdown_tx,
            running: AtomicBool::new(true),
            acceptor_task: parking_lot::Mutex::new(Some(acceptor_task)),
            reader_tasks: parking_lot::Mutex::new(reader_tasks),
            pool,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive-buffer pool; exposed so tests can assert lease balance.
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Force-close any connection from `peer`. Returns whether one matched.
    ///
    /// Matching is by remote IP; the connecting side uses an ephemeral
    /// port, so ports cannot be compared.
    pub async fn disrupt(&self, peer: &NodeAddress) -> bool {
        let Some(host) = resolve_host(&peer.host).await else {
            return false;
        };

        let txs: Vec<_> = self.reader_txs.lock().clone();
        let mut any = false;
        for tx in txs {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx
                .send(ReaderCommand::Disrupt {
                    host,
                    reply: reply_tx,
                })
                .await
                .is_ok()
            {
                if let Ok(found) = reply_rx.await {
                    any |= found;
                }
            }
        }
        any
    }

    /// Stop accepting, close all connections, and wait for the tasks.
    /// Idempotent; returns within a bound regardless of peer activity.
    pub async fn close(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        // The acceptor holds clones of the reader channels; it must exit
        // before dropping ours closes them.
        let acceptor = self.acceptor_task.lock().take();
        if let Some(task) = acceptor {
            if tokio::time::timeout(SHUTDOWN_WAIT, task).await.is_err() {
                warn!("acceptor did not stop within {:?}", SHUTDOWN_WAIT);
            }
        }

        drop(std::mem::take(&mut *self.reader_txs.lock()));
        let readers: Vec<_> = std::mem::take(&mut *self.reader_tasks.lock());
        for task in readers {
            if tokio::time::timeout(SHUTDOWN_WAIT, task).await.is_err() {
                warn!("reader did not stop within {:?}", SHUTDOWN_WAIT);
            }
        }
        info!("receiver on {} closed", self.local_addr);
    }
}

async fn resolve_host(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse() {
        return Some(ip);
    }
    tokio::net::lookup_host((host, 0))
        .await
        .ok()?
        .next()
        .map(|a| a.ip())
}

async fn acceptor_loop(
    socket: TcpListener,
    readers: Vec<mpsc::Sender<ReaderCommand>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let next = AtomicUsize::new(0);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = socket.accept() => match accepted {
                Ok((stream, peer)) => {
                    let idx = next.fetch_add(1, Ordering::Relaxed) % readers.len();
                    debug!("accepted {} onto reader {}", peer, idx);
                    if readers[idx]
                        .send(ReaderCommand::NewConnection(stream, peer))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("acceptor exiting");
}

type ConnFuture = Pin<Box<dyn Future<Output = u64> + Send>>;

async fn reader_loop(
    id: usize,
    mut commands: mpsc::Receiver<ReaderCommand>,
    listener: Arc<dyn Listener>,
    pool: Arc<BufferPool>,
    max_message_size: usize,
) {
    let mut connections: FuturesUnordered<ConnFuture> = FuturesUnordered::new();
    let mut cancels: HashMap<u64, (IpAddr, Arc<Notify>)> = HashMap::new();
    let mut next_conn = 0u64;

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(ReaderCommand::NewConnection(stream, peer)) => {
                    let conn_id = next_conn;
                    next_conn += 1;
                    let cancel = Arc::new(Notify::new());
                    cancels.insert(conn_id, (peer.ip(), Arc::clone(&cancel)));
                    connections.push(Box::pin(drive_connection(
                        conn_id,
                        stream,
                        peer,
                        Arc::clone(&listener),
                        pool.lease(),
                        max_message_size,
                        cancel,
                    )));
                }
                Some(ReaderCommand::Disrupt { host, reply }) => {
                    let mut any = false;
                    for (ip, cancel) in cancels.values() {
                        if *ip == host {
                            cancel.notify_one();
                            any = true;
                        }
                    }
                    let _ = reply.send(any);
                }
                None => break,
            },
            Some(done) = connections.next(), if !connections.is_empty() => {
                cancels.remove(&done);
            }
        }
    }

    // Shutdown: cancel whatever is still connected and drain.
    for (_, cancel) in cancels.values() {
        cancel.notify_one();
    }
    while connections.next().await.is_some() {}
    debug!("reader {} exiting", id);
}

/// Read frames off one connection until EOF, error, corruption, or cancel.
async fn drive_connection(
    conn_id: u64,
    mut stream: TcpStream,
    peer: SocketAddr,
    listener: Arc<dyn Listener>,
    mut buf: PooledBuffer,
    max_message_size: usize,
    cancel: Arc<Notify>,
) -> u64 {
    let mut decoder = FrameDecoder::new(peer.to_string(), max_message_size);
    loop {
        // Drain every complete frame already accumulated.
        loop {
            match decoder.decode(buf.chunk()) {
                Ok(Decoded::Frame { start, end }) => {
                    let (frame, next) = buf.into_frame(start, end);
                    buf = next;
                    listener.on_message(frame);
                }
                Ok(Decoded::NeedMore(hint)) => {
                    buf.storage_mut().reserve(hint);
                    break;
                }
                Err(e) => {
                    warn!("{}", e);
                    return conn_id;
                }
            }
        }

        tokio::select! {
            _ = cancel.notified() => {
                debug!("closing connection from {} on command", peer);
                let _ = stream.shutdown().await;
                return conn_id;
            }
            read = stream.read_buf(buf.storage_mut()) => match read {
                Ok(0) => {
                    debug!("peer {} closed", peer);
                    return conn_id;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("read from {} failed: {}", peer, e);
                    return conn_id;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::encode_frame;
    use crate::transport::LazyFrame;
    use bytes::BytesMut;

    struct Recording {
        frames: parking_lot::Mutex<Vec<Vec<u8>>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.frames.lock().len()
        }
    }

    impl Listener for Recording {
        fn on_message(&self, frame: LazyFrame) {
            let bytes = frame.read(|b| b.to_vec());
            self.frames.lock().push(bytes);
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn test_config() -> ReceiverConfig {
        ReceiverConfig {
            bind_port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_short_and_long_frames_delivered() {
        let listener = Recording::new();
        let receiver = FramedReceiver::start(&test_config(), listener.clone())
            .await
            .unwrap();

        let mut client = TcpStream::connect(receiver.local_addr()).await.unwrap();
        let mut wire = BytesMut::new();
        encode_frame(b"hello", 8 * 1024 * 1024, &mut wire).unwrap();
        let long_payload = vec![7u8; 40_000];
        encode_frame(&long_payload, 8 * 1024 * 1024, &mut wire).unwrap();
        client.write_all(&wire).await.unwrap();

        assert!(wait_until(|| listener.count() == 2).await);
        {
            let frames = listener.frames.lock();
            assert_eq!(frames[0], b"hello");
            assert_eq!(frames[1], long_payload);
        }

        drop(client);
        receiver.close().await;
        assert_eq!(receiver.buffer_pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_pipelined_frames_in_one_write() {
        let listener = Recording::new();
        let receiver = FramedReceiver::start(&test_config(), listener.clone())
            .await
            .unwrap();

        let mut wire = BytesMut::new();
        for i in 0..10u8 {
            encode_frame(&[i; 16], 8 * 1024 * 1024, &mut wire).unwrap();
        }
        let mut client = TcpStream::connect(receiver.local_addr()).await.unwrap();
        client.write_all(&wire).await.unwrap();

        assert!(wait_until(|| listener.count() == 10).await);
        {
            let frames = listener.frames.lock();
            for (i, frame) in frames.iter().enumerate() {
                assert_eq!(frame, &vec![i as u8; 16]);
            }
        }

        receiver.close().await;
    }

    #[tokio::test]
    async fn test_corrupt_size_closes_connection() {
        let listener = Recording::new();
        let receiver = FramedReceiver::start(&test_config(), listener.clone())
            .await
            .unwrap();

        let mut client = TcpStream::connect(receiver.local_addr()).await.unwrap();
        // size 0 is never valid
        client.write_all(&[0x00, 0x00, 0x01, 0x02]).await.unwrap();

        // The receiver drops the connection; the client sees EOF.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(listener.count(), 0);

        receiver.close().await;
    }

    #[tokio::test]
    async fn test_disrupt_closes_matching_peer() {
        let listener = Recording::new();
        let receiver = FramedReceiver::start(&test_config(), listener.clone())
            .await
            .unwrap();

        let mut client = TcpStream::connect(receiver.local_addr()).await.unwrap();
        let peer = NodeAddress::new("other", "127.0.0.1", 1, 1, 65536, 8 * 1024 * 1024);

        // The accept hand-off is asynchronous; retry until registered.
        let mut found = false;
        for _ in 0..200 {
            if receiver.disrupt(&peer).await {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found);

        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        // The reader unregisters the connection once its task finishes.
        let mut gone = false;
        for _ in 0..200 {
            if !receiver.disrupt(&peer).await {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone);
        receiver.close().await;
    }

    #[tokio::test]
    async fn test_close_is_bounded_and_idempotent() {
        let listener = Recording::new();
        let receiver = FramedReceiver::start(&test_config(), listener.clone())
            .await
            .unwrap();

        let _client = TcpStream::connect(receiver.local_addr()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(15), receiver.close())
            .await
            .expect("close must be bounded");
        receiver.close().await;
    }
}
