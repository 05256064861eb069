// Node assembly
//
// Wires the message plane together for one process: the framed receiver
// feeds the ordered threading model through delivery jobs, the dispatcher
// routes outbound messages (looping back locally hosted clusters), and
// the reconciler keeps the routing snapshot aligned with the directory
// this node registers itself in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MeshConfig;
use crate::coordination::{node_path, nodes_dir, CoordinationSession, DirMode};
use crate::error::Result;
use crate::routing::{
    FeedbackLoop, KeyHashStrategy, OutgoingDispatcher, RoutingReconciler, RoutingStrategyManager,
    SnapshotCell,
};
use crate::serializer::{BincodeSerializer, Serializer};
use crate::stats::{NullStatsCollector, StatsCollector};
use crate::threading::{ContainerJob, DeliveryJob, OrderedThreadingModel};
use crate::transport::{FramedReceiver, LazyFrame, Listener, SenderPool};
use crate::types::{ClusterId, ClusterInformation, KeyedMessage, NodeAddress, NodeInformation};

/// The per-cluster runtime that owns the message processors. External to
/// the plane; the plane only routes to it.
pub trait Container: Send + Sync {
    fn deliver(&self, message: &KeyedMessage) -> Result<()>;
}

/// A container hosted by this node, with its routing metadata.
pub struct ContainerRegistration {
    pub cluster_id: ClusterId,
    pub message_types: Vec<String>,
    pub container: Arc<dyn Container>,
}

// ============================================================================
// Inbound delivery
// ============================================================================

#[derive(Clone)]
struct Delivery {
    index: u16,
    container: Arc<dyn Container>,
    message: KeyedMessage,
}

/// A message bound for one container slot.
struct RoutedContainerJob {
    delivery: Delivery,
    stats: Arc<dyn StatsCollector>,
}

impl ContainerJob for RoutedContainerJob {
    fn container_index(&self) -> u16 {
        self.delivery.index
    }

    fn process(self: Box<Self>) {
        match self.delivery.container.deliver(&self.delivery.message) {
            Ok(()) => self.stats.message_dispatched(),
            Err(e) => {
                warn!("container {} refused message: {}", self.delivery.index, e);
                self.stats.message_discarded();
            }
        }
    }

    fn reject(self: Box<Self>) {
        self.stats.message_discarded();
    }
}

/// One inbound message, from raw frame to container deliveries.
///
/// Network frames deserialize lazily on the pool; feedback-loop messages
/// arrive with their deliveries already resolved.
struct RoutedDeliveryJob {
    frame: Mutex<Option<LazyFrame>>,
    serializer: Arc<dyn Serializer>,
    containers: Arc<Vec<ContainerRegistration>>,
    resolved: OnceCell<Vec<Delivery>>,
    stats: Arc<dyn StatsCollector>,
}

impl RoutedDeliveryJob {
    fn from_frame(
        frame: LazyFrame,
        serializer: Arc<dyn Serializer>,
        containers: Arc<Vec<ContainerRegistration>>,
        stats: Arc<dyn StatsCollector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            frame: Mutex::new(Some(frame)),
            serializer,
            containers,
            resolved: OnceCell::new(),
            stats,
        })
    }

    fn precalculated(
        message: &KeyedMessage,
        container_indexes: &[u16],
        serializer: Arc<dyn Serializer>,
        containers: Arc<Vec<ContainerRegistration>>,
        stats: Arc<dyn StatsCollector>,
    ) -> Arc<Self> {
        let deliveries =
            resolve_deliveries(container_indexes, message.clone(), &containers, &stats);
        let resolved = OnceCell::new();
        let _ = resolved.set(deliveries);
        Arc::new(Self {
            frame: Mutex::new(None),
            serializer,
            containers,
            resolved,
            stats,
        })
    }
}

impl DeliveryJob for RoutedDeliveryJob {
    fn containers_calculated(&self) -> bool {
        self.resolved.get().is_some()
    }

    fn calculate_containers(&self) {
        let frame = self.frame.lock().take();
        let deliveries = match frame {
            Some(frame) => match frame.read(|bytes| self.serializer.deserialize(bytes)) {
                Ok(routed) => {
                    let message = KeyedMessage::new(routed.key, routed.payload, Vec::new());
                    resolve_deliveries(
                        &routed.container_indexes,
                        message,
                        &self.containers,
                        &self.stats,
                    )
                }
                Err(e) => {
                    warn!("discarding undecodable message: {}", e);
                    self.stats.message_discarded();
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        let _ = self.resolved.set(deliveries);
    }

    fn container_jobs(&self) -> Vec<Box<dyn ContainerJob>> {
        self.resolved
            .get()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|delivery| {
                Box::new(RoutedContainerJob {
                    delivery,
                    stats: Arc::clone(&self.stats),
                }) as Box<dyn ContainerJob>
            })
            .collect()
    }

    fn completed(&self) {
        self.stats.message_processed();
    }

    fn rejected(&self) {
        // Unread frames return their buffer here.
        drop(self.frame.lock().take());
        self.stats.message_discarded();
    }
}

fn resolve_deliveries(
    container_indexes: &[u16],
    message: KeyedMessage,
    containers: &Arc<Vec<ContainerRegistration>>,
    stats: &Arc<dyn StatsCollector>,
) -> Vec<Delivery> {
    let mut deliveries = Vec::with_capacity(container_indexes.len());
    for index in container_indexes {
        match containers.get(usize::from(*index)) {
            Some(registration) => deliveries.push(Delivery {
                index: *index,
                container: Arc::clone(&registration.container),
                message: message.clone(),
            }),
            None => {
                warn!("message addressed to unknown container slot {}", index);
                stats.message_discarded();
            }
        }
    }
    deliveries
}

/// Listener and feedback-loop endpoint: turns frames and local messages
/// into delivery jobs for the threading model.
pub struct NodeReceiver {
    containers: Arc<Vec<ContainerRegistration>>,
    serializer: Arc<dyn Serializer>,
    model: Arc<OrderedThreadingModel>,
    stats: Arc<dyn StatsCollector>,
}

impl Listener for NodeReceiver {
    fn on_message(&self, frame: LazyFrame) {
        self.stats.message_received();
        let job = RoutedDeliveryJob::from_frame(
            frame,
            Arc::clone(&self.serializer),
            Arc::clone(&self.containers),
            Arc::clone(&self.stats),
        );
        // The network is the fan-in point; it absorbs rejection.
        self.model.submit_limited(job);
    }
}

impl FeedbackLoop for NodeReceiver {
    fn feedback(&self, message: &KeyedMessage, container_indexes: &[u16]) {
        let job = RoutedDeliveryJob::precalculated(
            message,
            container_indexes,
            Arc::clone(&self.serializer),
            Arc::clone(&self.containers),
            Arc::clone(&self.stats),
        );
        self.model.submit(job);
    }
}

// ============================================================================
// Node lifecycle
// ============================================================================

pub struct MeshNodeBuilder {
    config: MeshConfig,
    session: Arc<dyn CoordinationSession>,
    serializer: Arc<dyn Serializer>,
    stats: Arc<dyn StatsCollector>,
    strategy: Arc<dyn RoutingStrategyManager>,
    containers: Vec<ContainerRegistration>,
}

impl MeshNodeBuilder {
    pub fn new(config: MeshConfig, session: Arc<dyn CoordinationSession>) -> Self {
        Self {
            config,
            session,
            serializer: Arc::new(BincodeSerializer::new()),
            stats: Arc::new(NullStatsCollector),
            strategy: Arc::new(KeyHashStrategy::new()),
            containers: Vec::new(),
        }
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn stats(mut self, stats: Arc<dyn StatsCollector>) -> Self {
        self.stats = stats;
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn RoutingStrategyManager>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Host `container` for `cluster_id`, handling `message_types`. The
    /// registration order assigns container slots.
    pub fn add_container(
        mut self,
        cluster_id: ClusterId,
        message_types: Vec<String>,
        container: Arc<dyn Container>,
    ) -> Self {
        self.containers.push(ContainerRegistration {
            cluster_id,
            message_types,
            container,
        });
        self
    }

    /// Bind the receiver, register this node in the directory, and start
    /// the reconciler. A node with no containers registers as
    /// adaptor-only: it dispatches but receives nothing.
    pub async fn start(self) -> Result<MeshNode> {
        let root = self.config.root_path();
        let containers = Arc::new(self.containers);

        let model = OrderedThreadingModel::start(&self.config.threading);
        let node_receiver = Arc::new(NodeReceiver {
            containers: Arc::clone(&containers),
            serializer: Arc::clone(&self.serializer),
            model: Arc::clone(&model),
            stats: Arc::clone(&self.stats),
        });

        let receiver =
            FramedReceiver::start(&self.config.receiver, Arc::clone(&node_receiver) as _).await?;
        let bound = receiver.local_addr();

        let address = NodeAddress::new(
            Uuid::new_v4().to_string(),
            bound.ip().to_string(),
            bound.port(),
            self.serializer.serializer_id(),
            self.config.receiver.recv_buffer_size,
            self.config.receiver.max_message_size,
        );

        let running = Arc::new(AtomicBool::new(true));
        let ready = Arc::new(AtomicBool::new(false));
        let cell = SnapshotCell::new();
        let dispatcher = OutgoingDispatcher::new(
            Arc::clone(&cell),
            Arc::clone(&ready),
            Arc::clone(&running),
            address.clone(),
            Arc::clone(&node_receiver) as _,
            Arc::clone(&self.stats),
        );

        let mut info = NodeInformation::new(address.clone());
        for (slot, registration) in containers.iter().enumerate() {
            info.add_cluster(ClusterInformation::new(
                registration.cluster_id.clone(),
                slot as u16,
                registration.message_types.clone(),
            ));
        }

        let registration_path = node_path(&root, &address.guid);
        self.session
            .mkdir_recursive(&nodes_dir(&root), DirMode::Persistent)
            .await?;
        self.session
            .mkdir_recursive(&registration_path, DirMode::Ephemeral)
            .await?;
        self.session
            .set_data(&registration_path, info.to_bytes()?)
            .await?;
        info!("registered node {} at {}", address, registration_path);

        let sender_pool = SenderPool::new(Arc::clone(&self.serializer), Arc::clone(&self.stats));
        let reconciler = RoutingReconciler::start(
            Arc::clone(&self.session),
            root,
            address.clone(),
            cell,
            ready,
            sender_pool,
            self.strategy,
            self.config.retry_timeout,
        );

        Ok(MeshNode {
            address,
            registration_path,
            session: self.session,
            receiver,
            model,
            dispatcher,
            reconciler,
            running,
        })
    }
}

/// A running member of the mesh.
pub struct MeshNode {
    address: NodeAddress,
    registration_path: String,
    session: Arc<dyn CoordinationSession>,
    receiver: FramedReceiver,
    model: Arc<OrderedThreadingModel>,
    dispatcher: Arc<OutgoingDispatcher>,
    reconciler: RoutingReconciler,
    running: Arc<AtomicBool>,
}

impl MeshNode {
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn dispatcher(&self) -> &Arc<OutgoingDispatcher> {
        &self.dispatcher
    }

    /// Route one message from this node.
    pub fn dispatch(&self, message: &KeyedMessage) -> Result<()> {
        self.dispatcher.dispatch(message)
    }

    /// Test hook: force-close any inbound connection from `peer`.
    pub async fn disrupt(&self, peer: &NodeAddress) -> bool {
        self.receiver.disrupt(peer).await
    }

    /// Deregister and tear down in reverse start order. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("stopping node {}", self.address);

        if let Err(e) = self.session.delete(&self.registration_path).await {
            debug!("deregistration skipped: {}", e);
        }
        self.reconciler.stop().await;
        self.receiver.close().await;

        let model = Arc::clone(&self.model);
        let _ = tokio::task::spawn_blocking(move || model.shutdown()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemorySession;
    use crate::stats::AtomicStatsCollector;
    use bytes::Bytes;
    use std::time::Duration;

    struct RecordingContainer {
        seen: parking_lot::Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingContainer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.seen.lock().len()
        }
    }

    impl Container for RecordingContainer {
        fn deliver(&self, message: &KeyedMessage) -> Result<()> {
            self.seen.lock().push(message.payload.to_vec());
            Ok(())
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn event(payload: &[u8]) -> KeyedMessage {
        KeyedMessage::new(
            Bytes::from_static(b"key-1"),
            Bytes::copy_from_slice(payload),
            vec!["Event".to_string()],
        )
    }

    #[tokio::test]
    async fn test_single_node_loopback() {
        let session = MemorySession::new();
        let container = RecordingContainer::new();
        let stats = Arc::new(AtomicStatsCollector::new());

        let node = MeshNodeBuilder::new(MeshConfig::default(), Arc::new(session))
            .stats(stats.clone())
            .add_container(
                ClusterId::new("mesh", "sink"),
                vec!["Event".to_string()],
                container.clone(),
            )
            .start()
            .await
            .unwrap();

        // The reconciler must observe our own registration first.
        assert!(wait_until(|| node.dispatch(&event(b"ping")).is_ok()).await);
        assert!(wait_until(|| container.count() >= 1).await);
        assert_eq!(container.seen.lock()[0], b"ping");
        assert!(stats.dispatched() >= 1);

        node.stop().await;
        // Idempotent.
        node.stop().await;
    }

    #[tokio::test]
    async fn test_dispatch_becomes_routable_after_first_snapshot() {
        let session = MemorySession::new();
        let container = RecordingContainer::new();

        let node = MeshNodeBuilder::new(MeshConfig::default(), Arc::new(session))
            .add_container(
                ClusterId::new("mesh", "sink"),
                vec!["Event".to_string()],
                container,
            )
            .start()
            .await
            .unwrap();

        // Either not ready yet or already routable; never a panic. After
        // the first snapshot it must be routable.
        assert!(wait_until(|| node.dispatch(&event(b"x")).is_ok()).await);
        node.stop().await;
    }
}
