// Outgoing dispatcher
//
// Front door for application code. Resolves each message's destinations
// from the current snapshot, coalesces co-located clusters into one
// network hop per node, and never surfaces routing misses to the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::snapshot::SnapshotCell;
use crate::error::{MeshError, Result};
use crate::stats::StatsCollector;
use crate::types::{ContainerAddress, KeyedMessage, NodeAddress, RoutedMessage};

/// Bound on the yield-wait for a snapshot mid-swap.
const SNAPSHOT_WAIT: Duration = Duration::from_secs(1);

/// In-process delivery path for messages addressed to the local node.
pub trait FeedbackLoop: Send + Sync {
    fn feedback(&self, message: &KeyedMessage, container_indexes: &[u16]);
}

pub struct OutgoingDispatcher {
    cell: Arc<SnapshotCell>,
    ready: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    local: NodeAddress,
    feedback: Arc<dyn FeedbackLoop>,
    stats: Arc<dyn StatsCollector>,
}

impl OutgoingDispatcher {
    pub fn new(
        cell: Arc<SnapshotCell>,
        ready: Arc<AtomicBool>,
        running: Arc<AtomicBool>,
        local: NodeAddress,
        feedback: Arc<dyn FeedbackLoop>,
        stats: Arc<dyn StatsCollector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cell,
            ready,
            running,
            local,
            feedback,
            stats,
        })
    }

    /// Route one message. Synchronous; may yield briefly while the
    /// reconciler swaps snapshots. Routing misses are counted, not
    /// returned.
    pub fn dispatch(&self, message: &KeyedMessage) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        let snapshot = match self.cell.load() {
            Some(snapshot) => snapshot,
            None if !self.ready.load(Ordering::Acquire) => {
                return Err(MeshError::RoutingNotReady);
            }
            None => {
                let running = &self.running;
                match self
                    .cell
                    .wait(SNAPSHOT_WAIT, || running.load(Ordering::Acquire))
                {
                    Ok(snapshot) => snapshot,
                    Err(MeshError::ShutdownInProgress) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        };

        // One ContainerAddress per destination node: routers agreeing on a
        // node have their cluster indexes concatenated, order preserved.
        let mut destinations: Vec<ContainerAddress> = Vec::new();
        for message_type in &message.message_types {
            let Some(routers) = snapshot.routers_for(message_type) else {
                trace!("no outbound for message type {}", message_type);
                continue;
            };
            for router in routers {
                let Some(dest) = router.select_destination_for_message(message) else {
                    trace!("no placement from {} for this key", router.cluster_id());
                    continue;
                };
                match destinations.iter_mut().find(|d| d.node == dest.node) {
                    Some(existing) => existing.clusters.extend_from_slice(&dest.clusters),
                    None => destinations.push(dest),
                }
            }
        }

        if destinations.is_empty() {
            self.stats.message_not_sent();
            return Ok(());
        }

        for dest in destinations {
            if dest.node == self.local {
                self.feedback.feedback(message, &dest.clusters);
            } else {
                match snapshot.sender_for(&dest.node) {
                    Some(sender) => {
                        let routed = RoutedMessage {
                            container_indexes: dest.clusters.clone(),
                            key: message.key.clone(),
                            payload: message.payload.clone(),
                        };
                        if let Err(e) = sender.send(routed) {
                            debug!("send to {} failed: {}", dest.node, e);
                            self.stats.message_not_sent();
                        }
                    }
                    None => {
                        // Window after a reconcile removed the node.
                        debug!("no sender for {} in current snapshot; dropping", dest.node);
                        self.stats.message_not_sent();
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::snapshot::RoutingSnapshot;
    use crate::routing::strategy::Router;
    use crate::stats::AtomicStatsCollector;
    use crate::types::ClusterId;
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct FixedRouter {
        cluster_id: ClusterId,
        dest: Option<ContainerAddress>,
    }

    impl Router for FixedRouter {
        fn cluster_id(&self) -> &ClusterId {
            &self.cluster_id
        }

        fn select_destination_for_message(&self, _: &KeyedMessage) -> Option<ContainerAddress> {
            self.dest.clone()
        }
    }

    struct RecordingFeedback {
        calls: Mutex<Vec<Vec<u16>>>,
    }

    impl RecordingFeedback {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl FeedbackLoop for RecordingFeedback {
        fn feedback(&self, _message: &KeyedMessage, container_indexes: &[u16]) {
            self.calls.lock().push(container_indexes.to_vec());
        }
    }

    fn local_addr() -> NodeAddress {
        NodeAddress::new("local", "127.0.0.1", 9000, 1, 65536, 8 * 1024 * 1024)
    }

    fn message(types: &[&str]) -> KeyedMessage {
        KeyedMessage::new(
            Bytes::from_static(b"key"),
            Bytes::from_static(b"payload"),
            types.iter().map(|t| t.to_string()).collect(),
        )
    }

    fn router_to(cluster: &str, node: &NodeAddress, index: u16) -> Arc<dyn Router> {
        Arc::new(FixedRouter {
            cluster_id: ClusterId::new("app", cluster),
            dest: Some(ContainerAddress::new(node.clone(), vec![index])),
        })
    }

    fn dispatcher_with(
        snapshot: Option<RoutingSnapshot>,
        ready: bool,
        feedback: Arc<RecordingFeedback>,
        stats: Arc<AtomicStatsCollector>,
    ) -> Arc<OutgoingDispatcher> {
        let cell = SnapshotCell::new();
        if let Some(s) = snapshot {
            cell.publish(Arc::new(s));
        }
        OutgoingDispatcher::new(
            cell,
            Arc::new(AtomicBool::new(ready)),
            Arc::new(AtomicBool::new(true)),
            local_addr(),
            feedback,
            stats,
        )
    }

    #[test]
    fn test_colocated_clusters_coalesce() {
        let local = local_addr();
        let mut snapshot = RoutingSnapshot::empty();
        snapshot
            .outbounds_by_type
            .insert("A".to_string(), vec![router_to("alpha", &local, 7)]);
        snapshot
            .outbounds_by_type
            .insert("B".to_string(), vec![router_to("beta", &local, 9)]);

        let feedback = RecordingFeedback::new();
        let stats = Arc::new(AtomicStatsCollector::new());
        let dispatcher = dispatcher_with(Some(snapshot), true, feedback.clone(), stats.clone());

        dispatcher.dispatch(&message(&["A", "B"])).unwrap();

        // One delivery carrying both cluster indexes, in router order.
        let calls = feedback.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![7, 9]);
        assert_eq!(stats.not_sent(), 0);
    }

    #[test]
    fn test_no_destination_counts_miss() {
        let feedback = RecordingFeedback::new();
        let stats = Arc::new(AtomicStatsCollector::new());
        let dispatcher = dispatcher_with(
            Some(RoutingSnapshot::empty()),
            true,
            feedback.clone(),
            stats.clone(),
        );

        dispatcher.dispatch(&message(&["A"])).unwrap();

        assert!(feedback.calls.lock().is_empty());
        assert_eq!(stats.not_sent(), 1);
    }

    #[test]
    fn test_router_returning_none_is_a_miss() {
        let mut snapshot = RoutingSnapshot::empty();
        let dead: Arc<dyn Router> = Arc::new(FixedRouter {
            cluster_id: ClusterId::new("app", "alpha"),
            dest: None,
        });
        snapshot
            .outbounds_by_type
            .insert("A".to_string(), vec![dead]);

        let feedback = RecordingFeedback::new();
        let stats = Arc::new(AtomicStatsCollector::new());
        let dispatcher = dispatcher_with(Some(snapshot), true, feedback.clone(), stats.clone());

        dispatcher.dispatch(&message(&["A"])).unwrap();
        assert_eq!(stats.not_sent(), 1);
    }

    #[test]
    fn test_never_ready_fails() {
        let feedback = RecordingFeedback::new();
        let stats = Arc::new(AtomicStatsCollector::new());
        let dispatcher = dispatcher_with(None, false, feedback, stats);

        let err = dispatcher.dispatch(&message(&["A"])).unwrap_err();
        assert!(matches!(err, MeshError::RoutingNotReady));
    }

    #[test]
    fn test_stopped_dispatch_is_silent() {
        let feedback = RecordingFeedback::new();
        let stats = Arc::new(AtomicStatsCollector::new());
        let cell = SnapshotCell::new();
        let dispatcher = OutgoingDispatcher::new(
            cell,
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(false)),
            local_addr(),
            feedback,
            stats.clone(),
        );

        dispatcher.dispatch(&message(&["A"])).unwrap();
        assert_eq!(stats.not_sent(), 0);
    }

    #[test]
    fn test_missing_sender_drops_with_miss() {
        let remote = NodeAddress::new("remote", "127.0.0.1", 9001, 1, 65536, 8 * 1024 * 1024);
        let mut snapshot = RoutingSnapshot::empty();
        snapshot
            .outbounds_by_type
            .insert("A".to_string(), vec![router_to("alpha", &remote, 0)]);
        // No sender registered for the remote node.

        let feedback = RecordingFeedback::new();
        let stats = Arc::new(AtomicStatsCollector::new());
        let dispatcher = dispatcher_with(Some(snapshot), true, feedback.clone(), stats.clone());

        dispatcher.dispatch(&message(&["A"])).unwrap();
        assert!(feedback.calls.lock().is_empty());
        assert_eq!(stats.not_sent(), 1);
    }
}
