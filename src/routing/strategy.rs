// Routing strategy contracts and the default key-hash strategy
//
// A Router places one keyed message for one downstream cluster. The
// strategy manager rebuilds the per-type router lists whenever the
// reconciler observes a membership change.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::trace;

use crate::types::{ClusterId, ContainerAddress, KeyedMessage, NodeAddress, NodeInformation};

/// Per-downstream-cluster placement.
pub trait Router: Send + Sync {
    fn cluster_id(&self) -> &ClusterId;

    /// Destination for `message`, or None when no placement is currently
    /// available for its key.
    fn select_destination_for_message(&self, message: &KeyedMessage) -> Option<ContainerAddress>;
}

/// Rebuilds the outbound router lists from live node registrations.
pub trait RoutingStrategyManager: Send + Sync {
    fn build_outbounds(&self, nodes: &[NodeInformation]) -> HashMap<String, Vec<Arc<dyn Router>>>;
}

/// Default strategy: a stable hash of the key, modulo the cluster's
/// guid-ordered membership.
///
/// Deterministic across nodes as long as they observe the same
/// membership, which the shared directory guarantees eventually.
#[derive(Debug, Default)]
pub struct KeyHashStrategy;

impl KeyHashStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl RoutingStrategyManager for KeyHashStrategy {
    fn build_outbounds(&self, nodes: &[NodeInformation]) -> HashMap<String, Vec<Arc<dyn Router>>> {
        // Cluster membership, guid-ordered for stable hashing.
        let mut members: BTreeMap<ClusterId, Vec<(NodeAddress, u16)>> = BTreeMap::new();
        let mut types: BTreeMap<ClusterId, BTreeSet<String>> = BTreeMap::new();

        for node in nodes {
            for (cluster_id, info) in &node.clusters {
                members
                    .entry(cluster_id.clone())
                    .or_default()
                    .push((node.address.clone(), info.container_index));
                types
                    .entry(cluster_id.clone())
                    .or_default()
                    .extend(info.message_types.iter().cloned());
            }
        }

        let mut outbounds: HashMap<String, Vec<Arc<dyn Router>>> = HashMap::new();
        for (cluster_id, mut nodes) in members {
            nodes.sort_by(|a, b| a.0.guid.cmp(&b.0.guid));
            let router: Arc<dyn Router> = Arc::new(KeyHashRouter {
                cluster_id: cluster_id.clone(),
                members: nodes,
            });

            if let Some(handled) = types.get(&cluster_id) {
                for message_type in handled {
                    outbounds
                        .entry(message_type.clone())
                        .or_default()
                        .push(Arc::clone(&router));
                }
            }
        }
        outbounds
    }
}

struct KeyHashRouter {
    cluster_id: ClusterId,
    members: Vec<(NodeAddress, u16)>,
}

impl Router for KeyHashRouter {
    fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    fn select_destination_for_message(&self, message: &KeyedMessage) -> Option<ContainerAddress> {
        if self.members.is_empty() {
            trace!("cluster {} has no members", self.cluster_id);
            return None;
        }
        let idx = (fnv1a(&message.key) % self.members.len() as u64) as usize;
        let (node, container_index) = &self.members[idx];
        Some(ContainerAddress::new(node.clone(), vec![*container_index]))
    }
}

/// FNV-1a. Stable across platforms and releases; routing depends on that.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
