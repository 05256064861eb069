// Routing snapshot
//
// The single globally shared piece of routing state. The reconciler is
// the only writer; it may take the snapshot out of the cell while it
// rebuilds, so readers can observe a transient absence and wait it out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::strategy::Router;
use crate::error::{MeshError, Result};
use crate::transport::Sender;
use crate::types::NodeAddress;

/// Immutable routing table: per-type routers plus live senders.
///
/// Every reachable destination a router can return resolves to an entry
/// in `senders`, except the local node, which uses the in-process
/// feedback path.
pub struct RoutingSnapshot {
    pub outbounds_by_type: HashMap<String, Vec<Arc<dyn Router>>>,
    pub senders: HashMap<NodeAddress, Arc<Sender>>,
}

impl std::fmt::Debug for RoutingSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingSnapshot")
            .field("outbounds_by_type_len", &self.outbounds_by_type.len())
            .field("senders_len", &self.senders.len())
            .finish()
    }
}

impl RoutingSnapshot {
    pub fn empty() -> Self {
        Self {
            outbounds_by_type: HashMap::new(),
            senders: HashMap::new(),
        }
    }

    pub fn routers_for(&self, message_type: &str) -> Option<&[Arc<dyn Router>]> {
        self.outbounds_by_type
            .get(message_type)
            .map(|v| v.as_slice())
    }

    pub fn sender_for(&self, addr: &NodeAddress) -> Option<&Arc<Sender>> {
        self.senders.get(addr)
    }
}

/// Atomic publication slot for the current snapshot.
pub struct SnapshotCell {
    slot: RwLock<Option<Arc<RoutingSnapshot>>>,
}

impl SnapshotCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: RwLock::new(None),
        })
    }

    pub fn load(&self) -> Option<Arc<RoutingSnapshot>> {
        self.slot.read().clone()
    }

    /// Remove the snapshot, signaling an in-progress rebuild to readers.
    pub fn take(&self) -> Option<Arc<RoutingSnapshot>> {
        self.slot.write().take()
    }

    pub fn publish(&self, snapshot: Arc<RoutingSnapshot>) {
        *self.slot.write() = Some(snapshot);
    }

    pub fn clear(&self) {
        *self.slot.write() = None;
    }

    /// Yield until a snapshot is present, bounded by `wait`.
    ///
    /// `keep_waiting` lets callers bail out on shutdown.
    pub fn wait(
        &self,
        wait: Duration,
        keep_waiting: impl Fn() -> bool,
    ) -> Result<Arc<RoutingSnapshot>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(snapshot) = self.load() {
                return Ok(snapshot);
            }
            if !keep_waiting() {
                return Err(MeshError::ShutdownInProgress);
            }
            if Instant::now() >= deadline {
                return Err(MeshError::SnapshotAbsent);
            }
            std::thread::yield_now();
        }
    }
}
