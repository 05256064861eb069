// Routing reconciler
//
// A persistent task that keeps the routing snapshot aligned with the
// coordination directory. Directory watches nudge it; transient failures
// reschedule it on a timer. At most one pass runs at a time. A pass that
// changes nothing leaves the published snapshot untouched, including
// sender identity.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::snapshot::{RoutingSnapshot, SnapshotCell};
use super::strategy::RoutingStrategyManager;
use crate::coordination::{nodes_dir, CoordinationSession, Watch};
use crate::error::Result;
use crate::transport::SenderPool;
use crate::types::{NodeAddress, NodeInformation};

const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

struct Inner {
    session: Arc<dyn CoordinationSession>,
    root: String,
    local: NodeAddress,
    cell: Arc<SnapshotCell>,
    ready: Arc<AtomicBool>,
    senders: Arc<SenderPool>,
    strategy: Arc<dyn RoutingStrategyManager>,
    nudge: Arc<Notify>,
    running: AtomicBool,
    retry_timeout: Duration,
    /// Last observed directory state, guid -> raw registration blob.
    /// Blobs are compared opaquely; decoding happens only on change.
    known: parking_lot::Mutex<HashMap<String, Bytes>>,
}

pub struct RoutingReconciler {
    inner: Arc<Inner>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RoutingReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        session: Arc<dyn CoordinationSession>,
        root: String,
        local: NodeAddress,
        cell: Arc<SnapshotCell>,
        ready: Arc<AtomicBool>,
        senders: Arc<SenderPool>,
        strategy: Arc<dyn RoutingStrategyManager>,
        retry_timeout: Duration,
    ) -> Self {
        let inner = Arc::new(Inner {
            session,
            root,
            local,
            cell,
            ready,
            senders,
            strategy,
            nudge: Arc::new(Notify::new()),
            running: AtomicBool::new(true),
            retry_timeout,
            known: parking_lot::Mutex::new(HashMap::new()),
        });

        let task = tokio::spawn(run(Arc::clone(&inner)));
        Self {
            inner,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Request an extra pass, as a fired directory watch would.
    pub fn nudge(&self) {
        self.inner.nudge.notify_one();
    }

    /// Stop the task, clear the snapshot, and stop all senders.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.nudge.notify_one();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(SHUTDOWN_WAIT, task).await.is_err() {
                warn!("reconciler did not stop within {:?}", SHUTDOWN_WAIT);
            }
        }

        self.inner.cell.clear();
        self.inner.senders.shutdown().await;
    }
}

async fn run(inner: Arc<Inner>) {
    while inner.running.load(Ordering::Acquire) {
        match reconcile(&inner).await {
            Ok(()) => inner.nudge.notified().await,
            Err(e) => {
                warn!(
                    "reconcile failed: {}; retrying in {:?}",
                    e, inner.retry_timeout
                );
                tokio::select! {
                    _ = inner.nudge.notified() => {}
                    _ = tokio::time::sleep(inner.retry_timeout) => {}
                }
            }
        }
    }
    debug!("reconciler exiting");
}

fn new_watch(inner: &Inner) -> Watch {
    let nudge = Arc::clone(&inner.nudge);
    Arc::new(move || nudge.notify_one())
}

async fn reconcile(inner: &Inner) -> Result<()> {
    let watch = new_watch(inner);
    let dir = nodes_dir(&inner.root);
    let children = inner.session.get_subdirs(&dir, Some(Arc::clone(&watch))).await?;

    // Observe the directory. A child vanishing between list and fetch is
    // ordinary churn; the registered watches re-trigger this pass.
    let mut observed: Vec<(Bytes, NodeInformation)> = Vec::new();
    let mut seen = HashSet::new();
    for child in children {
        let path = format!("{}/{}", dir, child);
        let blob = match inner
            .session
            .get_data(&path, Some(Arc::clone(&watch)))
            .await
        {
            Ok(blob) => blob,
            Err(e) => {
                debug!("node entry {} unreadable: {}", path, e);
                continue;
            }
        };
        let info = match NodeInformation::from_bytes(&blob) {
            Ok(info) => info,
            Err(e) => {
                debug!("undecodable registration at {}: {}", path, e);
                continue;
            }
        };
        if info.is_adaptor_only() {
            trace!("skipping adaptor-only node {}", info.address);
            continue;
        }
        if !seen.insert(info.address.guid.clone()) {
            warn!("duplicate node registration for {}", info.address);
            continue;
        }
        observed.push((blob, info));
    }

    // Unchanged only counts once a snapshot exists; the first pass must
    // publish even for an empty directory so dispatchers become ready.
    let unchanged = inner.cell.load().is_some() && {
        let known = inner.known.lock();
        known.len() == observed.len()
            && observed
                .iter()
                .all(|(blob, info)| known.get(&info.address.guid) == Some(blob))
    };
    if unchanged {
        inner.ready.store(true, Ordering::Release);
        return Ok(());
    }

    info!(
        "cluster membership changed ({} nodes); rebuilding routing snapshot",
        observed.len()
    );

    // Take-swap-put: readers see a transient absence, never a half-built
    // snapshot. On failure the previous snapshot is restored.
    let prev = inner.cell.take();
    match build_snapshot(inner, prev.as_deref(), &observed) {
        Ok(next) => {
            if let Some(prev) = &prev {
                for addr in prev.senders.keys() {
                    if !next.senders.contains_key(addr) {
                        inner.senders.stop_sender(addr, false).await;
                    }
                }
            }
            inner.cell.publish(Arc::new(next));

            let mut known = inner.known.lock();
            known.clear();
            for (blob, info) in &observed {
                known.insert(info.address.guid.clone(), blob.clone());
            }
            inner.ready.store(true, Ordering::Release);
            Ok(())
        }
        Err(e) => {
            match prev {
                Some(prev) => inner.cell.publish(prev),
                None => inner.cell.clear(),
            }
            Err(e)
        }
    }
}

fn build_snapshot(
    inner: &Inner,
    prev: Option<&RoutingSnapshot>,
    observed: &[(Bytes, NodeInformation)],
) -> Result<RoutingSnapshot> {
    let mut senders = HashMap::new();
    for (_, info) in observed {
        if info.address == inner.local {
            continue;
        }
        let sender = match prev.and_then(|p| p.senders.get(&info.address)) {
            // Unchanged addresses keep their sender by identity.
            Some(existing) => Arc::clone(existing),
            None => inner.senders.open(&info.address)?,
        };
        senders.insert(info.address.clone(), sender);
    }

    let infos: Vec<NodeInformation> = observed.iter().map(|(_, info)| info.clone()).collect();
    let outbounds_by_type = inner.strategy.build_outbounds(&infos);

    Ok(RoutingSnapshot {
        outbounds_by_type,
        senders,
    })
}
