// Delivery jobs and per-job bookkeeping
//
// A DeliveryJob wraps one inbound message from frame to containers. It is
// individuated into one ContainerJob per destination; the shared
// bookkeeping record tracks the outstanding pieces with atomic counts and
// releases the job exactly once when the last piece finishes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One inbound message on its way to this node's containers.
pub trait DeliveryJob: Send + Sync + 'static {
    /// True once the destination containers are known.
    fn containers_calculated(&self) -> bool;

    /// Compute the destination containers; runs on the deserialization
    /// pool. Must set `containers_calculated` before returning.
    fn calculate_containers(&self);

    /// One job per destination container. Called once, after calculation.
    fn container_jobs(&self) -> Vec<Box<dyn ContainerJob>>;

    /// Every individuated job finished (processed or rejected); release
    /// the message's resources. Called exactly once.
    fn completed(&self);

    /// The job was dropped before individuation.
    fn rejected(&self);
}

/// The unit of work dispatched to a single container.
pub trait ContainerJob: Send + 'static {
    /// Container slot this job targets; routes it to the right worker.
    fn container_index(&self) -> u16;

    fn process(self: Box<Self>);

    fn reject(self: Box<Self>);
}

/// Shared per-message record: the parent job plus outstanding counts.
///
/// `queued` falls at the start of each piece's execution or rejection and
/// settles the global limited counter; `unfinished` falls at the end and
/// triggers completion. Both are primed to the piece count before any
/// piece is enqueued, so an early finisher cannot complete the job while
/// siblings are still being registered.
pub struct JobBookkeeping {
    job: Arc<dyn DeliveryJob>,
    queued: AtomicUsize,
    unfinished: AtomicUsize,
    limited: bool,
    num_limited: Arc<AtomicUsize>,
}

impl JobBookkeeping {
    pub fn new(
        job: Arc<dyn DeliveryJob>,
        pieces: usize,
        limited: bool,
        num_limited: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            job,
            queued: AtomicUsize::new(pieces),
            unfinished: AtomicUsize::new(pieces),
            limited,
            num_limited,
        })
    }

    fn started(&self) {
        if self.queued.fetch_sub(1, Ordering::AcqRel) == 1 && self.limited {
            self.num_limited.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn finished(&self) {
        if self.unfinished.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.job.completed();
        }
    }
}

/// A ContainerJob plus its share of the parent's bookkeeping.
///
/// Exactly one of `execute` or `reject` is called per holder.
pub struct ContainerJobHolder {
    job: Box<dyn ContainerJob>,
    bookkeeping: Arc<JobBookkeeping>,
}

impl ContainerJobHolder {
    pub fn new(job: Box<dyn ContainerJob>, bookkeeping: Arc<JobBookkeeping>) -> Self {
        Self { job, bookkeeping }
    }

    pub fn container_index(&self) -> u16 {
        self.job.container_index()
    }

    pub fn execute(self) {
        self.bookkeeping.started();
        self.job.process();
        self.bookkeeping.finished();
    }

    pub fn reject(self) {
        self.bookkeeping.started();
        self.job.reject();
        self.bookkeeping.finished();
    }
}
