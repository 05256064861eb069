// Ordered per-container threading model
//
// Submissions land on an unbounded inqueue. A single shuttle thread
// drains it: jobs without calculated containers go to the
// deserialization pool and to a pending queue; the shuttle only releases
// the pending head once its containers are known, so parallel
// deserialization cannot reorder arrivals. Released jobs individuate into
// per-container pieces executed by dedicated FIFO workers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use tracing::{debug, warn};

use super::jobs::{ContainerJobHolder, DeliveryJob, JobBookkeeping};
use super::Pacer;
use crate::config::ThreadingConfig;

const SHUTTLE_EXIT_WAIT: Duration = Duration::from_secs(10);

struct Submitted {
    job: Arc<dyn DeliveryJob>,
    limited: bool,
}

struct WorkerHandle {
    tx: Sender<ContainerJobHolder>,
    handle: thread::JoinHandle<()>,
}

pub struct OrderedThreadingModel {
    inqueue_tx: Sender<Arc<Submitted>>,
    deser_tx: parking_lot::Mutex<Option<Sender<Arc<Submitted>>>>,
    num_limited: Arc<AtomicUsize>,
    max_pending: usize,
    stopped: Arc<AtomicBool>,
    shuttle_done: Arc<AtomicBool>,
    shuttle: parking_lot::Mutex<Option<thread::JoinHandle<()>>>,
    deser_threads: parking_lot::Mutex<Vec<thread::JoinHandle<()>>>,
}

impl OrderedThreadingModel {
    pub fn start(config: &ThreadingConfig) -> Arc<Self> {
        let (inqueue_tx, inqueue_rx) = channel::unbounded::<Arc<Submitted>>();
        let (deser_tx, deser_rx) = channel::unbounded::<Arc<Submitted>>();

        let num_limited = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicBool::new(false));
        let shuttle_done = Arc::new(AtomicBool::new(false));

        let mut deser_threads = Vec::new();
        for i in 0..config.deserialization_threads.max(1) {
            let rx = deser_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("mesh-deser-{}", i))
                .spawn(move || deser_loop(rx))
                .expect("failed to spawn deserialization thread");
            deser_threads.push(handle);
        }
        drop(deser_rx);

        let shuttle = {
            let inqueue_rx = inqueue_rx;
            let deser_tx = deser_tx.clone();
            let stopped = Arc::clone(&stopped);
            let num_limited = Arc::clone(&num_limited);
            let shuttle_done = Arc::clone(&shuttle_done);
            let hard_shutdown = config.hard_shutdown;
            thread::Builder::new()
                .name("mesh-shuttle".to_string())
                .spawn(move || {
                    shuttle_loop(
                        inqueue_rx,
                        deser_tx,
                        stopped,
                        hard_shutdown,
                        num_limited,
                        shuttle_done,
                    )
                })
                .expect("failed to spawn shuttle thread")
        };

        Arc::new(Self {
            inqueue_tx,
            deser_tx: parking_lot::Mutex::new(Some(deser_tx)),
            num_limited,
            max_pending: config.max_pending,
            stopped,
            shuttle_done,
            shuttle: parking_lot::Mutex::new(Some(shuttle)),
            deser_threads: parking_lot::Mutex::new(deser_threads),
        })
    }

    /// Enqueue without backpressure accounting. Never blocks.
    pub fn submit(&self, job: Arc<dyn DeliveryJob>) {
        if self.stopped.load(Ordering::Acquire) {
            job.rejected();
            return;
        }
        let sub = Arc::new(Submitted {
            job,
            limited: false,
        });
        if let Err(channel::SendError(sub)) = self.inqueue_tx.send(sub) {
            sub.job.rejected();
        }
    }

    /// Enqueue against the soft cap. Never blocks; over the cap the job
    /// is rejected and false returned so fan-in callers can degrade.
    pub fn submit_limited(&self, job: Arc<dyn DeliveryJob>) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            job.rejected();
            return false;
        }
        if self.num_limited.load(Ordering::Acquire) >= self.max_pending {
            job.rejected();
            return false;
        }
        self.num_limited.fetch_add(1, Ordering::AcqRel);
        let sub = Arc::new(Submitted { job, limited: true });
        match self.inqueue_tx.send(sub) {
            Ok(()) => true,
            Err(channel::SendError(sub)) => {
                self.num_limited.fetch_sub(1, Ordering::AcqRel);
                sub.job.rejected();
                false
            }
        }
    }

    /// Outstanding limited jobs.
    pub fn num_limited(&self) -> usize {
        self.num_limited.load(Ordering::Acquire)
    }

    /// Stop the pipeline. With `hard_shutdown` queued work is rejected;
    /// otherwise the shuttle drains first. Waits up to 10s for the
    /// shuttle, then gives up with a warning. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let deadline = Instant::now() + SHUTTLE_EXIT_WAIT;
        while !self.shuttle_done.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                warn!("shuttle did not exit within {:?}", SHUTTLE_EXIT_WAIT);
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        drop(self.deser_tx.lock().take());

        if self.shuttle_done.load(Ordering::Acquire) {
            if let Some(handle) = self.shuttle.lock().take() {
                let _ = handle.join();
            }
            let handles: Vec<_> = self.deser_threads.lock().drain(..).collect();
            for handle in handles {
                let _ = handle.join();
            }
        }
        debug!("threading model stopped");
    }
}

fn deser_loop(rx: Receiver<Arc<Submitted>>) {
    while let Ok(sub) = rx.recv() {
        sub.job.calculate_containers();
    }
}

fn shuttle_loop(
    inqueue_rx: Receiver<Arc<Submitted>>,
    deser_tx: Sender<Arc<Submitted>>,
    stopped: Arc<AtomicBool>,
    hard_shutdown: bool,
    num_limited: Arc<AtomicUsize>,
    shuttle_done: Arc<AtomicBool>,
) {
    let mut pending: VecDeque<Arc<Submitted>> = VecDeque::new();
    let mut workers: HashMap<u16, WorkerHandle> = HashMap::new();
    let mut pacer = Pacer::new();

    loop {
        let mut progressed = false;

        while let Ok(sub) = inqueue_rx.try_recv() {
            progressed = true;
            if sub.job.containers_calculated() && pending.is_empty() {
                // Pre-calculated and nothing ahead of it: route now.
                fan_out(&sub, &mut workers, &stopped, hard_shutdown, &num_limited);
            } else {
                if !sub.job.containers_calculated() {
                    let _ = deser_tx.send(Arc::clone(&sub));
                }
                pending.push_back(sub);
            }
        }

        // Release from the head only, preserving arrival order across the
        // parallel deserialization pool.
        while pending
            .front()
            .map_or(false, |sub| sub.job.containers_calculated())
        {
            let sub = pending.pop_front().expect("peeked front");
            fan_out(&sub, &mut workers, &stopped, hard_shutdown, &num_limited);
            progressed = true;
        }

        if stopped.load(Ordering::Acquire) {
            let drained = pending.is_empty() && inqueue_rx.is_empty();
            if hard_shutdown || drained {
                break;
            }
        }

        if progressed {
            pacer.reset();
        } else {
            pacer.pause();
        }
    }

    // Hard shutdown can leave undelivered jobs; reject them with their
    // backpressure accounting.
    while let Ok(sub) = inqueue_rx.try_recv() {
        pending.push_back(sub);
    }
    for sub in pending.drain(..) {
        if sub.limited {
            num_limited.fetch_sub(1, Ordering::AcqRel);
        }
        sub.job.rejected();
    }

    let handles: Vec<_> = workers
        .drain()
        .map(|(_, WorkerHandle { tx, handle })| {
            drop(tx);
            handle
        })
        .collect();
    for handle in handles {
        let _ = handle.join();
    }
    shuttle_done.store(true, Ordering::Release);
    debug!("shuttle exited");
}

fn fan_out(
    sub: &Arc<Submitted>,
    workers: &mut HashMap<u16, WorkerHandle>,
    stopped: &Arc<AtomicBool>,
    hard_shutdown: bool,
    num_limited: &Arc<AtomicUsize>,
) {
    let jobs = sub.job.container_jobs();
    if jobs.is_empty() {
        if sub.limited {
            num_limited.fetch_sub(1, Ordering::AcqRel);
        }
        sub.job.completed();
        return;
    }

    // All holders exist, with counts primed, before any is enqueued.
    let bookkeeping = JobBookkeeping::new(
        Arc::clone(&sub.job),
        jobs.len(),
        sub.limited,
        Arc::clone(num_limited),
    );
    let holders: Vec<ContainerJobHolder> = jobs
        .into_iter()
        .map(|job| ContainerJobHolder::new(job, Arc::clone(&bookkeeping)))
        .collect();

    for holder in holders {
        let index = holder.container_index();
        let worker = workers
            .entry(index)
            .or_insert_with(|| spawn_worker(index, Arc::clone(stopped), hard_shutdown));
        if let Err(channel::SendError(holder)) = worker.tx.send(holder) {
            // Worker gone; keep the counting invariants.
            holder.reject();
        }
    }
}

fn spawn_worker(index: u16, stopped: Arc<AtomicBool>, hard_shutdown: bool) -> WorkerHandle {
    let (tx, rx) = channel::unbounded::<ContainerJobHolder>();
    let handle = thread::Builder::new()
        .name(format!("mesh-container-{}", index))
        .spawn(move || worker_loop(rx, stopped, hard_shutdown))
        .expect("failed to spawn container worker");
    WorkerHandle { tx, handle }
}

fn worker_loop(rx: Receiver<ContainerJobHolder>, stopped: Arc<AtomicBool>, hard_shutdown: bool) {
    let mut pacer = Pacer::new();
    loop {
        match rx.try_recv() {
            Ok(holder) => {
                pacer.reset();
                if hard_shutdown && stopped.load(Ordering::Acquire) {
                    holder.reject();
                } else {
                    holder.execute();
                }
            }
            Err(TryRecvError::Empty) => pacer.pause(),
            Err(TryRecvError::Disconnected) => break,
        }
    }
}
