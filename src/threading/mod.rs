// Ordered per-container threading model
//
// A two-stage pipeline for inbound messages: deserialization runs in
// parallel, but each destination container sees its work in strict
// arrival order. Runs on dedicated threads; every stage polls
// non-blocking queues with spin/yield/sleep escalation.

pub mod jobs;
pub mod ordered;

pub use jobs::{ContainerJob, ContainerJobHolder, DeliveryJob, JobBookkeeping};
pub use ordered::OrderedThreadingModel;

use std::time::Duration;

const SPIN_LIMIT: u32 = 100;
const YIELD_LIMIT: u32 = 500;

/// Spin, then yield, then sleep. Reset on progress.
pub(crate) struct Pacer {
    count: u32,
}

impl Pacer {
    pub(crate) fn new() -> Self {
        Self { count: 0 }
    }

    pub(crate) fn reset(&mut self) {
        self.count = 0;
    }

    pub(crate) fn pause(&mut self) {
        self.count = self.count.saturating_add(1);
        if self.count < SPIN_LIMIT {
            std::hint::spin_loop();
        } else if self.count < YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
