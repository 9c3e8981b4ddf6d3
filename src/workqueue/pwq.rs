//! `pool_workqueue`: the fan-in point between one [`crate::workqueue::
//! Workqueue`] and one [`crate::workqueue::pool::WorkerPool`]. Tracks
//! `max_active`/`nr_active` so a workqueue can't flood its pool past the
//! concurrency limit the caller asked for; anything over the limit waits
//! on `delayed_works` until a running work completes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::workqueue::pool::WorkerPool;
use crate::workqueue::work::WorkItem;

pub struct PoolWorkqueue {
    pub pool: Arc<WorkerPool>,
    pub max_active: u32,
    nr_active: AtomicU32,
    delayed: Mutex<VecDeque<Arc<WorkItem>>>,
}

impl PoolWorkqueue {
    pub fn new(pool: Arc<WorkerPool>, max_active: u32) -> Arc<Self> {
        Arc::new(Self { pool, max_active: max_active.max(1), nr_active: AtomicU32::new(0), delayed: Mutex::new(VecDeque::new()) })
    }

    /// Queue `work`, either dispatching it straight to the pool or parking
    /// it on `delayed` if `nr_active` is already at `max_active`.
    pub fn queue(self: Arc<Self>, work: Arc<WorkItem>) {
        let mut active = self.nr_active.load(Ordering::Acquire);
        loop {
            if active >= self.max_active {
                self.delayed.lock().push_back(work);
                return;
            }
            match self.nr_active.compare_exchange_weak(active, active + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(seen) => active = seen,
            }
        }
        self.dispatch_active(work);
    }

    fn dispatch_active(self: Arc<Self>, work: Arc<WorkItem>) {
        let pwq = self.clone();
        // Hooked so a completed active slot immediately pulls the next
        // delayed work in, keeping `nr_active` saturated instead of
        // stalling until some unrelated re-check.
        work.set_on_complete(move || pwq.on_active_complete());
        self.pool.enqueue(work);
    }

    fn on_active_complete(self: Arc<Self>) {
        if let Some(next) = self.delayed.lock().pop_front() {
            self.dispatch_active(next);
        } else {
            self.nr_active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn nr_active(&self) -> u32 {
        self.nr_active.load(Ordering::Acquire)
    }

    pub fn nr_delayed(&self) -> usize {
        self.delayed.lock().len()
    }

    pub fn drain(&self) {
        while self.nr_active() > 0 || self.nr_delayed() > 0 {
            std::thread::yield_now();
        }
    }
}
