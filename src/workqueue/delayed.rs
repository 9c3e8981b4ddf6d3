//! Delayed work: a [`WorkItem`] plus an embedded timer, queued onto its
//! workqueue once the delay elapses instead of immediately.
//!
//! Grounded on `examples/original_source/include/skp/process/
//! workqueue.h`'s `delayed_work` (`work_struct` + `timer_list`) and its
//! `queue_delayed_work_on`/`mod_delayed_work_on`/`cancel_delayed_work_sync`.
//! A workqueue consumer may not be running an [`crate::event::EventLooper`],
//! so the timer here is driven by a dedicated background thread reusing
//! [`crate::event::timer_heap::TimerHeap`] rather than the reactor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::event::timer_heap::TimerHeap;
use crate::event::types::TimerId;
use crate::workqueue::queue::{cancel_work_sync, next_work_id, Workqueue};
use crate::workqueue::work::{WorkFn, WorkItem};

struct DelayedTimerThread {
    heap: Mutex<TimerHeap>,
    cvar: Condvar,
}

impl DelayedTimerThread {
    fn schedule(&self, delay: Duration, callback: crate::event::types::TimerCallback) -> TimerId {
        let id = self.heap.lock().schedule(Instant::now() + delay, None, callback);
        self.cvar.notify_all();
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        let canceled = self.heap.lock().cancel(id);
        self.cvar.notify_all();
        canceled
    }

    fn run(&self) {
        loop {
            let mut heap = self.heap.lock();
            let wait = match heap.next_deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        Duration::ZERO
                    } else {
                        deadline - now
                    }
                }
                // Nothing scheduled: sleep a long time, woken early by the
                // next `schedule`/`cancel`'s `notify_all`.
                None => Duration::from_secs(3600),
            };
            if wait.is_zero() {
                heap.fire_due(Instant::now());
                continue;
            }
            self.cvar.wait_for(&mut heap, wait);
        }
    }
}

static DELAYED_TIMER: Lazy<Arc<DelayedTimerThread>> = Lazy::new(|| {
    let inner = Arc::new(DelayedTimerThread { heap: Mutex::new(TimerHeap::new()), cvar: Condvar::new() });
    let t = inner.clone();
    std::thread::Builder::new()
        .name("wq-delayed-timer".into())
        .spawn(move || t.run())
        .expect("spawning delayed-work timer thread");
    inner
});

/// A work item scheduled to run after a delay on a specific [`Workqueue`].
pub struct DelayedWork {
    work: Arc<WorkItem>,
    wq: Arc<Workqueue>,
    timer_id: Mutex<Option<TimerId>>,
}

impl DelayedWork {
    pub fn new(wq: Arc<Workqueue>, func: WorkFn) -> Arc<Self> {
        Arc::new(Self { work: Arc::new(WorkItem::new(next_work_id(), func)), wq, timer_id: Mutex::new(None) })
    }

    pub fn work(&self) -> &Arc<WorkItem> {
        &self.work
    }

    /// `queue_delayed_work`: arm the timer on the current thread's pool.
    /// No-op if already pending or running.
    pub fn queue(self: &Arc<Self>, delay: Duration) -> bool {
        self.queue_on(None, delay)
    }

    /// `queue_delayed_work_on`: as [`Self::queue`], pinned to `cpu` (bound
    /// workqueues only).
    pub fn queue_on(self: &Arc<Self>, cpu: Option<usize>, delay: Duration) -> bool {
        if !self.work.try_mark_pending() {
            return false;
        }
        self.arm(cpu, delay);
        true
    }

    /// `mod_delayed_work`: cancel any outstanding timer and reschedule with
    /// a new delay. Returns whether the work was already pending (armed or
    /// previously queued) before this call.
    pub fn modify(self: &Arc<Self>, delay: Duration) -> bool {
        self.modify_on(None, delay)
    }

    pub fn modify_on(self: &Arc<Self>, cpu: Option<usize>, delay: Duration) -> bool {
        let had_live_timer = match self.timer_id.lock().take() {
            Some(id) => DELAYED_TIMER.cancel(id),
            None => false,
        };
        let was_pending = self.work.is_pending();
        if !was_pending {
            self.work.try_mark_pending();
        }
        self.arm(cpu, delay);
        had_live_timer || was_pending
    }

    fn arm(self: &Arc<Self>, cpu: Option<usize>, delay: Duration) {
        let this = self.clone();
        let id = DELAYED_TIMER.schedule(delay, Box::new(move || this.fire(cpu)));
        *self.timer_id.lock() = Some(id);
    }

    fn fire(self: &Arc<Self>, cpu: Option<usize>) {
        *self.timer_id.lock() = None;
        self.wq.dispatch_existing(cpu, self.work.clone());
    }

    /// `cancel_delayed_work_sync`: cancel the timer if it hasn't fired yet;
    /// otherwise fall back to waiting for the work to finish running, the
    /// same as a plain `cancel_work_sync`.
    pub fn cancel_sync(&self) -> bool {
        if let Some(id) = self.timer_id.lock().take() {
            if DELAYED_TIMER.cancel(id) {
                self.work.clear_pending();
                return true;
            }
        }
        cancel_work_sync(&self.work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::workqueue::queue::alloc_workqueue;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delayed_work_runs_after_its_delay() {
        let wq = alloc_workqueue("delayed-test", true, 0, &RuntimeConfig::default());
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let dw = DelayedWork::new(wq, Box::new(move || { h.fetch_add(1, Ordering::SeqCst); }));
        dw.queue(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn modifying_a_pending_delay_reports_it_was_pending() {
        let wq = alloc_workqueue("delayed-mod-test", true, 0, &RuntimeConfig::default());
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let dw = DelayedWork::new(wq, Box::new(move || { h.fetch_add(1, Ordering::SeqCst); }));
        assert!(dw.queue(Duration::from_millis(500)));
        assert!(dw.modify(Duration::from_millis(10)));

        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn canceling_before_the_delay_elapses_prevents_the_run() {
        let wq = alloc_workqueue("delayed-cancel-test", true, 0, &RuntimeConfig::default());
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let dw = DelayedWork::new(wq, Box::new(move || { h.fetch_add(1, Ordering::SeqCst); }));
        dw.queue(Duration::from_millis(200));
        assert!(dw.cancel_sync());
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
