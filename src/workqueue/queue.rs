//! `workqueue`: the caller-facing handle. Fans work out across one pool
//! per CPU (bound) or a single shared pool (unbound/ordered), and provides
//! `flush`/`drain`/`cancel` semantics on top of [`PoolWorkqueue`].
//!
//! Grounded on `examples/original_source/include/skp/process/
//! workqueue.h`'s public surface (`alloc_workqueue`, `queue_work[_on]`,
//! `flush_work`, `__cancel_work_sync`, `current_work`, `work_busy`) and its
//! four global system workqueues, lazily created on first use the way the
//! original gates them behind a `wq_online` flag — done here with
//! `once_cell::sync::Lazy` instead of a hand-rolled once-flag.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::{Result, RtError};
use crate::event::Completion;
use crate::workqueue::pool::WorkerPool;
use crate::workqueue::pwq::PoolWorkqueue;
use crate::workqueue::work::{CancelGrab, WorkBusy, WorkFn, WorkItem};

static NEXT_WORK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// `current_work()`: id of the work item the calling thread is
    /// currently executing inside a pool worker, if any.
    static CURRENT_WORK: Cell<Option<u64>> = Cell::new(None);
}

enum Layout {
    /// One `PoolWorkqueue` per CPU, each backed by its own bound pool.
    Bound(Vec<Arc<PoolWorkqueue>>),
    /// A single `PoolWorkqueue` backed by one unbound pool, shared by every
    /// CPU. `ordered` workqueues are this layout with `max_active` pinned
    /// to 1.
    Unbound(Arc<PoolWorkqueue>),
}

pub struct Workqueue {
    pub name: String,
    layout: Layout,
}

impl Workqueue {
    fn pwq_for_current_thread(&self) -> Arc<PoolWorkqueue> {
        match &self.layout {
            Layout::Bound(pwqs) => {
                let cpu = current_cpu_hint() % pwqs.len().max(1);
                pwqs[cpu].clone()
            }
            Layout::Unbound(pwq) => pwq.clone(),
        }
    }

    fn all_pwqs(&self) -> Vec<Arc<PoolWorkqueue>> {
        match &self.layout {
            Layout::Bound(pwqs) => pwqs.clone(),
            Layout::Unbound(pwq) => vec![pwq.clone()],
        }
    }

    /// `queue_work`: submit `func` for execution, returning the handle used
    /// by `flush_work`/`cancel_work_sync`/`work_busy`.
    pub fn queue_work(&self, func: WorkFn) -> Arc<WorkItem> {
        let work = Arc::new(WorkItem::new(NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed), func));
        self.queue_existing(work.clone());
        work
    }

    /// `queue_work_on`: as [`Self::queue_work`] but pinned to a specific
    /// CPU's pool (bound workqueues only; unbound workqueues ignore the
    /// hint since they have one shared pool).
    pub fn queue_work_on(&self, cpu: usize, func: WorkFn) -> Arc<WorkItem> {
        let work = Arc::new(WorkItem::new(NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed), func));
        let pwq = match &self.layout {
            Layout::Bound(pwqs) => pwqs[cpu % pwqs.len()].clone(),
            Layout::Unbound(pwq) => pwq.clone(),
        };
        self.dispatch(pwq, work.clone());
        work
    }

    fn queue_existing(&self, work: Arc<WorkItem>) {
        let pwq = self.pwq_for_current_thread();
        self.dispatch(pwq, work);
    }

    /// Re-submit a work item obtained from an earlier `queue_work` call,
    /// rather than constructing a new one. Mirrors the original's
    /// `queue_work`, which always takes a pre-existing `work_struct` — a
    /// repeated call is a no-op while `work` is already pending or running.
    pub fn requeue(&self, work: Arc<WorkItem>) {
        self.queue_existing(work);
    }

    fn dispatch(&self, pwq: Arc<PoolWorkqueue>, work: Arc<WorkItem>) {
        if !work.try_mark_pending() {
            return;
        }
        pwq.queue(work);
    }

    /// Used by [`crate::workqueue::delayed::DelayedWork`]: the PENDING bit
    /// is already held (set when the timer was armed), so this skips the
    /// dedup check `dispatch` does and hands straight to the pool.
    pub(crate) fn dispatch_existing(&self, cpu: Option<usize>, work: Arc<WorkItem>) {
        let pwq = match cpu {
            Some(cpu) => match &self.layout {
                Layout::Bound(pwqs) => pwqs[cpu % pwqs.len()].clone(),
                Layout::Unbound(pwq) => pwq.clone(),
            },
            None => self.pwq_for_current_thread(),
        };
        pwq.queue(work);
    }

    /// `flush_work`: block until `work` is neither pending nor running.
    /// Implemented by inserting a barrier work right after it on the same
    /// pool and waiting on the barrier's completion, so ordering against
    /// anything queued before the flush is preserved.
    pub fn flush_work(&self, work: &Arc<WorkItem>) {
        if !work.is_pending() && !work.is_running() {
            return;
        }
        let pwq = self.pwq_for_current_thread();
        let completion = Completion::new();
        let barrier = Arc::new(WorkItem::barrier(NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed), completion.clone()));
        barrier.try_mark_pending();
        pwq.queue(barrier);
        completion.wait();
    }

    /// `flush_workqueue`: wait for everything queued on every pool this
    /// workqueue fans out to, as of the moment this is called.
    pub fn flush_workqueue(&self) {
        let mut completions = Vec::new();
        for pwq in self.all_pwqs() {
            let completion = Completion::new();
            let barrier = Arc::new(WorkItem::barrier(NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed), completion.clone()));
            barrier.try_mark_pending();
            pwq.queue(barrier);
            completions.push(completion);
        }
        for c in completions {
            c.wait();
        }
    }

    /// `drain_workqueue`: flush repeatedly until nothing is active or
    /// delayed anywhere, handling work that re-queues more work.
    pub fn drain(&self) {
        loop {
            self.flush_workqueue();
            let idle = self.all_pwqs().iter().all(|p| p.nr_active() == 0 && p.nr_delayed() == 0);
            if idle {
                return;
            }
        }
    }

    pub fn work_busy(&self, work: &WorkItem) -> WorkBusy {
        work.busy()
    }
}

/// `__cancel_work_sync`: try to prevent `work` from ever running; if it's
/// already running, block until it finishes. Returns whether it was
/// pending (i.e. actually canceled before it could run).
///
/// CANCELING is sticky only long enough to resolve this one instance: a
/// worker that later pops a still-queued copy of `work` clears it as soon
/// as it skips the function, and a fresh `queue_work`/`requeue` on the same
/// item clears it immediately too, so the item is never stuck unusable.
pub fn cancel_work_sync(work: &Arc<WorkItem>) -> bool {
    match work.try_grab_for_cancel() {
        CancelGrab::WasPending => true,
        CancelGrab::Idle => {
            // Nothing is queued or running — no worker will ever see this
            // instance to clear CANCELING, so clear it here.
            work.clear_canceling();
            false
        }
        CancelGrab::Running => {
            while work.is_running() {
                std::thread::yield_now();
            }
            false
        }
    }
}

pub(crate) fn next_work_id() -> u64 {
    NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn current_work() -> Option<u64> {
    CURRENT_WORK.with(|c| c.get())
}

pub(crate) fn set_current_work(id: Option<u64>) {
    CURRENT_WORK.with(|c| c.set(id));
}

fn current_cpu_hint() -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() as usize
}

/// `alloc_workqueue`: `max_active == 0` means "use the config default".
pub fn alloc_workqueue(name: impl Into<String>, unbound: bool, max_active: u32, config: &RuntimeConfig) -> Arc<Workqueue> {
    let name = name.into();
    let max_active = if max_active == 0 { config.wq_dfl_active } else { max_active.min(config.wq_max_active) };
    let layout = if unbound {
        let pool = WorkerPool::new_unbound((config.max_numnodes as usize * 4).max(2), config.idle_worker_timeout);
        Layout::Unbound(PoolWorkqueue::new(pool, max_active))
    } else {
        let n = num_cpus::get().max(1);
        let pwqs = (0..n).map(|cpu| PoolWorkqueue::new(WorkerPool::new_bound(cpu), max_active)).collect();
        Layout::Bound(pwqs)
    };
    debug!(name = %name, unbound, max_active, "allocated workqueue");
    Arc::new(Workqueue { name, layout })
}

/// `alloc_ordered_workqueue`: exactly one active work at a time, processed
/// in queue order, on a dedicated unbound pool whose single worker never
/// gets reaped (so strict ordering doesn't stall behind a respawn).
pub fn alloc_ordered_workqueue(name: impl Into<String>) -> Arc<Workqueue> {
    let pool = WorkerPool::new_unbound(1, Duration::MAX);
    Arc::new(Workqueue { name: name.into(), layout: Layout::Unbound(PoolWorkqueue::new(pool, 1)) })
}

/// `destroy_workqueue`: drain everything outstanding, then shut down every
/// pool this workqueue owns. The handle must not be used after this call.
pub fn destroy_workqueue(wq: Arc<Workqueue>) {
    wq.drain();
    for pwq in wq.all_pwqs() {
        pwq.pool.shutdown();
    }
}

/// `schedule_on_each_cpu`: queue one work per CPU on [`SYSTEM_WQ`], pinned
/// via `queue_work_on`, and block until every one of them has run. Used for
/// per-CPU maintenance passes (e.g. draining a per-thread cache on every
/// CPU) rather than for general-purpose scheduling.
pub fn schedule_on_each_cpu(mut make_work: impl FnMut(usize) -> WorkFn) {
    let n = num_cpus::get().max(1);
    let works: Vec<_> = (0..n).map(|cpu| SYSTEM_WQ.queue_work_on(cpu, make_work(cpu))).collect();
    for w in works {
        SYSTEM_WQ.flush_work(&w);
    }
}

/// The four global system workqueues, created lazily on first access.
/// Defaults follow the original: `system_wq` is bound/normal-priority,
/// `system_highpri_wq` bound/high-priority (priority is cosmetic here — no
/// scheduling class is set, just a distinct pool), `system_long_wq` is
/// unbound so long-running work never starves short work on a bound pool,
/// `system_unbound_wq` is unbound/normal.
pub static SYSTEM_WQ: Lazy<Arc<Workqueue>> = Lazy::new(|| alloc_workqueue("system_wq", false, 0, &RuntimeConfig::default()));
pub static SYSTEM_HIGHPRI_WQ: Lazy<Arc<Workqueue>> =
    Lazy::new(|| alloc_workqueue("system_highpri_wq", false, 0, &RuntimeConfig::default()));
pub static SYSTEM_LONG_WQ: Lazy<Arc<Workqueue>> =
    Lazy::new(|| alloc_workqueue("system_long_wq", true, 0, &RuntimeConfig::default()));
pub static SYSTEM_UNBOUND_WQ: Lazy<Arc<Workqueue>> =
    Lazy::new(|| alloc_workqueue("system_unbound_wq", true, 0, &RuntimeConfig::default()));

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AOrdering};

    #[test]
    fn queued_work_runs_exactly_once() {
        let wq = alloc_workqueue("test", true, 0, &RuntimeConfig::default());
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let work = wq.queue_work(Box::new(move || { h.fetch_add(1, AOrdering::SeqCst); }));
        wq.flush_work(&work);
        assert_eq!(hits.load(AOrdering::SeqCst), 1);
    }

    #[test]
    fn max_active_limits_concurrency() {
        let wq = alloc_workqueue("bounded", true, 2, &RuntimeConfig::default());
        let running = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let mut works = Vec::new();
        for _ in 0..6 {
            let r = running.clone();
            let m = max_seen.clone();
            works.push(wq.queue_work(Box::new(move || {
                let now = r.fetch_add(1, AOrdering::SeqCst) + 1;
                m.fetch_max(now, AOrdering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                r.fetch_sub(1, AOrdering::SeqCst);
            })));
        }
        wq.drain();
        assert!(max_seen.load(AOrdering::SeqCst) <= 2);
    }

    #[test]
    fn cancel_sync_prevents_a_pending_work_from_running() {
        let wq = alloc_workqueue("cancel-test", true, 1, &RuntimeConfig::default());
        let hits = Arc::new(AtomicU32::new(0));
        // Saturate the single active slot so the next work stays pending.
        let blocker_done = Completion::new();
        let bd = blocker_done.clone();
        wq.queue_work(Box::new(move || {
            bd.wait();
        }));
        let h = hits.clone();
        let work = wq.queue_work(Box::new(move || { h.fetch_add(1, AOrdering::SeqCst); }));
        let canceled = cancel_work_sync(&work);
        blocker_done.complete();
        std::thread::sleep(Duration::from_millis(50));
        assert!(canceled);
        assert_eq!(hits.load(AOrdering::SeqCst), 0);
    }

    #[test]
    fn destroy_workqueue_drains_before_shutting_down() {
        let wq = alloc_workqueue("destroy-test", true, 0, &RuntimeConfig::default());
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        wq.queue_work(Box::new(move || { h.fetch_add(1, AOrdering::SeqCst); }));
        destroy_workqueue(wq);
        assert_eq!(hits.load(AOrdering::SeqCst), 1);
    }

    #[test]
    fn schedule_on_each_cpu_runs_on_every_cpu() {
        let ran = Arc::new(AtomicU32::new(0));
        schedule_on_each_cpu(|_cpu| {
            let r = ran.clone();
            Box::new(move || { r.fetch_add(1, AOrdering::SeqCst); })
        });
        assert_eq!(ran.load(AOrdering::SeqCst), num_cpus::get().max(1) as u32);
    }
}
