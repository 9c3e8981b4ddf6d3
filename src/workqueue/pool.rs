//! Worker pools: the threads that actually run queued work. A bound pool
//! has one persistent worker per CPU; an unbound pool grows workers on
//! demand up to a cap and reaps idle ones after `idle_worker_timeout`.
//!
//! Grounded on `examples/original_source/include/skp/process/
//! workqueue.h`'s bound-vs-unbound worker pool split and the busy-worker
//! hash used to detect "this work item is already executing somewhere in
//! this pool" collisions, reshaped here as a plain `HashSet<u64>` of
//! in-flight work ids guarded by the same mutex as the worklist.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::workqueue::work::WorkItem;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(0);

struct Inner {
    worklist: VecDeque<Arc<WorkItem>>,
    busy: HashSet<u64>,
    nr_idle: usize,
    nr_workers: usize,
    shutdown: bool,
}

/// A pool of worker threads sharing one worklist. Bound pools are created
/// once per CPU by [`crate::workqueue::queue::system_workqueues`]; unbound
/// pools back `alloc_workqueue(unbound)` callers.
pub struct WorkerPool {
    pub id: u32,
    pub bound_cpu: Option<usize>,
    inner: Mutex<Inner>,
    cvar: Condvar,
    nr_running: AtomicUsize,
    max_workers: usize,
    idle_timeout: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Bound pool: exactly one persistent worker, pinned (conceptually —
    /// this crate doesn't call `sched_setaffinity`) to `cpu`.
    pub fn new_bound(cpu: usize) -> Arc<Self> {
        let pool = Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            bound_cpu: Some(cpu),
            inner: Mutex::new(Inner { worklist: VecDeque::new(), busy: HashSet::new(), nr_idle: 0, nr_workers: 0, shutdown: false }),
            cvar: Condvar::new(),
            nr_running: AtomicUsize::new(0),
            max_workers: 1,
            idle_timeout: Duration::MAX,
            handles: Mutex::new(Vec::new()),
        });
        pool.spawn_worker();
        pool
    }

    /// Unbound pool: starts with no workers, grows up to `max_workers` as
    /// queued work outpaces idle capacity, reaps back down to zero after
    /// `idle_timeout` of no work.
    pub fn new_unbound(max_workers: usize, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            bound_cpu: None,
            inner: Mutex::new(Inner { worklist: VecDeque::new(), busy: HashSet::new(), nr_idle: 0, nr_workers: 0, shutdown: false }),
            cvar: Condvar::new(),
            nr_running: AtomicUsize::new(0),
            max_workers: max_workers.max(1),
            idle_timeout,
            handles: Mutex::new(Vec::new()),
        })
    }

    fn spawn_worker(self: &Arc<Self>) {
        let pool = self.clone();
        let mut inner = self.inner.lock();
        inner.nr_workers += 1;
        drop(inner);
        let handle = std::thread::Builder::new()
            .name(format!("wq-pool-{}", pool.id))
            .spawn(move || pool.worker_loop())
            .expect("spawning a worker thread");
        self.handles.lock().push(handle);
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let work = {
                let mut inner = self.inner.lock();
                loop {
                    if inner.shutdown {
                        return;
                    }
                    if let Some(w) = inner.worklist.pop_front() {
                        break w;
                    }
                    inner.nr_idle += 1;
                    let reapable = self.bound_cpu.is_none() && inner.nr_workers > 0;
                    let timed_out = if reapable {
                        let result = self.cvar.wait_for(&mut inner, self.idle_timeout);
                        result.timed_out()
                    } else {
                        self.cvar.wait(&mut inner);
                        false
                    };
                    inner.nr_idle -= 1;
                    if timed_out && inner.worklist.is_empty() && !inner.shutdown && self.bound_cpu.is_none() {
                        inner.nr_workers -= 1;
                        trace!(pool = self.id, "reaping idle unbound worker");
                        return;
                    }
                }
            };

            self.inner.lock().busy.insert(work.id);
            work.mark_running();
            self.nr_running.fetch_add(1, Ordering::AcqRel);
            crate::workqueue::queue::set_current_work(Some(work.id));

            // A canceled work still needs its completion hook run (e.g. to
            // release a pool_workqueue active slot) — only the function
            // itself is skipped.
            if work.is_canceling() {
                // nothing to run
            } else if work.is_barrier() {
                if let Some(completion) = &work.barrier_completion {
                    completion.complete();
                }
            } else if let Some(func) = work.func.lock().take() {
                func();
            }
            if let Some(cb) = work.on_complete.lock().take() {
                cb();
            }

            // This instance is resolved: clear CANCELING before RUNNING so a
            // `cancel_work_sync` spinning on `is_running()` never observes
            // "not running" while the item still looks permanently canceled.
            work.clear_canceling();
            crate::workqueue::queue::set_current_work(None);
            work.clear_running();
            self.nr_running.fetch_sub(1, Ordering::AcqRel);
            let mut inner = self.inner.lock();
            inner.busy.remove(&work.id);
        }
    }

    /// `queue_work_on`'s pool-side half: push to the worklist, growing the
    /// pool if nothing is idle to pick it up and we're below `max_workers`.
    pub fn enqueue(self: &Arc<Self>, work: Arc<WorkItem>) {
        let mut inner = self.inner.lock();
        let need_growth = inner.nr_idle == 0 && inner.nr_workers < self.max_workers;
        inner.worklist.push_back(work);
        if need_growth {
            drop(inner);
            self.spawn_worker();
        } else {
            drop(inner);
        }
        self.cvar.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().worklist.len()
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.worklist.is_empty() && self.nr_running.load(Ordering::Acquire) == 0
    }

    pub fn nr_workers(&self) -> usize {
        self.inner.lock().nr_workers
    }

    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.cvar.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock());
        for h in handles {
            let _ = h.join();
        }
        debug!(pool = self.id, "worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.inner.lock().shutdown {
            self.inner.lock().shutdown = true;
            self.cvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as AU32;
    use std::sync::Arc as A;

    #[test]
    fn bound_pool_runs_queued_work() {
        let pool = WorkerPool::new_bound(0);
        let hits = A::new(AU32::new(0));
        let h = hits.clone();
        let work = A::new(WorkItem::new(1, Box::new(move || { h.fetch_add(1, Ordering::SeqCst); })));
        pool.enqueue(work);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn unbound_pool_grows_to_serve_concurrent_work() {
        let pool = WorkerPool::new_unbound(4, Duration::from_millis(50));
        let hits = A::new(AU32::new(0));
        for i in 0..4 {
            let h = hits.clone();
            pool.enqueue(A::new(WorkItem::new(i, Box::new(move || {
                std::thread::sleep(Duration::from_millis(30));
                h.fetch_add(1, Ordering::SeqCst);
            }))));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) < 4 && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        pool.shutdown();
    }
}
