//! `work_struct` equivalent: a unit of work plus the state bits the pool and
//! workqueue layers use to serialize repeated queuing, detect in-flight
//! cancellation, and chain flush barriers.
//!
//! Grounded on `examples/original_source/include/skp/process/
//! workqueue.h`'s `WQ_WORK_*_BIT` layout. The original packs a pointer (to
//! either the owning `pool_workqueue` or the executing `pool`) into the low
//! bits alongside these flags; this crate keeps that pointer out of the
//! atomic word entirely (ownership is tracked by the `Arc` the pool and
//! workqueue already hold) and only ports the state bits themselves.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::event::Completion;

pub mod bits {
    pub const PENDING: u32 = 1 << 0;
    pub const DELAYED: u32 = 1 << 1;
    pub const CANCELING: u32 = 1 << 2;
    pub const RUNNING: u32 = 1 << 3;
    pub const BARRIER: u32 = 1 << 4;
}

/// Queryable status bitmask mirroring `WORK_BUSY_PENDING`/`WORK_BUSY_RUNNING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkBusy {
    pub pending: bool,
    pub running: bool,
}

/// Outcome of [`WorkItem::try_grab_for_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelGrab {
    /// Cleared PENDING before a worker could pop it off a worklist.
    WasPending,
    /// Already executing; caller must wait for it to finish.
    Running,
    /// Neither pending nor running — nothing to cancel.
    Idle,
}

pub type WorkFn = Box<dyn FnOnce() + Send + 'static>;

/// One work item. Always handled behind an `Arc` once queued, so multiple
/// subsystems (pool worklist, busy hash, delayed-work timer) can refer to
/// the same instance.
pub struct WorkItem {
    pub id: u64,
    pub(crate) func: parking_lot::Mutex<Option<WorkFn>>,
    pub(crate) flags: AtomicU32,
    /// Set only for barrier works inserted by `flush_work`/`flush_workqueue`;
    /// completed once the barrier runs in FIFO order after every work
    /// queued ahead of it.
    pub(crate) barrier_completion: Option<Completion>,
    /// Invoked by the worker right after the work function (or barrier)
    /// runs. [`crate::workqueue::pwq::PoolWorkqueue`] uses this to pull the
    /// next delayed work in as soon as an active slot frees up, without the
    /// pool needing to know `pool_workqueue` exists.
    pub(crate) on_complete: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl WorkItem {
    pub fn new(id: u64, func: WorkFn) -> Self {
        Self {
            id,
            func: parking_lot::Mutex::new(Some(func)),
            flags: AtomicU32::new(0),
            barrier_completion: None,
            on_complete: parking_lot::Mutex::new(None),
        }
    }

    pub(crate) fn barrier(id: u64, completion: Completion) -> Self {
        Self {
            id,
            func: parking_lot::Mutex::new(None),
            flags: AtomicU32::new(bits::BARRIER),
            barrier_completion: Some(completion),
            on_complete: parking_lot::Mutex::new(None),
        }
    }

    pub(crate) fn set_on_complete(&self, cb: impl FnOnce() + Send + 'static) {
        *self.on_complete.lock() = Some(Box::new(cb));
    }

    pub fn is_barrier(&self) -> bool {
        self.flags.load(Ordering::Acquire) & bits::BARRIER != 0
    }

    pub fn is_pending(&self) -> bool {
        self.flags.load(Ordering::Acquire) & bits::PENDING != 0
    }

    pub fn is_running(&self) -> bool {
        self.flags.load(Ordering::Acquire) & bits::RUNNING != 0
    }

    pub fn is_canceling(&self) -> bool {
        self.flags.load(Ordering::Acquire) & bits::CANCELING != 0
    }

    pub fn busy(&self) -> WorkBusy {
        let f = self.flags.load(Ordering::Acquire);
        WorkBusy { pending: f & bits::PENDING != 0, running: f & bits::RUNNING != 0 }
    }

    /// Returns `true` if this call transitioned Idle -> Pending (i.e. the
    /// caller actually queued it). `false` means it was already pending or
    /// running and the queue request should be a no-op, matching
    /// `queue_work`'s "at most one pending instance" rule.
    ///
    /// Always clears CANCELING: a fresh `queue_work` on a previously
    /// canceled item is a new instance that must actually run, matching
    /// `cancel_work_sync`'s "a subsequent `queue_work` succeeds" contract.
    pub(crate) fn try_mark_pending(&self) -> bool {
        let was_pending = self.flags.fetch_or(bits::PENDING, Ordering::AcqRel) & bits::PENDING == 0;
        self.flags.fetch_and(!bits::CANCELING, Ordering::AcqRel);
        was_pending
    }

    pub(crate) fn clear_canceling(&self) {
        self.flags.fetch_and(!bits::CANCELING, Ordering::AcqRel);
    }

    pub(crate) fn clear_pending(&self) {
        self.flags.fetch_and(!bits::PENDING, Ordering::AcqRel);
    }

    pub(crate) fn mark_running(&self) {
        self.flags.fetch_and(!bits::PENDING, Ordering::AcqRel);
        self.flags.fetch_or(bits::RUNNING, Ordering::AcqRel);
    }

    pub(crate) fn clear_running(&self) {
        self.flags.fetch_and(!bits::RUNNING, Ordering::AcqRel);
    }

    /// `try_to_grab_pending`: mark the work canceling (sticky — a worker
    /// that later pops it from a pool's worklist checks this and skips
    /// invoking its function) and report what state it was caught in.
    pub(crate) fn try_grab_for_cancel(&self) -> CancelGrab {
        self.flags.fetch_or(bits::CANCELING, Ordering::AcqRel);
        let snapshot = self.flags.load(Ordering::Acquire);
        if snapshot & bits::RUNNING != 0 {
            CancelGrab::Running
        } else if snapshot & bits::PENDING != 0 {
            self.flags.fetch_and(!bits::PENDING, Ordering::AcqRel);
            CancelGrab::WasPending
        } else {
            CancelGrab::Idle
        }
    }
}
