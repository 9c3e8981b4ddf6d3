//! Concurrency-managed work scheduling: `work_struct`/`workqueue_struct`
//! reshaped around `Arc` ownership instead of intrusive C lists.
//!
//! Grounded throughout on `examples/original_source/include/skp/process/
//! workqueue.h` and `kernel/workqueue.c`. Layering, bottom to top:
//! [`work::WorkItem`] (state bits) -> [`pool::WorkerPool`] (threads) ->
//! [`pwq::PoolWorkqueue`] (per-workqueue concurrency limit on one pool) ->
//! [`queue::Workqueue`] (caller-facing handle, fans out over one or many
//! pools) -> [`delayed::DelayedWork`] (work plus a timer).

pub mod delayed;
pub mod pool;
pub mod pwq;
pub mod queue;
pub mod work;

pub use delayed::DelayedWork;
pub use pool::WorkerPool;
pub use pwq::PoolWorkqueue;
pub use queue::{
    alloc_ordered_workqueue, alloc_workqueue, cancel_work_sync, current_work, destroy_workqueue, schedule_on_each_cpu,
    Workqueue, SYSTEM_HIGHPRI_WQ, SYSTEM_LONG_WQ, SYSTEM_UNBOUND_WQ, SYSTEM_WQ,
};
pub use work::{WorkBusy, WorkItem};
