//! Virtual-page buddy allocator, per-thread slab caches, an epoll/kqueue
//! event reactor and a kernel-style workqueue scheduler, built on the same
//! small set of lock-free building blocks (`concurrent`).
//!
//! Layering: `mm` and `event` are independent of each other; `workqueue`
//! depends on `event` for its delayed-work timer and `Completion`. Nothing
//! depends on `workqueue`.

pub mod concurrent;
pub mod config;
pub mod error;
pub mod event;
pub mod mm;
pub mod workqueue;

pub use config::RuntimeConfig;
pub use error::{Result, RtError};
pub use mm::{
    AllocApi, AllocFlags, PageArena, PageCache, PageDescriptor, PageHandle, PageOwner, SlabCache, SlabFlags, SlabStats,
};
pub use event::{
    AsyncHandle, Completion, EventLooper, Interest, LooperStats, Readiness, RcuDomain, RcuRegistry, StreamId, TimerId,
    TimerStats,
};
pub use workqueue::{
    alloc_ordered_workqueue, alloc_workqueue, cancel_work_sync, current_work, destroy_workqueue, schedule_on_each_cpu,
    DelayedWork, PoolWorkqueue, WorkBusy, WorkItem, Workqueue, WorkerPool, SYSTEM_HIGHPRI_WQ, SYSTEM_LONG_WQ,
    SYSTEM_UNBOUND_WQ, SYSTEM_WQ,
};
