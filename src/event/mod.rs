//! Event reactor: one [`EventLooper`] per driving thread, multiplexing
//! stream readiness, timers, RCU-lite reclamation and (optionally) signals
//! over a single `epoll`/`kqueue` wait call.

pub mod async_notify;
pub mod completion;
#[cfg(not(feature = "kqueue"))]
pub mod epoll_backend;
#[cfg(feature = "kqueue")]
pub mod kqueue_backend;
pub mod looper;
pub mod rcu;
pub mod timer_heap;
pub mod types;

pub use async_notify::AsyncHandle;
pub use completion::Completion;
pub use looper::{EventLooper, LooperStats};
pub use rcu::{RcuDomain, RcuRegistry};
pub use timer_heap::TimerStats;
pub use types::{Interest, Readiness, StreamId, TimerId};
