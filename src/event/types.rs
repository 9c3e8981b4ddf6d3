//! Event kinds the looper multiplexes, and the callback shapes registered
//! against them.
//!
//! Grounded on `examples/original_source/src/process/reactor/epoll.h`'s
//! `mask2epev`/`epev2mask` (stream readiness as a bitmask) and on
//! `include/skp/process/workqueue.h`'s callback-pointer style, reshaped here
//! as boxed closures the way the teacher's `event_loop.rs`-adjacent code
//! takes `Box<dyn Fn>` callbacks.

use std::fmt;

/// Readiness bits a registered stream can be polled for, mirroring
/// `EPOLLIN`/`EPOLLOUT`/`EPOLLERR`/`EPOLLHUP` without leaking the `libc`
/// constants into caller-facing code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };
    pub const READ_WRITE: Interest = Interest { readable: true, writable: true };
}

/// What actually happened to a registered stream, handed to its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// Identifies a stream registration within one [`crate::event::EventLooper`].
/// Index into the looper's internal stream table plus a generation counter
/// so a stale id from a deleted registration is rejected instead of
/// silently hitting a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}.{}", self.slot, self.generation)
    }
}

/// Identifies a registered timer. Same slot+generation shape as
/// [`StreamId`]; kept as a distinct type so a timer id can't be passed
/// where a stream id is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

pub type StreamCallback = Box<dyn FnMut(Readiness) + Send>;
pub type TimerCallback = Box<dyn FnMut() + Send>;
/// Callback run by [`crate::event::EventLooper::register_async`] once per
/// dispatch, after the pending count has been drained and reset.
pub type AsyncCallback = Box<dyn FnMut() + Send>;
pub type SignalCallback = Box<dyn FnMut(i32) + Send>;
