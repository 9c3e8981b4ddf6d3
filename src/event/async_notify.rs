//! Async-notify events: a cross-thread wakeup backed by a non-blocking pipe
//! and an atomic pending count, dispatched through the looper as an
//! ordinary readable stream.
//!
//! Grounded on spec.md's async-notify description (`uev_async_init/emit`)
//! and on `epoll_backend.rs`'s raw-syscall-plus-`RtError::from_errno` idiom
//! for the pipe setup.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::{Result, RtError};

/// Sentinel for "no emit pending, pipe drained" — distinct from any real
/// pending count (which starts at 0 on the first emit after drain).
const IDLE: i64 = -1;

pub(crate) struct AsyncNotify {
    pub(crate) read_fd: RawFd,
    write_fd: RawFd,
    pending: AtomicI64,
}

impl AsyncNotify {
    pub(crate) fn new() -> Result<Arc<Self>> {
        let mut fds = [0i32; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) } != 0 {
            return Err(RtError::from_errno("pipe2(async_notify)"));
        }
        let [read_fd, write_fd] = fds;
        Ok(Arc::new(Self { read_fd, write_fd, pending: AtomicI64::new(IDLE) }))
    }

    /// `uev_async_emit`: bump the pending count; only the idle->pending
    /// transition writes a wake byte, so emits that arrive before the
    /// looper has drained the last one coalesce into a single dispatch.
    fn emit(&self) {
        let prev = self.pending.fetch_add(1, Ordering::AcqRel);
        if prev == IDLE {
            let byte = [1u8];
            unsafe {
                libc::write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1);
            }
        }
    }

    /// Drain every byte the pipe is holding and reset to idle. Called from
    /// the stream callback, before the user callback runs.
    fn drain_and_reset(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
        self.pending.store(IDLE, Ordering::Release);
    }
}

impl Drop for AsyncNotify {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Emit-side handle returned by [`crate::event::EventLooper::register_async`].
/// Cheap to clone; `emit()` is safe to call from any thread, including the
/// looper's own.
#[derive(Clone)]
pub struct AsyncHandle {
    pub(crate) notify: Arc<AsyncNotify>,
}

impl AsyncHandle {
    pub fn emit(&self) {
        self.notify.emit();
    }
}

pub(crate) fn drain_and_reset(notify: &AsyncNotify) {
    notify.drain_and_reset();
}
