//! BSD/macOS multiplexing backend stub, gated behind the `kqueue` feature.
//!
//! Not exercised in this environment (the retrieved corpus and the demo
//! binary both target Linux); kept to the same shape as
//! [`super::epoll_backend::EpollReactor`] so [`crate::event::looper`] can
//! stay backend-agnostic via a `#[cfg]`-selected type alias rather than a
//! trait object, matching how the original keeps the epoll and (absent
//! here) kqueue reactor implementations as sibling headers behind the same
//! call sites.

use std::os::unix::io::RawFd;

use crate::error::{Result, RtError};
use crate::event::types::{Interest, Readiness, StreamId};

pub enum RawEvent {
    Stream { token: u64, readiness: Readiness },
    Signal(i32),
}

pub struct KqueueReactor {
    kq: RawFd,
}

impl KqueueReactor {
    pub fn new(_max_events: usize, _signals: &[i32]) -> Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(RtError::from_errno("kqueue"));
        }
        Ok(Self { kq })
    }

    pub fn register(&self, _fd: RawFd, _token: StreamId, _interest: Interest) -> Result<()> {
        Err(RtError::Internal("kqueue backend is a stub in this build".into()))
    }

    pub fn modify(&self, _fd: RawFd, _token: StreamId, _interest: Interest) -> Result<()> {
        Err(RtError::Internal("kqueue backend is a stub in this build".into()))
    }

    pub fn deregister(&self, _fd: RawFd) -> Result<()> {
        Ok(())
    }

    pub fn add_signal(&mut self, _sig: i32) -> Result<()> {
        Err(RtError::Internal("kqueue backend is a stub in this build".into()))
    }

    pub fn remove_signal(&mut self, _sig: i32) -> Result<()> {
        Err(RtError::Internal("kqueue backend is a stub in this build".into()))
    }

    pub fn poll(&mut self, _timeout_ms: i32) -> Result<Vec<RawEvent>> {
        Ok(Vec::new())
    }
}

pub fn decode_token(token: u64) -> StreamId {
    StreamId { slot: (token >> 32) as u32, generation: token as u32 }
}

impl Drop for KqueueReactor {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}
