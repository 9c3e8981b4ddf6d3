//! Linux multiplexing backend: `epoll` for stream readiness, `signalfd` for
//! process signals folded into the same `epoll_wait` call.
//!
//! Grounded directly on `examples/original_source/src/process/reactor/
//! epoll.h`'s `epoll_reactor` (epfd + optional sigfd, `mask2epev`/
//! `epev2mask` translation, batch `signalfd_siginfo` reads) and on
//! `examples/dillonhicks-page-modification-tracking/src/mmapfile.rs` for
//! the general "wrap a raw syscall, turn -1 into `RtError::from_errno`"
//! idiom used throughout (that file uses `nix`; this one calls `libc`
//! directly since no `mio`/`nix`/`signal-hook` crate appears anywhere in
//! this corpus and `libc` is already part of the dependency stack).

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use tracing::{trace, warn};

use crate::error::{Result, RtError};
use crate::event::types::{Readiness, StreamId};

/// `READ_NR_SIGINFO` from the original: how many `signalfd_siginfo`
/// records to read per signalfd-ready wakeup.
const READ_NR_SIGINFO: usize = 4;

fn mask_to_epev(interest: crate::event::types::Interest) -> u32 {
    let mut ev = libc::EPOLLET as u32;
    if interest.readable {
        ev |= libc::EPOLLIN as u32;
    }
    if interest.writable {
        ev |= libc::EPOLLOUT as u32;
    }
    ev
}

fn epev_to_readiness(ev: u32) -> Readiness {
    Readiness {
        readable: ev & (libc::EPOLLIN as u32) != 0,
        writable: ev & (libc::EPOLLOUT as u32) != 0,
        error: ev & (libc::EPOLLERR as u32) != 0,
        hangup: ev & (libc::EPOLLHUP as u32) != 0,
    }
}

/// One readiness/signal notification drained from a `reactor_poll` call.
pub enum RawEvent {
    Stream { token: u64, readiness: Readiness },
    Signal(i32),
}

pub struct EpollReactor {
    epfd: RawFd,
    sigfd: Option<RawFd>,
    /// Signals this reactor currently has blocked, mapped to whether the
    /// signal was already blocked process-wide before we touched it (so
    /// `remove_signal` knows whether to restore it on the way out).
    signals: HashMap<i32, bool>,
    event_buf: Vec<libc::epoll_event>,
}

impl EpollReactor {
    /// `reactor_create`: open the epoll instance, then block any initial
    /// `signals` and fold them into a shared `signalfd` via `add_signal` so
    /// they surface through the same `epoll_wait` loop instead of an
    /// async-signal-unsafe handler.
    pub fn new(max_events: usize, signals: &[i32]) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RtError::from_errno("epoll_create1"));
        }

        let mut reactor = Self {
            epfd,
            sigfd: None,
            signals: HashMap::new(),
            event_buf: vec![unsafe { std::mem::zeroed() }; max_events.max(1)],
        };
        for &sig in signals {
            if let Err(e) = reactor.add_signal(sig) {
                unsafe { libc::close(epfd) };
                return Err(e);
            }
        }
        Ok(reactor)
    }

    /// Block `sig` process-wide (recording whether it was already blocked,
    /// so `remove_signal` can restore the prior state) and rebuild the
    /// shared `signalfd` mask to include it. A no-op if already registered.
    pub fn add_signal(&mut self, sig: i32) -> Result<()> {
        if self.signals.contains_key(&sig) {
            return Ok(());
        }
        let mut single: libc::sigset_t = unsafe { std::mem::zeroed() };
        let was_blocked = unsafe {
            libc::sigemptyset(&mut single);
            libc::sigaddset(&mut single, sig);
            let mut old: libc::sigset_t = std::mem::zeroed();
            if libc::sigprocmask(libc::SIG_BLOCK, &single, &mut old) != 0 {
                return Err(RtError::from_errno("sigprocmask(SIG_BLOCK)"));
            }
            libc::sigismember(&old, sig) == 1
        };
        self.signals.insert(sig, was_blocked);
        self.sync_signalfd_mask()
    }

    /// Unblock `sig` process-wide (unless it was already blocked before this
    /// reactor registered it) and rebuild the shared `signalfd` mask to drop
    /// it. A no-op if `sig` isn't currently registered.
    pub fn remove_signal(&mut self, sig: i32) -> Result<()> {
        let Some(was_blocked) = self.signals.remove(&sig) else {
            return Ok(());
        };
        if !was_blocked {
            let mut single: libc::sigset_t = unsafe { std::mem::zeroed() };
            unsafe {
                libc::sigemptyset(&mut single);
                libc::sigaddset(&mut single, sig);
                if libc::sigprocmask(libc::SIG_UNBLOCK, &single, std::ptr::null_mut()) != 0 {
                    return Err(RtError::from_errno("sigprocmask(SIG_UNBLOCK)"));
                }
            }
        }
        self.sync_signalfd_mask()
    }

    /// Rebuild the signalfd from `self.signals`, creating or tearing it
    /// down as the registered set becomes non-empty or empty.
    fn sync_signalfd_mask(&mut self) -> Result<()> {
        if self.signals.is_empty() {
            if let Some(fd) = self.sigfd.take() {
                unsafe {
                    libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
                    libc::close(fd);
                }
            }
            return Ok(());
        }

        let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut set);
            for &sig in self.signals.keys() {
                libc::sigaddset(&mut set, sig);
            }
        }

        if let Some(fd) = self.sigfd {
            if unsafe { libc::signalfd(fd, &set, 0) } < 0 {
                return Err(RtError::from_errno("signalfd(update)"));
            }
            return Ok(());
        }

        let fd = unsafe { libc::signalfd(-1, &set, libc::SFD_CLOEXEC | libc::SFD_NONBLOCK) };
        if fd < 0 {
            return Err(RtError::from_errno("signalfd"));
        }
        let mut ev = libc::epoll_event { events: libc::EPOLLIN as u32, u64: u64::MAX };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) } != 0 {
            let e = RtError::from_errno("epoll_ctl(signalfd)");
            unsafe { libc::close(fd) };
            return Err(e);
        }
        self.sigfd = Some(fd);
        Ok(())
    }

    pub fn register(&self, fd: RawFd, token: StreamId, interest: crate::event::types::Interest) -> Result<()> {
        let mut ev = libc::epoll_event { events: mask_to_epev(interest), u64: encode_token(token) };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) } != 0 {
            return Err(RtError::from_errno("epoll_ctl(ADD)"));
        }
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: StreamId, interest: crate::event::types::Interest) -> Result<()> {
        let mut ev = libc::epoll_event { events: mask_to_epev(interest), u64: encode_token(token) };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) } != 0 {
            return Err(RtError::from_errno("epoll_ctl(MOD)"));
        }
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(RtError::from_errno("epoll_ctl(DEL)"));
            }
        }
        Ok(())
    }

    /// `reactor_poll`: block for up to `timeout_ms` (`-1` = forever),
    /// draining stream readiness and any pending blocked signals.
    pub fn poll(&mut self, timeout_ms: i32) -> Result<Vec<RawEvent>> {
        let n = unsafe {
            libc::epoll_wait(self.epfd, self.event_buf.as_mut_ptr(), self.event_buf.len() as i32, timeout_ms)
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(Vec::new());
            }
            return Err(RtError::from_errno("epoll_wait"));
        }

        let mut out = Vec::with_capacity(n as usize);
        for ev in &self.event_buf[..n as usize] {
            if ev.u64 == u64::MAX {
                self.drain_signals(&mut out);
            } else {
                out.push(RawEvent::Stream { token: ev.u64, readiness: epev_to_readiness(ev.events) });
            }
        }
        Ok(out)
    }

    fn drain_signals(&self, out: &mut Vec<RawEvent>) {
        let Some(fd) = self.sigfd else { return };
        let mut buf = [std::mem::MaybeUninit::<libc::signalfd_siginfo>::uninit(); READ_NR_SIGINFO];
        loop {
            let n = unsafe {
                libc::read(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    std::mem::size_of::<libc::signalfd_siginfo>() * READ_NR_SIGINFO,
                )
            };
            if n <= 0 {
                if n < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::EAGAIN) {
                        warn!(error = %err, "signalfd read failed");
                    }
                }
                return;
            }
            let count = n as usize / std::mem::size_of::<libc::signalfd_siginfo>();
            for info in &buf[..count] {
                let info = unsafe { info.assume_init_ref() };
                trace!(signal = info.ssi_signo, "signal delivered via signalfd");
                out.push(RawEvent::Signal(info.ssi_signo as i32));
            }
            if count < READ_NR_SIGINFO {
                return;
            }
        }
    }
}

fn encode_token(id: StreamId) -> u64 {
    ((id.slot as u64) << 32) | id.generation as u64
}

pub fn decode_token(token: u64) -> StreamId {
    StreamId { slot: (token >> 32) as u32, generation: token as u32 }
}

impl Drop for EpollReactor {
    fn drop(&mut self) {
        if let Some(fd) = self.sigfd {
            unsafe { libc::close(fd) };
        }
        unsafe { libc::close(self.epfd) };
    }
}
