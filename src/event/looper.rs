//! The reactor core: one thread owns an [`EventLooper`] and drives
//! [`EventLooper::run_once`]/[`EventLooper::run`] in a loop. Registration
//! (`register`/`modify`/`delete`) can be called from any thread; `epoll_ctl`
//! is safe to call concurrently with another thread's `epoll_wait`, so only
//! the stream table itself needs a lock.
//!
//! Each iteration services, in order, streams, the RCU grace period,
//! timers, then signals — streams first since they carry user-facing I/O
//! latency, RCU next so reclamation doesn't pile up behind a busy timer
//! queue, per spec.md §4.4's ordering.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, RtError};
use crate::event::async_notify::{self, AsyncHandle, AsyncNotify};
use crate::event::completion::Completion;
use crate::event::rcu::{RcuDomain, RcuRegistry};
use crate::event::timer_heap::{TimerHeap, TimerStats};
use crate::event::types::{
    AsyncCallback, Interest, Readiness, SignalCallback, StreamCallback, StreamId, TimerCallback, TimerId,
};

#[cfg(not(feature = "kqueue"))]
use crate::event::epoll_backend::{decode_token, EpollReactor as Backend, RawEvent};
#[cfg(feature = "kqueue")]
use crate::event::kqueue_backend::{decode_token, KqueueReactor as Backend, RawEvent};

struct StreamSlot {
    generation: u32,
    fd: RawFd,
    callback: StreamCallback,
}

enum Command {
    DeleteSync(StreamId, Completion),
}

/// Stats snapshot exposed for tests/metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct LooperStats {
    pub iterations: u64,
    pub streams_dispatched: u64,
    pub timer_deviation: TimerStats,
    pub rcu_reclaimed: u64,
}

pub struct EventLooper {
    backend: Mutex<Backend>,
    streams: Mutex<Vec<Option<StreamSlot>>>,
    free_slots: Mutex<Vec<u32>>,
    next_generation: Mutex<u32>,
    timers: Mutex<TimerHeap>,
    rcu: RcuDomain,
    signal_handlers: Mutex<std::collections::HashMap<i32, SignalCallback>>,
    commands: (Sender<Command>, Receiver<Command>),
    stats: Mutex<LooperStats>,
}

impl EventLooper {
    pub fn new(config: &crate::config::RuntimeConfig, signals: &[i32]) -> Result<Self> {
        Self::build(config, signals, RcuDomain::new())
    }

    /// Like [`Self::new`], but joins `registry` so a `call_rcu` callback
    /// posted from this looper (or any other looper sharing `registry`)
    /// only runs once every member has passed its own grace period.
    pub fn new_with_rcu_registry(
        config: &crate::config::RuntimeConfig,
        signals: &[i32],
        registry: &Arc<RcuRegistry>,
    ) -> Result<Self> {
        Self::build(config, signals, RcuDomain::new_in(registry))
    }

    fn build(config: &crate::config::RuntimeConfig, signals: &[i32], rcu: RcuDomain) -> Result<Self> {
        let backend = Backend::new(config.per_looper_events_max, signals)?;
        Ok(Self {
            backend: Mutex::new(backend),
            streams: Mutex::new(Vec::new()),
            free_slots: Mutex::new(Vec::new()),
            next_generation: Mutex::new(0),
            timers: Mutex::new(TimerHeap::new()),
            rcu,
            signal_handlers: Mutex::new(std::collections::HashMap::new()),
            commands: unbounded(),
            stats: Mutex::new(LooperStats::default()),
        })
    }

    fn alloc_slot(&self, fd: RawFd, callback: StreamCallback) -> StreamId {
        let mut generation_guard = self.next_generation.lock();
        let generation = *generation_guard;
        *generation_guard = generation_guard.wrapping_add(1);
        drop(generation_guard);

        let mut streams = self.streams.lock();
        let slot = if let Some(slot) = self.free_slots.lock().pop() {
            streams[slot as usize] = Some(StreamSlot { generation, fd, callback });
            slot
        } else {
            streams.push(Some(StreamSlot { generation, fd, callback }));
            (streams.len() - 1) as u32
        };
        StreamId { slot, generation }
    }

    /// Register a raw fd for readiness notification.
    pub fn register(&self, fd: RawFd, interest: Interest, callback: StreamCallback) -> Result<StreamId> {
        let id = self.alloc_slot(fd, callback);
        if let Err(e) = self.backend.lock().register(fd, id, interest) {
            self.streams.lock()[id.slot as usize] = None;
            self.free_slots.lock().push(id.slot);
            return Err(e);
        }
        Ok(id)
    }

    pub fn modify(&self, id: StreamId, interest: Interest) -> Result<()> {
        let streams = self.streams.lock();
        let fd = match streams.get(id.slot as usize) {
            Some(Some(slot)) if slot.generation == id.generation => slot.fd,
            _ => return Err(RtError::NotFound(format!("{id}"))),
        };
        drop(streams);
        self.backend.lock().modify(fd, id, interest)
    }

    /// Best-effort delete: returns once the fd is deregistered, but a
    /// readiness event already pulled out of the same `epoll_wait` batch
    /// may still dispatch. Use [`Self::delete_sync`] when that race matters.
    pub fn delete(&self, id: StreamId) -> Result<()> {
        let mut streams = self.streams.lock();
        let fd = match streams.get(id.slot as usize) {
            Some(Some(slot)) if slot.generation == id.generation => slot.fd,
            _ => return Err(RtError::NotFound(format!("{id}"))),
        };
        streams[id.slot as usize] = None;
        drop(streams);
        self.free_slots.lock().push(id.slot);
        self.backend.lock().deregister(fd)
    }

    /// Delete and block until the looper thread has processed the removal
    /// between two poll iterations, guaranteeing no callback for `id` runs
    /// after this returns. Must not be called from the looper's own thread.
    pub fn delete_sync(&self, id: StreamId) -> Result<()> {
        let completion = Completion::new();
        self.commands.0.send(Command::DeleteSync(id, completion.clone())).map_err(|_| {
            RtError::InvalidState("looper command channel closed".into())
        })?;
        completion.wait();
        Ok(())
    }

    /// Register an async-notify event: returns an [`AsyncHandle`] any
    /// thread can call `emit()` on to wake this looper and run `callback`.
    pub fn register_async(&self, mut callback: AsyncCallback) -> Result<(AsyncHandle, StreamId)> {
        let notify = AsyncNotify::new()?;
        let read_fd = notify.read_fd;
        let stream_notify = notify.clone();
        let stream_id = self.register(
            read_fd,
            Interest::READABLE,
            Box::new(move |_readiness| {
                async_notify::drain_and_reset(&stream_notify);
                callback();
            }),
        )?;
        Ok((AsyncHandle { notify }, stream_id))
    }

    /// Unregister an async-notify event registered via [`Self::register_async`].
    pub fn delete_async(&self, id: StreamId) -> Result<()> {
        self.delete(id)
    }

    pub fn schedule_timer(&self, after: Duration, callback: TimerCallback) -> TimerId {
        self.timers.lock().schedule(Instant::now() + after, None, callback)
    }

    pub fn schedule_periodic(&self, period: Duration, callback: TimerCallback) -> TimerId {
        self.timers.lock().schedule(Instant::now() + period, Some(period), callback)
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.timers.lock().cancel(id)
    }

    /// Add `sig` to this looper's signal mask (blocking it process-wide if
    /// it isn't already) and route it to `callback` from now on.
    pub fn register_signal(&self, sig: i32, callback: SignalCallback) -> Result<()> {
        self.backend.lock().add_signal(sig)?;
        self.signal_handlers.lock().insert(sig, callback);
        Ok(())
    }

    /// Stop dispatching `sig` to this looper and unblock it process-wide,
    /// unless it was already blocked before `register_signal` touched it.
    pub fn unregister_signal(&self, sig: i32) -> Result<()> {
        self.backend.lock().remove_signal(sig)?;
        self.signal_handlers.lock().remove(&sig);
        Ok(())
    }

    pub fn rcu(&self) -> &RcuDomain {
        &self.rcu
    }

    /// Drain commands queued from other threads. Always called at the top
    /// of `run_once`, strictly between two `epoll_wait` calls.
    fn drain_commands(&self) {
        while let Ok(cmd) = self.commands.1.try_recv() {
            match cmd {
                Command::DeleteSync(id, completion) => {
                    if let Err(e) = self.delete(id) {
                        warn!(error = %e, %id, "delete_sync target already gone");
                    }
                    completion.complete();
                }
            }
        }
    }

    fn dispatch_stream(&self, token: u64, readiness: Readiness) {
        let id = decode_token(token);
        let mut streams = self.streams.lock();
        let mut callback = match streams.get_mut(id.slot as usize) {
            Some(Some(slot)) if slot.generation == id.generation => {
                std::mem::replace(&mut slot.callback, Box::new(|_| {}))
            }
            _ => return,
        };
        drop(streams);

        // Invoked with no lock held: a callback that calls back into
        // register/modify/delete/delete_sync on this same looper must not
        // deadlock on `self.streams`.
        callback(readiness);

        let mut streams = self.streams.lock();
        if let Some(Some(slot)) = streams.get_mut(id.slot as usize) {
            if slot.generation == id.generation {
                slot.callback = callback;
            }
        }
    }

    fn dispatch_signal(&self, sig: i32) {
        if let Some(cb) = self.signal_handlers.lock().get_mut(&sig) {
            cb(sig);
        }
    }

    /// One iteration: drain commands, poll for readiness (bounded by the
    /// next timer deadline so timers don't starve), advance RCU, fire due
    /// timers, dispatch signals.
    pub fn run_once(&self) -> Result<()> {
        self.drain_commands();

        let timeout_ms = match self.timers.lock().next_deadline() {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    0
                } else {
                    (deadline - now).as_millis().min(i32::MAX as u128) as i32
                }
            }
            None => -1,
        };

        let events = self.backend.lock().poll(timeout_ms)?;
        let mut dispatched = 0u64;
        for event in events {
            match event {
                RawEvent::Stream { token, readiness } => {
                    self.dispatch_stream(token, readiness);
                    dispatched += 1;
                }
                RawEvent::Signal(sig) => self.dispatch_signal(sig),
            }
        }

        let reclaimed = self.rcu.advance() as u64;
        self.timers.lock().fire_due(Instant::now());

        let mut stats = self.stats.lock();
        stats.iterations += 1;
        stats.streams_dispatched += dispatched;
        stats.timer_deviation = self.timers.lock().stats();
        stats.rcu_reclaimed += reclaimed;
        Ok(())
    }

    /// Run iterations until `should_stop` returns true. The demo binary and
    /// tests use this instead of spawning a dedicated thread for every
    /// scenario.
    pub fn run(&self, mut should_stop: impl FnMut() -> bool) -> Result<()> {
        while !should_stop() {
            self.run_once()?;
        }
        debug!(stats = ?self.stats(), "looper stopped");
        Ok(())
    }

    pub fn stats(&self) -> LooperStats {
        *self.stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> crate::config::RuntimeConfig {
        crate::config::RuntimeConfig::default()
    }

    #[test]
    fn self_pipe_wakes_and_dispatches() {
        let looper = EventLooper::new(&config(), &[]).unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        let [read_fd, write_fd] = fds;

        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let id = looper
            .register(
                read_fd,
                Interest::READABLE,
                Box::new(move |_readiness| {
                    let mut buf = [0u8; 64];
                    unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };
        looper.run_once().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        looper.delete(id).unwrap();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn timer_fires_without_any_streams_registered() {
        let looper = EventLooper::new(&config(), &[]).unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        looper.schedule_timer(Duration::from_millis(5), Box::new(move || { f.fetch_add(1, Ordering::SeqCst); }));

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            looper.run_once().unwrap();
            if fired.load(Ordering::SeqCst) > 0 || Instant::now() > deadline {
                break;
            }
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delete_sync_from_another_thread_completes() {
        let looper = Arc::new(EventLooper::new(&config(), &[]).unwrap());
        let mut fds = [0i32; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        let [read_fd, _write_fd] = fds;
        let id = looper.register(read_fd, Interest::READABLE, Box::new(|_| {})).unwrap();

        let l = looper.clone();
        let handle = std::thread::spawn(move || {
            l.delete_sync(id).unwrap();
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while !handle.is_finished() && Instant::now() < deadline {
            looper.run_once().unwrap();
        }
        handle.join().unwrap();
        unsafe { libc::close(read_fd) };
    }
}
