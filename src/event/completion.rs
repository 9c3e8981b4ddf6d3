//! Done-flag + waitqueue primitive, ported from
//! `examples/original_source/include/skp/process/completion.h`'s
//! `completion_t`. Used by `flush_work`, `rcu_barrier` and synchronous
//! delete/cancel operations to block a caller until some other thread (the
//! looper, a worker) signals "done".

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Inner {
    done: Mutex<u32>,
    cond: Condvar,
}

/// Cloneable handle to one completion. Cloning shares the same underlying
/// done-count and waitqueue, matching `completion_t`'s "embed in a struct,
/// hand out pointers to it" usage in the original.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner { done: Mutex::new(0), cond: Condvar::new() }) }
    }

    /// `complete()`: wake exactly one waiter.
    pub fn complete(&self) {
        let mut done = self.inner.done.lock();
        *done += 1;
        self.inner.cond.notify_one();
    }

    /// `complete_all()`: wake every current and future waiter until the
    /// count is drained back down by `wait_for_completion` calls.
    pub fn complete_all(&self) {
        let mut done = self.inner.done.lock();
        *done = u32::MAX;
        self.inner.cond.notify_all();
    }

    /// `wait_for_completion()`: block until `complete`/`complete_all` has
    /// been called at least once since the last successful wait.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock();
        while *done == 0 {
            self.inner.cond.wait(&mut done);
        }
        if *done != u32::MAX {
            *done -= 1;
        }
    }

    /// `wait_for_completion_timeout()`: as [`Self::wait`], but gives up
    /// after `timeout` and reports whether it actually completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.inner.done.lock();
        while *done == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let result = self.inner.cond.wait_for(&mut done, deadline - now);
            if result.timed_out() && *done == 0 {
                return false;
            }
        }
        if *done != u32::MAX {
            *done -= 1;
        }
        true
    }

    /// `try_wait_for_completion()`: non-blocking poll.
    pub fn try_wait(&self) -> bool {
        let mut done = self.inner.done.lock();
        if *done == 0 {
            return false;
        }
        if *done != u32::MAX {
            *done -= 1;
        }
        true
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn complete_wakes_a_waiter() {
        let c = Completion::new();
        let c2 = c.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            c2.complete();
        });
        c.wait();
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_reports_failure_on_expiry() {
        let c = Completion::new();
        assert!(!c.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn try_wait_is_non_blocking() {
        let c = Completion::new();
        assert!(!c.try_wait());
        c.complete();
        assert!(c.try_wait());
        assert!(!c.try_wait());
    }
}
