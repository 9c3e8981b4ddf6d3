// RCU-lite grace-period scenario: N callbacks posted at the same instant
// each run exactly once, no earlier than the two-advance grace period.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rtcore::RcuDomain;

#[test]
fn n_callbacks_posted_together_each_run_exactly_once() {
    let rcu = RcuDomain::new();
    let ran = Arc::new(AtomicUsize::new(0));

    const N: usize = 64;
    for _ in 0..N {
        let r = ran.clone();
        rcu.call(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(rcu.pending_count(), N);

    rcu.advance();
    assert_eq!(ran.load(Ordering::SeqCst), 0, "nothing reclaims within the epoch it was queued in");

    rcu.advance();
    assert_eq!(ran.load(Ordering::SeqCst), N);
    assert_eq!(rcu.pending_count(), 0);

    // Further advances don't re-run anything.
    rcu.advance();
    rcu.advance();
    assert_eq!(ran.load(Ordering::SeqCst), N);
}

#[test]
fn a_reader_in_progress_defers_the_whole_grace_period() {
    let rcu = RcuDomain::new();
    let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let r = ran.clone();
    rcu.call(move || r.store(true, Ordering::SeqCst));

    let guard = rcu.read();
    rcu.advance();
    rcu.advance();
    assert!(!ran.load(Ordering::SeqCst), "active reader must block epoch advance entirely");
    drop(guard);

    rcu.advance();
    rcu.advance();
    assert!(ran.load(Ordering::SeqCst));
}
