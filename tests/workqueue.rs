// Workqueue scenarios from spec.md §8: FIFO ordering on one pool, flush
// ordering, and the cancel-race exclusivity property.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rtcore::{alloc_ordered_workqueue, alloc_workqueue, cancel_work_sync, RuntimeConfig};

#[test]
fn fifo_ordering_on_an_ordered_workqueue() {
    let wq = alloc_ordered_workqueue("fifo-test");
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..20 {
        let order = order.clone();
        wq.queue_work(Box::new(move || {
            order.lock().unwrap().push(i);
        }));
    }
    wq.drain();

    let recorded = order.lock().unwrap();
    assert_eq!(*recorded, (0..20).collect::<Vec<_>>());
}

#[test]
fn flush_work_then_flush_workqueue_ordering() {
    let wq = alloc_workqueue("flush-test", false, 1, &RuntimeConfig::default());
    let x = Arc::new(AtomicU32::new(0));

    let x1 = x.clone();
    let w1 = wq.queue_work(Box::new(move || {
        std::thread::sleep(Duration::from_millis(10));
        x1.store(1, Ordering::SeqCst);
    }));
    let x2 = x.clone();
    wq.queue_work(Box::new(move || {
        x2.store(2, Ordering::SeqCst);
    }));

    wq.flush_work(&w1);
    let after_flush_work = x.load(Ordering::SeqCst);
    assert!(after_flush_work == 1 || after_flush_work == 2);

    wq.flush_workqueue();
    assert_eq!(x.load(Ordering::SeqCst), 2);
}

#[test]
fn cancel_race_leaves_no_thread_inside_the_work_function() {
    let wq = alloc_workqueue("cancel-race-test", true, 4, &RuntimeConfig::default());
    let inside = Arc::new(AtomicU32::new(0));
    let max_concurrent_inside = Arc::new(AtomicU32::new(0));
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let work = {
        let inside = inside.clone();
        let max_inside = max_concurrent_inside.clone();
        wq.queue_work(Box::new(move || {
            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            max_inside.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            inside.fetch_sub(1, Ordering::SeqCst);
        }))
    };

    let enqueuer = {
        let wq = wq.clone();
        let work = work.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                wq.requeue(work.clone());
                std::thread::sleep(Duration::from_micros(200));
            }
        })
    };

    let canceler = {
        let work = work.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_millis(200);
            while std::time::Instant::now() < deadline {
                cancel_work_sync(&work);
            }
            stop.store(true, Ordering::SeqCst);
        })
    };

    canceler.join().unwrap();
    enqueuer.join().unwrap();

    assert_eq!(inside.load(Ordering::SeqCst), 0);
    assert!(max_concurrent_inside.load(Ordering::SeqCst) <= 1, "the work body never ran concurrently with itself");
}
