//! `rtcore-demo`: boots a runtime, exercises the page allocator, the event
//! reactor and the workqueue scheduler end to end, then shuts down cleanly.
//! This is a smoke-test harness, not a product surface.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use rtcore::{
    alloc_workqueue, AllocApi, AllocFlags, Completion, EventLooper, Interest, PageArena, RuntimeConfig,
};

fn main() {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).with_level(true).init();

    info!("rtcore-demo starting");

    let config = RuntimeConfig::default();

    demo_allocator(&config);
    demo_event_loop(&config);
    demo_workqueue(&config);

    info!("rtcore-demo finished");
}

fn demo_allocator(config: &RuntimeConfig) {
    let arena = Arc::new(PageArena::new(config).expect("page arena init"));
    let api = AllocApi::new(arena.clone(), config);

    let small = api.umalloc(48).expect("small alloc");
    let big = api.umalloc(64 * 1024).expect("oversize alloc");
    info!(
        small_size = api.usize_of(small),
        big_size = api.usize_of(big),
        free_pages = arena.free_pages_count(),
        "allocator warmed up"
    );
    api.ufree(small);
    api.ufree(big);

    // Exercise the raw buddy path directly too.
    let block = arena.alloc_pages(2, AllocFlags::ZERO).expect("4-page block");
    arena.free_pages(block, 2);
}

fn demo_event_loop(config: &RuntimeConfig) {
    let looper = Arc::new(EventLooper::new(config, &[]).expect("looper init"));

    let mut fds = [0i32; 2];
    unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
    let [read_fd, write_fd] = fds;

    let hits = Arc::new(AtomicU32::new(0));
    let h = hits.clone();
    let stream_id = looper
        .register(
            read_fd,
            Interest::READABLE,
            Box::new(move |_readiness| {
                let mut buf = [0u8; 64];
                unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                h.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("register stream");

    let fired = Arc::new(AtomicU32::new(0));
    let f = fired.clone();
    looper.schedule_timer(Duration::from_millis(5), Box::new(move || { f.fetch_add(1, Ordering::SeqCst); }));

    unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };

    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while (hits.load(Ordering::SeqCst) == 0 || fired.load(Ordering::SeqCst) == 0) && std::time::Instant::now() < deadline
    {
        looper.run_once().expect("run_once");
    }

    // `delete_sync` waits on a command this same thread would have to drain
    // via `run_once` — since nothing else is driving the loop here, use the
    // best-effort `delete` instead (no other thread can race dispatch of a
    // stale readiness event for this stream once it's removed).
    looper.delete(stream_id).expect("delete");
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }

    info!(stats = ?looper.stats(), "event loop demo complete");
}

fn demo_workqueue(config: &RuntimeConfig) {
    let bound_wq = alloc_workqueue("demo-bound", false, 0, config);
    let unbound_wq = alloc_workqueue("demo-unbound", true, 0, config);

    let done = Completion::new();
    let d = done.clone();
    bound_wq.queue_work(Box::new(move || {
        d.complete();
    }));
    done.wait();

    let ran = Arc::new(AtomicU32::new(0));
    for _ in 0..8 {
        let r = ran.clone();
        unbound_wq.queue_work(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
    }
    unbound_wq.drain();

    info!(ran = ran.load(Ordering::SeqCst), "workqueue demo complete");
}
