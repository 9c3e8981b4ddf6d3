// Slab cache invariants: alloc/free pairs with no interleaving return the
// same pointer; concurrent churn across threads leaves no slabs in use
// after a shrink pass.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rtcore::{PageArena, RuntimeConfig, SlabCache};

fn config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.max_order = 10;
    config.max_numnodes = 1;
    config.vpages_per_node = 1 << 14;
    config
}

fn arena(config: &RuntimeConfig) -> Arc<PageArena> {
    Arc::new(PageArena::new(config).expect("arena init"))
}

#[test]
fn free_then_alloc_with_no_interleaving_reuses_the_pointer() {
    let c = config();
    let cache = SlabCache::new(arena(&c), 64, 16, &c);
    let p1 = cache.alloc().unwrap();
    cache.dealloc(p1);
    let p2 = cache.alloc().unwrap();
    assert_eq!(p1, p2);
    cache.dealloc(p2);
}

#[test]
fn concurrent_churn_across_threads_leaves_no_slabs_in_use_after_shrink() {
    let c = config();
    let cache = SlabCache::new(arena(&c), 128, 32, &c);
    let total_freed = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let cache = cache.clone();
            let total_freed = total_freed.clone();
            scope.spawn(move || {
                let mut held = Vec::new();
                for i in 0..20_000 {
                    let p = cache.alloc().unwrap();
                    held.push(p);
                    if i % 2 == 1 {
                        let p = held.pop().unwrap();
                        cache.dealloc(p);
                        total_freed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                for p in held {
                    cache.dealloc(p);
                    total_freed.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    assert_eq!(total_freed.load(Ordering::Relaxed), 80_000);
    let stats_before = cache.stats();
    assert_eq!(stats_before.live_objects, 0);

    cache.shrink();
    let stats = cache.stats();
    assert_eq!(stats.live_slabs, 0, "every slab should be reclaimed once nothing is live");
}
