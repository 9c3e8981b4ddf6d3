// Page allocator and slab cache hot-path benchmarks: buddy split/merge
// under alloc/free churn, and slab cache alloc/free through the magazine
// layer.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use rtcore::{AllocFlags, PageArena, RuntimeConfig, SlabCache};

fn arena(order: u32) -> Arc<PageArena> {
    let mut config = RuntimeConfig::default();
    config.max_order = order;
    config.max_numnodes = 1;
    config.vpages_per_node = 1 << 16;
    Arc::new(PageArena::new(&config).expect("arena init"))
}

fn bench_buddy_split_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("buddy_split_merge");
    for order in [0u32, 2, 4] {
        group.bench_with_input(BenchmarkId::new("alloc_free", order), &order, |b, &order| {
            let arena = arena(8);
            b.iter(|| {
                let handle = arena.alloc_pages(order, AllocFlags::NONE).unwrap();
                black_box(arena.page_ptr(handle));
                arena.free_pages(handle, order);
            });
        });
    }
    group.finish();
}

fn bench_slab_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("slab_alloc_free");
    for obj_size in [32usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::new("alloc_free", obj_size), &obj_size, |b, &obj_size| {
            let arena = arena(8);
            let cache = SlabCache::new(arena, obj_size, 32);
            b.iter(|| {
                let ptr = cache.alloc().unwrap();
                black_box(ptr);
                cache.dealloc(ptr);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_buddy_split_merge, bench_slab_alloc_free);
criterion_main!(benches);
