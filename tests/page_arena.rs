// Buddy allocator invariants: split/merge restores upward, and the
// conservation equation `sum(2^o * nr_free[o]) + allocated == total_pages`
// holds through any interleaving.

use rtcore::{AllocFlags, PageArena, RuntimeConfig};

fn small_arena(max_order: u32, pages: u32) -> PageArena {
    let mut config = RuntimeConfig::default();
    config.max_order = max_order;
    config.max_numnodes = 1;
    config.vpages_per_node = pages;
    PageArena::new(&config).expect("arena init")
}

#[test]
fn alloc_all_single_pages_then_free_in_reverse_merges_to_top_order() {
    let arena = small_arena(11, 2048);
    let mut handles = Vec::new();
    for _ in 0..2048 {
        handles.push(arena.alloc_pages(0, AllocFlags::NONE).unwrap());
    }
    assert_eq!(arena.free_pages_count(), 0);

    for h in handles.into_iter().rev() {
        arena.free_pages(h, 0);
    }
    assert_eq!(arena.free_pages_count(), 2048);

    // Fully merged: a single order-10 allocation should now succeed.
    let top = arena.alloc_pages(10, AllocFlags::NONE).unwrap();
    assert_eq!(arena.free_pages_count(), 0);
    arena.free_pages(top, 10);
}

#[test]
fn interleaved_alloc_free_conserves_total_pages() {
    let arena = small_arena(8, 256);
    let total = arena.total_pages();
    let mut live = Vec::new();

    for round in 0..200 {
        let order = (round % 4) as u32;
        if round % 3 == 0 && !live.is_empty() {
            let (h, o) = live.remove(0);
            arena.free_pages(h, o);
        } else if let Ok(h) = arena.alloc_pages(order, AllocFlags::NONE) {
            live.push((h, order));
        }
    }

    let allocated: usize = live.iter().map(|&(_, o)| 1usize << o).sum();
    assert_eq!(arena.free_pages_count() + allocated, total);

    for (h, o) in live {
        arena.free_pages(h, o);
    }
    assert_eq!(arena.free_pages_count(), total);
}

#[test]
fn decommitted_block_is_rezeroed_on_next_allocation() {
    let arena = small_arena(4, 32);
    let h = arena.alloc_pages(0, AllocFlags::NONE).unwrap();
    unsafe {
        std::ptr::write_bytes(arena.page_ptr(h), 0xAB, 4096);
    }
    arena.free_pages(h, 0);

    let h2 = arena.alloc_pages(0, AllocFlags::ZERO).unwrap();
    let slice = unsafe { std::slice::from_raw_parts(arena.page_ptr(h2), 4096) };
    assert!(slice.iter().all(|&b| b == 0));
    arena.free_pages(h2, 0);
}
