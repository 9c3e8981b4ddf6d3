//! `PageArena`: a binary-buddy allocator over a single reserved virtual
//! range, split into `MAX_NUMNODES` equal nodes each holding one zone.
//!
//! Grounded on `examples/harborgrid-justin-rusty-db/src/memory/allocator/
//! zones.rs` and `arena_allocator.rs` for the "reserve one big chunk up
//! front, carve it with an internal free-list" shape, and on
//! `examples/original_source/src/mm/pgalloc.c` (`__rmqueue`, `expand`,
//! `__free_pages_bulk`) for the split/merge algorithm itself.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, trace, warn};

use crate::config::RuntimeConfig;
use crate::error::{Result, RtError};
use crate::mm::page::{self, flags, PageDescriptor, PageHandle, NIL, PAGE_SIZE};

/// Tiny stand-in for the `bitflags` crate macro: the teacher's codebase
/// encodes flag sets as plain shifted `u32` constants rather than pulling in
/// `bitflags`, so this macro keeps that idiom while giving call sites the
/// usual `Flags::A | Flags::B` ergonomics.
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $flag:ident = $val:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $ty);
        impl $name {
            $(pub const $flag: $name = $name($val);)*
            pub const NONE: $name = $name(0);
            pub fn contains(self, other: $name) -> bool { self.0 & other.0 == other.0 }
        }
        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name { $name(self.0 | rhs.0) }
        }
    };
}

bitflags_lite! {
    /// Allocation request flags, a small subset of the C core's `__GFP_*`.
    pub struct AllocFlags: u32 {
        const ZERO    = 1 << 0;
        const COMP    = 1 << 1; // compound page
        const BLK     = 1 << 2; // block page (large-object carrier)
        const PANIC   = 1 << 3; // abort the process instead of returning OOM
    }
}

struct FreeArea {
    head: u32,
    count: u32,
}

impl FreeArea {
    const fn new() -> Self {
        Self { head: NIL, count: 0 }
    }
}

/// One zone per node: `MAX_ORDER` free-lists plus the mutex protecting them,
/// per spec.md §3.2.
struct Zone {
    free_areas: Mutex<Vec<FreeArea>>,
    free_pages: AtomicUsize,
}

impl Zone {
    fn new(max_order: u32) -> Self {
        Self {
            free_areas: Mutex::new((0..max_order).map(|_| FreeArea::new()).collect()),
            free_pages: AtomicUsize::new(0),
        }
    }
}

/// A node owns a contiguous slice of the reserved arena and its `mem_map`.
pub struct Node {
    pub id: u16,
    base: *mut u8,
    pages_per_node: u32,
    mem_map: Vec<PageDescriptor>,
    zone: Zone,
}

unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    fn page_addr(&self, idx: u32) -> *mut u8 {
        unsafe { self.base.add(idx as usize * PAGE_SIZE) }
    }

    fn push_free(&self, areas: &mut [FreeArea], order: u32, idx: u32) {
        let area = &mut areas[order as usize];
        let old_head = area.head;
        self.mem_map[idx as usize].free_prev.store(NIL, Ordering::Relaxed);
        self.mem_map[idx as usize].free_next.store(old_head, Ordering::Relaxed);
        if old_head != NIL {
            self.mem_map[old_head as usize].free_prev.store(idx, Ordering::Relaxed);
        }
        area.head = idx;
        area.count += 1;
        self.mem_map[idx as usize].set_buddy_order(order);
    }

    fn remove_free(&self, areas: &mut [FreeArea], order: u32, idx: u32) {
        let area = &mut areas[order as usize];
        let prev = self.mem_map[idx as usize].free_prev.load(Ordering::Relaxed);
        let next = self.mem_map[idx as usize].free_next.load(Ordering::Relaxed);
        if prev != NIL {
            self.mem_map[prev as usize].free_next.store(next, Ordering::Relaxed);
        } else {
            area.head = next;
        }
        if next != NIL {
            self.mem_map[next as usize].free_prev.store(prev, Ordering::Relaxed);
        }
        area.count -= 1;
        self.mem_map[idx as usize].clear_buddy();
    }

    fn pop_free(&self, areas: &mut [FreeArea], order: u32) -> Option<u32> {
        let idx = areas[order as usize].head;
        if idx == NIL {
            return None;
        }
        self.remove_free(areas, order, idx);
        Some(idx)
    }
}

/// The buddy allocator: `MAX_NUMNODES` nodes over one reserved mapping.
/// Contract from spec.md §4.1: `alloc_pages(order) -> Page | fail`,
/// `free_pages(page, order)`.
pub struct PageArena {
    nodes: Vec<Node>,
    /// Bit `i` set iff node `i` has any free page in any order — spec.md's
    /// "bitmap of nodes that currently have any free pages" for fast
    /// iteration during allocation.
    has_free: AtomicU64,
    max_order: u32,
    pages_per_node: u32,
}

impl PageArena {
    /// Reserve the arena. One `mmap(MAP_ANON|MAP_NORESERVE)` call backs the
    /// entire range; nodes are equal-sized slices of it. `MAP_NORESERVE`
    /// means the OS does not commit physical pages up front, matching
    /// spec.md's "reserve a fixed virtual address range" rather than
    /// actually populating it.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let pages_per_node = config.vpages_per_node;
        let node_bytes = pages_per_node as usize * PAGE_SIZE;
        let total_bytes = node_bytes * config.max_numnodes as usize;

        let mut nodes = Vec::with_capacity(config.max_numnodes as usize);
        for id in 0..config.max_numnodes {
            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    node_bytes,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return Err(RtError::from_errno("mmap(arena node)"));
            }
            let mut mem_map = Vec::with_capacity(pages_per_node as usize);
            mem_map.resize_with(pages_per_node as usize, PageDescriptor::new);

            let zone = Zone::new(config.max_order);
            let node = Node { id, base: base as *mut u8, pages_per_node, mem_map, zone };

            // The whole node starts life as one maximal free block (or
            // several, if pages_per_node isn't itself a power of two).
            let mut areas = node.zone.free_areas.lock();
            let mut remaining = pages_per_node;
            let mut cursor = 0u32;
            while remaining > 0 {
                let order = (31 - remaining.leading_zeros()).min(config.max_order - 1);
                let block = 1u32 << order;
                for p in cursor..cursor + block {
                    node.mem_map[p as usize].flags.store(flags::INITED, Ordering::Relaxed);
                }
                node.push_free(&mut areas, order, cursor);
                node.zone.free_pages.fetch_add(block as usize, Ordering::Relaxed);
                cursor += block;
                remaining -= block;
            }
            drop(areas);
            nodes.push(node);
        }

        let _ = total_bytes;
        let has_free = (1u64 << config.max_numnodes) - 1;
        debug!(nodes = config.max_numnodes, pages_per_node, "page arena reserved");
        Ok(Self { nodes, has_free: AtomicU64::new(has_free), max_order: config.max_order, pages_per_node })
    }

    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    /// Total pages across every node, free or not — used by invariant
    /// checks (`sum(2^o * nr_free[o]) + allocated == total_pages`).
    pub fn total_pages(&self) -> usize {
        self.nodes.len() * self.pages_per_node as usize
    }

    pub fn free_pages_count(&self) -> usize {
        self.nodes.iter().map(|n| n.zone.free_pages.load(Ordering::Relaxed)).sum()
    }

    pub fn page_ptr(&self, handle: PageHandle) -> *mut u8 {
        self.nodes[handle.node as usize].page_addr(handle.index)
    }

    pub fn descriptor(&self, handle: PageHandle) -> &PageDescriptor {
        &self.nodes[handle.node as usize].mem_map[handle.index as usize]
    }

    /// Reverse-lookup: which page (and byte offset within it) backs a raw
    /// pointer handed out by the slab/allocator layer. Used by `ufree`-style
    /// APIs that only get a bare pointer back from the caller.
    pub fn locate(&self, ptr: *const u8) -> Option<(PageHandle, usize)> {
        for node in &self.nodes {
            let start = node.base as usize;
            let end = start + node.pages_per_node as usize * PAGE_SIZE;
            let addr = ptr as usize;
            if addr >= start && addr < end {
                let delta = addr - start;
                let page_idx = (delta / PAGE_SIZE) as u32;
                let offset = delta % PAGE_SIZE;
                return Some((PageHandle { node: node.id, index: page_idx }, offset));
            }
        }
        None
    }

    /// `alloc_pages(order, flags) -> Page | fail`.
    pub fn alloc_pages(&self, order: u32, alloc_flags: AllocFlags) -> Result<PageHandle> {
        if order >= self.max_order {
            return Err(RtError::InvalidArgument(format!("order {order} >= MAX_ORDER")));
        }
        if let Some(handle) = self.try_alloc(order) {
            self.prep(handle, order, alloc_flags);
            return Ok(handle);
        }
        // Shrink pass: ask slab caches to give back empty slabs, then retry
        // once, per spec.md §4.1.
        warn!(order, "page arena exhausted, running shrink pass");
        crate::mm::slab::shrink_all_caches();
        if let Some(handle) = self.try_alloc(order) {
            self.prep(handle, order, alloc_flags);
            return Ok(handle);
        }
        if alloc_flags.contains(AllocFlags::PANIC) {
            panic!("page allocator out of memory at order {order} (AllocFlags::PANIC)");
        }
        Err(RtError::OutOfMemory(format!("no free block at order {order}")))
    }

    fn prep(&self, handle: PageHandle, order: u32, alloc_flags: AllocFlags) {
        let node = &self.nodes[handle.node as usize];
        let was_decommitted = node.mem_map[handle.index as usize].flags.load(Ordering::Relaxed) & flags::DECOMMITTED != 0;
        for i in 0..(1u32 << order) {
            node.mem_map[(handle.index + i) as usize].prep_new_page();
        }
        node.mem_map[handle.index as usize].set_alloc_order(order);
        if alloc_flags.contains(AllocFlags::ZERO) && !was_decommitted {
            unsafe {
                std::ptr::write_bytes(node.page_addr(handle.index), 0, (1usize << order) * PAGE_SIZE);
            }
        }
        if alloc_flags.contains(AllocFlags::COMP) && order > 0 {
            for i in 0..(1u32 << order) {
                node.mem_map[(handle.index + i) as usize]
                    .flags
                    .fetch_or(flags::COMPOUND, Ordering::AcqRel);
                *node.mem_map[(handle.index + i) as usize].owner.lock().unwrap() =
                    page::PageOwner::CompoundHead(handle.index);
            }
        }
        if alloc_flags.contains(AllocFlags::BLK) && order > 0 {
            node.mem_map[handle.index as usize].flags.fetch_or(flags::BLOCK, Ordering::AcqRel);
        }
    }

    fn try_alloc(&self, order: u32) -> Option<PageHandle> {
        let mut free_mask = self.has_free.load(Ordering::Acquire);
        while free_mask != 0 {
            let node_id = free_mask.trailing_zeros();
            free_mask &= !(1 << node_id);
            let node = &self.nodes[node_id as usize];
            let mut areas = node.zone.free_areas.lock();
            if let Some(handle) = Self::rmqueue(node, &mut areas, order) {
                if areas.iter().all(|a| a.head == NIL) {
                    self.has_free.fetch_and(!(1 << node_id), Ordering::AcqRel);
                }
                return Some(PageHandle { node: node_id as u16, index: handle });
            }
        }
        None
    }

    /// `__rmqueue` + `expand`: find the lowest non-empty order >= requested,
    /// split down to the target order, and return the leftover halves to
    /// their free lists.
    fn rmqueue(node: &Node, areas: &mut [FreeArea], order: u32) -> Option<u32> {
        for cur in order as usize..areas.len() {
            if areas[cur].head == NIL {
                continue;
            }
            let idx = node.pop_free(areas, cur as u32).unwrap();
            node.zone.free_pages.fetch_sub(1usize << cur, Ordering::Relaxed);
            let idx = Self::expand(node, areas, idx, order, cur as u32);
            return Some(idx);
        }
        None
    }

    fn expand(node: &Node, areas: &mut [FreeArea], mut idx: u32, low: u32, mut high: u32) -> u32 {
        while high > low {
            high -= 1;
            let buddy = idx + (1 << high);
            node.push_free(areas, high, buddy);
            node.zone.free_pages.fetch_add(1usize << high, Ordering::Relaxed);
        }
        let _ = &mut idx;
        idx
    }

    /// `free_pages(page, order)`: merge with the buddy at every order up to
    /// `MAX_ORDER - 1`, always pushing merged blocks to the head of the
    /// target order's list (tie-break rule from spec.md §4.1).
    pub fn free_pages(&self, handle: PageHandle, order: u32) {
        let node = &self.nodes[handle.node as usize];
        for i in 0..(1u32 << order) {
            let pd = &node.mem_map[(handle.index + i) as usize];
            debug_assert!(!pd.is_buddy(), "double free detected at page {}", handle.index + i);
            debug_assert_eq!(pd.refcount.load(Ordering::Acquire), 0, "freeing page with nonzero refcount");
            pd.flags.fetch_and(!(flags::LOCKED | flags::SLAB | flags::COMPOUND | flags::BLOCK), Ordering::AcqRel);
        }

        let mut areas = node.zone.free_areas.lock();
        node.zone.free_pages.fetch_add(1usize << order, Ordering::Relaxed);

        let mut idx = handle.index;
        let mut order = order;
        while order + 1 < self.max_order as u32 {
            let buddy_idx = idx ^ (1 << order);
            if buddy_idx >= node.pages_per_node {
                break;
            }
            let buddy_order = node.mem_map[buddy_idx as usize].buddy_order();
            if buddy_order != Some(order) {
                break;
            }
            node.remove_free(&mut areas, order, buddy_idx);
            idx = idx.min(buddy_idx);
            order += 1;
        }
        node.push_free(&mut areas, order, idx);
        self.has_free.fetch_or(1 << handle.node, Ordering::AcqRel);

        // "When the maximum-order list accumulates > 1 block, release one
        // block above the first back to the OS": approximated here with
        // madvise(MADV_DONTNEED) on the physical backing, which keeps the
        // reservation (and our free-list bookkeeping) intact while letting
        // the kernel reclaim the pages.
        if order == self.max_order - 1 {
            let head = areas[order as usize].head;
            let second = node.mem_map[head as usize].free_next.load(Ordering::Relaxed);
            if second != NIL {
                self.decommit_block(node, second, order);
            }
        }
    }

    fn decommit_block(&self, node: &Node, idx: u32, order: u32) {
        let addr = node.page_addr(idx);
        let len = (1usize << order) * PAGE_SIZE;
        let rc = unsafe { libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED) };
        if rc == 0 {
            for i in 0..(1u32 << order) {
                node.mem_map[(idx + i) as usize].flags.fetch_or(flags::DECOMMITTED, Ordering::Relaxed);
            }
            trace!(node = node.id, idx, order, "decommitted excess max-order block");
        }
    }
}

impl Drop for PageArena {
    fn drop(&mut self) {
        for node in &self.nodes {
            let len = node.pages_per_node as usize * PAGE_SIZE;
            unsafe {
                libc::munmap(node.base as *mut libc::c_void, len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RuntimeConfig {
        let mut c = RuntimeConfig::default();
        c.max_order = 6;
        c.max_numnodes = 1;
        c.vpages_per_node = 1 << 8;
        c
    }

    #[test]
    fn split_and_merge_restores_max_order_block() {
        let arena = PageArena::new(&test_config()).unwrap();
        let total = arena.total_pages();
        let mut handles = Vec::new();
        for _ in 0..total {
            handles.push(arena.alloc_pages(0, AllocFlags::NONE).unwrap());
        }
        assert!(arena.alloc_pages(0, AllocFlags::NONE).is_err());
        for h in handles.into_iter().rev() {
            arena.free_pages(h, 0);
        }
        assert_eq!(arena.free_pages_count(), total);
    }

    #[test]
    fn buddy_invariant_after_interleaving() {
        let arena = PageArena::new(&test_config()).unwrap();
        let a = arena.alloc_pages(2, AllocFlags::NONE).unwrap();
        let b = arena.alloc_pages(2, AllocFlags::NONE).unwrap();
        let c = arena.alloc_pages(1, AllocFlags::NONE).unwrap();
        arena.free_pages(a, 2);
        arena.free_pages(c, 1);
        arena.free_pages(b, 2);
        assert_eq!(arena.free_pages_count(), arena.total_pages());
    }

    #[test]
    fn zero_flag_clears_memory() {
        let arena = PageArena::new(&test_config()).unwrap();
        let h = arena.alloc_pages(0, AllocFlags::ZERO).unwrap();
        let ptr = arena.page_ptr(h);
        unsafe {
            std::ptr::write_bytes(ptr, 0xAB, PAGE_SIZE);
        }
        arena.free_pages(h, 0);
        let h2 = arena.alloc_pages(0, AllocFlags::ZERO).unwrap();
        let ptr2 = arena.page_ptr(h2);
        let slice = unsafe { std::slice::from_raw_parts(ptr2, PAGE_SIZE) };
        assert!(slice.iter().all(|&b| b == 0));
    }
}
