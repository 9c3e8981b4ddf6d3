//! Page descriptors and the flag bits that track a page's ownership state.
//!
//! Mirrors `struct vpage` from the C core: one fixed-size descriptor per
//! page-sized slot of the reserved arena, living in a node's `mem_map`. A
//! page descriptor never moves and is never freed — only its flags and
//! owner fields change as it transitions between buddy/slab/user ownership.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// log2 of the page size. 4KiB pages.
pub const VPAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << VPAGE_SHIFT;

/// `PG_*` bits, ported 1:1 from the C core's `page->flags` bitset.
pub mod flags {
    pub const LOCKED: u32 = 1 << 0;
    pub const SLAB: u32 = 1 << 1;
    pub const COMPOUND: u32 = 1 << 2;
    pub const BUDDY: u32 = 1 << 3;
    pub const ACTIVE: u32 = 1 << 4;
    pub const BLOCK: u32 = 1 << 5;
    pub const INITED: u32 = 1 << 6;
    pub const RESERVED: u32 = 1 << 7;
    /// Physical backing was released with `madvise(MADV_DONTNEED)`; the next
    /// touch will fault in zeroed pages. Not part of the original bitset —
    /// added so §4.1's "release excess max-order blocks to the OS" has
    /// somewhere to record the decommit without unmapping the reservation.
    pub const DECOMMITTED: u32 = 1 << 8;

    pub const OWNER_MASK: u32 = BUDDY | SLAB | RESERVED;
}

/// Back-reference a page can hold depending on its ownership state.
#[derive(Debug, Default, Clone, Copy)]
pub enum PageOwner {
    #[default]
    None,
    /// Index of the head page of a compound block this page is part of.
    CompoundHead(u32),
    /// Back-pointer to the slab descriptor id owning this page.
    Slab(u32),
}

/// One page-sized slot's metadata. Indexed by `(node_id, page_idx)` rather
/// than addressed by raw pointer — see DESIGN.md for why the buddy free
/// lists are index-linked instead of pointer-linked.
pub struct PageDescriptor {
    pub flags: AtomicU32,
    /// Buddy order when `BUDDY` is set, `-1` otherwise. `i32` so "not on a
    /// free list" has a cheap sentinel distinct from order 0.
    pub order: AtomicU32,
    pub refcount: AtomicUsize,
    pub owner: std::sync::Mutex<PageOwner>,
    /// Doubly-linked free-list pointers, indices into the owning node's
    /// `mem_map`. `u32::MAX` is the list-terminator sentinel.
    pub free_prev: AtomicU32,
    pub free_next: AtomicU32,
    /// Slab fast-path fields, valid only while `SLAB` is set.
    pub slab_inuse: AtomicU32,
    pub slab_freelist: AtomicU64,
    pub slab_lockless_freelist: AtomicU64,
}

pub const NIL: u32 = u32::MAX;
pub const NO_ORDER: u32 = u32::MAX;

impl PageDescriptor {
    pub fn new() -> Self {
        Self {
            flags: AtomicU32::new(0),
            order: AtomicU32::new(NO_ORDER),
            refcount: AtomicUsize::new(0),
            owner: std::sync::Mutex::new(PageOwner::None),
            free_prev: AtomicU32::new(NIL),
            free_next: AtomicU32::new(NIL),
            slab_inuse: AtomicU32::new(0),
            slab_freelist: AtomicU64::new(0),
            slab_lockless_freelist: AtomicU64::new(0),
        }
    }

    pub fn is_buddy(&self) -> bool {
        self.flags.load(Ordering::Acquire) & flags::BUDDY != 0
    }

    pub fn set_buddy_order(&self, order: u32) {
        self.order.store(order, Ordering::Release);
        self.flags.fetch_or(flags::BUDDY, Ordering::AcqRel);
    }

    pub fn clear_buddy(&self) {
        self.flags.fetch_and(!flags::BUDDY, Ordering::AcqRel);
        self.order.store(NO_ORDER, Ordering::Release);
    }

    /// Record the order a block was handed out at, once it has left the
    /// free lists. Reuses the same field `set_buddy_order` uses while the
    /// block sits on a free list — the two uses never overlap, since a page
    /// is either on a free list (`BUDDY` set) or allocated (`BUDDY` clear).
    pub fn set_alloc_order(&self, order: u32) {
        self.order.store(order, Ordering::Release);
    }

    /// The order this (allocated, head-of-block) page was handed out at.
    /// Only meaningful for the head page of a multi-page block; single
    /// pages handed out at order 0 don't need it but storing it anyway
    /// keeps `ufree` order-agnostic.
    pub fn alloc_order(&self) -> u32 {
        self.order.load(Ordering::Acquire)
    }

    pub fn buddy_order(&self) -> Option<u32> {
        if self.is_buddy() {
            Some(self.order.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Acquire the per-page bit spinlock (`test_and_set_bit(PG_locked)`).
    /// Caller must release with [`Self::unlock`]. Never call while holding
    /// a cache/pool lock in the reverse order (`cache_lock -> page_lock`
    /// is the only legal nesting, per spec.md §5).
    pub fn lock(&self) {
        let mut backoff = crate::concurrent::Backoff::new();
        loop {
            let prev = self.flags.fetch_or(flags::LOCKED, Ordering::Acquire);
            if prev & flags::LOCKED == 0 {
                return;
            }
            backoff.snooze();
        }
    }

    pub fn try_lock(&self) -> bool {
        self.flags.fetch_or(flags::LOCKED, Ordering::Acquire) & flags::LOCKED == 0
    }

    pub fn unlock(&self) {
        self.flags.fetch_and(!flags::LOCKED, Ordering::Release);
    }

    pub fn prep_new_page(&self) {
        self.flags.fetch_and(
            !(flags::LOCKED | flags::SLAB | flags::COMPOUND | flags::DECOMMITTED),
            Ordering::AcqRel,
        );
        *self.owner.lock().unwrap() = PageOwner::None;
        self.refcount.store(1, Ordering::Release);
    }
}

impl Default for PageDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// An opaque handle to an allocated page, returned by [`crate::mm::arena::PageArena`].
/// Carries enough to locate both the descriptor and the backing memory
/// without re-deriving node/zone from a raw address, which the spec calls
/// for via "fixed shifts" but which a safe Rust API can sidestep entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle {
    pub node: u16,
    pub index: u32,
}

impl PageHandle {
    pub const NULL: PageHandle = PageHandle { node: u16::MAX, index: NIL };

    pub fn is_null(&self) -> bool {
        self.node == u16::MAX
    }
}
