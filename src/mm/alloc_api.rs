//! Generic `malloc`-family dispatch: routes a byte-size request to the
//! smallest size-class cache that fits it, or straight to the page arena as
//! a block allocation once the request outgrows the largest size class.
//!
//! Grounded on `examples/harborgrid-justin-rusty-db/src/memory/allocator/
//! slab_allocator.rs`'s `SlabAllocator::allocate` (round up to a size
//! class, else fall through to a bigger allocator) and on spec.md §4.3's
//! "anything larger than the largest size class is a direct block
//! allocation from the arena."

use std::sync::Arc;

use crate::error::{Result, RtError};
use crate::mm::arena::{AllocFlags, PageArena};
use crate::mm::page::PAGE_SIZE;
use crate::mm::slab::{SlabCache, SlabFlags};

/// Owns one [`SlabCache`] per configured size class plus a handle to the
/// backing arena for oversize requests. This is the type a `Runtime`
/// exposes as its general-purpose allocator.
pub struct AllocApi {
    arena: Arc<PageArena>,
    classes: Vec<Arc<SlabCache>>,
}

impl AllocApi {
    pub fn new(arena: Arc<PageArena>, config: &crate::config::RuntimeConfig) -> Self {
        let classes = config
            .slab_size_classes
            .iter()
            .map(|&size| {
                SlabCache::cache_create(
                    "umalloc-class",
                    arena.clone(),
                    size,
                    std::mem::size_of::<usize>(),
                    config.magazine_size,
                    config,
                    SlabFlags::NONE,
                )
            })
            .collect();
        Self { arena, classes }
    }

    fn class_for(&self, size: usize) -> Option<&Arc<SlabCache>> {
        self.classes.iter().find(|c| c.obj_size >= size)
    }

    /// `umalloc`: allocate at least `size` bytes, uninitialized.
    pub fn umalloc(&self, size: usize) -> Result<*mut u8> {
        if size == 0 {
            return Err(RtError::InvalidArgument("umalloc(0)".into()));
        }
        if let Some(cache) = self.class_for(size) {
            return cache.alloc();
        }
        let order = block_order_for(size);
        let page = self.arena.alloc_pages(order, AllocFlags::BLK)?;
        Ok(self.arena.page_ptr(page))
    }

    /// `ucalloc`: `umalloc` plus zeroing.
    pub fn ucalloc(&self, size: usize) -> Result<*mut u8> {
        if size == 0 {
            return Err(RtError::InvalidArgument("ucalloc(0)".into()));
        }
        if let Some(cache) = self.class_for(size) {
            let ptr = cache.alloc()?;
            unsafe { std::ptr::write_bytes(ptr, 0, cache.obj_size) };
            return Ok(ptr);
        }
        let order = block_order_for(size);
        let page = self.arena.alloc_pages(order, AllocFlags::BLK | AllocFlags::ZERO)?;
        Ok(self.arena.page_ptr(page))
    }

    /// `ufree`: return a pointer obtained from [`Self::umalloc`]/
    /// [`Self::ucalloc`]/[`Self::urealloc`].
    pub fn ufree(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let Some((page, offset)) = self.arena.locate(ptr) else {
            debug_assert!(false, "ufree: pointer does not belong to this runtime's arena");
            return;
        };
        let pd = self.arena.descriptor(page);
        let flags_now = pd.flags.load(std::sync::atomic::Ordering::Acquire);
        let _ = offset;
        if flags_now & crate::mm::page::flags::SLAB != 0 {
            if let Some(cache) = self.classes.iter().find(|c| c.id == slab_owner_id(pd)) {
                cache.dealloc(ptr);
                return;
            }
        }
        self.arena.free_pages(page, block_order_of(pd));
    }

    /// `urealloc`: grow or shrink a previous allocation, preserving the
    /// lesser of the old and new sizes' contents. A conservative
    /// allocate-copy-free; the size classes don't expose in-place growth.
    pub fn urealloc(&self, ptr: *mut u8, old_size: usize, new_size: usize) -> Result<*mut u8> {
        if ptr.is_null() {
            return self.umalloc(new_size);
        }
        if new_size == 0 {
            self.ufree(ptr);
            return Err(RtError::InvalidArgument("urealloc to size 0".into()));
        }
        let new_ptr = self.umalloc(new_size)?;
        let copy_len = old_size.min(new_size);
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
        }
        self.ufree(ptr);
        Ok(new_ptr)
    }

    /// `usize`: the usable size of an allocation (the rounded-up size class,
    /// or the full block size for oversize allocations).
    pub fn usize_of(&self, ptr: *const u8) -> Option<usize> {
        let (page, _offset) = self.arena.locate(ptr)?;
        let pd = self.arena.descriptor(page);
        if pd.flags.load(std::sync::atomic::Ordering::Acquire) & crate::mm::page::flags::SLAB != 0 {
            self.classes.iter().find(|c| c.id == slab_owner_id(pd)).map(|c| c.obj_size)
        } else {
            Some((1usize << block_order_of(pd)) * PAGE_SIZE)
        }
    }
}

fn slab_owner_id(pd: &crate::mm::page::PageDescriptor) -> u32 {
    match *pd.owner.lock().unwrap() {
        crate::mm::page::PageOwner::Slab(id) => id,
        _ => u32::MAX,
    }
}

fn block_order_of(pd: &crate::mm::page::PageDescriptor) -> u32 {
    pd.alloc_order()
}

/// Smallest order `o` such that `2^o` pages cover `size` bytes.
fn block_order_for(size: usize) -> u32 {
    let pages = size.div_ceil(PAGE_SIZE);
    (usize::BITS - (pages.max(1) - 1).leading_zeros()).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn api() -> AllocApi {
        let mut c = RuntimeConfig::default();
        c.max_order = 8;
        c.max_numnodes = 1;
        c.vpages_per_node = 1024;
        let arena = Arc::new(PageArena::new(&c).unwrap());
        AllocApi::new(arena, &c)
    }

    #[test]
    fn small_request_uses_a_size_class() {
        let api = api();
        let p = api.umalloc(40).unwrap();
        assert_eq!(api.usize_of(p), Some(64));
        api.ufree(p);
    }

    #[test]
    fn oversize_request_falls_through_to_the_arena() {
        let api = api();
        let p = api.umalloc(20_000).unwrap();
        assert!(api.usize_of(p).unwrap() >= 20_000);
        api.ufree(p);
    }

    #[test]
    fn urealloc_preserves_contents() {
        let api = api();
        let p = api.umalloc(32).unwrap();
        unsafe {
            std::ptr::write_bytes(p, 0x5A, 32);
        }
        let p2 = api.urealloc(p, 32, 512).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(p2, 32) };
        assert!(slice.iter().all(|&b| b == 0x5A));
        api.ufree(p2);
    }
}
