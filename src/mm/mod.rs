//! Virtual-page buddy allocator, per-thread page cache, slab object caches
//! and the generic allocation API built on top of them.
//!
//! Layering, bottom to top: [`page`] (descriptors) -> [`arena`] (buddy
//! allocator) -> [`page_cache`] (per-thread hot-page cache) -> [`slab`]
//! (size-classed object cache, carving and releasing whole pages through
//! `page_cache` rather than the arena directly) -> [`alloc_api`] (generic
//! `umalloc`/`ufree` dispatch).

pub mod alloc_api;
pub mod arena;
pub mod page;
pub mod page_cache;
pub mod slab;

pub use alloc_api::AllocApi;
pub use arena::{AllocFlags, PageArena};
pub use page::{PageDescriptor, PageHandle, PageOwner};
pub use page_cache::PageCache;
pub use slab::{SlabCache, SlabFlags, SlabStats};
