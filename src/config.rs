//! Runtime tunables. `spec.md` §6 lists these as compile-time constants; a
//! library can't force a downstream recompile to change them, so they are
//! collected into one `Copy` struct with sensible `Default`s instead,
//! matching the way the teacher threads a plain config struct with a
//! `Default` impl (`SnapshotConfig` in `examples/harborgrid-justin-rusty-db/
//! src/replication/snapshots/config.rs`) through its constructors rather
//! than reaching for global constants.

/// Tunables for [`crate::mm`], [`crate::event`] and [`crate::workqueue`].
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// log2(page size). Only 12 (4KiB) is exercised; kept as a field rather
    /// than a `const` so huge-page configurations can be modeled later.
    pub vpage_shift: u32,
    /// Number of buddy orders; highest allocatable block is
    /// `2^(max_order - 1)` pages.
    pub max_order: u32,
    /// Number of arena nodes (NUMA-style partitions). Each gets its own
    /// zone and free-list locks so allocation on different nodes never
    /// contends.
    pub max_numnodes: u32,
    /// Pages per node; `max_numnodes * vpages_per_node` is the arena's total
    /// page budget.
    pub vpages_per_node: u32,

    /// Per-thread page cache low/high/batch watermarks (spec.md §4.2).
    pub page_cache_low: u32,
    pub page_cache_high: u32,
    pub page_cache_batch: u32,

    /// Slab size classes in bytes, ascending. Allocation requests are
    /// rounded up to the nearest class; anything larger than the last class
    /// goes straight to the page arena as a block allocation.
    pub slab_size_classes: &'static [usize],
    /// Number of objects a freshly carved slab holds a magazine-worth of,
    /// used to size the per-cache magazine capacity.
    pub magazine_size: usize,
    /// `objpool_cap` equivalent: once a cache's lock-free depot holds more
    /// than this many returned magazines, `dealloc` drains it back to the
    /// page arena instead of growing it unbounded.
    pub slab_depot_cap: usize,

    /// Maximum events a single `reactor_poll` call drains before returning
    /// control to the looper's dispatch loop.
    pub per_looper_events_max: usize,
    /// Idle worker reap timeout for unbound pools.
    pub idle_worker_timeout: std::time::Duration,
    /// `WQ_MAX_ACTIVE` equivalent: hard ceiling on concurrently active works
    /// per `pool_workqueue` unless the workqueue raised its own max_active.
    pub wq_max_active: u32,
    /// `WQ_DFL_ACTIVE`: default max_active for `alloc_workqueue` callers
    /// that pass 0.
    pub wq_dfl_active: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            vpage_shift: 12,
            max_order: 11,
            max_numnodes: num_cpus::get().min(8).max(1) as u32,
            vpages_per_node: 1 << 16, // 256MiB/node at 4KiB pages

            page_cache_low: 8,
            page_cache_high: 12,
            page_cache_batch: 4,

            slab_size_classes: &[16, 32, 64, 96, 128, 192, 256, 512, 1024, 2048, 4096],
            magazine_size: 32,
            slab_depot_cap: 3,

            per_looper_events_max: 256,
            idle_worker_timeout: std::time::Duration::from_secs(5 * 60),
            wq_max_active: 64,
            wq_dfl_active: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let c = RuntimeConfig::default();
        assert!(c.page_cache_low < c.page_cache_high);
        assert!(c.wq_dfl_active <= c.wq_max_active);
        assert!(c.max_numnodes >= 1);
    }
}
