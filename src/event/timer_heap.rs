//! Timer min-heap keyed by millisecond-rounded deadline, plus the
//! deviation/escape accounting from `examples/original_source/tests/
//! process/test-timer.c`'s `my_timer`/`timer_cb` (how far a timer actually
//! fired from its requested deadline, and how many times a modify raced a
//! firing).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::event::types::{TimerCallback, TimerId};

/// Round a deadline down to the nearest millisecond boundary, matching the
/// original's coarse timer wheel granularity.
fn round_down_ms(deadline: Instant, epoch: Instant) -> u128 {
    let ns = deadline.saturating_duration_since(epoch).as_nanos();
    (ns / 1_000_000) * 1_000_000
}

struct Entry {
    key_ns: u128,
    requested_at: Instant,
    id: TimerId,
    callback: TimerCallback,
    interval: Option<Duration>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key_ns == other.key_ns
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts
        // to the top.
        other.key_ns.cmp(&self.key_ns)
    }
}

/// Running statistics the `timer_expiry` scenario checks against (spec.md
/// §8): how far firings deviated from their requested deadline, and how
/// many in-flight modifications raced an already-firing timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimerStats {
    pub fired: u64,
    pub deviation_ns_sum: u128,
    pub deviation_ns_max: u128,
    pub escapes: u64,
}

impl TimerStats {
    pub fn mean_deviation(&self) -> f64 {
        if self.fired == 0 {
            0.0
        } else {
            self.deviation_ns_sum as f64 / self.fired as f64
        }
    }
}

pub struct TimerHeap {
    epoch: Instant,
    heap: BinaryHeap<Entry>,
    next_generation: u32,
    free_slots: Vec<u32>,
    next_slot: u32,
    /// Generation of the slot currently in the heap (or `None` if the
    /// timer was canceled/already fired and the slot is free). Used to
    /// reject a `cancel`/`modify` against a stale id without scanning the
    /// heap.
    live: Vec<Option<u32>>,
    stats: TimerStats,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            heap: BinaryHeap::new(),
            next_generation: 0,
            free_slots: Vec::new(),
            next_slot: 0,
            live: Vec::new(),
            stats: TimerStats::default(),
        }
    }

    fn alloc_id(&mut self) -> TimerId {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let slot = match self.free_slots.pop() {
            Some(s) => s,
            None => {
                let s = self.next_slot;
                self.next_slot += 1;
                self.live.push(None);
                s
            }
        };
        self.live[slot as usize] = Some(generation);
        TimerId { slot, generation }
    }

    pub fn schedule(&mut self, deadline: Instant, interval: Option<Duration>, callback: TimerCallback) -> TimerId {
        let id = self.alloc_id();
        self.heap.push(Entry {
            key_ns: round_down_ms(deadline, self.epoch),
            requested_at: deadline,
            id,
            callback,
            interval,
        });
        id
    }

    /// Cancel a pending timer. Returns `false` if it already fired (or the
    /// id is stale) — an "escape", counted for the `timer_expiry`
    /// scenario's race accounting.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let still_live = self.live.get(id.slot as usize).copied().flatten() == Some(id.generation);
        if still_live {
            self.live[id.slot as usize] = None;
            self.free_slots.push(id.slot);
            // Lazily removed from `heap`; `pop_due` skips dead entries.
            true
        } else {
            self.stats.escapes += 1;
            false
        }
    }

    pub fn is_live(&self, id: TimerId) -> bool {
        self.live.get(id.slot as usize).copied().flatten() == Some(id.generation)
    }

    /// Next deadline in the heap, skipping entries already canceled.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_dead();
        self.heap.peek().map(|e| e.requested_at)
    }

    fn drop_dead(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.live.get(top.id.slot as usize).copied().flatten() == Some(top.id.generation) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Pop and fire every timer whose deadline is `<= now`, feeding
    /// deviation stats and re-arming periodic timers.
    pub fn fire_due(&mut self, now: Instant) -> usize {
        let now_key = round_down_ms(now, self.epoch);
        let mut fired = 0;
        loop {
            self.drop_dead();
            let due = match self.heap.peek() {
                Some(e) if e.key_ns <= now_key => true,
                _ => false,
            };
            if !due {
                break;
            }
            let mut entry = self.heap.pop().unwrap();
            self.live[entry.id.slot as usize] = None;
            self.free_slots.push(entry.id.slot);

            let deviation = now.saturating_duration_since(entry.requested_at).as_nanos();
            self.stats.fired += 1;
            self.stats.deviation_ns_sum += deviation;
            self.stats.deviation_ns_max = self.stats.deviation_ns_max.max(deviation);

            (entry.callback)();
            fired += 1;

            if let Some(interval) = entry.interval {
                let next_deadline = entry.requested_at + interval;
                let id = self.alloc_id();
                self.heap.push(Entry {
                    key_ns: round_down_ms(next_deadline, self.epoch),
                    requested_at: next_deadline,
                    id,
                    callback: entry.callback,
                    interval: entry.interval,
                });
            }
        }
        fired
    }

    pub fn stats(&self) -> TimerStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}
