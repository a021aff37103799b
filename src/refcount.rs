//! Module `refcount` implements the per-version reference count array
//! (§4.4): one 32-bit atomic per version, shared among arbitrary
//! threads since snapshots can be released from anywhere.
//!
//! Low bit of each entry selects the mode: 1 = refcount (upper 31 bits,
//! steps of 2, initialized to 1 reference i.e. raw value 3), 0 = jump
//! (upper 31 bits = number of consecutive dead versions that may be
//! skipped). Jump-mode write-back is how `for_each_alive_version` stays
//! amortized linear in the number of *alive* versions across arbitrary
//! release interleavings, without maintaining any separate skiplist.

use std::sync::atomic::{AtomicU32, Ordering};

const MODE_BIT: u32 = 1;

pub struct VersionRefcounts {
    entries: Vec<AtomicU32>,
}

impl VersionRefcounts {
    pub fn with_capacity(capacity: usize) -> VersionRefcounts {
        let mut entries = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            entries.push(AtomicU32::new(0));
        }
        VersionRefcounts { entries }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Initialize the refcount for a freshly born version to one
    /// reference (the snapshot that will represent it).
    pub fn init(&self, offset: u32) {
        self.entries[offset as usize].store(3, Ordering::Release);
    }

    pub fn add_reference(&self, offset: u32) {
        let prev = self.entries[offset as usize].fetch_add(2, Ordering::Relaxed);
        debug_assert!(prev & MODE_BIT == 1 && prev >= 3, "add_reference on dead version");
    }

    /// Returns `true` iff this was the last reference (the version just
    /// died and its slot now reads as `1`, i.e. refcount-mode with zero
    /// references).
    pub fn remove_reference(&self, offset: u32) -> bool {
        let prev = self.entries[offset as usize].fetch_sub(2, Ordering::AcqRel);
        debug_assert!(prev & MODE_BIT == 1 && prev >= 3, "remove_reference on dead version");
        prev - 2 == 1
    }

    pub fn is_alive(&self, offset: u32) -> bool {
        let raw = self.entries[offset as usize].load(Ordering::Acquire);
        raw & MODE_BIT == 1 && raw >> 1 > 0
    }

    /// §4.4 `for_each_alive_version`: linear scan accelerated by
    /// jump-mode write-back. Stops early if `f` returns `true`.
    pub fn for_each_alive_version<F>(&self, count: u32, mut f: F)
    where
        F: FnMut(u32) -> bool,
    {
        let mut offset = 0u32;
        while offset < count {
            let raw = self.entries[offset as usize].load(Ordering::Acquire);
            if raw & MODE_BIT == 1 {
                let refs = raw >> 1;
                if refs > 0 {
                    if f(offset) {
                        return;
                    }
                    offset += 1;
                    continue;
                }
                // Dead, first in a prospective run: scan ahead to find
                // how far the run extends before writing back a jump.
                let run_start = offset;
                let mut run_len = 1u32;
                let mut probe = offset + 1;
                while probe < count {
                    let next = self.entries[probe as usize].load(Ordering::Acquire);
                    let dead = (next & MODE_BIT == 1 && next >> 1 == 0)
                        || (next & MODE_BIT == 0);
                    if !dead {
                        break;
                    }
                    // A jump-mode entry already covers `step` dead slots
                    // starting at `probe`; advance past all of them, not
                    // just this one, or the next scan re-counts slots the
                    // jump already accounted for and overshoots past a
                    // still-alive version.
                    let step = if next & MODE_BIT == 0 { next >> 1 } else { 1 };
                    run_len += step;
                    probe += step;
                }
                self.entries[run_start as usize]
                    .store(run_len << 1, Ordering::Relaxed);
                offset = run_start + run_len;
            } else {
                // Already in jump mode: honor the recorded distance.
                let distance = raw >> 1;
                offset += distance.max(1);
            }
        }
    }
}

#[cfg(test)]
#[path = "refcount_test.rs"]
mod refcount_test;
