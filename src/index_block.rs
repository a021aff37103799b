//! Module `index_block` implements the hash-probed, lock-free-for-readers
//! array that maps `(key)` or `(key, subkey)` to a state block plus an
//! optional version block (§4.1).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::util::{BlockId, INDEX_SLOTS};

/// `counts_and_hashes` bit layout (little-endian byte order within the
/// 64-bit word): byte 0 is the counts/overflow byte, bytes 1..=7 are the
/// 8-bit slot hashes for slots 0..=6.
const KEY_COUNT_MASK: u64 = 0x07;
const SUBKEY_COUNT_SHIFT: u32 = 3;
const SUBKEY_COUNT_MASK: u64 = 0x07 << SUBKEY_COUNT_SHIFT;
const OVERFLOWED_HERE_BIT: u64 = 1 << 6;
const OVERFLOWED_BEFORE_BIT: u64 = 1 << 7;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlotKind {
    Key,
    Subkey,
}

/// Non-allocating iterator over a block's occupied slots of one kind,
/// returned by [`IndexBlock::occupied_slots`].
pub struct OccupiedSlots {
    kind: SlotKind,
    count: usize,
    next: usize,
}

impl Iterator for OccupiedSlots {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.next >= self.count {
            return None;
        }
        let slot = match self.kind {
            SlotKind::Key => self.next,
            SlotKind::Subkey => INDEX_SLOTS - 1 - self.next,
        };
        self.next += 1;
        Some(slot)
    }
}

pub struct IndexSlot {
    state_block: AtomicU32,
    version_block: AtomicU32,
}

impl IndexSlot {
    fn empty() -> IndexSlot {
        IndexSlot {
            state_block: AtomicU32::new(BlockId::NIL.0),
            version_block: AtomicU32::new(BlockId::NIL.0),
        }
    }

    #[inline]
    pub fn state_block(&self) -> BlockId {
        BlockId(self.state_block.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn version_block(&self) -> BlockId {
        BlockId(self.version_block.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_version_block(&self, id: BlockId) {
        self.version_block.store(id.0, Ordering::Release);
    }

    // Writer-only: populate a slot's pointers before the block-level
    // publish (counts_and_hashes release-store) makes it visible.
    fn init(&self, state_block: BlockId, version_block: BlockId) {
        self.state_block.store(state_block.0, Ordering::Relaxed);
        self.version_block.store(version_block.0, Ordering::Relaxed);
    }
}

/// One 7-slot hash bucket. Key slots fill from slot 0 upward, subkey
/// slots fill from slot 6 downward; the implicit kind of a slot is
/// determined by the current counts.
pub struct IndexBlock {
    counts_and_hashes: AtomicU64,
    slots: [IndexSlot; INDEX_SLOTS],
}

impl IndexBlock {
    pub fn new() -> IndexBlock {
        IndexBlock {
            counts_and_hashes: AtomicU64::new(0),
            slots: [
                IndexSlot::empty(),
                IndexSlot::empty(),
                IndexSlot::empty(),
                IndexSlot::empty(),
                IndexSlot::empty(),
                IndexSlot::empty(),
                IndexSlot::empty(),
            ],
        }
    }

    #[inline]
    fn raw(&self) -> u64 {
        self.counts_and_hashes.load(Ordering::Acquire)
    }

    #[inline]
    pub fn key_count(&self) -> usize {
        (self.raw() & KEY_COUNT_MASK) as usize
    }

    #[inline]
    pub fn subkey_count(&self) -> usize {
        ((self.raw() & SUBKEY_COUNT_MASK) >> SUBKEY_COUNT_SHIFT) as usize
    }

    #[inline]
    pub fn overflowed_here(&self) -> bool {
        self.raw() & OVERFLOWED_HERE_BIT != 0
    }

    #[inline]
    pub fn overflowed_before(&self) -> bool {
        self.raw() & OVERFLOWED_BEFORE_BIT != 0
    }

    #[inline]
    pub fn slot_hash(&self, slot: usize) -> u8 {
        ((self.raw() >> (8 * (slot + 1))) & 0xff) as u8
    }

    pub fn slot(&self, slot: usize) -> &IndexSlot {
        &self.slots[slot]
    }

    /// Slots currently occupied, in probe order for `kind`: keys probe
    /// 0..key_count ascending, subkeys probe 6..6-subkey_count descending.
    /// A reader hits this on every index probe, so it must not allocate:
    /// `OccupiedSlots` is a plain counting iterator over the block's own
    /// `counts_and_hashes`-derived bounds.
    #[inline]
    pub fn occupied_slots(&self, kind: SlotKind) -> OccupiedSlots {
        let count = match kind {
            SlotKind::Key => self.key_count(),
            SlotKind::Subkey => self.subkey_count(),
        };
        OccupiedSlots { kind, count, next: 0 }
    }

    /// Writer-only: try to insert a new occupant of `kind` with the given
    /// `hash` byte and block pointers. Returns the slot index on success,
    /// or `None` if the block has no free slot of that kind (caller must
    /// then set the overflow bit and advance the probe).
    pub fn try_insert(
        &self,
        kind: SlotKind,
        hash: u8,
        state_block: BlockId,
        version_block: BlockId,
    ) -> Option<usize> {
        let raw = self.raw();
        let key_count = (raw & KEY_COUNT_MASK) as usize;
        let subkey_count = ((raw & SUBKEY_COUNT_MASK) >> SUBKEY_COUNT_SHIFT) as usize;
        if key_count + subkey_count >= INDEX_SLOTS {
            return None;
        }
        let slot_idx = match kind {
            SlotKind::Key => key_count,
            SlotKind::Subkey => INDEX_SLOTS - 1 - subkey_count,
        };

        self.slots[slot_idx].init(state_block, version_block);

        let new_raw = match kind {
            SlotKind::Key => (raw & !KEY_COUNT_MASK) | (key_count as u64 + 1),
            SlotKind::Subkey => {
                (raw & !SUBKEY_COUNT_MASK) | ((subkey_count as u64 + 1) << SUBKEY_COUNT_SHIFT)
            }
        };
        let new_raw = (new_raw & !(0xffu64 << (8 * (slot_idx + 1))))
            | ((hash as u64) << (8 * (slot_idx + 1)));
        // Publish: slot pointers above are ordinary writes; this
        // release-store is what makes them visible to any reader that
        // subsequently acquire-loads counts_and_hashes (§5).
        self.counts_and_hashes.store(new_raw, Ordering::Release);
        Some(slot_idx)
    }

    /// Writer-only: mark this block as overflowed (a probe passed through
    /// it and found it full). `chained_from_before` is true when a prior
    /// block in the same probe chain was already marked overflowed.
    pub fn mark_overflowed(&self, chained_from_before: bool) {
        let raw = self.raw();
        let mut new_raw = raw | OVERFLOWED_HERE_BIT;
        if chained_from_before {
            new_raw |= OVERFLOWED_BEFORE_BIT;
        }
        self.counts_and_hashes.store(new_raw, Ordering::Release);
    }
}
