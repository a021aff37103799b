//! Module `version_block` implements the overflow storage used once a
//! state block's inline version history is exhausted (§4.3). A
//! "version block" here is one node of a singly-linked chain rooted at
//! an index slot's `version_block` pointer; the chain extends by
//! appending freshly allocated nodes, never by moving existing ones, so
//! nodes already published to readers stay valid for as long as the
//! blob lives.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::behavior::PayloadHandle;
use crate::cell::{PublishedCell, WriterCell};
use crate::util::{
    mark_version, offset_valid, search_token, unmark_version, BlockId, VersionOffset,
    INVALID_OFFSET, KEY_VERSION_BLOCK_EXT, KEY_VERSION_BLOCK_FIRST, SUBKEY_VERSION_BLOCK_EXT,
    SUBKEY_VERSION_BLOCK_FIRST,
};

/// One node of a key version block chain (§4.3 "Key version block").
pub struct KeyVersionBlock {
    capacity: usize,
    size: AtomicU32,
    entries: Vec<PublishedCell<(VersionOffset, u32)>>,
    next_block: WriterCell<BlockId>,
}

impl KeyVersionBlock {
    pub fn first() -> KeyVersionBlock {
        KeyVersionBlock::with_capacity(KEY_VERSION_BLOCK_FIRST)
    }

    pub fn extension() -> KeyVersionBlock {
        KeyVersionBlock::with_capacity(KEY_VERSION_BLOCK_EXT)
    }

    fn with_capacity(capacity: usize) -> KeyVersionBlock {
        let mut entries = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            entries.push(PublishedCell::new((INVALID_OFFSET, 0)));
        }
        KeyVersionBlock {
            capacity,
            size: AtomicU32::new(0),
            entries,
            next_block: WriterCell::new(BlockId::NIL),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity
    }

    pub fn next_block(&self) -> BlockId {
        self.next_block.get()
    }

    pub fn set_next_block(&self, next: BlockId) {
        self.next_block.set(next);
    }

    pub fn entry(&self, idx: usize) -> (VersionOffset, u32) {
        self.entries[idx].get()
    }

    pub fn latest(&self) -> Option<(VersionOffset, u32)> {
        let size = self.size();
        if size == 0 {
            None
        } else {
            Some(self.entries[size - 1].get())
        }
    }

    /// §4.3 `push`: no-op if `count` equals the last pushed count.
    /// Returns `false` if this node is full (caller must extend the
    /// chain with a new node and retry there).
    pub fn push(&self, offset: VersionOffset, count: u32) -> bool {
        if let Some((_, last_count)) = self.latest() {
            if last_count == count {
                return true;
            }
        }
        let size = self.size();
        if size >= self.capacity {
            return false;
        }
        self.entries[size].set((offset, count));
        self.size.store((size + 1) as u32, Ordering::Release);
        true
    }

    /// Binary search for the subkey count visible at `version_offset`.
    pub fn query(&self, version_offset: VersionOffset) -> u32 {
        let size = self.size();
        if size == 0 {
            return 0;
        }
        let (mut lo, mut hi) = (0usize, size);
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (offset, _) = self.entries[mid].get();
            if offset <= version_offset {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            0
        } else {
            self.entries[lo - 1].get().1
        }
    }
}

/// One node of a subkey version block chain (§4.3 "Subkey version
/// block"). `anchor` is the full 64-bit marked version of this node's
/// first entry; later entries are 32-bit offsets from it.
pub struct SubkeyVersionBlock {
    capacity: usize,
    size: AtomicU32,
    anchor_marked: PublishedCell<u64>,
    offsets: Vec<PublishedCell<u32>>, // offsets[0] unused; anchor covers slot 0
    payloads: Vec<PublishedCell<Option<PayloadHandle>>>,
    previous: WriterCell<BlockId>,
    next_block: WriterCell<BlockId>,
}

impl SubkeyVersionBlock {
    pub fn first() -> SubkeyVersionBlock {
        SubkeyVersionBlock::with_capacity(SUBKEY_VERSION_BLOCK_FIRST)
    }

    pub fn extension() -> SubkeyVersionBlock {
        SubkeyVersionBlock::with_capacity(SUBKEY_VERSION_BLOCK_EXT)
    }

    fn with_capacity(capacity: usize) -> SubkeyVersionBlock {
        let mut offsets = Vec::with_capacity(capacity);
        let mut payloads = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            offsets.push(PublishedCell::new(INVALID_OFFSET));
            payloads.push(PublishedCell::new(None));
        }
        SubkeyVersionBlock {
            capacity,
            size: AtomicU32::new(0),
            anchor_marked: PublishedCell::new(0),
            offsets,
            payloads,
            previous: WriterCell::new(BlockId::NIL),
            next_block: WriterCell::new(BlockId::NIL),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity
    }

    pub fn previous(&self) -> BlockId {
        self.previous.get()
    }

    pub fn set_previous(&self, prev: BlockId) {
        self.previous.set(prev);
    }

    pub fn next_block(&self) -> BlockId {
        self.next_block.get()
    }

    pub fn set_next_block(&self, next: BlockId) {
        self.next_block.set(next);
    }

    pub fn anchor_marked(&self) -> Option<u64> {
        if self.size() == 0 {
            None
        } else {
            Some(self.anchor_marked.get())
        }
    }

    /// Marked version of entry `idx` (0 is the anchor itself).
    fn marked_at(&self, idx: usize) -> Option<u64> {
        if idx == 0 {
            return self.anchor_marked();
        }
        let offset = self.offsets[idx].get();
        if !offset_valid(offset) {
            return None;
        }
        Some(self.anchor_marked.get() + offset as u64)
    }

    /// True if a marked version can be appended to this node without
    /// overflowing its 32-bit anchor-relative offset.
    pub fn can_append(&self, marked: u64) -> bool {
        let size = self.size();
        if size == 0 {
            return true;
        }
        if size >= self.capacity {
            return false;
        }
        let anchor = self.anchor_marked.get();
        marked >= anchor && marked - anchor <= u32::MAX as u64
    }

    /// §4.3 `push`: appends `(version, deleted)` with `payload` (ignored
    /// for deletions). No-op if the new state matches what's already
    /// latest. Returns `false` if the node cannot take the entry (either
    /// full, or the offset would not fit) so the caller extends the
    /// chain.
    pub fn push(&self, version: u64, deleted: bool, payload: Option<PayloadHandle>) -> bool {
        let marked = mark_version(version, deleted);
        let size = self.size();
        if size > 0 {
            if let Some(latest) = self.marked_at(size - 1) {
                let (_, latest_deleted) = unmark_version(latest);
                if latest_deleted && deleted {
                    return true; // deleting an already-deleted subkey: no-op
                }
            }
        }
        if !self.can_append(marked) {
            return false;
        }
        if size == 0 {
            self.anchor_marked.set(marked);
            self.payloads[0].set(if deleted { None } else { payload });
            self.size.store(1, Ordering::Release);
        } else {
            let anchor = self.anchor_marked.get();
            self.offsets[size].set((marked - anchor) as u32);
            self.payloads[size].set(if deleted { None } else { payload });
            self.size.store((size + 1) as u32, Ordering::Release);
        }
        true
    }

    /// Fill every unused slot from `size()` onward with the invalid
    /// offset sentinel, so a binary search never mistakes a future
    /// write for a stale default. Called when a node is retired because
    /// the next entry would not fit its anchor-relative offset range.
    pub fn seal(&self) {
        let size = self.size();
        for i in size..self.capacity {
            if i != 0 {
                self.offsets[i].set(INVALID_OFFSET);
            }
        }
    }

    /// §4.3 query `get_versioned_payload`: returns `(version, payload)`
    /// for the latest entry visible at or before `version`, walking
    /// backward from the tentative slot.
    pub fn get_versioned_payload(&self, version: u64) -> Option<(u64, Option<PayloadHandle>)> {
        let token = search_token(version);
        let size = self.size();
        if size == 0 {
            return None;
        }
        if self.anchor_marked.get() > token {
            return None;
        }
        let mut idx = size.saturating_sub(1);
        loop {
            if let Some(marked) = self.marked_at(idx) {
                if marked <= token {
                    let (v, deleted) = unmark_version(marked);
                    return if deleted {
                        Some((v, None))
                    } else {
                        Some((v, self.payloads[idx].get()))
                    };
                }
            }
            if idx == 0 {
                return None;
            }
            idx -= 1;
        }
    }

    /// Destruction helper: append every non-deletion `(version, payload)`
    /// pair in this node to `out`.
    pub fn append_payloads(&self, out: &mut Vec<(u64, PayloadHandle)>) {
        let size = self.size();
        for idx in 0..size {
            if let Some(marked) = self.marked_at(idx) {
                let (v, deleted) = unmark_version(marked);
                if !deleted {
                    if let Some(p) = self.payloads[idx].get() {
                        out.push((v, p));
                    }
                }
            }
        }
    }
}
