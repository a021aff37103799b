//! Module `state_block` implements the per-key and per-subkey records
//! described in §3/§4.2: a small inline version history plus the
//! links that thread the writer-only AA-tree and the reader-visible
//! sorted list.

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicU64, Ordering};

use crate::behavior::{KeyHandle, KeySubscriptionHandle, PayloadHandle, SubkeySubscriptionHandle};
use crate::cell::{PublishedCell, WriterCell};
use crate::util::{
    mark_version, offset_valid, search_token, unmark_version, BlockId, VersionOffset,
    INLINE_KEY_VERSIONS, INLINE_SUBKEY_VERSIONS, INVALID_OFFSET,
};

/// Either an AA-tree child pair or, during blob reallocation, a single
/// scratch pointer into the in-flight transaction's per-key/per-subkey
/// map (§4.5 "scratch buffer via tag-union on child pointers").
#[derive(Clone, Copy)]
pub enum TreeLink {
    Children { left: BlockId, right: BlockId },
    Scratch(u64),
}

impl Default for TreeLink {
    fn default() -> TreeLink {
        TreeLink::Children {
            left: BlockId::NIL,
            right: BlockId::NIL,
        }
    }
}

/// Per-key state block (§3 "Key state block").
pub struct KeyStateBlock {
    pub key: KeyHandle,
    subscription: WriterCell<Option<KeySubscriptionHandle>>,
    tree_level: WriterCell<u8>,
    tree_link: WriterCell<TreeLink>,
    next: AtomicU32,
    inline_count: AtomicU8,
    inline_versions: [PublishedCell<(VersionOffset, u32)>; INLINE_KEY_VERSIONS],
    subkeys_list_head: AtomicU32,
    subkeys_tree_root: WriterCell<BlockId>,
}

impl KeyStateBlock {
    pub fn new(key: KeyHandle) -> KeyStateBlock {
        KeyStateBlock {
            key,
            subscription: WriterCell::new(None),
            tree_level: WriterCell::new(1),
            tree_link: WriterCell::new(TreeLink::default()),
            next: AtomicU32::new(BlockId::NIL.0),
            inline_count: AtomicU8::new(0),
            inline_versions: [
                PublishedCell::new((INVALID_OFFSET, 0)),
                PublishedCell::new((INVALID_OFFSET, 0)),
                PublishedCell::new((INVALID_OFFSET, 0)),
            ],
            subkeys_list_head: AtomicU32::new(BlockId::NIL.0),
            subkeys_tree_root: WriterCell::new(BlockId::NIL),
        }
    }

    // -- reader-visible list -------------------------------------------------

    #[inline]
    pub fn next(&self) -> BlockId {
        BlockId(self.next.load(Ordering::Acquire))
    }

    /// Writer-only: publish this block's successor. Must be called after
    /// every other write to this block has completed.
    #[inline]
    pub fn set_next(&self, next: BlockId) {
        self.next.store(next.0, Ordering::Release);
    }

    #[inline]
    pub fn subkeys_list_head(&self) -> BlockId {
        BlockId(self.subkeys_list_head.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_subkeys_list_head(&self, head: BlockId) {
        self.subkeys_list_head.store(head.0, Ordering::Release);
    }

    // -- inline version history ----------------------------------------------

    /// §4.2 `get_subkeys_count`: scan inline entries for the latest one at
    /// or before `version_offset`, defaulting to 0.
    pub fn get_subkeys_count(&self, version_offset: VersionOffset) -> u32 {
        let count = self.inline_count.load(Ordering::Acquire) as usize;
        for i in (0..count).rev() {
            let (offset, subkeys) = self.inline_versions[i].get();
            if offset <= version_offset {
                return subkeys;
            }
        }
        0
    }

    pub fn latest_subkeys_count(&self) -> u32 {
        let count = self.inline_count.load(Ordering::Acquire) as usize;
        if count == 0 {
            0
        } else {
            self.inline_versions[count - 1].get().1
        }
    }

    pub fn inline_len(&self) -> usize {
        self.inline_count.load(Ordering::Acquire) as usize
    }

    /// Raw `(offset, count)` tuple at inline slot `idx`, in original push
    /// order. Used when migrating inline history into a version block.
    pub fn nth_inline(&self, idx: usize) -> (VersionOffset, u32) {
        self.inline_versions[idx].get()
    }

    /// §4.2 `push_subkeys_count`: writer-only. Precondition: inline count
    /// `< INLINE_KEY_VERSIONS` and `count` differs from the latest pushed
    /// count (callers are expected to check `latest_subkeys_count`).
    pub fn push_subkeys_count(&self, version_offset: VersionOffset, count: u32) {
        let idx = self.inline_count.load(Ordering::Acquire) as usize;
        assert!(idx < INLINE_KEY_VERSIONS, "key state block inline array full");
        self.inline_versions[idx].set((version_offset, count));
        self.inline_count.store((idx + 1) as u8, Ordering::Release);
    }

    pub fn can_push_inline(&self) -> bool {
        (self.inline_count.load(Ordering::Acquire) as usize) < INLINE_KEY_VERSIONS
    }

    // -- writer-only metadata -------------------------------------------------

    pub fn subscription(&self) -> Option<KeySubscriptionHandle> {
        self.subscription.get()
    }

    pub fn set_subscription(&self, sub: Option<KeySubscriptionHandle>) {
        self.subscription.set(sub);
    }

    pub fn tree_level(&self) -> u8 {
        self.tree_level.get()
    }

    pub fn set_tree_level(&self, level: u8) {
        self.tree_level.set(level);
    }

    pub fn tree_link(&self) -> TreeLink {
        self.tree_link.get()
    }

    pub fn set_tree_link(&self, link: TreeLink) {
        self.tree_link.set(link);
    }

    pub fn subkeys_tree_root(&self) -> BlockId {
        self.subkeys_tree_root.get()
    }

    pub fn set_subkeys_tree_root(&self, root: BlockId) {
        self.subkeys_tree_root.set(root);
    }
}

/// Per-subkey state block (§3 "Subkey state block"). Stores the owning
/// key's handle unowned, purely to speed up equality checks during hash
/// probing (§9 "back-pointers that are not ownership").
pub struct SubkeyStateBlock {
    pub owner_key: KeyHandle,
    pub subkey: u64,
    subscription: WriterCell<Option<SubkeySubscriptionHandle>>,
    tree_level: WriterCell<u8>,
    tree_link: WriterCell<TreeLink>,
    next: AtomicU32,
    // anchor: marked version of inline slot 0. offset: signed distance
    // from anchor to inline slot 1's marked version, or INVALID_OFFSET.
    anchor: AtomicU64,
    offset: AtomicU32,
    payloads: [PublishedCell<Option<PayloadHandle>>; INLINE_SUBKEY_VERSIONS],
    has_anchor: AtomicU8,
}

impl SubkeyStateBlock {
    pub fn new(owner_key: KeyHandle, subkey: u64) -> SubkeyStateBlock {
        SubkeyStateBlock {
            owner_key,
            subkey,
            subscription: WriterCell::new(None),
            tree_level: WriterCell::new(1),
            tree_link: WriterCell::new(TreeLink::default()),
            next: AtomicU32::new(BlockId::NIL.0),
            anchor: AtomicU64::new(0),
            offset: AtomicU32::new(INVALID_OFFSET),
            payloads: [PublishedCell::new(None), PublishedCell::new(None)],
            has_anchor: AtomicU8::new(0),
        }
    }

    #[inline]
    pub fn next(&self) -> BlockId {
        BlockId(self.next.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_next(&self, next: BlockId) {
        self.next.store(next.0, Ordering::Release);
    }

    pub fn subscription(&self) -> Option<SubkeySubscriptionHandle> {
        self.subscription.get()
    }

    pub fn set_subscription(&self, sub: Option<SubkeySubscriptionHandle>) {
        self.subscription.set(sub);
    }

    pub fn tree_level(&self) -> u8 {
        self.tree_level.get()
    }

    pub fn set_tree_level(&self, level: u8) {
        self.tree_level.set(level);
    }

    pub fn tree_link(&self) -> TreeLink {
        self.tree_link.get()
    }

    pub fn set_tree_link(&self, link: TreeLink) {
        self.tree_link.set(link);
    }

    /// §4.2 `can_push`: true iff either inline slot is free and, for the
    /// second slot, the offset from the anchor fits in 32 bits.
    pub fn can_push(&self, new_version: u64, deleted: bool) -> bool {
        if self.has_anchor.load(Ordering::Acquire) == 0 {
            return true;
        }
        if self.offset.load(Ordering::Acquire) != INVALID_OFFSET {
            return false;
        }
        let anchor = self.anchor.load(Ordering::Acquire);
        let marked = mark_version(new_version, deleted);
        marked >= anchor && marked - anchor <= u32::MAX as u64
    }

    /// §4.2 `push_payload`: writer-only, requires `can_push`.
    pub fn push_payload(&self, new_version: u64, deleted: bool, payload: Option<PayloadHandle>) {
        let marked = mark_version(new_version, deleted);
        if self.has_anchor.load(Ordering::Acquire) == 0 {
            self.payloads[0].set(if deleted { None } else { payload });
            self.anchor.store(marked, Ordering::Release);
            self.has_anchor.store(1, Ordering::Release);
        } else {
            let anchor = self.anchor.load(Ordering::Acquire);
            let delta = (marked - anchor) as u32;
            self.payloads[1].set(if deleted { None } else { payload });
            self.offset.store(delta, Ordering::Release);
        }
    }

    /// §4.2 `get_versioned_payload`: returns `(version, payload)` for the
    /// latest value visible at or before `version`, or `None`.
    pub fn get_versioned_payload(&self, version: u64) -> Option<(u64, Option<PayloadHandle>)> {
        if self.has_anchor.load(Ordering::Acquire) == 0 {
            return None;
        }
        let anchor = self.anchor.load(Ordering::Acquire);
        let token = search_token(version);
        if anchor > token {
            return None;
        }

        let offset = self.offset.load(Ordering::Acquire);
        let second_marked = if offset_valid(offset) {
            Some(anchor + offset as u64)
        } else {
            None
        };

        let (marked, slot) = match second_marked {
            Some(m) if m <= token => (m, 1),
            _ => (anchor, 0),
        };
        let (version, deleted) = unmark_version(marked);
        if deleted {
            Some((version, None))
        } else {
            Some((version, self.payloads[slot].get()))
        }
    }

    /// Destructor-only: every `(version, payload)` pair currently stored
    /// inline, skipping deletions (which never held a payload).
    pub fn collect_all_payloads(&self) -> Vec<(u64, PayloadHandle)> {
        let mut out = Vec::with_capacity(INLINE_SUBKEY_VERSIONS);
        if self.has_anchor.load(Ordering::Acquire) == 0 {
            return out;
        }
        let anchor = self.anchor.load(Ordering::Acquire);
        let (v0, deleted0) = unmark_version(anchor);
        if !deleted0 {
            if let Some(p) = self.payloads[0].get() {
                out.push((v0, p));
            }
        }
        let offset = self.offset.load(Ordering::Acquire);
        if offset_valid(offset) {
            let (v1, deleted1) = unmark_version(anchor + offset as u64);
            if !deleted1 {
                if let Some(p) = self.payloads[1].get() {
                    out.push((v1, p));
                }
            }
        }
        out
    }

    /// Migration-only: every slot currently stored inline as
    /// `(version, deleted, payload)`, preserving the deletion bit.
    /// Unlike [`SubkeyStateBlock::collect_all_payloads`] (which the
    /// destructor uses to release payload handles and so has no need
    /// for deletion markers), a migration into a version block chain
    /// must carry every slot's full history forward, including a
    /// trailing deletion, or a snapshot reading an intermediate version
    /// would see a payload that had in fact already been deleted.
    pub fn collect_all_versions(&self) -> Vec<(u64, bool, Option<PayloadHandle>)> {
        let mut out = Vec::with_capacity(INLINE_SUBKEY_VERSIONS);
        if self.has_anchor.load(Ordering::Acquire) == 0 {
            return out;
        }
        let anchor = self.anchor.load(Ordering::Acquire);
        let (v0, deleted0) = unmark_version(anchor);
        out.push((v0, deleted0, if deleted0 { None } else { self.payloads[0].get() }));
        let offset = self.offset.load(Ordering::Acquire);
        if offset_valid(offset) {
            let (v1, deleted1) = unmark_version(anchor + offset as u64);
            out.push((v1, deleted1, if deleted1 { None } else { self.payloads[1].get() }));
        }
        out
    }
}
