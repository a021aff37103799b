//! Module `blob` implements the versioned backing store described in
//! §2/§3/§4.1: a fixed-capacity index plus a fixed-capacity data arena,
//! both sized once at blob construction and never relocated afterward
//! so that every pointer handed to a reader stays valid for the life of
//! the blob (§9 "raw memory with indices instead of pointer graphs").
//!
//! Simplification from the source design (recorded in `DESIGN.md`):
//! rather than one bidirectionally-bump-allocated byte region (state
//! and version blocks from the high end, per-version refcounts from the
//! low end), this implementation keeps the block arena and the refcount
//! array as two independently sized, independently bump-allocated
//! pools. The observable exhaustion contract is unchanged: `add_version`
//! fails when the refcount pool is full, block allocation fails when
//! the arena is full.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, info};

use crate::aatree::{self, AaOps};
use crate::behavior::{Behavior, KeyHandle, PayloadHandle};
use crate::cell::WriterCell;
use crate::index_block::{IndexBlock, SlotKind};
use crate::refcount::VersionRefcounts;
use crate::state_block::{KeyStateBlock, SubkeyStateBlock, TreeLink};
use crate::util::{
    combine_hash, next_pow2, split_hash, BlockId, VersionOffset, INVALID_OFFSET,
};
use crate::version_block::{KeyVersionBlock, SubkeyVersionBlock};

pub enum BlockSlot {
    Free,
    KeyState(KeyStateBlock),
    SubkeyState(SubkeyStateBlock),
    KeyVersion(KeyVersionBlock),
    SubkeyVersion(SubkeyVersionBlock),
}

impl BlockSlot {
    fn as_key_state(&self) -> &KeyStateBlock {
        match self {
            BlockSlot::KeyState(b) => b,
            _ => panic!("blob: expected key state block"),
        }
    }
    fn as_subkey_state(&self) -> &SubkeyStateBlock {
        match self {
            BlockSlot::SubkeyState(b) => b,
            _ => panic!("blob: expected subkey state block"),
        }
    }
    fn as_key_version(&self) -> &KeyVersionBlock {
        match self {
            BlockSlot::KeyVersion(b) => b,
            _ => panic!("blob: expected key version block"),
        }
    }
    fn as_subkey_version(&self) -> &SubkeyVersionBlock {
        match self {
            BlockSlot::SubkeyVersion(b) => b,
            _ => panic!("blob: expected subkey version block"),
        }
    }
}

/// Fixed-capacity, append-only arena of data blocks. `UnsafeCell` lets
/// the writer publish a slot's contents once (`Free` -> populated)
/// ahead of making any pointer to it reachable; after that the variant
/// itself never changes, only fields inside it (which manage their own
/// synchronization).
struct Arena {
    slots: Box<[UnsafeCell<BlockSlot>]>,
}

unsafe impl Sync for Arena {}
unsafe impl Send for Arena {}

impl Arena {
    fn with_capacity(capacity: usize) -> Arena {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(UnsafeCell::new(BlockSlot::Free));
        }
        Arena {
            slots: slots.into_boxed_slice(),
        }
    }

    fn get(&self, id: BlockId) -> &BlockSlot {
        unsafe { &*self.slots[id.0 as usize].get() }
    }

    /// Writer-only: populate a still-`Free` slot. Must happen before
    /// `id` is published to any reader-reachable location.
    fn publish(&self, id: BlockId, slot: BlockSlot) {
        unsafe { *self.slots[id.0 as usize].get() = slot }
    }
}

/// A view returned by `find_key_state`/`find_subkey_state`: the located
/// state block plus, for the writer, the index slot it lives in.
pub struct KeyStateView {
    pub block: BlockId,
    pub slot_index: u32,
    pub slot: u8,
}

pub struct SubkeyStateView {
    pub block: BlockId,
    pub slot_index: u32,
    pub slot: u8,
}

/// The versioned, block-structured backing store (§2/§3).
pub struct Blob {
    pub base_version: u64,

    is_mutable: std::sync::atomic::AtomicBool,
    stored_versions_count: AtomicU32,
    snapshot_aggregate: AtomicU32,
    keys_count: AtomicU32,
    subkeys_count: AtomicU32,

    keys_list_head: AtomicU32,
    keys_tree_root: WriterCell<BlockId>,

    index: Box<[IndexBlock]>,
    index_mask: u32,

    arena: Arena,
    data_capacity: u32,
    next_data_block: WriterCell<u32>,

    refcounts: VersionRefcounts,

    /// Pages this blob holds from `Behavior::allocate_pages`, returned
    /// via `free_pages` exactly once, from `destroy`.
    pages: u32,
}

impl Blob {
    pub fn new(
        base_version: u64,
        index_blocks: u32,
        data_blocks: u32,
        max_versions: u32,
        pages: u32,
    ) -> Blob {
        let index_blocks = next_pow2(index_blocks.max(1));
        let mut index = Vec::with_capacity(index_blocks as usize);
        for _ in 0..index_blocks {
            index.push(IndexBlock::new());
        }
        info!(
            "blob: created base_version={} index_blocks={} data_blocks={} max_versions={} pages={}",
            base_version, index_blocks, data_blocks, max_versions, pages
        );
        Blob {
            base_version,
            is_mutable: std::sync::atomic::AtomicBool::new(true),
            stored_versions_count: AtomicU32::new(0),
            snapshot_aggregate: AtomicU32::new(0),
            keys_count: AtomicU32::new(0),
            subkeys_count: AtomicU32::new(0),
            keys_list_head: AtomicU32::new(BlockId::NIL.0),
            keys_tree_root: WriterCell::new(BlockId::NIL),
            index: index.into_boxed_slice(),
            index_mask: index_blocks - 1,
            arena: Arena::with_capacity(data_blocks as usize),
            data_capacity: data_blocks,
            next_data_block: WriterCell::new(0),
            refcounts: VersionRefcounts::with_capacity(max_versions as usize),
            pages,
        }
    }

    #[inline]
    pub fn is_mutable(&self) -> bool {
        self.is_mutable.load(Ordering::Acquire)
    }

    pub fn set_immutable(&self) {
        self.is_mutable.store(false, Ordering::Release);
        debug!("blob: marked immutable at version {}", self.base_version);
    }

    #[inline]
    pub fn stored_versions_count(&self) -> u32 {
        self.stored_versions_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn keys_count(&self) -> u32 {
        self.keys_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn subkeys_count(&self) -> u32 {
        self.subkeys_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn keys_list_head(&self) -> BlockId {
        BlockId(self.keys_list_head.load(Ordering::Acquire))
    }

    #[inline]
    pub fn refcounts(&self) -> &VersionRefcounts {
        &self.refcounts
    }

    pub fn key_block(&self, id: BlockId) -> &KeyStateBlock {
        self.arena.get(id).as_key_state()
    }

    pub fn subkey_block(&self, id: BlockId) -> &SubkeyStateBlock {
        self.arena.get(id).as_subkey_state()
    }

    pub fn key_version_block(&self, id: BlockId) -> &KeyVersionBlock {
        self.arena.get(id).as_key_version()
    }

    pub fn subkey_version_block(&self, id: BlockId) -> &SubkeyVersionBlock {
        self.arena.get(id).as_subkey_version()
    }

    fn index_slot(&self, block_idx: u32, slot: u8) -> &crate::index_block::IndexSlot {
        self.index[block_idx as usize].slot(slot as usize)
    }

    // -- hash probing (§4.1 "Search algorithm") ------------------------------

    fn probe_key(&self, behavior: &dyn Behavior, key: KeyHandle) -> Option<KeyStateView> {
        let (offset_hash, slot_hash) = split_hash(behavior.hash_key(key));
        self.probe(SlotKind::Key, offset_hash, slot_hash, |block| {
            behavior.keys_equal(self.arena.get(block).as_key_state().key, key)
        })
        .map(|(block, slot_index, slot)| KeyStateView {
            block,
            slot_index,
            slot,
        })
    }

    fn probe_subkey(
        &self,
        behavior: &dyn Behavior,
        key: KeyHandle,
        subkey: u64,
    ) -> Option<SubkeyStateView> {
        let combined = combine_hash(behavior.hash_key(key), subkey);
        let (offset_hash, slot_hash) = split_hash(combined);
        self.probe(SlotKind::Subkey, offset_hash, slot_hash, |block| {
            let b = self.arena.get(block).as_subkey_state();
            b.subkey == subkey && behavior.keys_equal(b.owner_key, key)
        })
        .map(|(block, slot_index, slot)| SubkeyStateView {
            block,
            slot_index,
            slot,
        })
    }

    fn probe(
        &self,
        kind: SlotKind,
        offset_hash: u32,
        slot_hash: u8,
        eq: impl Fn(BlockId) -> bool,
    ) -> Option<(BlockId, u32, u8)> {
        let mut block_idx = offset_hash & self.index_mask;
        let mut chained = false;
        loop {
            let index_block = &self.index[block_idx as usize];
            for slot in index_block.occupied_slots(kind) {
                if index_block.slot_hash(slot) == slot_hash {
                    let state_block = index_block.slot(slot).state_block();
                    if !state_block.is_nil() && eq(state_block) {
                        return Some((state_block, block_idx, slot as u8));
                    }
                }
            }
            if !index_block.overflowed_here() && !(chained && index_block.overflowed_before()) {
                return None;
            }
            chained = true;
            block_idx = (block_idx + 1) & self.index_mask;
        }
    }

    pub fn find_key_state(&self, behavior: &dyn Behavior, key: KeyHandle) -> Option<KeyStateView> {
        self.probe_key(behavior, key)
    }

    pub fn find_subkey_state(
        &self,
        behavior: &dyn Behavior,
        key: KeyHandle,
        subkey: u64,
    ) -> Option<SubkeyStateView> {
        self.probe_subkey(behavior, key, subkey)
    }

    pub fn subkeys_count_for(&self, version_offset: VersionOffset, view: &KeyStateView) -> u32 {
        let key_block = self.key_block(view.block);
        let version_block = self.index_slot(view.slot_index, view.slot).version_block();
        if version_block.is_nil() {
            key_block.get_subkeys_count(version_offset)
        } else {
            self.query_key_version_chain(version_block, version_offset)
        }
    }

    pub fn payload_for(
        &self,
        version: u64,
        view: &SubkeyStateView,
    ) -> Option<PayloadHandle> {
        let subkey_block = self.subkey_block(view.block);
        let version_block = self.index_slot(view.slot_index, view.slot).version_block();
        let result = if version_block.is_nil() {
            subkey_block.get_versioned_payload(version)
        } else {
            self.query_subkey_version_chain(version_block, version)
        };
        result.and_then(|(_, payload)| payload)
    }

    fn query_key_version_chain(&self, head: BlockId, version_offset: VersionOffset) -> u32 {
        // Chain nodes are appended in increasing-version order; the
        // first node whose smallest offset is <= the query and which
        // actually contains a matching entry wins. Linear walk is fine:
        // chains are short relative to inline capacity amortization.
        let mut best = 0u32;
        let mut cur = head;
        while !cur.is_nil() {
            let block = self.key_version_block(cur);
            if block.size() > 0 {
                let q = block.query(version_offset);
                let (first_offset, _) = block.entry(0);
                if first_offset <= version_offset {
                    best = q;
                }
            }
            cur = block.next_block();
        }
        best
    }

    fn query_subkey_version_chain(
        &self,
        head: BlockId,
        version: u64,
    ) -> Option<(u64, Option<PayloadHandle>)> {
        let mut result = None;
        let mut cur = head;
        while !cur.is_nil() {
            let block = self.subkey_version_block(cur);
            if let Some(r) = block.get_versioned_payload(version) {
                result = Some(r);
            }
            cur = block.next_block();
        }
        result
    }

    // -- mutating-only operations (§4.1) -------------------------------------

    pub fn available_data_blocks(&self) -> u32 {
        self.data_capacity - self.next_data_block.get()
    }

    pub fn allocate_data_block(&self, slot: BlockSlot) -> Option<BlockId> {
        let next = self.next_data_block.get();
        if next >= self.data_capacity {
            return None;
        }
        let id = BlockId(next);
        self.arena.publish(id, slot);
        self.next_data_block.set(next + 1);
        Some(id)
    }

    pub fn can_insert_state_blocks(&self, n: u32) -> bool {
        self.available_data_blocks() >= n
    }

    /// §4.1 `add_version`: fails if the next offset would be the
    /// reserved sentinel or the refcount pool has no room left.
    pub fn add_version(&self) -> bool {
        let current = self.stored_versions_count.load(Ordering::Acquire);
        if current as u64 >= (INVALID_OFFSET as u64) {
            return false;
        }
        if current as usize >= self.refcounts.capacity() {
            return false;
        }
        self.refcounts.init(current);
        self.stored_versions_count.store(current + 1, Ordering::Release);
        self.snapshot_aggregate.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Roll back a version added by `add_version` when phase 1 aborts
    /// before publishing a snapshot on it (§4.7 phase 2).
    pub fn rollback_last_version(&self) {
        let current = self.stored_versions_count.load(Ordering::Acquire);
        debug_assert!(current > 0);
        self.stored_versions_count.store(current - 1, Ordering::Release);
        self.snapshot_aggregate.fetch_sub(1, Ordering::AcqRel);
    }

    /// A version just died (its refcount reached zero). Returns `true`
    /// iff the blob's snapshot aggregate also reached zero, meaning the
    /// blob is now structurally dead and should be destroyed.
    pub fn note_version_died(&self) -> bool {
        self.snapshot_aggregate.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn set_keys_count(&self, n: u32) {
        self.keys_count.store(n, Ordering::Release);
    }

    pub fn set_subkeys_count(&self, n: u32) {
        self.subkeys_count.store(n, Ordering::Release);
    }

    pub fn keys_tree_root(&self) -> BlockId {
        self.keys_tree_root.get()
    }

    /// Writer-only: allocate a key state block, insert it into the
    /// writer-only AA-tree, and publish it to the reader-visible sorted
    /// list (§4.5: plain write of the new node's `next`, then a
    /// release-store of the predecessor's or the list head's `next`).
    pub fn insert_key_block(&self, behavior: &dyn Behavior, key: KeyHandle) -> Option<BlockId> {
        let id = self.allocate_data_block(BlockSlot::KeyState(KeyStateBlock::new(key)))?;

        let ops = self.key_tree_ops(behavior);
        let (new_root, predecessor) = aatree::insert(&ops, self.keys_tree_root.get(), id);
        self.keys_tree_root.set(new_root);

        let new_block = self.key_block(id);
        match predecessor {
            Some(pred) => {
                let pred_block = self.key_block(pred);
                new_block.set_next(pred_block.next());
                pred_block.set_next(id);
            }
            None => {
                new_block.set_next(self.keys_list_head());
                self.keys_list_head.store(id.0, Ordering::Release);
            }
        }

        let (offset_hash, slot_hash) = split_hash(behavior.hash_key(key));
        self.index_insert(SlotKind::Key, offset_hash, slot_hash, id, BlockId::NIL);
        Some(id)
    }

    /// Writer-only: same as `insert_key_block` but for a subkey under an
    /// already-resolved key block.
    pub fn insert_subkey_block(
        &self,
        behavior: &dyn Behavior,
        key_block: BlockId,
        key: KeyHandle,
        subkey: u64,
    ) -> Option<BlockId> {
        let id =
            self.allocate_data_block(BlockSlot::SubkeyState(SubkeyStateBlock::new(key, subkey)))?;

        let kb = self.key_block(key_block);
        let ops = self.subkey_tree_ops();
        let (new_root, predecessor) = aatree::insert(&ops, kb.subkeys_tree_root(), id);
        kb.set_subkeys_tree_root(new_root);

        let new_block = self.subkey_block(id);
        match predecessor {
            Some(pred) => {
                let pred_block = self.subkey_block(pred);
                new_block.set_next(pred_block.next());
                pred_block.set_next(id);
            }
            None => {
                new_block.set_next(kb.subkeys_list_head());
                kb.set_subkeys_list_head(id);
            }
        }

        let combined = combine_hash(behavior.hash_key(key), subkey);
        let (offset_hash, slot_hash) = split_hash(combined);
        self.index_insert(SlotKind::Subkey, offset_hash, slot_hash, id, BlockId::NIL);
        Some(id)
    }

    fn index_insert(
        &self,
        kind: SlotKind,
        offset_hash: u32,
        slot_hash: u8,
        state_block: BlockId,
        version_block: BlockId,
    ) {
        let mut block_idx = offset_hash & self.index_mask;
        let mut chained_from_before = false;
        loop {
            let index_block = &self.index[block_idx as usize];
            if index_block
                .try_insert(kind, slot_hash, state_block, version_block)
                .is_some()
            {
                return;
            }
            index_block.mark_overflowed(chained_from_before);
            chained_from_before = true;
            block_idx = (block_idx + 1) & self.index_mask;
        }
    }

    /// Writer-only: ensure the key state block at `view` can accept one
    /// more pushed version, allocating a fresh key version block chain
    /// (copying every still-alive inline entry) if the inline capacity is
    /// exhausted. Returns `false` if allocation was needed but failed.
    pub fn reserve_key_version(&self, view: &KeyStateView) -> bool {
        let key_block = self.key_block(view.block);
        let slot = self.index_slot(view.slot_index, view.slot);
        let existing_chain = slot.version_block();

        if !existing_chain.is_nil() {
            return self.reserve_key_chain_capacity(existing_chain);
        }
        if key_block.can_push_inline() {
            return true;
        }

        // Inline capacity exhausted: migrate to a version block chain.
        let new_head = match self.allocate_data_block(BlockSlot::KeyVersion(KeyVersionBlock::first()))
        {
            Some(id) => id,
            None => return false,
        };
        let head_block = self.key_version_block(new_head);
        // Copy inline history forward in original order.
        for i in 0..key_block.inline_len() {
            let tuple = key_block.nth_inline(i);
            if !head_block.push(tuple.0, tuple.1) {
                return false;
            }
        }
        slot.set_version_block(new_head);
        self.reserve_key_chain_capacity(new_head)
    }

    fn reserve_key_chain_capacity(&self, head: BlockId) -> bool {
        let mut cur = head;
        loop {
            let block = self.key_version_block(cur);
            if !block.is_full() {
                return true;
            }
            let next = block.next_block();
            if next.is_nil() {
                let new_block =
                    match self.allocate_data_block(BlockSlot::KeyVersion(KeyVersionBlock::extension()))
                    {
                        Some(id) => id,
                        None => return false,
                    };
                block.set_next_block(new_block);
                return true;
            }
            cur = next;
        }
    }

    /// Writer-only: push `(version_offset, count)` onto the key's version
    /// history, whether inline or via its chain. Assumes
    /// `reserve_key_version` already guaranteed capacity.
    pub fn push_key_version(&self, view: &KeyStateView, version_offset: VersionOffset, count: u32) {
        let key_block = self.key_block(view.block);
        let slot = self.index_slot(view.slot_index, view.slot);
        let chain = slot.version_block();
        if chain.is_nil() {
            key_block.push_subkeys_count(version_offset, count);
        } else {
            let mut cur = chain;
            loop {
                let block = self.key_version_block(cur);
                if block.push(version_offset, count) {
                    return;
                }
                cur = block.next_block();
                debug_assert!(!cur.is_nil(), "reserve_key_version should have prepared room");
            }
        }
    }

    /// Writer-only: ensure the subkey state block at `view` can accept
    /// one more pushed version, migrating to / extending a subkey
    /// version block chain as needed.
    pub fn reserve_subkey_version(
        &self,
        view: &SubkeyStateView,
        new_version: u64,
        deleted: bool,
    ) -> bool {
        let subkey_block = self.subkey_block(view.block);
        let slot = self.index_slot(view.slot_index, view.slot);
        let existing_chain = slot.version_block();

        if !existing_chain.is_nil() {
            return self.reserve_subkey_chain_capacity(existing_chain, new_version, deleted);
        }
        if subkey_block.can_push(new_version, deleted) {
            return true;
        }

        let new_head =
            match self.allocate_data_block(BlockSlot::SubkeyVersion(SubkeyVersionBlock::first())) {
                Some(id) => id,
                None => return false,
            };
        let head_block = self.subkey_version_block(new_head);
        for (version, deleted, payload) in subkey_block.collect_all_versions() {
            if !head_block.push(version, deleted, payload) {
                return false;
            }
        }
        slot.set_version_block(new_head);
        self.reserve_subkey_chain_capacity(new_head, new_version, deleted)
    }

    fn reserve_subkey_chain_capacity(&self, head: BlockId, new_version: u64, deleted: bool) -> bool {
        let mut cur = head;
        loop {
            let block = self.subkey_version_block(cur);
            let marked = crate::util::mark_version(new_version, deleted);
            if block.can_append(marked) {
                return true;
            }
            block.seal();
            let next = block.next_block();
            if next.is_nil() {
                let new_block = match self
                    .allocate_data_block(BlockSlot::SubkeyVersion(SubkeyVersionBlock::extension()))
                {
                    Some(id) => id,
                    None => return false,
                };
                self.subkey_version_block(new_block).set_previous(cur);
                block.set_next_block(new_block);
                return true;
            }
            cur = next;
        }
    }

    pub fn push_subkey_version(
        &self,
        view: &SubkeyStateView,
        new_version: u64,
        deleted: bool,
        payload: Option<PayloadHandle>,
    ) {
        let subkey_block = self.subkey_block(view.block);
        let slot = self.index_slot(view.slot_index, view.slot);
        let chain = slot.version_block();
        if chain.is_nil() {
            subkey_block.push_payload(new_version, deleted, payload);
        } else {
            let mut cur = chain;
            loop {
                let block = self.subkey_version_block(cur);
                if block.push(new_version, deleted, payload) {
                    return;
                }
                cur = block.next_block();
                debug_assert!(!cur.is_nil(), "reserve_subkey_version should have prepared room");
            }
        }
    }

    fn key_tree_ops<'a>(&'a self, behavior: &'a dyn Behavior) -> AaOps<'a> {
        AaOps {
            level: Box::new(move |id| self.key_block(id).tree_level()),
            set_level: Box::new(move |id, l| self.key_block(id).set_tree_level(l)),
            link: Box::new(move |id| self.key_block(id).tree_link()),
            set_link: Box::new(move |id, link| self.key_block(id).set_tree_link(link)),
            less: Box::new(move |a, b| {
                behavior.keys_less(self.key_block(a).key, self.key_block(b).key)
            }),
        }
    }

    fn subkey_tree_ops<'a>(&'a self) -> AaOps<'a> {
        AaOps {
            level: Box::new(move |id| self.subkey_block(id).tree_level()),
            set_level: Box::new(move |id, l| self.subkey_block(id).set_tree_level(l)),
            link: Box::new(move |id| self.subkey_block(id).tree_link()),
            set_link: Box::new(move |id, link| self.subkey_block(id).set_tree_link(link)),
            less: Box::new(move |a, b| self.subkey_block(a).subkey < self.subkey_block(b).subkey),
        }
    }

    /// Writer-only: flip a state block into scratch-buffer mode, storing
    /// a 64-bit pointer to its corresponding transaction-map entry in
    /// place of its (otherwise now-useless, since the blob is becoming
    /// immutable) tree child pointers (§4.5/§9).
    pub fn enter_scratch_mode_key(&self, id: BlockId, scratch: u64) {
        self.key_block(id).set_tree_link(TreeLink::Scratch(scratch));
    }

    pub fn enter_scratch_mode_subkey(&self, id: BlockId, scratch: u64) {
        self.subkey_block(id).set_tree_link(TreeLink::Scratch(scratch));
    }

    pub fn scratch_of_key(&self, id: BlockId) -> Option<u64> {
        match self.key_block(id).tree_link() {
            TreeLink::Scratch(s) => Some(s),
            TreeLink::Children { .. } => None,
        }
    }

    pub fn scratch_of_subkey(&self, id: BlockId) -> Option<u64> {
        match self.subkey_block(id).tree_link() {
            TreeLink::Scratch(s) => Some(s),
            TreeLink::Children { .. } => None,
        }
    }

    /// §3 "Lifecycles": called exactly once, when this blob's snapshot
    /// aggregate has reached zero, i.e. no live snapshot anywhere
    /// references any of its versions any longer. Walks every state
    /// block in two passes (subkeys before keys, so a payload
    /// destructor could in principle still observe the owning key
    /// handle) and releases every payload, subscription and key handle
    /// exactly once.
    ///
    /// Every version-block chain in this implementation only ever grows
    /// by appending extension nodes (never by migrating to a second,
    /// independent chain), so the authoritative history for a subkey is
    /// always reachable via a single forward walk: either its inline
    /// fields, if no chain was ever allocated, or its chain, never
    /// both. This is what makes a single pass here safe from
    /// double-releasing a payload that was copied forward during a
    /// chain migration.
    pub fn destroy(&self, behavior: &dyn Behavior) {
        debug!("blob: destroying base_version={}", self.base_version);
        let mut key_id = self.keys_list_head();
        while !key_id.is_nil() {
            let key_block = self.key_block(key_id);
            let mut sub_id = key_block.subkeys_list_head();
            while !sub_id.is_nil() {
                let sub_block = self.subkey_block(sub_id);
                self.release_subkey_payloads(behavior, sub_block);
                if let Some(sub) = sub_block.subscription() {
                    behavior.release_subkey_subscription(sub);
                }
                sub_id = sub_block.next();
            }
            key_id = key_block.next();
        }

        let mut key_id = self.keys_list_head();
        while !key_id.is_nil() {
            let key_block = self.key_block(key_id);
            if let Some(sub) = key_block.subscription() {
                behavior.release_key_subscription(sub);
            }
            behavior.release_key(key_block.key);
            key_id = key_block.next();
        }

        if self.pages > 0 {
            behavior.free_pages(self.pages);
        }
    }

    fn release_subkey_payloads(&self, behavior: &dyn Behavior, sub_block: &SubkeyStateBlock) {
        let view = match self.find_subkey_state(behavior, sub_block.owner_key, sub_block.subkey) {
            Some(v) => v,
            None => return,
        };
        let version_block = self.index_slot(view.slot_index, view.slot).version_block();
        if version_block.is_nil() {
            for (_, payload) in sub_block.collect_all_payloads() {
                behavior.release_payload(payload);
            }
        } else {
            let mut cur = version_block;
            while !cur.is_nil() {
                let block = self.subkey_version_block(cur);
                let mut out = Vec::new();
                block.append_payloads(&mut out);
                for (_, payload) in out {
                    behavior.release_payload(payload);
                }
                cur = block.next_block();
            }
        }
    }
}
