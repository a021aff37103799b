//! Module `aatree` implements the writer-only AA-tree used both at the
//! blob level (keys) and per-key level (subkeys) (§4.5). Readers never
//! touch any of this: no tree field is ever read outside the writer
//! mutex, so `insert` is free to mutate levels and child links with
//! plain (non-atomic) writes via [`crate::cell::WriterCell`].
//!
//! This is the classic Arne Andersson insertion algorithm (skew, then
//! split, on the way back up the recursion), with one addition: each
//! call also tracks the in-order predecessor of the freshly inserted
//! node, which the caller uses to thread that node into the
//! reader-visible sorted list (§4.5 "the insertion additionally returns
//! a pointer to the predecessor in sorted order").

use crate::state_block::TreeLink;
use crate::util::BlockId;

/// Operations the tree needs on whatever state-block type it is
/// indexing (key blocks for the blob-level tree, subkey blocks for a
/// per-key tree). Implemented once per call site as a small closure
/// bundle rather than a trait object, since the two trees differ only
/// in which field accessors and comparator they close over.
pub struct AaOps<'a> {
    pub level: Box<dyn Fn(BlockId) -> u8 + 'a>,
    pub set_level: Box<dyn Fn(BlockId, u8) + 'a>,
    pub link: Box<dyn Fn(BlockId) -> TreeLink + 'a>,
    pub set_link: Box<dyn Fn(BlockId, TreeLink) + 'a>,
    /// Total order: is `a` strictly less than `b`?
    pub less: Box<dyn Fn(BlockId, BlockId) -> bool + 'a>,
}

fn children(ops: &AaOps, node: BlockId) -> (BlockId, BlockId) {
    match (ops.link)(node) {
        TreeLink::Children { left, right } => (left, right),
        TreeLink::Scratch(_) => panic!("aatree: node is in scratch-buffer mode"),
    }
}

fn set_children(ops: &AaOps, node: BlockId, left: BlockId, right: BlockId) {
    (ops.set_link)(node, TreeLink::Children { left, right });
}

/// Right-rotation that promotes a left child which has caught up to its
/// parent's level.
fn skew(ops: &AaOps, root: BlockId) -> BlockId {
    if root.is_nil() {
        return root;
    }
    let (left, right) = children(ops, root);
    if left.is_nil() || (ops.level)(left) != (ops.level)(root) {
        return root;
    }
    let (left_left, left_right) = children(ops, left);
    set_children(ops, root, left_right, right);
    set_children(ops, left, left_left, root);
    left
}

/// Left-rotation that increments the new subtree root's level once its
/// right-right grandchild has caught up.
fn split(ops: &AaOps, root: BlockId) -> BlockId {
    if root.is_nil() {
        return root;
    }
    let (left, right) = children(ops, root);
    if right.is_nil() {
        return root;
    }
    let (right_left, right_right) = children(ops, right);
    if right_right.is_nil() || (ops.level)(right_right) != (ops.level)(root) {
        return root;
    }
    set_children(ops, root, left, right_left);
    set_children(ops, right, root, right_right);
    (ops.set_level)(right, (ops.level)(right) + 1);
    right
}

/// Insert `node` (a freshly allocated, childless, level-1 leaf) into the
/// tree rooted at `root`. Returns `(new_root, predecessor)`, where
/// `predecessor` is the in-order predecessor of `node` within the
/// resulting tree, or `None` if `node` is now the smallest element.
pub fn insert(ops: &AaOps, root: BlockId, node: BlockId) -> (BlockId, Option<BlockId>) {
    if root.is_nil() {
        return (node, None);
    }

    let (left, right) = children(ops, root);
    let (new_root, predecessor) = if (ops.less)(node, root) {
        let (new_left, pred) = insert(ops, left, node);
        set_children(ops, root, new_left, right);
        (root, pred)
    } else {
        let (new_right, pred) = insert(ops, right, node);
        set_children(ops, root, left, new_right);
        // No left-side predecessor was found deeper down: `root` itself
        // is the predecessor, since we just took a right turn from it.
        (root, pred.or(Some(root)))
    };

    let new_root = skew(ops, new_root);
    let new_root = split(ops, new_root);
    (new_root, predecessor)
}
