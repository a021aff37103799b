//! Module `transaction` implements the mutation builder described in
//! §4.6: a single-threaded, host-owned batch of `put`/`delete`/`require_*`
//! operations that `storage::Storage::apply_transaction` later consumes
//! atomically.
//!
//! The builder's own bookkeeping (one entry per distinct key, one entry
//! per distinct subkey within it) is a small linear `Vec` rather than a
//! `BTreeMap`: keys are only ordered by the host-supplied
//! [`Behavior::keys_less`], which is not a `std::cmp::Ord` the standard
//! collections can use, and a single transaction is expected to touch a
//! handful of keys at most.

use std::sync::Arc;

use crate::behavior::{Behavior, KeyHandle, PayloadHandle};

#[derive(Clone, Copy)]
pub(crate) enum SubkeyAction {
    None,
    Put(PayloadHandle),
    Delete,
}

#[derive(Clone, Copy)]
pub(crate) enum Requirement {
    None,
    Payload(PayloadHandle),
    Missing,
}

pub(crate) struct SubkeyTxn {
    pub subkey: u64,
    pub action: SubkeyAction,
    pub requirement: Requirement,
}

pub(crate) struct KeyTxn {
    pub key: KeyHandle,
    pub clear_before_transaction: bool,
    pub required_subkeys_count: Option<u32>,
    pub subkeys: Vec<SubkeyTxn>,
}

/// A batch of operations against one or more keys, built up with `put`,
/// `delete`, `clear_before_transaction`, `require_payload`,
/// `require_missing_subkey` and `require_subkeys_count`, then consumed
/// whole by `Storage::apply_transaction` (§4.6/§4.7).
///
/// Every `KeyHandle`/`PayloadHandle` passed into a builder method is
/// consumed: the transaction either keeps exactly one owned copy of it
/// (releasing a caller's redundant duplicate when the same key is
/// mentioned twice) or releases it immediately once it has served its
/// purpose (a superseded value, or a `require_payload` comparison).
/// Dropping a `Transaction` without applying it releases everything it
/// still owns.
pub struct Transaction {
    behavior: Arc<dyn Behavior>,
    pub(crate) keys: Vec<KeyTxn>,
}

impl Transaction {
    pub fn new(behavior: Arc<dyn Behavior>) -> Transaction {
        Transaction {
            behavior,
            keys: Vec::new(),
        }
    }

    fn key_index(&mut self, key: KeyHandle) -> usize {
        if let Some(i) = self
            .keys
            .iter()
            .position(|k| self.behavior.keys_equal(k.key, key))
        {
            self.behavior.release_key(key);
            i
        } else {
            self.keys.push(KeyTxn {
                key,
                clear_before_transaction: false,
                required_subkeys_count: None,
                subkeys: Vec::new(),
            });
            self.keys.len() - 1
        }
    }

    fn subkey_index(entry: &mut KeyTxn, subkey: u64) -> usize {
        if let Some(i) = entry.subkeys.iter().position(|s| s.subkey == subkey) {
            i
        } else {
            entry.subkeys.push(SubkeyTxn {
                subkey,
                action: SubkeyAction::None,
                requirement: Requirement::None,
            });
            entry.subkeys.len() - 1
        }
    }

    /// Write `payload` for `(key, subkey)`. Supersedes any earlier `put`
    /// or `delete` queued in this transaction for the same `(key,
    /// subkey)`, releasing the superseded payload if there was one.
    pub fn put(&mut self, key: KeyHandle, subkey: u64, payload: PayloadHandle) {
        let ki = self.key_index(key);
        let entry = &mut self.keys[ki];
        let si = Transaction::subkey_index(entry, subkey);
        let s = &mut entry.subkeys[si];
        if let SubkeyAction::Put(old) = s.action {
            self.behavior.release_payload(old);
        }
        s.action = SubkeyAction::Put(payload);
    }

    /// Delete `(key, subkey)`. Under a pending `clear_before_transaction`
    /// for `key`, this is folded into that sweep instead of recorded as
    /// a separate entry whenever that leaves nothing else to track.
    pub fn delete(&mut self, key: KeyHandle, subkey: u64) {
        let ki = self.key_index(key);
        let entry = &mut self.keys[ki];
        if entry.clear_before_transaction {
            if let Some(pos) = entry.subkeys.iter().position(|s| s.subkey == subkey) {
                let s = &entry.subkeys[pos];
                let bare = matches!(s.action, SubkeyAction::Delete | SubkeyAction::None)
                    && matches!(s.requirement, Requirement::None);
                if bare {
                    entry.subkeys.remove(pos);
                } else {
                    if let SubkeyAction::Put(old) = entry.subkeys[pos].action {
                        self.behavior.release_payload(old);
                    }
                    entry.subkeys[pos].action = SubkeyAction::Delete;
                }
            }
            return;
        }
        let si = Transaction::subkey_index(entry, subkey);
        let s = &mut entry.subkeys[si];
        if let SubkeyAction::Put(old) = s.action {
            self.behavior.release_payload(old);
        }
        s.action = SubkeyAction::Delete;
    }

    /// Mark `key` so that, at apply time, every subkey currently present
    /// and not otherwise mentioned in this transaction is implicitly
    /// deleted (§4.6/§4.7).
    pub fn clear_before_transaction(&mut self, key: KeyHandle) {
        let ki = self.key_index(key);
        let entry = &mut self.keys[ki];
        entry.clear_before_transaction = true;
        entry.subkeys.retain(|s| {
            let bare = matches!(s.action, SubkeyAction::Delete | SubkeyAction::None)
                && matches!(s.requirement, Requirement::None);
            !bare
        });
    }

    /// Require that `(key, subkey)`'s current payload compares equal to
    /// `payload` (via `Behavior::payloads_equal`) or the whole
    /// transaction is applied with no effect. `payload` is always
    /// released once the comparison has been made.
    pub fn require_payload(&mut self, key: KeyHandle, subkey: u64, payload: PayloadHandle) {
        let ki = self.key_index(key);
        let entry = &mut self.keys[ki];
        let si = Transaction::subkey_index(entry, subkey);
        let s = &mut entry.subkeys[si];
        if let Requirement::Payload(old) = s.requirement {
            self.behavior.release_payload(old);
        }
        s.requirement = Requirement::Payload(payload);
    }

    /// Require that `(key, subkey)` currently has no payload.
    pub fn require_missing_subkey(&mut self, key: KeyHandle, subkey: u64) {
        let ki = self.key_index(key);
        let entry = &mut self.keys[ki];
        let si = Transaction::subkey_index(entry, subkey);
        let s = &mut entry.subkeys[si];
        if let Requirement::Payload(old) = s.requirement {
            self.behavior.release_payload(old);
        }
        s.requirement = Requirement::Missing;
    }

    /// Require that `key` currently has exactly `count` present subkeys.
    pub fn require_subkeys_count(&mut self, key: KeyHandle, count: u32) {
        let ki = self.key_index(key);
        self.keys[ki].required_subkeys_count = Some(count);
    }

    /// Hand the built-up entries to the caller, leaving this
    /// transaction empty (so its `Drop` becomes a no-op). Used by
    /// `Storage::apply_transaction`, which is the only legitimate
    /// consumer: everything returned here must be given a final
    /// disposition (applied, merged, or released) by the caller.
    pub(crate) fn take_keys(&mut self) -> Vec<KeyTxn> {
        std::mem::take(&mut self.keys)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        for entry in self.keys.drain(..) {
            for s in entry.subkeys {
                if let SubkeyAction::Put(p) = s.action {
                    self.behavior.release_payload(p);
                }
                if let Requirement::Payload(p) = s.requirement {
                    self.behavior.release_payload(p);
                }
            }
            self.behavior.release_key(entry.key);
        }
    }
}
