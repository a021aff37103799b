//! Module `apply` implements the per-transaction validation and
//! in-place mutation phases of §4.7 ("Phase 1: in-place"). Blob
//! reallocation (§4.7 "Phase 2") lives in [`crate::merge`]; the two
//! share the [`KeyPrep`]/[`SubkeyPrep`] plan this module builds in
//! [`prepare`].

use crate::behavior::{Behavior, PayloadHandle};
use crate::blob::{Blob, KeyStateView, SubkeyStateView};
use crate::transaction::{KeyTxn, Requirement, SubkeyAction};
use crate::util::VersionOffset;

#[derive(Clone, Copy)]
pub(crate) enum SubkeyOutcome {
    /// Nothing changes for this subkey: a requirement-only mention, a
    /// delete of an already-absent subkey, or a Put whose payload
    /// compares equal to what is already there.
    Skip,
    Put(PayloadHandle),
    Delete,
}

pub(crate) struct SubkeyPrep {
    pub subkey: u64,
    pub view: Option<SubkeyStateView>,
    pub outcome: SubkeyOutcome,
}

pub(crate) struct KeyPrep {
    pub key: crate::behavior::KeyHandle,
    pub view: Option<KeyStateView>,
    pub current_subkeys_count: u32,
    pub new_subkeys_count: u32,
    /// True once this key will end up with an owned state block that
    /// the transaction's key handle was transferred into (a brand new
    /// key with at least one surviving subkey). When false, the
    /// transaction's copy of the key handle must be released once
    /// processing finishes.
    pub key_consumed: bool,
    pub subkeys: Vec<SubkeyPrep>,
}

pub(crate) enum PrepareOutcome {
    ValidationFailed,
    Ready {
        keys: Vec<KeyPrep>,
        extra_state_blocks: u32,
        reservation_ok: bool,
    },
}

/// Release every `Put` payload and every key handle a failed/abandoned
/// transaction still owns. `Requirement::Payload` handles are always
/// released as soon as they are compared in `prepare`, regardless of
/// outcome, so they need no separate handling here.
fn release_uncommitted(behavior: &dyn Behavior, keys: &[KeyPrep], raw: &[KeyTxn]) {
    for (kp, kt) in keys.iter().zip(raw.iter()) {
        for (sp, st) in kp.subkeys.iter().zip(kt.subkeys.iter()) {
            if let (SubkeyOutcome::Put(p), SubkeyAction::Put(_)) = (sp.outcome, st.action) {
                behavior.release_payload(p);
            }
        }
        behavior.release_key(kp.key);
    }
}

/// Release every key handle not transferred into a freshly created
/// block, after a successful phase-1 apply or phase-2 merge.
pub(crate) fn release_unconsumed_keys(behavior: &dyn Behavior, keys: &[KeyPrep]) {
    for kp in keys {
        if !kp.key_consumed {
            behavior.release_key(kp.key);
        }
    }
}

/// Release everything a validated plan still owns when phase 2 never
/// runs to completion (the merged blob's own allocation was refused):
/// every key handle, since none of them ended up transferred anywhere,
/// and every pending `Put` payload, since no block was ever written to
/// hold it.
pub(crate) fn release_all(behavior: &dyn Behavior, keys: &[KeyPrep]) {
    for kp in keys {
        for sp in &kp.subkeys {
            if let SubkeyOutcome::Put(p) = sp.outcome {
                behavior.release_payload(p);
            }
        }
        behavior.release_key(kp.key);
    }
}

/// §4.7 phase 1, steps 2-3: validate every `require_*`, resolve
/// Put-with-same-value cancellations, walk `clear_before_transaction`
/// sweeps, and (if validation passed) reserve capacity for every
/// mutation. `allocation_failed` is `true` when `add_version` itself
/// already failed (so capacity reservation is skipped, but validation
/// still runs — a transaction with a failed precondition has no effect
/// regardless of capacity).
pub(crate) fn prepare(
    blob: &Blob,
    behavior: &dyn Behavior,
    observe_offset: VersionOffset,
    new_version: u64,
    txn_keys: &[KeyTxn],
    allocation_failed: bool,
) -> PrepareOutcome {
    let observe_version = blob.base_version + observe_offset as u64;
    let mut validation_failed = false;
    let mut keys: Vec<KeyPrep> = Vec::with_capacity(txn_keys.len());

    for kt in txn_keys {
        let view = blob.find_key_state(behavior, kt.key);
        let current_count = view
            .as_ref()
            .map(|v| blob.subkeys_count_for(observe_offset, v))
            .unwrap_or(0);

        if let Some(required) = kt.required_subkeys_count {
            if required != current_count {
                validation_failed = true;
            }
        }

        let mut delta: i64 = 0;
        let mut subkeys = Vec::with_capacity(kt.subkeys.len());
        let mut mentioned = std::collections::HashSet::with_capacity(kt.subkeys.len());

        for st in &kt.subkeys {
            mentioned.insert(st.subkey);
            let sview = blob.find_subkey_state(behavior, kt.key, st.subkey);
            let current_payload = sview
                .as_ref()
                .and_then(|v| blob.payload_for(observe_version, v));

            match st.requirement {
                Requirement::Payload(p) => {
                    let ok = current_payload.map_or(false, |c| behavior.payloads_equal(c, p));
                    if !ok {
                        validation_failed = true;
                    }
                    behavior.release_payload(p);
                }
                Requirement::Missing => {
                    if current_payload.is_some() {
                        validation_failed = true;
                    }
                }
                Requirement::None => {}
            }

            let outcome = match st.action {
                SubkeyAction::Put(payload) => {
                    let cancelled = current_payload.map_or(false, |c| behavior.payloads_equal(c, payload));
                    if cancelled {
                        behavior.release_payload(payload);
                        SubkeyOutcome::Skip
                    } else {
                        if current_payload.is_none() {
                            delta += 1;
                        }
                        SubkeyOutcome::Put(payload)
                    }
                }
                SubkeyAction::Delete => {
                    if current_payload.is_some() {
                        delta -= 1;
                        SubkeyOutcome::Delete
                    } else {
                        SubkeyOutcome::Skip
                    }
                }
                SubkeyAction::None => SubkeyOutcome::Skip,
            };

            subkeys.push(SubkeyPrep {
                subkey: st.subkey,
                view: sview,
                outcome,
            });
        }

        if kt.clear_before_transaction {
            if let Some(kv) = &view {
                let mut cur = blob.key_block(kv.block).subkeys_list_head();
                while !cur.is_nil() {
                    let sb = blob.subkey_block(cur);
                    let subkey = sb.subkey;
                    let owner = sb.owner_key;
                    cur = sb.next();
                    if mentioned.contains(&subkey) {
                        continue;
                    }
                    let sview = match blob.find_subkey_state(behavior, owner, subkey) {
                        Some(v) => v,
                        None => continue,
                    };
                    let current_payload = blob.payload_for(observe_version, &sview);
                    if current_payload.is_some() {
                        delta -= 1;
                        subkeys.push(SubkeyPrep {
                            subkey,
                            view: Some(sview),
                            outcome: SubkeyOutcome::Delete,
                        });
                    }
                }
            }
        }

        let new_subkeys_count = (current_count as i64 + delta).max(0) as u32;
        let key_consumed = view.is_none() && new_subkeys_count > 0;

        keys.push(KeyPrep {
            key: kt.key,
            view,
            current_subkeys_count: current_count,
            new_subkeys_count,
            key_consumed,
            subkeys,
        });
    }

    if validation_failed {
        release_uncommitted(behavior, &keys, txn_keys);
        return PrepareOutcome::ValidationFailed;
    }

    let mut ok = !allocation_failed;
    let mut extra_state_blocks = 0u32;

    for kp in &keys {
        if kp.view.is_none() {
            if kp.new_subkeys_count > 0 {
                extra_state_blocks += 1;
            }
        } else if kp.new_subkeys_count != kp.current_subkeys_count {
            if ok {
                ok = blob.reserve_key_version(kp.view.as_ref().unwrap());
            }
        }

        for sp in &kp.subkeys {
            if let SubkeyOutcome::Skip = sp.outcome {
                continue;
            }
            match &sp.view {
                None => extra_state_blocks += 1,
                Some(v) => {
                    if ok {
                        let deleted = matches!(sp.outcome, SubkeyOutcome::Delete);
                        ok = blob.reserve_subkey_version(v, new_version, deleted);
                    }
                }
            }
        }
    }

    PrepareOutcome::Ready {
        keys,
        extra_state_blocks,
        reservation_ok: ok,
    }
}

/// §4.7 phase 1, step 4: mutate the current blob in place. Assumes
/// `prepare` returned `Ready` with `reservation_ok` true and the blob
/// had enough data blocks for `extra_state_blocks`.
pub(crate) fn apply(
    blob: &Blob,
    behavior: &dyn Behavior,
    new_offset: VersionOffset,
    new_version: u64,
    keys: &[KeyPrep],
) {
    let mut keys_delta: i64 = 0;
    let mut subkeys_delta: i64 = 0;

    for kp in keys {
        if kp.view.is_none() && kp.new_subkeys_count == 0 {
            // Nothing ever gets created for this key: every mentioned
            // subkey cancelled out to a no-op against an absent key.
            continue;
        }

        let key_view = match &kp.view {
            Some(v) => KeyStateView {
                block: v.block,
                slot_index: v.slot_index,
                slot: v.slot,
            },
            None => {
                let id = blob
                    .insert_key_block(behavior, kp.key)
                    .expect("reserved capacity for new key block");
                blob.find_key_state(behavior, kp.key)
                    .unwrap_or(KeyStateView {
                        block: id,
                        slot_index: 0,
                        slot: 0,
                    })
            }
        };

        for sp in &kp.subkeys {
            let (deleted, payload) = match sp.outcome {
                SubkeyOutcome::Skip => continue,
                SubkeyOutcome::Put(p) => (false, Some(p)),
                SubkeyOutcome::Delete => (true, None),
            };
            let sview = match &sp.view {
                Some(v) => SubkeyStateView {
                    block: v.block,
                    slot_index: v.slot_index,
                    slot: v.slot,
                },
                None => {
                    let id = blob
                        .insert_subkey_block(behavior, key_view.block, kp.key, sp.subkey)
                        .expect("reserved capacity for new subkey block");
                    blob.find_subkey_state(behavior, kp.key, sp.subkey)
                        .unwrap_or(SubkeyStateView {
                            block: id,
                            slot_index: 0,
                            slot: 0,
                        })
                }
            };
            blob.push_subkey_version(&sview, new_version, deleted, payload);
        }

        if kp.new_subkeys_count != kp.current_subkeys_count {
            blob.push_key_version(&key_view, new_offset, kp.new_subkeys_count);
        }

        if kp.current_subkeys_count == 0 && kp.new_subkeys_count > 0 {
            keys_delta += 1;
        } else if kp.current_subkeys_count > 0 && kp.new_subkeys_count == 0 {
            keys_delta -= 1;
        }
        subkeys_delta += kp.new_subkeys_count as i64 - kp.current_subkeys_count as i64;
    }

    let keys_total = (blob.keys_count() as i64 + keys_delta).max(0) as u32;
    let subkeys_total = (blob.subkeys_count() as i64 + subkeys_delta).max(0) as u32;
    blob.set_keys_count(keys_total);
    blob.set_subkeys_count(subkeys_total);

    release_unconsumed_keys(behavior, keys);
}
