//! Module `merge` implements §4.7 phase 2: when the current blob cannot
//! absorb a transaction in place (either `add_version` failed, or a
//! reservation found the refcount pool or data arena exhausted),
//! `create_merged_blob` builds a fresh, right-sized blob holding only
//! what survives — the transaction's effects plus every (key, subkey)
//! the transaction didn't touch.
//!
//! The source design tags each live old-blob block with a scratch
//! pointer into the transaction's own map, reusing the (now useless,
//! since the blob is going immutable) AA-tree child-pointer storage for
//! it (§4.5/§9 "scratch buffer mode"). This implementation keeps that
//! scratch-mode API on `Blob` (`enter_scratch_mode_key`/`scratch_of_key`
//! and the subkey equivalents) and exercises it for fidelity, but the
//! actual decision of "did the transaction touch this block" is made
//! through a plain `HashMap` built once up front — simpler to get right
//! in safe Rust than decoding a packed `u64` scratch value, and just as
//! correct since this workspace has an ordinary heap to build the map
//! in (unlike the fixed-arena source design, which had nowhere else to
//! put it).

use std::collections::HashMap;
use std::sync::Arc;

use crate::apply::{release_all, release_unconsumed_keys, KeyPrep, SubkeyOutcome};
use crate::behavior::{
    Behavior, KeyHandle, KeySubscriptionHandle, PayloadHandle, SubkeySubscriptionHandle,
};
use crate::blob::Blob;
use crate::config::Config;
use crate::util::{next_pow2, BLOCK_SIZE, PAGE_SIZE};

struct SurvivorSubkey {
    subkey: u64,
    payload: Option<PayloadHandle>,
    duplicate_payload: bool,
    subscription: Option<SubkeySubscriptionHandle>,
}

struct SurvivorKey {
    key: KeyHandle,
    duplicate_key: bool,
    subscription: Option<KeySubscriptionHandle>,
    subkeys: Vec<SurvivorSubkey>,
}

/// Build the fresh blob a transaction will be replayed into once the
/// current one can no longer absorb it. Returns `None` if the host
/// allocator refuses the page request for the new blob, in which case
/// the caller (§4.7 phase 3) treats storage as permanently wedged.
pub(crate) fn create_merged_blob(
    old_blob: &Blob,
    behavior: &dyn Behavior,
    config: &Config,
    observe_offset: crate::util::VersionOffset,
    new_version: u64,
    keys: &[KeyPrep],
) -> Option<Arc<Blob>> {
    let observe_version = old_blob.base_version + observe_offset as u64;

    let mut key_scratch: HashMap<u32, usize> = HashMap::with_capacity(keys.len());
    let mut subkey_scratch: HashMap<u32, (usize, usize)> = HashMap::new();
    for (ki, kp) in keys.iter().enumerate() {
        if let Some(v) = &kp.view {
            old_blob.enter_scratch_mode_key(v.block, ki as u64);
            key_scratch.insert(v.block.0, ki);
        }
        for (si, sp) in kp.subkeys.iter().enumerate() {
            if let Some(v) = &sp.view {
                old_blob.enter_scratch_mode_subkey(v.block, ((ki as u64) << 32) | si as u64);
                subkey_scratch.insert(v.block.0, (ki, si));
            }
        }
    }

    let mut survivors: Vec<SurvivorKey> = Vec::new();

    let mut key_id = old_blob.keys_list_head();
    while !key_id.is_nil() {
        let key_block = old_blob.key_block(key_id);
        let touched = key_scratch.get(&key_id.0).copied();

        // `prepare` already materialized every clear-sweep deletion as
        // an explicit `SubkeyPrep { outcome: Delete, .. }` entry for the
        // key it applies to, so an untouched subkey (`touched_sub ==
        // None`) is, by construction, never one a pending
        // `clear_before_transaction` needs to erase — it was either
        // swept already (and so shows up as touched) or the key was
        // never cleared at all.
        let mut subkeys = Vec::new();
        let mut sub_id = key_block.subkeys_list_head();
        while !sub_id.is_nil() {
            let sb = old_blob.subkey_block(sub_id);
            let next = sb.next();
            let touched_sub = subkey_scratch.get(&sub_id.0).copied();

            let current_payload = {
                let view = old_blob.find_subkey_state(behavior, sb.owner_key, sb.subkey);
                view.and_then(|v| old_blob.payload_for(observe_version, &v))
            };
            let current_alive = current_payload.is_some();
            let subscribed = sb.subscription().is_some();

            let keep = subscribed
                || match touched_sub {
                    Some((ki, si)) => match keys[ki].subkeys[si].outcome {
                        SubkeyOutcome::Put(_) => true,
                        SubkeyOutcome::Delete => false,
                        SubkeyOutcome::Skip => current_alive,
                    },
                    None => current_alive,
                };

            if keep {
                let (payload, dup) = match touched_sub {
                    Some((ki, si)) => match keys[ki].subkeys[si].outcome {
                        SubkeyOutcome::Put(p) => (Some(p), false),
                        _ => (current_payload, true),
                    },
                    None => (current_payload, true),
                };
                subkeys.push(SurvivorSubkey {
                    subkey: sb.subkey,
                    payload,
                    duplicate_payload: dup,
                    subscription: sb.subscription(),
                });
            }

            sub_id = next;
        }

        // Brand-new subkeys the transaction introduced under this
        // *existing* key have no old subkey block at all, so the walk
        // above never visits them — `subkey_scratch` only maps blocks
        // that exist in `old_blob`. Without this, a Put against a new
        // subkey of an already-present key would be dropped from the
        // merged blob and its payload handle would leak.
        if let Some(ki) = touched {
            for (si, sp) in keys[ki].subkeys.iter().enumerate() {
                if sp.view.is_some() {
                    continue;
                }
                if let SubkeyOutcome::Put(p) = sp.outcome {
                    subkeys.push(SurvivorSubkey {
                        subkey: keys[ki].subkeys[si].subkey,
                        payload: Some(p),
                        duplicate_payload: false,
                        subscription: None,
                    });
                }
            }
        }

        let key_subscribed = key_block.subscription().is_some();
        let key_survives = key_subscribed
            || match touched {
                Some(ki) => keys[ki].new_subkeys_count > 0 || !subkeys.is_empty(),
                None => !subkeys.is_empty(),
            };

        if key_survives {
            survivors.push(SurvivorKey {
                key: key_block.key,
                duplicate_key: true,
                subscription: key_block.subscription(),
                subkeys,
            });
        }

        key_id = key_block.next();
    }

    // §4.7 phase 2, final step: insert brand-new (key, subkey) pairs the
    // transaction introduced that had no existing block at all.
    for kp in keys {
        if kp.view.is_some() || kp.new_subkeys_count == 0 {
            continue;
        }
        let subkeys = kp
            .subkeys
            .iter()
            .filter_map(|sp| match sp.outcome {
                SubkeyOutcome::Put(p) if sp.view.is_none() => Some(SurvivorSubkey {
                    subkey: sp.subkey,
                    payload: Some(p),
                    duplicate_payload: false,
                    subscription: None,
                }),
                _ => None,
            })
            .collect();
        survivors.push(SurvivorKey {
            key: kp.key,
            duplicate_key: false,
            subscription: None,
            subkeys,
        });
    }

    let total_keys = survivors.len() as u32;
    let total_subkeys: u32 = survivors.iter().map(|s| s.subkeys.len() as u32).sum();
    let total_entries = (total_keys + total_subkeys).max(1);

    let index_blocks = next_pow2(total_entries);
    let data_blocks = (total_entries * 2).max(config.initial_data_blocks);
    let bytes = (index_blocks as u64 + data_blocks as u64) * BLOCK_SIZE as u64;
    let pages = ((bytes + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64) as u32;

    if !behavior.allocate_pages(pages) {
        release_all(behavior, keys);
        return None;
    }

    let new_blob = Blob::new(new_version, index_blocks, data_blocks, config.max_versions, pages);
    new_blob.add_version();

    let mut keys_total = 0u32;
    let mut subkeys_total = 0u32;

    for sk in survivors {
        let key = if sk.duplicate_key {
            behavior.duplicate_key(sk.key)
        } else {
            sk.key
        };
        let key_id = new_blob
            .insert_key_block(behavior, key)
            .expect("freshly sized merged blob has room for its own survivors");
        if sk.subscription.is_some() {
            new_blob.key_block(key_id).set_subscription(sk.subscription);
        }

        let mut count = 0u32;
        for ss in sk.subkeys {
            let payload = match (ss.payload, ss.duplicate_payload) {
                (Some(p), true) => Some(behavior.duplicate_payload(p)),
                (Some(p), false) => Some(p),
                (None, _) => None,
            };
            let sub_id = new_blob
                .insert_subkey_block(behavior, key_id, key, ss.subkey)
                .expect("freshly sized merged blob has room for its own survivors");
            if ss.subscription.is_some() {
                new_blob.subkey_block(sub_id).set_subscription(ss.subscription);
            }
            if let Some(p) = payload {
                let view = new_blob
                    .find_subkey_state(behavior, key, ss.subkey)
                    .expect("just inserted");
                new_blob.push_subkey_version(&view, new_version, false, Some(p));
                count += 1;
            }
        }

        if count > 0 {
            let view = new_blob
                .find_key_state(behavior, key)
                .expect("just inserted");
            new_blob.push_key_version(&view, 0, count);
            keys_total += 1;
        }
        subkeys_total += count;
    }

    new_blob.set_keys_count(keys_total);
    new_blob.set_subkeys_count(subkeys_total);

    release_unconsumed_keys(behavior, keys);

    Some(Arc::new(new_blob))
}
