//! Module `storage` implements the top-level entry point of §4.8: the
//! single mutable "current" blob pointer, the writer-mutex bracket
//! around `apply_transaction`, and the §4.7 phase dispatch between
//! in-place apply ([`crate::apply`]) and blob reallocation
//! ([`crate::merge`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, warn};

use crate::apply::{self, PrepareOutcome};
use crate::behavior::Behavior;
use crate::blob::Blob;
use crate::config::Config;
use crate::error::{Error, TxnOutcome};
use crate::merge;
use crate::snapshot::Snapshot;
use crate::transaction::Transaction;
use crate::util::{next_pow2, BLOCK_SIZE, PAGE_SIZE, VersionOffset};

struct CurrentState {
    blob: Arc<Blob>,
    offset: VersionOffset,
}

fn pages_for(index_blocks: u32, data_blocks: u32) -> u32 {
    let bytes = (index_blocks as u64 + data_blocks as u64) * BLOCK_SIZE as u64;
    ((bytes + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64) as u32
}

/// The versioned key/subkey storage engine (§2/§4.8): one writer at a
/// time, any number of concurrent readers holding [`Snapshot`]s that
/// never block behind the writer and never see a torn mutation.
pub struct Storage {
    behavior: Arc<dyn Behavior>,
    config: Config,
    current: Mutex<CurrentState>,
    /// Set once a merge's `allocate_pages` call is refused. From then
    /// on every `apply_transaction` short-circuits to the same error;
    /// reads against the last good snapshot remain unaffected.
    permanently_failed: AtomicBool,
}

impl Storage {
    /// Construct a fresh, empty storage at `config.base_version`.
    /// Returns `Error::InsufficientResources` if the host allocator
    /// refuses the initial page request.
    pub fn new(config: Config, behavior: Arc<dyn Behavior>) -> Result<Storage, Error> {
        let index_blocks = next_pow2(config.initial_index_blocks.max(1));
        let data_blocks = config.initial_data_blocks.max(1);
        let pages = pages_for(index_blocks, data_blocks);
        if !behavior.allocate_pages(pages) {
            return Err(Error::InsufficientResources(format!(
                "allocator refused initial request for {} pages",
                pages
            )));
        }
        let blob = Blob::new(
            config.base_version,
            index_blocks,
            data_blocks,
            config.max_versions,
            pages,
        );
        blob.add_version();
        Ok(Storage {
            behavior,
            config,
            current: Mutex::new(CurrentState {
                blob: Arc::new(blob),
                offset: 0,
            }),
            permanently_failed: AtomicBool::new(false),
        })
    }

    /// A read-only view of the storage as of right now. Cheap: bumps
    /// one atomic refcount and clones two `Arc`s.
    pub fn get_snapshot(&self) -> Snapshot {
        let guard = self.current.lock().expect("storage mutex poisoned");
        guard.blob.refcounts().add_reference(guard.offset);
        Snapshot::new(
            Arc::clone(&guard.blob),
            Arc::clone(&self.behavior),
            guard.offset,
        )
    }

    /// Consume `txn` and make its effects visible atomically, or report
    /// why it could not be (§4.6/§4.7). Serialized against every other
    /// call to `apply_transaction` via `Behavior::lock_writer_mutex`;
    /// never blocks a concurrent `get_snapshot`.
    pub fn apply_transaction(&self, mut txn: Transaction) -> TxnOutcome {
        if self.permanently_failed.load(Ordering::Acquire) {
            return TxnOutcome::FailedDueToInsufficientResources;
        }

        let txn_keys = txn.take_keys();

        self.behavior.lock_writer_mutex();
        let outcome = self.apply_transaction_locked(txn_keys);
        self.behavior.unlock_writer_mutex();
        outcome
    }

    fn apply_transaction_locked(&self, txn_keys: Vec<crate::transaction::KeyTxn>) -> TxnOutcome {
        let (blob, old_offset) = {
            let guard = self.current.lock().expect("storage mutex poisoned");
            (Arc::clone(&guard.blob), guard.offset)
        };

        let allocation_failed = !blob.add_version();
        let new_offset = old_offset + 1;
        let new_version = blob.base_version + new_offset as u64;

        let outcome = apply::prepare(
            &blob,
            self.behavior.as_ref(),
            old_offset,
            new_version,
            &txn_keys,
            allocation_failed,
        );

        match outcome {
            PrepareOutcome::ValidationFailed => {
                if !allocation_failed {
                    self.advance_in_place(&blob, old_offset, new_offset);
                    TxnOutcome::AppliedWithNoEffect { version: new_version }
                } else {
                    // The blob's version-refcount array is exhausted and
                    // there is nothing to mutate either; rebuild at the
                    // same contents just to buy a fresh refcount array.
                    // A failed require_* still yields no-effect semantics
                    // even though a fresh blob had to be built to carry
                    // the version forward (§4.7 step 3).
                    match self.merge_and_swap(&blob, old_offset, new_version, &[]) {
                        TxnOutcome::Applied { version } => {
                            TxnOutcome::AppliedWithNoEffect { version }
                        }
                        other => other,
                    }
                }
            }
            PrepareOutcome::Ready {
                keys,
                extra_state_blocks,
                reservation_ok,
            } => {
                let in_place = !allocation_failed
                    && reservation_ok
                    && blob.can_insert_state_blocks(extra_state_blocks);

                if in_place {
                    apply::apply(&blob, self.behavior.as_ref(), new_offset, new_version, &keys);
                    self.advance_in_place(&blob, old_offset, new_offset);
                    TxnOutcome::Applied { version: new_version }
                } else {
                    if !allocation_failed {
                        blob.rollback_last_version();
                    }
                    blob.set_immutable();
                    self.merge_and_swap(&blob, old_offset, new_version, &keys)
                }
            }
        }
    }

    /// Phase 1 finish: the mutation happened in place on `blob` itself,
    /// so only the "current" pointer's observed offset needs to move.
    fn advance_in_place(&self, blob: &Arc<Blob>, old_offset: VersionOffset, new_offset: VersionOffset) {
        let mut guard = self.current.lock().expect("storage mutex poisoned");
        guard.offset = new_offset;
        drop(guard);
        if blob.refcounts().remove_reference(old_offset) {
            if blob.note_version_died() {
                blob.destroy(self.behavior.as_ref());
            }
        }
    }

    /// Phase 2 finish: `old_blob` is now immutable and will never gain
    /// another version; `keys` replays the transaction's plan (or, for
    /// a pure refcount-array reallocation, an empty plan that keeps
    /// everything) into a freshly allocated blob, which becomes
    /// "current" in its place.
    fn merge_and_swap(
        &self,
        old_blob: &Arc<Blob>,
        old_offset: VersionOffset,
        new_version: u64,
        keys: &[apply::KeyPrep],
    ) -> TxnOutcome {
        let merged = merge::create_merged_blob(
            old_blob,
            self.behavior.as_ref(),
            &self.config,
            old_offset,
            new_version,
            keys,
        );

        let new_blob = match merged {
            Some(b) => b,
            None => {
                error!("storage: allocator refused merged blob, storage permanently failed");
                self.permanently_failed.store(true, Ordering::Release);
                return TxnOutcome::FailedDueToInsufficientResources;
            }
        };

        {
            let mut guard = self.current.lock().expect("storage mutex poisoned");
            guard.blob = Arc::clone(&new_blob);
            guard.offset = 0;
        }

        if old_blob.refcounts().remove_reference(old_offset) {
            if old_blob.note_version_died() {
                warn!("storage: old blob died immediately on merge, destroying");
                old_blob.destroy(self.behavior.as_ref());
            }
        }

        TxnOutcome::Applied { version: new_version }
    }
}

#[cfg(test)]
#[path = "storage_test.rs"]
mod storage_test;
