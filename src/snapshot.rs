//! Module `snapshot` implements the immutable reader view of §4.9: one
//! version refcount held on one blob, a point-in-time `get`/count API,
//! and a key iterator plus a per-key subkey iterator.

use std::sync::Arc;

use crate::behavior::{Behavior, KeyHandle, PayloadHandle};
use crate::blob::Blob;
use crate::util::{BlockId, VersionOffset};

/// A read-only, point-in-time view of a [`crate::storage::Storage`],
/// obtained from `Storage::get_snapshot`. Holds one reference on the
/// version it was constructed against; dropping it may release that
/// version and, if it was the last one keeping its blob alive, tears
/// the blob down (§3 "Lifecycles").
pub struct Snapshot {
    blob: Arc<Blob>,
    behavior: Arc<dyn Behavior>,
    version_offset: VersionOffset,
    version: u64,
}

impl Snapshot {
    /// Wraps a version this caller already owns a reference on (either
    /// fresh from `Blob::add_version`, or duplicated via `Clone`).
    pub(crate) fn new(
        blob: Arc<Blob>,
        behavior: Arc<dyn Behavior>,
        version_offset: VersionOffset,
    ) -> Snapshot {
        let version = blob.base_version + version_offset as u64;
        Snapshot {
            blob,
            behavior,
            version_offset,
            version,
        }
    }

    /// The absolute version number this snapshot observes.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The payload currently visible for `(key, subkey)`, or `None` if
    /// absent or never written.
    pub fn get(&self, key: KeyHandle, subkey: u64) -> Option<PayloadHandle> {
        let view = self
            .blob
            .find_subkey_state(self.behavior.as_ref(), key, subkey)?;
        self.blob.payload_for(self.version, &view)
    }

    /// Number of subkeys present under `key` as of this snapshot.
    pub fn subkeys_count(&self, key: KeyHandle) -> u32 {
        match self.blob.find_key_state(self.behavior.as_ref(), key) {
            Some(v) => self.blob.subkeys_count_for(self.version_offset, &v),
            None => 0,
        }
    }

    /// Number of keys with at least one present subkey as of this
    /// snapshot. `O(keys)`: computed by walking the key list, since a
    /// snapshot may observe an older version than its blob's most
    /// recently applied one, for which only the *latest* aggregate is
    /// cached on the blob itself.
    pub fn keys_count(&self) -> u32 {
        self.keys().count() as u32
    }

    /// Total number of present subkeys across every key, as of this
    /// snapshot. `O(keys + subkeys)`.
    pub fn subkeys_total_count(&self) -> u32 {
        self.keys().map(|k| self.subkeys_count(k)).sum()
    }

    pub fn keys(&self) -> KeyIter<'_> {
        KeyIter {
            blob: &self.blob,
            behavior: self.behavior.as_ref(),
            offset: self.version_offset,
            cur: self.blob.keys_list_head(),
        }
    }

    pub fn subkeys(&self, key: KeyHandle) -> SubkeyIter<'_> {
        let head = match self.blob.find_key_state(self.behavior.as_ref(), key) {
            Some(v) => self.blob.key_block(v.block).subkeys_list_head(),
            None => BlockId::NIL,
        };
        SubkeyIter {
            blob: &self.blob,
            behavior: self.behavior.as_ref(),
            version: self.version,
            cur: head,
        }
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Snapshot {
        self.blob.refcounts().add_reference(self.version_offset);
        Snapshot {
            blob: Arc::clone(&self.blob),
            behavior: Arc::clone(&self.behavior),
            version_offset: self.version_offset,
            version: self.version,
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if self.blob.refcounts().remove_reference(self.version_offset) {
            if self.blob.note_version_died() {
                self.blob.destroy(self.behavior.as_ref());
            }
        }
    }
}

/// Key iterator (§4.9): walks the reader-visible sorted key list,
/// skipping any key whose subkey count is zero at the snapshot's
/// version. Re-probes the index per key instead of following a
/// version-block pointer cached on the list node itself, trading one
/// extra hash lookup per key for not needing a second field on
/// `KeyStateBlock` that would otherwise only exist to speed up
/// iteration (recorded in `DESIGN.md`).
pub struct KeyIter<'s> {
    blob: &'s Blob,
    behavior: &'s dyn Behavior,
    offset: VersionOffset,
    cur: BlockId,
}

impl<'s> Iterator for KeyIter<'s> {
    type Item = KeyHandle;

    fn next(&mut self) -> Option<KeyHandle> {
        while !self.cur.is_nil() {
            let block = self.blob.key_block(self.cur);
            let key = block.key;
            self.cur = block.next();
            let count = self
                .blob
                .find_key_state(self.behavior, key)
                .map(|v| self.blob.subkeys_count_for(self.offset, &v))
                .unwrap_or(0);
            if count > 0 {
                return Some(key);
            }
        }
        None
    }
}

/// Per-key subkey iterator (§4.9): walks one key's reader-visible
/// sorted subkey list, yielding only subkeys with a payload present at
/// the snapshot's version.
pub struct SubkeyIter<'s> {
    blob: &'s Blob,
    behavior: &'s dyn Behavior,
    version: u64,
    cur: BlockId,
}

impl<'s> Iterator for SubkeyIter<'s> {
    type Item = (u64, PayloadHandle);

    fn next(&mut self) -> Option<(u64, PayloadHandle)> {
        while !self.cur.is_nil() {
            let block = self.blob.subkey_block(self.cur);
            let subkey = block.subkey;
            let owner = block.owner_key;
            self.cur = block.next();
            if let Some(view) = self.blob.find_subkey_state(self.behavior, owner, subkey) {
                if let Some(payload) = self.blob.payload_for(self.version, &view) {
                    return Some((subkey, payload));
                }
            }
        }
        None
    }
}
