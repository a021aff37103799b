//! Module `behavior` defines the host-supplied collaborators the engine
//! consumes: hashing/ordering/duplication/release of the opaque handle
//! types, and the writer-mutex pair. This mirrors how the rest of this
//! crate keeps hosts pluggable through a trait object rather than a
//! concrete type (see `core::Diff`/`core::Serialize` for the same shape
//! applied to values).

use std::fmt;

/// Opaque 64-bit handle to a key. Ownership semantics are entirely
/// external: the engine only ever duplicates and releases handles
/// through [`Behavior`], never inspects their bit pattern beyond using
/// it as a hash/compare input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle(pub u64);

/// Opaque 64-bit handle to a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadHandle(pub u64);

/// Opaque handle to a key-level subscription. Concrete subscription
/// semantics are out of scope for this engine; it only owns the handle
/// (duplicate on attach, release on the owning block's destruction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeySubscriptionHandle(pub u64);

/// Opaque handle to a subkey-level subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubkeySubscriptionHandle(pub u64);

impl fmt::Display for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Key({:#x})", self.0)
    }
}

impl fmt::Display for PayloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Payload({:#x})", self.0)
    }
}

/// Collaborators supplied by the host application.
///
/// Every method here is expected to be cheap and side-effect-free aside
/// from the refcount bookkeeping implied by `duplicate`/`release`; the
/// engine may call them from either reader or writer threads depending
/// on the method (see doc on each).
pub trait Behavior: Send + Sync {
    /// Deterministic hash of a key handle. Must not depend on pointer
    /// identity or process-local state. Called from any thread.
    fn hash_key(&self, key: KeyHandle) -> u64;

    /// Total order used both for the writer-only AA-tree of keys and for
    /// key iteration order exposed to readers.
    fn keys_equal(&self, a: KeyHandle, b: KeyHandle) -> bool;
    fn keys_less(&self, a: KeyHandle, b: KeyHandle) -> bool;

    /// Payload equality, used to detect Put-with-same-value no-ops and to
    /// validate `require_payload`. Implementations may degrade to handle
    /// identity; in that case a Put carrying an equal-but-not-identical
    /// payload will not be recognized as a no-op (§6).
    fn payloads_equal(&self, a: PayloadHandle, b: PayloadHandle) -> bool;

    /// Increment the external refcount and return a handle the engine now
    /// owns. Called whenever the engine needs to retain a handle beyond
    /// the caller's own copy (e.g. storing a transaction's key in the
    /// index, or duplicating an old payload forward across a merge).
    fn duplicate_key(&self, key: KeyHandle) -> KeyHandle;
    fn duplicate_payload(&self, payload: PayloadHandle) -> PayloadHandle;

    /// Decrement the external refcount. Called exactly once per owned
    /// handle, from destructor paths (block destruction, transaction
    /// drop, snapshot drop) which must never themselves fail.
    fn release_key(&self, key: KeyHandle);
    fn release_payload(&self, payload: PayloadHandle);
    fn release_key_subscription(&self, sub: KeySubscriptionHandle);
    fn release_subkey_subscription(&self, sub: SubkeySubscriptionHandle);

    /// Request `count` page-aligned, zeroed, 4096-byte pages for the data
    /// pool of a blob. Returns `false` on allocation failure, in which
    /// case the engine leaves the blob untouched and begins phase 2
    /// (reallocate and merge) or gives up (phase 3).
    fn allocate_pages(&self, count: u32) -> bool;

    /// Return `count` pages previously granted by `allocate_pages` back to
    /// the allocator. Called from blob destruction; never fails.
    fn free_pages(&self, count: u32);

    /// Acquire/release the single writer mutex. `Storage::apply_transaction`
    /// brackets its prepare+apply (or prepare+merge) work with exactly one
    /// matched pair of calls.
    fn lock_writer_mutex(&self);
    fn unlock_writer_mutex(&self);
}
