//! Module `cell` provides the interior-mutability primitives used for
//! blob fields that live behind a companion publish flag instead of
//! their own atomic read-modify-write op.
//!
//! A blob is shared between the writer and arbitrary reader threads via
//! `Arc<Blob>`, so every mutable field technically needs to be `Sync`.
//! Two patterns recur throughout the blob layout:
//!
//! * **Writer-only** fields (AA-tree child pointers, tree levels,
//!   scratch pointers) that readers are documented to never touch at
//!   all (§5). [`WriterCell`] covers these.
//! * **Publish-once-then-read-many** fields (inline version/count
//!   tuples, subkey anchor/offset, payload slots) that the writer fills
//!   in with plain writes and then makes visible to readers with a
//!   single release-store on a *separate* atomic counter; readers
//!   acquire-load that counter first and only then read the field.
//!   [`PublishedCell`] covers these — structurally identical to
//!   `WriterCell`, named separately so each call site states which
//!   contract it relies on.
//!
//! Both are thin `UnsafeCell` wrappers that assert `Sync`; soundness
//! rests entirely on the access pattern documented above being
//! respected by every caller, not on anything the type itself enforces.

use std::cell::UnsafeCell;

pub struct WriterCell<T>(UnsafeCell<T>);

impl<T> WriterCell<T> {
    pub fn new(value: T) -> WriterCell<T> {
        WriterCell(UnsafeCell::new(value))
    }

    #[inline]
    pub fn get(&self) -> T
    where
        T: Copy,
    {
        unsafe { *self.0.get() }
    }

    /// Caller must hold the writer mutex.
    #[inline]
    pub fn set(&self, value: T) {
        unsafe { *self.0.get() = value }
    }
}

unsafe impl<T> Sync for WriterCell<T> {}
unsafe impl<T> Send for WriterCell<T> {}

pub struct PublishedCell<T>(UnsafeCell<T>);

impl<T> PublishedCell<T> {
    pub fn new(value: T) -> PublishedCell<T> {
        PublishedCell(UnsafeCell::new(value))
    }

    /// Read the value. Sound only after the caller has acquire-loaded
    /// the companion publish flag that guards this field.
    #[inline]
    pub fn get(&self) -> T
    where
        T: Copy,
    {
        unsafe { *self.0.get() }
    }

    /// Write the value. Caller must hold the writer mutex and must
    /// release-store the companion publish flag afterward.
    #[inline]
    pub fn set(&self, value: T) {
        unsafe { *self.0.get() = value }
    }
}

unsafe impl<T> Sync for PublishedCell<T> {}
unsafe impl<T> Send for PublishedCell<T> {}
