//! Module `util` collects the bit-level primitives the blob layout is
//! built from: the 64-to-(32,8) hash split used by the index, the
//! 64-bit hash combinator used to fold a subkey into a key's hash, and
//! the sentinel constants for version offsets.

/// Block size in bytes. Every index block, key/subkey state block and
/// key/subkey version block is exactly this size.
pub const BLOCK_SIZE: usize = 64;

/// Page size assumed of the host allocator.
pub const PAGE_SIZE: usize = 4096;

/// Slots per index block.
pub const INDEX_SLOTS: usize = 7;

/// Inline `(VersionOffset, subkey_count)` entries carried directly on a
/// key state block before a key version block is needed.
pub const INLINE_KEY_VERSIONS: usize = 3;

/// Inline marked-version/payload slots carried directly on a subkey
/// state block before a subkey version block is needed.
pub const INLINE_SUBKEY_VERSIONS: usize = 2;

/// Entries in the first key version block; later blocks extend by
/// [`KEY_VERSION_BLOCK_EXT`].
pub const KEY_VERSION_BLOCK_FIRST: usize = 7;
pub const KEY_VERSION_BLOCK_EXT: usize = 8;

/// Entries in the first subkey version block; later blocks hold
/// [`SUBKEY_VERSION_BLOCK_EXT`].
pub const SUBKEY_VERSION_BLOCK_FIRST: usize = 4;
pub const SUBKEY_VERSION_BLOCK_EXT: usize = 5;

/// A [`VersionOffset`] of this value means "no entry here".
pub const INVALID_OFFSET: u32 = u32::MAX;

/// Smallest 64-bit version considered invalid (versions must stay
/// strictly below 2^63 so the deletion bit of a marked version never
/// collides with the sign-adjacent range).
pub const SMALLEST_INVALID_VERSION: u64 = 0x7FFF_FFFF_FFFF_FFFF;

/// A version expressed as a 32-bit offset from a blob's `base_version`.
/// `INVALID_OFFSET` is reserved to mean "no such version".
pub type VersionOffset = u32;

#[inline]
pub fn offset_valid(offset: VersionOffset) -> bool {
    offset != INVALID_OFFSET
}

/// Split a 64-bit hash into `(index_offset_hash, slot_hash)`: the high
/// 32 bits select the probed index block, the low 8 bits are compared
/// in parallel against the 7 stored slot hashes.
#[inline]
pub fn split_hash(hash: u64) -> (u32, u8) {
    ((hash >> 32) as u32, (hash & 0xff) as u8)
}

/// Fold a subkey value into a key's hash using a 64-bit mixer derived
/// from SplitMix64, producing a fresh, well-distributed 64-bit value
/// suitable for another `split_hash` call.
#[inline]
pub fn combine_hash(key_hash: u64, subkey: u64) -> u64 {
    let mut h = key_hash ^ subkey.wrapping_add(0x9E37_79B9_7F4A_7C15);
    h ^= h >> 30;
    h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    h ^= h >> 27;
    h = h.wrapping_mul(0x94D0_49BB_1331_11EB);
    h ^= h >> 31;
    h
}

/// Pack a version and a deletion flag into a single monotonic token,
/// `(version << 1) | deletion_bit`. Comparisons between marked versions
/// compare correctly as plain integers.
#[inline]
pub fn mark_version(version: u64, deleted: bool) -> u64 {
    (version << 1) | (deleted as u64)
}

#[inline]
pub fn unmark_version(marked: u64) -> (u64, bool) {
    (marked >> 1, marked & 1 == 1)
}

/// The search token used by `get_versioned_payload`: the marked version
/// of the highest-possible entry at or below `version`, i.e. the
/// deletion-flagged variant of `version` itself. Any stored marked
/// version `<=` this token was visible as of `version`.
#[inline]
pub fn search_token(version: u64) -> u64 {
    mark_version(version, true)
}

pub fn next_pow2(n: u32) -> u32 {
    if n <= 1 {
        1
    } else {
        1u32 << (32 - (n - 1).leading_zeros())
    }
}

/// A typed index into a blob's flat block arena, used everywhere a raw
/// pointer would otherwise appear (§9 "raw memory with indices instead
/// of pointer graphs"). `NIL` stands in for a null block reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    pub const NIL: BlockId = BlockId(u32::MAX);

    #[inline]
    pub fn is_nil(self) -> bool {
        self == BlockId::NIL
    }
}

impl Default for BlockId {
    fn default() -> BlockId {
        BlockId::NIL
    }
}
