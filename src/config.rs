//! Module `config` collects the handful of knobs a host can tune when
//! constructing a [`crate::storage::Storage`], mirroring the role
//! `robt::Config` plays for the disk-backed index elsewhere in this
//! crate's lineage: a small, `Clone`-able struct consulted only at
//! construction time.

/// Construction-time tunables for [`crate::storage::Storage`].
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Initial number of index blocks, rounded up to the next power of
    /// two. The index never shrinks; it is recreated at a larger size
    /// during a merge (§4.7) once the load factor gets too high.
    pub initial_index_blocks: u32,
    /// Initial number of data blocks (state blocks + version blocks +
    /// refcount entries share this pool, carved from opposite ends).
    pub initial_data_blocks: u32,
    /// First version number a freshly constructed storage will report.
    pub base_version: u64,
    /// Capacity of the per-version refcount array carried by every
    /// blob (the current one and every one a merge replaces it with).
    /// `add_version` fails once this many versions have been born
    /// against a single blob without dying, which is one of the two
    /// triggers for §4.7 phase 2 reallocation.
    pub max_versions: u32,
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            initial_index_blocks: 8,
            initial_data_blocks: 64,
            base_version: 0,
            max_versions: 65536,
        }
    }
}
