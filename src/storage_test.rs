use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use rand::prelude::random;

use super::*;
use crate::behavior::{KeySubscriptionHandle, SubkeySubscriptionHandle};

/// A `Behavior` whose key/payload handles are plain `u64` ids. Keeps an
/// external reference count per id so tests can assert every handle
/// the engine ever touched was released exactly as many times as it
/// was created or duplicated — the §8 "released exactly once" property
/// applied end to end instead of block by block.
struct TestBehavior {
    key_refs: Mutex<HashMap<u64, i64>>,
    payload_refs: Mutex<HashMap<u64, i64>>,
    pages_available: AtomicI64,
}

impl TestBehavior {
    fn new(pages_available: i64) -> Arc<TestBehavior> {
        Arc::new(TestBehavior {
            key_refs: Mutex::new(HashMap::new()),
            payload_refs: Mutex::new(HashMap::new()),
            pages_available: AtomicI64::new(pages_available),
        })
    }

    fn own_key(&self, k: KeyHandle) {
        *self.key_refs.lock().unwrap().entry(k.0).or_insert(0) += 1;
    }

    fn own_payload(&self, p: PayloadHandle) {
        *self.payload_refs.lock().unwrap().entry(p.0).or_insert(0) += 1;
    }

    fn key_balance(&self) -> i64 {
        self.key_refs.lock().unwrap().values().sum()
    }

    fn payload_balance(&self) -> i64 {
        self.payload_refs.lock().unwrap().values().sum()
    }
}

impl Behavior for TestBehavior {
    fn hash_key(&self, key: KeyHandle) -> u64 {
        key.0
    }
    fn keys_equal(&self, a: KeyHandle, b: KeyHandle) -> bool {
        a.0 == b.0
    }
    fn keys_less(&self, a: KeyHandle, b: KeyHandle) -> bool {
        a.0 < b.0
    }
    fn payloads_equal(&self, a: PayloadHandle, b: PayloadHandle) -> bool {
        a.0 == b.0
    }

    fn duplicate_key(&self, key: KeyHandle) -> KeyHandle {
        self.own_key(key);
        key
    }
    fn duplicate_payload(&self, payload: PayloadHandle) -> PayloadHandle {
        self.own_payload(payload);
        payload
    }

    fn release_key(&self, key: KeyHandle) {
        let mut refs = self.key_refs.lock().unwrap();
        let count = refs.get_mut(&key.0).expect("release of never-owned key");
        *count -= 1;
        assert!(*count >= 0, "key {} refcount underflow", key.0);
    }
    fn release_payload(&self, payload: PayloadHandle) {
        let mut refs = self.payload_refs.lock().unwrap();
        let count = refs
            .get_mut(&payload.0)
            .expect("release of never-owned payload");
        *count -= 1;
        assert!(*count >= 0, "payload {} refcount underflow", payload.0);
    }
    fn release_key_subscription(&self, _sub: KeySubscriptionHandle) {}
    fn release_subkey_subscription(&self, _sub: SubkeySubscriptionHandle) {}

    fn allocate_pages(&self, count: u32) -> bool {
        let mut avail = self.pages_available.load(AtomicOrdering::Relaxed);
        loop {
            if avail < count as i64 {
                return false;
            }
            match self.pages_available.compare_exchange(
                avail,
                avail - count as i64,
                AtomicOrdering::SeqCst,
                AtomicOrdering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(cur) => avail = cur,
            }
        }
    }
    fn free_pages(&self, count: u32) {
        self.pages_available.fetch_add(count as i64, AtomicOrdering::SeqCst);
    }

    // Tests run single-threaded; the real mutex is the host's concern.
    fn lock_writer_mutex(&self) {}
    fn unlock_writer_mutex(&self) {}
}

fn key(behavior: &TestBehavior, v: u64) -> KeyHandle {
    let k = KeyHandle(v);
    behavior.own_key(k);
    k
}

fn payload(behavior: &TestBehavior, v: u64) -> PayloadHandle {
    let p = PayloadHandle(v);
    behavior.own_payload(p);
    p
}

fn small_config() -> Config {
    Config {
        initial_index_blocks: 8,
        initial_data_blocks: 64,
        base_version: 0,
        max_versions: 1024,
    }
}

#[test]
fn test_basic_put_get_delete() {
    let behavior = TestBehavior::new(1_000_000);
    let storage = Storage::new(small_config(), behavior.clone()).expect("initial allocation");

    let mut txn = Transaction::new(behavior.clone());
    txn.put(key(&behavior, 5), 111, payload(&behavior, 1));
    assert_eq!(storage.apply_transaction(txn), TxnOutcome::Applied { version: 1 });

    let snap1 = storage.get_snapshot();
    assert_eq!(snap1.version(), 1);
    assert_eq!(snap1.keys_count(), 1);
    assert_eq!(snap1.subkeys_total_count(), 1);
    assert_eq!(snap1.subkeys_count(KeyHandle(5)), 1);
    assert_eq!(snap1.get(KeyHandle(5), 111), Some(PayloadHandle(1)));

    let mut txn2 = Transaction::new(behavior.clone());
    txn2.put(key(&behavior, 6), 222, payload(&behavior, 2));
    txn2.put(key(&behavior, 6), 333, payload(&behavior, 3));
    txn2.delete(key(&behavior, 5), 111);
    assert_eq!(storage.apply_transaction(txn2), TxnOutcome::Applied { version: 2 });

    let snap2 = storage.get_snapshot();
    assert_eq!(snap2.version(), 2);
    assert_eq!(snap2.keys_count(), 1);
    assert_eq!(snap2.subkeys_total_count(), 2);
    assert_eq!(snap2.subkeys_count(KeyHandle(5)), 0);
    assert_eq!(snap2.get(KeyHandle(5), 111), None);
    assert_eq!(snap2.get(KeyHandle(6), 222), Some(PayloadHandle(2)));
    assert_eq!(snap2.get(KeyHandle(6), 333), Some(PayloadHandle(3)));

    // The older snapshot must still observe the state as of its own version.
    assert_eq!(snap1.get(KeyHandle(5), 111), Some(PayloadHandle(1)));
    assert_eq!(snap1.subkeys_count(KeyHandle(5)), 1);
}

#[test]
fn test_prerequisite_failure_applies_with_no_effect() {
    let behavior = TestBehavior::new(1_000_000);
    let storage = Storage::new(small_config(), behavior.clone()).expect("initial allocation");

    let mut txn = Transaction::new(behavior.clone());
    txn.require_subkeys_count(key(&behavior, 7), 6);
    assert_eq!(
        storage.apply_transaction(txn),
        TxnOutcome::AppliedWithNoEffect { version: 1 }
    );

    let snap = storage.get_snapshot();
    assert_eq!(snap.version(), 1);
    assert_eq!(snap.keys_count(), 0);
    assert_eq!(snap.subkeys_total_count(), 0);
}

#[test]
fn test_clear_before_transaction() {
    let behavior = TestBehavior::new(1_000_000);
    let storage = Storage::new(small_config(), behavior.clone()).expect("initial allocation");

    let mut txn1 = Transaction::new(behavior.clone());
    txn1.put(key(&behavior, 5), 111, payload(&behavior, 1));
    txn1.put(key(&behavior, 5), 222, payload(&behavior, 2));
    txn1.put(key(&behavior, 5), 333, payload(&behavior, 3));
    assert_eq!(storage.apply_transaction(txn1), TxnOutcome::Applied { version: 1 });

    let mut txn2 = Transaction::new(behavior.clone());
    txn2.put(key(&behavior, 5), 222, payload(&behavior, 22));
    txn2.put(key(&behavior, 5), 333, payload(&behavior, 3)); // same value: cancels to a no-op
    txn2.put(key(&behavior, 5), 444, payload(&behavior, 4));
    txn2.put(key(&behavior, 5), 555, payload(&behavior, 5));
    txn2.clear_before_transaction(key(&behavior, 5));
    txn2.require_missing_subkey(key(&behavior, 5), 777);
    assert_eq!(storage.apply_transaction(txn2), TxnOutcome::Applied { version: 2 });

    let snap = storage.get_snapshot();
    assert_eq!(snap.subkeys_count(KeyHandle(5)), 4);
    assert_eq!(snap.get(KeyHandle(5), 111), None);
    assert_eq!(snap.get(KeyHandle(5), 222), Some(PayloadHandle(22)));
    assert_eq!(snap.get(KeyHandle(5), 333), Some(PayloadHandle(3)));
    assert_eq!(snap.get(KeyHandle(5), 444), Some(PayloadHandle(4)));
    assert_eq!(snap.get(KeyHandle(5), 555), Some(PayloadHandle(5)));

    let order: Vec<u64> = snap.subkeys(KeyHandle(5)).map(|(sk, _)| sk).collect();
    assert_eq!(order, vec![222, 333, 444, 555]);
}

#[test]
fn test_blob_reallocation_under_sustained_growth() {
    let behavior = TestBehavior::new(1_000_000);
    let cfg = Config {
        initial_index_blocks: 4,
        initial_data_blocks: 8,
        base_version: 0,
        max_versions: 64,
    };
    let storage = Storage::new(cfg, behavior.clone()).expect("initial allocation");

    let mut expected = Vec::new();
    for i in 0..20u64 {
        let mut txn = Transaction::new(behavior.clone());
        txn.put(key(&behavior, 5), 100 + i, payload(&behavior, i));
        match storage.apply_transaction(txn) {
            TxnOutcome::Applied { .. } => {}
            other => panic!("unexpected outcome at i={}: {:?}", i, other),
        }
        expected.push(100 + i);
    }

    let snap = storage.get_snapshot();
    assert_eq!(snap.subkeys_count(KeyHandle(5)), 20);
    for (i, sk) in expected.iter().enumerate() {
        assert_eq!(snap.get(KeyHandle(5), *sk), Some(PayloadHandle(i as u64)));
    }
    let order: Vec<u64> = snap.subkeys(KeyHandle(5)).map(|(sk, _)| sk).collect();
    assert_eq!(order, expected);
}

#[test]
fn test_version_compaction_via_overflow() {
    // Ten writes to the same subkey, forcing its inline version slots
    // to overflow into a version-block chain; every earlier snapshot
    // must still read its own value back correctly afterward.
    let behavior = TestBehavior::new(1_000_000);
    let storage = Storage::new(small_config(), behavior.clone()).expect("initial allocation");

    let mut snaps = Vec::new();
    for i in 0u64..10 {
        let mut txn = Transaction::new(behavior.clone());
        txn.put(key(&behavior, 5), 42, payload(&behavior, i % 3));
        assert_eq!(
            storage.apply_transaction(txn),
            TxnOutcome::Applied { version: i + 1 }
        );
        snaps.push(storage.get_snapshot());
    }

    for (i, snap) in snaps.iter().enumerate() {
        assert_eq!(snap.get(KeyHandle(5), 42), Some(PayloadHandle(i as u64 % 3)));
    }
}

#[test]
fn test_old_blob_fully_released_after_forced_merge() {
    let behavior = TestBehavior::new(1_000_000);
    // A two-slot refcount array: the base version plus exactly one more.
    // The transaction that comes after must go through phase 2.
    let cfg = Config {
        initial_index_blocks: 4,
        initial_data_blocks: 64,
        base_version: 0,
        max_versions: 2,
    };
    let storage = Storage::new(cfg, behavior.clone()).expect("initial allocation");

    let mut txn1 = Transaction::new(behavior.clone());
    txn1.put(key(&behavior, 5), 111, payload(&behavior, 1));
    assert_eq!(storage.apply_transaction(txn1), TxnOutcome::Applied { version: 1 });

    let mut txn2 = Transaction::new(behavior.clone());
    txn2.delete(key(&behavior, 5), 111);
    assert_eq!(storage.apply_transaction(txn2), TxnOutcome::Applied { version: 2 });

    let snap = storage.get_snapshot();
    assert_eq!(snap.keys_count(), 0);
    assert_eq!(snap.get(KeyHandle(5), 111), None);
    drop(snap);

    assert_eq!(behavior.key_balance(), 0, "key 5 has no remaining home");
    assert_eq!(behavior.payload_balance(), 0, "payload 1 released with the old blob");
}

/// §4.7 phase 3: a transaction that needs a merge but whose host
/// allocator refuses the new blob's page request leaves storage
/// permanently failed, without disturbing anything already durable.
#[test]
fn test_permanent_failure_when_merge_allocation_refused() {
    // Exactly enough pages for the initial blob and not one page more,
    // so the merge that version 2 forces has nothing to allocate from.
    let behavior = TestBehavior::new(2);
    let cfg = Config {
        initial_index_blocks: 4,
        initial_data_blocks: 64,
        base_version: 0,
        max_versions: 2,
    };
    let storage = Storage::new(cfg, behavior.clone()).expect("initial allocation");

    let mut txn1 = Transaction::new(behavior.clone());
    txn1.put(key(&behavior, 1), 10, payload(&behavior, 100));
    assert_eq!(storage.apply_transaction(txn1), TxnOutcome::Applied { version: 1 });

    let snap1 = storage.get_snapshot();
    assert_eq!(snap1.get(KeyHandle(1), 10), Some(PayloadHandle(100)));

    // The refcount array (capacity 2: offsets 0 and 1) is now full, so
    // this transaction must go through phase 2, and the allocator has
    // no pages left to hand out for the merged blob.
    let mut txn2 = Transaction::new(behavior.clone());
    txn2.put(key(&behavior, 2), 20, payload(&behavior, 200));
    assert_eq!(
        storage.apply_transaction(txn2),
        TxnOutcome::FailedDueToInsufficientResources
    );

    // The snapshot taken before the failed transaction is untouched.
    assert_eq!(snap1.get(KeyHandle(1), 10), Some(PayloadHandle(100)));

    // Once permanently failed, every further transaction short-circuits
    // the same way without even attempting to prepare.
    let mut txn3 = Transaction::new(behavior.clone());
    txn3.put(key(&behavior, 3), 30, payload(&behavior, 300));
    assert_eq!(
        storage.apply_transaction(txn3),
        TxnOutcome::FailedDueToInsufficientResources
    );

    drop(snap1);
    // Key 1 / payload 100 are still owned by the storage's one
    // remaining (now permanently frozen) blob; key 2/3 and payload
    // 200/300 never found a home, so the abandoned plan must have
    // released them exactly as fully as a never-submitted transaction
    // would have.
    assert_eq!(behavior.key_balance(), 1);
    assert_eq!(behavior.payload_balance(), 1);
}

/// A failed `require_*` precondition must report `AppliedWithNoEffect`
/// even when the blob's refcount array is exhausted at the same time,
/// forcing the version to be carried forward through a merge instead of
/// applied in place (§4.7 step 3; see DESIGN.md).
#[test]
fn test_validation_failure_through_forced_merge_is_still_no_effect() {
    let behavior = TestBehavior::new(1_000_000);
    let cfg = Config {
        initial_index_blocks: 4,
        initial_data_blocks: 64,
        base_version: 0,
        max_versions: 2,
    };
    let storage = Storage::new(cfg, behavior.clone()).expect("initial allocation");

    let mut txn1 = Transaction::new(behavior.clone());
    txn1.put(key(&behavior, 5), 111, payload(&behavior, 1));
    assert_eq!(storage.apply_transaction(txn1), TxnOutcome::Applied { version: 1 });

    // The refcount array (capacity 2) is now full, so this transaction
    // must go through phase 2 regardless of its own outcome. Its own
    // precondition also fails, so the result must still be no-effect.
    let mut txn2 = Transaction::new(behavior.clone());
    txn2.require_subkeys_count(key(&behavior, 5), 999);
    assert_eq!(
        storage.apply_transaction(txn2),
        TxnOutcome::AppliedWithNoEffect { version: 2 }
    );

    // Nothing about key 5's state actually changed.
    let snap = storage.get_snapshot();
    assert_eq!(snap.version(), 2);
    assert_eq!(snap.get(KeyHandle(5), 111), Some(PayloadHandle(1)));
    assert_eq!(snap.subkeys_count(KeyHandle(5)), 1);
}

/// §4.7 phase 2: a brand-new subkey put under an *already-existing* key
/// must survive a forced merge just as reliably as a brand-new key does,
/// and its payload handle must end up transferred rather than leaked
/// (see DESIGN.md — merge.rs's survivor walk used to only visit subkey
/// blocks that already existed in the old blob).
#[test]
fn test_new_subkey_under_existing_key_survives_forced_merge() {
    let behavior = TestBehavior::new(1_000_000);
    let cfg = Config {
        initial_index_blocks: 4,
        initial_data_blocks: 64,
        base_version: 0,
        max_versions: 2,
    };
    let storage = Storage::new(cfg, behavior.clone()).expect("initial allocation");

    let mut txn1 = Transaction::new(behavior.clone());
    txn1.put(key(&behavior, 5), 111, payload(&behavior, 1));
    assert_eq!(storage.apply_transaction(txn1), TxnOutcome::Applied { version: 1 });

    // The refcount array (capacity 2) is now full, so this transaction
    // must go through phase 2. Key 5 already exists (and so is
    // "touched", not "brand new" from merge.rs's point of view), but
    // subkey 222 under it has never been seen before.
    let mut txn2 = Transaction::new(behavior.clone());
    txn2.put(key(&behavior, 5), 222, payload(&behavior, 2));
    assert_eq!(storage.apply_transaction(txn2), TxnOutcome::Applied { version: 2 });

    let snap = storage.get_snapshot();
    assert_eq!(snap.get(KeyHandle(5), 111), Some(PayloadHandle(1)));
    assert_eq!(snap.get(KeyHandle(5), 222), Some(PayloadHandle(2)));
    assert_eq!(snap.subkeys_count(KeyHandle(5)), 2);
    drop(snap);

    assert_eq!(behavior.key_balance(), 1);
    assert_eq!(behavior.payload_balance(), 2);
}

/// A subkey's deletion marker must survive migration from its inline
/// version slots into a version-block chain: a snapshot taken between
/// the delete and the put that forces the migration must still read
/// `None`, not the payload that preceded the delete (see DESIGN.md —
/// the migration used to force every slot's `deleted` bit to `false`).
#[test]
fn test_deletion_survives_inline_to_chain_migration() {
    let behavior = TestBehavior::new(1_000_000);
    let storage = Storage::new(small_config(), behavior.clone()).expect("initial allocation");

    let mut txn1 = Transaction::new(behavior.clone());
    txn1.put(key(&behavior, 5), 111, payload(&behavior, 1));
    assert_eq!(storage.apply_transaction(txn1), TxnOutcome::Applied { version: 1 });

    let mut txn2 = Transaction::new(behavior.clone());
    txn2.delete(key(&behavior, 5), 111);
    assert_eq!(storage.apply_transaction(txn2), TxnOutcome::Applied { version: 2 });

    // Held across the migration-triggering write below.
    let snap2 = storage.get_snapshot();
    assert_eq!(snap2.version(), 2);
    assert_eq!(snap2.get(KeyHandle(5), 111), None);

    // The subkey's two inline version slots (put@1, delete@2) are both
    // full; this third write forces migration into a version-block chain.
    let mut txn3 = Transaction::new(behavior.clone());
    txn3.put(key(&behavior, 5), 111, payload(&behavior, 2));
    assert_eq!(storage.apply_transaction(txn3), TxnOutcome::Applied { version: 3 });

    // The deletion must still be there for the snapshot that predates
    // the migration, and the new payload for one taken after it.
    assert_eq!(snap2.get(KeyHandle(5), 111), None);
    let snap3 = storage.get_snapshot();
    assert_eq!(snap3.get(KeyHandle(5), 111), Some(PayloadHandle(2)));
}

#[test]
fn test_transaction_dropped_without_applying_releases_everything() {
    let behavior = TestBehavior::new(1_000_000);
    {
        let mut txn = Transaction::new(behavior.clone());
        txn.put(key(&behavior, 1), 1, payload(&behavior, 1));
        txn.require_payload(key(&behavior, 1), 2, payload(&behavior, 99));
        // txn goes out of scope here, unapplied.
    }
    assert_eq!(behavior.key_balance(), 0);
    assert_eq!(behavior.payload_balance(), 0);
}

/// Plain `(key, subkey) -> payload` mirror of everything put into
/// `Storage` so far, in the style of `llrb_test.rs`'s `RefNodes`: a
/// trivial, obviously-correct model checked against the real thing
/// after every transaction instead of trusted on its own.
struct RefModel {
    entries: BTreeMap<(u64, u64), u64>,
}

impl RefModel {
    fn new() -> RefModel {
        RefModel {
            entries: BTreeMap::new(),
        }
    }

    fn put(&mut self, key: u64, subkey: u64, payload: u64) {
        self.entries.insert((key, subkey), payload);
    }

    fn delete(&mut self, key: u64, subkey: u64) {
        self.entries.remove(&(key, subkey));
    }

    fn subkeys_count(&self, key: u64) -> u32 {
        self.entries.keys().filter(|(k, _)| *k == key).count() as u32
    }

    fn keys(&self) -> Vec<u64> {
        let mut ks: Vec<u64> = self.entries.keys().map(|(k, _)| *k).collect();
        ks.dedup();
        ks
    }

    fn subkeys(&self, key: u64) -> Vec<u64> {
        self.entries
            .range((key, 0)..(key + 1, 0))
            .map(|((_, sk), _)| *sk)
            .collect()
    }

    fn get(&self, key: u64, subkey: u64) -> Option<u64> {
        self.entries.get(&(key, subkey)).copied()
    }
}

/// Randomized cross-check (§2.1 "Test tooling"): apply a long run of
/// random put/delete transactions over a small key/subkey universe and,
/// after every one, compare the resulting snapshot against `RefModel`
/// field by field. Catches anything a hand-picked scenario wouldn't:
/// wrong counts, stale reads, wrong iteration order, or a
/// double-released handle (the latter via `TestBehavior`'s own
/// bookkeeping once every snapshot has been dropped).
#[test]
fn test_randomized_put_delete_matches_reference_model() {
    let behavior = TestBehavior::new(10_000_000);
    let cfg = Config {
        initial_index_blocks: 4,
        initial_data_blocks: 16,
        base_version: 0,
        max_versions: 32,
    };
    let storage = Storage::new(cfg, behavior.clone()).expect("initial allocation");
    let mut model = RefModel::new();
    let mut next_payload = 0u64;

    const KEYS: u64 = 6;
    const SUBKEYS: u64 = 10;

    for _ in 0..400 {
        let mut txn = Transaction::new(behavior.clone());
        let k = random::<u64>() % KEYS;
        let ops = 1 + (random::<u64>() % 3);
        for _ in 0..ops {
            let sk = random::<u64>() % SUBKEYS;
            if random::<bool>() {
                next_payload += 1;
                let p = next_payload;
                txn.put(key(&behavior, k), sk, payload(&behavior, p));
                model.put(k, sk, p);
            } else {
                txn.delete(key(&behavior, k), sk);
                model.delete(k, sk);
            }
        }
        storage.apply_transaction(txn);

        let snap = storage.get_snapshot();
        assert_eq!(snap.subkeys_count(KeyHandle(k)), model.subkeys_count(k));
        let got: Vec<u64> = snap.subkeys(KeyHandle(k)).map(|(sk, _)| sk).collect();
        assert_eq!(got, model.subkeys(k));
        for sk in 0..SUBKEYS {
            let got = snap.get(KeyHandle(k), sk).map(|p| p.0);
            assert_eq!(got, model.get(k, sk), "key={} subkey={}", k, sk);
        }
        let mut snap_keys: Vec<u64> = snap.keys().map(|kh| kh.0).collect();
        snap_keys.sort();
        let mut model_keys = model.keys();
        model_keys.sort();
        assert_eq!(snap_keys, model_keys);
    }

    assert_eq!(behavior.key_balance(), 0);
    assert_eq!(behavior.payload_balance(), 0);
}
