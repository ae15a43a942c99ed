//! # Index
//!
//! An in-memory, multi-version, lock-free key-value index for the UndertowKV
//! storage engine.
//!
//! The index is the read path for every committed write. It is an append-only
//! chain of immutable version nodes, newest first, reachable from a single
//! atomic head cell — the only mutable location in the whole structure.
//!
//! ## Key properties
//! - **Wait-free reads**: one acquire load of the head plus pointer chasing;
//!   readers never block and never observe a partially built node.
//! - **Snapshot visibility**: every node carries the commit version that
//!   published it; a read at `visible_up_to = v` sees exactly the newest
//!   write per key with version `<= v`.
//! - **Tombstone support**: deletes are published as tombstone nodes that
//!   shadow older versions of their key.
//! - **Deferred reclamation**: published nodes are never freed while the
//!   index is alive; the whole chain is reclaimed when the index is dropped,
//!   at which point exclusive ownership rules out concurrent readers.
//!
//! ## Example
//! ```rust
//! use index::VersionedIndex;
//!
//! let idx = VersionedIndex::new();
//! idx.apply(b"hello", Some(b"world"), 1);
//! assert_eq!(idx.read(b"hello", 1), Some(&b"world"[..]));
//! assert_eq!(idx.read(b"hello", 0), None);
//!
//! idx.apply(b"hello", None, 2);
//! assert_eq!(idx.read(b"hello", 2), None);
//! ```

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use thiserror::Error;

/// One immutable version of one key.
///
/// Every field is fully initialized before the node's address is published
/// into the head cell, and no field is ever mutated afterwards. `next` points
/// at the node that was the head at publication time, so the chain is ordered
/// newest-first.
struct Node {
    key: Vec<u8>,
    value: Vec<u8>,
    /// `true` marks a delete: the node shadows older versions of `key` and
    /// reads resolving to it report the key as absent.
    tombstone: bool,
    version: u64,
    next: *mut Node,
}

/// Append-only multi-version index with a single atomic head.
///
/// Supports any number of concurrent readers alongside one writer. Writers
/// publish fully built nodes with a release store; readers snapshot the head
/// with an acquire load and traverse an immutable chain from there, so a
/// read's result can never change once the head load has returned.
pub struct VersionedIndex {
    head: AtomicPtr<Node>,
    len: AtomicUsize,
}

// Nodes are immutable once published and are only freed in `drop`, which has
// exclusive access. Raw pointers are the reason these impls don't come for
// free.
unsafe impl Send for VersionedIndex {}
unsafe impl Sync for VersionedIndex {}

impl VersionedIndex {
    /// Creates a new, empty index.
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Snapshot read: returns the value of the newest node for `key` with
    /// `version <= visible_up_to`, or `None` if there is no such node or the
    /// newest visible node is a tombstone.
    ///
    /// The returned slice borrows node memory owned by the index, which
    /// outlives every outstanding borrow by construction (nodes are freed
    /// only on drop).
    pub fn read(&self, key: &[u8], visible_up_to: u64) -> Option<&[u8]> {
        let mut curr = self.head.load(Ordering::Acquire);
        while !curr.is_null() {
            // Safety: published nodes are immutable and live until `drop`.
            let node = unsafe { &*curr };
            if node.version <= visible_up_to && node.key == key {
                if node.tombstone {
                    return None;
                }
                return Some(node.value.as_slice());
            }
            curr = node.next;
        }
        None
    }

    /// Publishes a new version of `key` stamped with `commit_version`.
    ///
    /// `value == None` publishes a tombstone. The node is built completely
    /// off-list and becomes visible in a single release store, so a reader
    /// that observes it observes all of its fields (and everything behind
    /// it in the chain).
    ///
    /// The engine drives this from a single writer; the CAS loop below keeps
    /// the chain intact even if that contract is broken, at the cost of a
    /// retry.
    pub fn apply(&self, key: &[u8], value: Option<&[u8]>, commit_version: u64) {
        let node = Box::into_raw(Box::new(Node {
            key: key.to_vec(),
            value: value.unwrap_or_default().to_vec(),
            tombstone: value.is_none(),
            version: commit_version,
            next: self.head.load(Ordering::Acquire),
        }));
        loop {
            // Safety: `node` is not yet published; this thread owns it.
            let expected = unsafe { (*node).next };
            match self
                .head
                .compare_exchange(expected, node, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => unsafe { (*node).next = actual },
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of published nodes (all versions, tombstones
    /// included).
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns `true` if nothing has ever been published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for VersionedIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VersionedIndex {
    fn drop(&mut self) {
        let mut curr = *self.head.get_mut();
        while !curr.is_null() {
            // Safety: `&mut self` guarantees no reader holds a borrow into
            // the chain; each node was allocated via `Box::into_raw`.
            let node = unsafe { Box::from_raw(curr) };
            curr = node.next;
        }
    }
}

/// Options for [`StorageEngine::read`]: the snapshot version the read runs
/// against.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub visible_up_to: u64,
}

/// Options for [`StorageEngine::apply`]: the commit version stamped on the
/// write.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub commit_version: u64,
}

/// Generic storage failure, reserved for engines that can actually fail
/// (quota, invalid arguments). The in-memory index never produces one today.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// The surface a transaction coordinator drives.
///
/// `Ok(None)` from `read` is the NotFound result; borrowed values live at
/// least as long as the engine itself.
pub trait StorageEngine {
    fn read(&self, key: &[u8], opts: ReadOptions) -> Result<Option<&[u8]>, StorageError>;

    /// Applies one committed mutation. `value == None` is a delete.
    fn apply(
        &self,
        key: &[u8],
        value: Option<&[u8]>,
        opts: WriteOptions,
    ) -> Result<(), StorageError>;
}

impl StorageEngine for VersionedIndex {
    fn read(&self, key: &[u8], opts: ReadOptions) -> Result<Option<&[u8]>, StorageError> {
        Ok(VersionedIndex::read(self, key, opts.visible_up_to))
    }

    fn apply(
        &self,
        key: &[u8],
        value: Option<&[u8]>,
        opts: WriteOptions,
    ) -> Result<(), StorageError> {
        VersionedIndex::apply(self, key, value, opts.commit_version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    // -------------------- Basic reads & writes --------------------

    #[test]
    fn read_empty_index_returns_none() {
        let idx = VersionedIndex::new();
        assert_eq!(idx.read(b"key1", 0), None);
        assert_eq!(idx.read(b"key1", u64::MAX), None);
    }

    #[test]
    fn write_then_read_at_version() {
        let idx = VersionedIndex::new();
        idx.apply(b"key1", Some(b"hello"), 1);
        assert_eq!(idx.read(b"key1", 1), Some(&b"hello"[..]));
    }

    #[test]
    fn write_invisible_below_its_version() {
        let idx = VersionedIndex::new();
        idx.apply(b"key1", Some(b"hello"), 1);
        assert_eq!(idx.read(b"key1", 0), None);
    }

    #[test]
    fn overwrite_visibility_per_snapshot() {
        let idx = VersionedIndex::new();
        idx.apply(b"k", Some(b"v1"), 1);
        idx.apply(b"k", Some(b"v2"), 2);
        assert_eq!(idx.read(b"k", 1), Some(&b"v1"[..]));
        assert_eq!(idx.read(b"k", 2), Some(&b"v2"[..]));
        assert_eq!(idx.read(b"k", u64::MAX), Some(&b"v2"[..]));
    }

    #[test]
    fn read_missing_key_with_other_keys_present() {
        let idx = VersionedIndex::new();
        idx.apply(b"a", Some(b"1"), 1);
        idx.apply(b"b", Some(b"2"), 2);
        assert_eq!(idx.read(b"c", 10), None);
    }

    #[test]
    fn future_versions_are_skipped_not_terminal() {
        let idx = VersionedIndex::new();
        idx.apply(b"k", Some(b"old"), 1);
        idx.apply(b"other", Some(b"x"), 2);
        idx.apply(b"k", Some(b"new"), 3);
        // Snapshot 2 must skip the version-3 node and find version 1.
        assert_eq!(idx.read(b"k", 2), Some(&b"old"[..]));
    }

    // -------------------- Tombstones --------------------

    #[test]
    fn tombstone_shadows_older_value() {
        let idx = VersionedIndex::new();
        idx.apply(b"k", Some(b"v"), 1);
        idx.apply(b"k", None, 2);
        assert_eq!(idx.read(b"k", 1), Some(&b"v"[..]));
        assert_eq!(idx.read(b"k", 2), None);
    }

    #[test]
    fn tombstone_for_never_written_key() {
        let idx = VersionedIndex::new();
        idx.apply(b"ghost", None, 1);
        assert_eq!(idx.read(b"ghost", 1), None);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn rewrite_after_tombstone_resurrects_key() {
        let idx = VersionedIndex::new();
        idx.apply(b"k", Some(b"v1"), 1);
        idx.apply(b"k", None, 2);
        idx.apply(b"k", Some(b"v2"), 3);
        assert_eq!(idx.read(b"k", 2), None);
        assert_eq!(idx.read(b"k", 3), Some(&b"v2"[..]));
    }

    #[test]
    fn tombstone_distinct_from_empty_value() {
        let idx = VersionedIndex::new();
        idx.apply(b"k", Some(b""), 1);
        // An empty value is Found; only a tombstone is NotFound.
        assert_eq!(idx.read(b"k", 1), Some(&b""[..]));
        idx.apply(b"k", None, 2);
        assert_eq!(idx.read(b"k", 2), None);
    }

    // -------------------- Edge cases --------------------

    #[test]
    fn empty_key_is_a_key() {
        let idx = VersionedIndex::new();
        idx.apply(b"", Some(b"anon"), 1);
        assert_eq!(idx.read(b"", 1), Some(&b"anon"[..]));
        assert_eq!(idx.read(b"x", 1), None);
    }

    #[test]
    fn binary_keys_compare_by_bytes() {
        let idx = VersionedIndex::new();
        let key = [0x00, 0xFF, 0x80, 0x01];
        let val = [0xDE, 0xAD, 0xBE, 0xEF];
        idx.apply(&key, Some(&val), 1);
        assert_eq!(idx.read(&key, 1), Some(&val[..]));
        assert_eq!(idx.read(&key[..3], 1), None);
    }

    #[test]
    fn duplicate_version_returns_first_found() {
        // The coordinator must never emit two writes of one key at the same
        // version; if it does, the newer publication wins (first in chain).
        let idx = VersionedIndex::new();
        idx.apply(b"k", Some(b"first"), 5);
        idx.apply(b"k", Some(b"second"), 5);
        assert_eq!(idx.read(b"k", 5), Some(&b"second"[..]));
    }

    #[test]
    fn version_zero_write_visible_at_zero() {
        let idx = VersionedIndex::new();
        idx.apply(b"k", Some(b"v"), 0);
        assert_eq!(idx.read(b"k", 0), Some(&b"v"[..]));
    }

    #[test]
    fn version_max_u64() {
        let idx = VersionedIndex::new();
        idx.apply(b"k", Some(b"v"), u64::MAX);
        assert_eq!(idx.read(b"k", u64::MAX), Some(&b"v"[..]));
        assert_eq!(idx.read(b"k", u64::MAX - 1), None);
    }

    // -------------------- len / is_empty --------------------

    #[test]
    fn len_counts_every_version() {
        let idx = VersionedIndex::new();
        assert!(idx.is_empty());
        idx.apply(b"k", Some(b"v1"), 1);
        idx.apply(b"k", Some(b"v2"), 2);
        idx.apply(b"k", None, 3);
        assert_eq!(idx.len(), 3);
        assert!(!idx.is_empty());
    }

    // -------------------- Load --------------------

    #[test]
    fn many_versions_of_one_key() {
        let idx = VersionedIndex::new();
        for v in 1..=10_000u64 {
            idx.apply(b"k", Some(format!("v{}", v).as_bytes()), v);
        }
        assert_eq!(idx.read(b"k", 10_000), Some(&b"v10000"[..]));
        assert_eq!(idx.read(b"k", 5_000), Some(&b"v5000"[..]));
        assert_eq!(idx.read(b"k", 1), Some(&b"v1"[..]));
        assert_eq!(idx.len(), 10_000);
    }

    #[test]
    fn many_distinct_keys() {
        let idx = VersionedIndex::new();
        for i in 0..1_000u64 {
            idx.apply(format!("key{:04}", i).as_bytes(), Some(b"v"), i + 1);
        }
        for i in 0..1_000u64 {
            assert_eq!(
                idx.read(format!("key{:04}", i).as_bytes(), 1_000),
                Some(&b"v"[..])
            );
        }
    }

    // -------------------- StorageEngine trait --------------------

    #[test]
    fn trait_surface_maps_found_and_not_found() {
        let idx = VersionedIndex::new();
        StorageEngine::apply(
            &idx,
            b"k",
            Some(b"v"),
            WriteOptions { commit_version: 1 },
        )
        .unwrap();

        let found = StorageEngine::read(&idx, b"k", ReadOptions { visible_up_to: 1 }).unwrap();
        assert_eq!(found, Some(&b"v"[..]));

        let missing = StorageEngine::read(&idx, b"nope", ReadOptions { visible_up_to: 1 }).unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn trait_delete_is_tombstone() {
        let idx = VersionedIndex::new();
        StorageEngine::apply(&idx, b"k", Some(b"v"), WriteOptions { commit_version: 1 }).unwrap();
        StorageEngine::apply(&idx, b"k", None, WriteOptions { commit_version: 2 }).unwrap();
        let gone = StorageEngine::read(&idx, b"k", ReadOptions { visible_up_to: 2 }).unwrap();
        assert_eq!(gone, None);
    }

    // -------------------- Concurrency --------------------

    #[test]
    fn concurrent_readers_see_consistent_snapshots() {
        const VERSIONS: u64 = 2_000;
        let idx = Arc::new(VersionedIndex::new());

        let writer = {
            let idx = Arc::clone(&idx);
            thread::spawn(move || {
                for v in 1..=VERSIONS {
                    idx.apply(b"k", Some(&v.to_le_bytes()), v);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|r| {
                let idx = Arc::clone(&idx);
                thread::spawn(move || {
                    for i in 0..10_000u64 {
                        let snapshot = (i * 7 + r) % (VERSIONS + 1);
                        if let Some(value) = idx.read(b"k", snapshot) {
                            let version = u64::from_le_bytes(value.try_into().unwrap());
                            // A snapshot read never observes a write newer
                            // than its visibility bound.
                            assert!(version <= snapshot);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }

        // After the writer finishes, every snapshot resolves exactly.
        for v in 1..=VERSIONS {
            let value = idx.read(b"k", v).unwrap();
            assert_eq!(u64::from_le_bytes(value.try_into().unwrap()), v);
        }
    }

    #[test]
    fn in_flight_read_unaffected_by_later_writes() {
        let idx = VersionedIndex::new();
        idx.apply(b"k", Some(b"stable"), 1);
        let borrowed = idx.read(b"k", 1).unwrap();
        // New publications extend the chain at the head; the borrowed node
        // is immutable behind it.
        idx.apply(b"k", Some(b"newer"), 2);
        idx.apply(b"other", Some(b"x"), 3);
        assert_eq!(borrowed, b"stable");
    }
}
