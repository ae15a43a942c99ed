//! # Engine — transaction coordinator
//!
//! Thin glue binding the [`wal`] and [`index`] crates into a durable,
//! transactional key-value engine for UndertowKV.
//!
//! The commit protocol is WAL-first: a transaction's records (`BEGIN`, then
//! `PUT`/`DELETE` as operations are issued, then `COMMIT` + fsync) are all on
//! disk before any mutation touches the in-memory index. Only after
//! [`Wal::commit`] returns are the buffered operations published, all under
//! one freshly minted commit version, so the whole transaction becomes
//! visible to readers atomically.
//!
//! On [`Engine::open`] the log is replayed before any new transaction is
//! accepted: committed transactions are rebuilt into a fresh index (one
//! commit version each, in commit order) and the txid/version counters are
//! restored past everything the log has seen.

use anyhow::{Context, Result};
use index::VersionedIndex;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use wal::{ReplayStats, TxOp, Wal};

/// Durable transactional key-value engine: one WAL, one versioned index,
/// one writer.
///
/// Writes go through [`Engine::begin`]; the `&mut` borrow held by the
/// returned [`Txn`] enforces the single-writer model at compile time.
/// Readers are unconstrained: [`Engine::index`] hands out the shared index
/// for wait-free snapshot reads from any number of threads.
pub struct Engine {
    wal: Wal,
    idx: Arc<VersionedIndex>,
    next_txid: u64,
    last_version: u64,
}

impl Engine {
    /// Opens (or creates) the WAL at `path` and replays it into a fresh
    /// index.
    ///
    /// Replay trusts the valid prefix of the log: committed transactions are
    /// applied in commit order, each under its own commit version;
    /// uncommitted or torn transactions are dropped. The txid counter
    /// resumes above every txid the log mentions, so an id stranded by a
    /// crash is never reissued (reusing it would adopt the stranded
    /// operations on the next replay).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Engine> {
        let path = path.as_ref();
        let wal =
            Wal::open(path).with_context(|| format!("opening wal at {}", path.display()))?;

        let idx = Arc::new(VersionedIndex::new());
        let mut last_version = 0u64;
        let mut current_txid = None;
        let stats: ReplayStats = wal.replay(|txid, op| {
            // Replay delivers each transaction's ops contiguously; one
            // version per transaction keeps its effects atomic to readers.
            if current_txid != Some(txid) {
                current_txid = Some(txid);
                last_version += 1;
            }
            match op {
                TxOp::Put { key, value } => idx.apply(&key, Some(&value), last_version),
                TxOp::Delete { key } => idx.apply(&key, None, last_version),
            }
        })?;

        info!(
            path = %path.display(),
            committed = stats.committed_txns,
            discarded = stats.discarded_txns,
            ops = stats.ops_applied,
            version = last_version,
            "engine recovered"
        );

        Ok(Engine {
            wal,
            idx,
            next_txid: stats.max_txid.map_or(1, |t| t + 1),
            last_version,
        })
    }

    /// Starts a new transaction: mints a txid and appends its `BEGIN`
    /// record.
    pub fn begin(&mut self) -> Result<Txn<'_>> {
        let txid = self.next_txid;
        self.wal.begin(txid).context("appending BEGIN")?;
        self.next_txid += 1;
        Ok(Txn {
            engine: self,
            txid,
            ops: Vec::new(),
        })
    }

    /// Snapshot read at the latest committed version.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.idx.read(key, self.last_version)
    }

    /// Snapshot read at an explicit version.
    pub fn get_at(&self, key: &[u8], visible_up_to: u64) -> Option<&[u8]> {
        self.idx.read(key, visible_up_to)
    }

    /// The version a plain [`Engine::get`] currently runs against.
    pub fn snapshot_version(&self) -> u64 {
        self.last_version
    }

    /// The most recently minted txid, committed or not; `0` if no
    /// transaction has ever been started against this log.
    pub fn last_txid(&self) -> u64 {
        self.next_txid - 1
    }

    /// Shared handle to the index for concurrent readers on other threads.
    ///
    /// Pair it with [`Engine::snapshot_version`] to pin a stable snapshot.
    pub fn index(&self) -> Arc<VersionedIndex> {
        Arc::clone(&self.idx)
    }
}

/// An open transaction borrowing the engine's single writer slot.
///
/// Operations append to the WAL immediately (not durable yet) and are
/// buffered for index publication at commit. Dropping an uncommitted `Txn`
/// abandons it: its records stay in the log but replay filters them out, so
/// abandonment is equivalent to a crash before commit.
pub struct Txn<'a> {
    engine: &'a mut Engine,
    txid: u64,
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl Txn<'_> {
    pub fn txid(&self) -> u64 {
        self.txid
    }

    /// Stages a write of `key = value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.engine
            .wal
            .put(self.txid, key, value)
            .context("appending PUT")?;
        self.ops.push((key.to_vec(), Some(value.to_vec())));
        Ok(())
    }

    /// Stages a delete of `key`.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.engine
            .wal
            .delete(self.txid, key)
            .context("appending DELETE")?;
        self.ops.push((key.to_vec(), None));
        Ok(())
    }

    /// Commits: appends `COMMIT`, fsyncs, then publishes every staged
    /// operation under one new commit version.
    ///
    /// Returns the engine's snapshot version after the commit. Durability
    /// comes first — if the fsync fails, nothing reaches the index.
    pub fn commit(self) -> Result<u64> {
        self.engine
            .wal
            .commit(self.txid)
            .context("committing transaction")?;

        if !self.ops.is_empty() {
            let version = self.engine.last_version + 1;
            for (key, value) in &self.ops {
                self.engine.idx.apply(key, value.as_deref(), version);
            }
            self.engine.last_version = version;
        }
        Ok(self.engine.last_version)
    }
}
