//! # WAL — transactional write-ahead log
//!
//! Crash-safe, append-only log for the UndertowKV storage engine.
//!
//! Every mutation reaches disk before it reaches the in-memory index. Records
//! are framed by the v2 codec in [`format`]: self-delimiting, checksummed,
//! byte-stable. A transaction is the unit of durability and atomicity:
//!
//! - `BEGIN(txid)` opens a transaction. It has zero durability meaning.
//! - `PUT`/`DELETE` records carry the transaction's mutations.
//! - `COMMIT(txid)` seals it. [`Wal::commit`] is the only operation that
//!   fsyncs; once it returns, the whole transaction is durable.
//!
//! ## Replay
//!
//! [`Wal::replay`] rebuilds state from the log using strict-prefix, two-pass
//! replay. Pass one scans records sequentially and stops dead at the first
//! corrupt record (torn write, bit rot, bad length, unknown type) — nothing
//! after it is trusted. Pass two hands the mutations of committed
//! transactions to the caller, in commit order across transactions and append
//! order within one. Partial transactions are discarded, so recovery is
//! all-or-nothing per transaction.

mod format;

pub use format::{
    decode_next, encode_begin, encode_commit, encode_delete, encode_put, Corruption, Decoded,
    Record, RecordType, HEADER_BYTES, MAX_KEY_LEN, MAX_VALUE_LEN, WAL_MAGIC, WAL_VERSION,
};

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// A committed mutation handed to the replay callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("key length {len} exceeds limit {MAX_KEY_LEN}")]
    KeyTooLarge { len: usize },
    #[error("value length {len} exceeds limit {MAX_VALUE_LEN}")]
    ValueTooLarge { len: usize },
}

/// What replay found in the log.
///
/// Corruption and discarded transactions are reported here (and via
/// `tracing`), not as errors — a torn tail after a crash is the expected
/// case, and the valid prefix defines truth.
#[derive(Debug, Default)]
pub struct ReplayStats {
    /// Records that passed every format and checksum check.
    pub records_scanned: u64,
    /// Transactions whose `COMMIT` landed inside the valid prefix.
    pub committed_txns: u64,
    /// Transactions seen via `BEGIN` but never committed in the prefix.
    pub discarded_txns: u64,
    /// `PUT`/`DELETE` records delivered to the apply callback.
    pub ops_applied: u64,
    /// `PUT`/`DELETE` records with no preceding `BEGIN` for their txid.
    pub orphan_records: u64,
    /// Highest txid observed anywhere in the valid prefix, committed or not.
    /// Coordinators must mint txids above this; reusing an uncommitted txid
    /// would adopt its stranded operations on the next replay.
    pub max_txid: Option<u64>,
    /// Why the scan stopped, if it did not reach a clean end of log.
    pub corruption: Option<Corruption>,
}

/// Append-only transactional log backed by a single file.
///
/// One `Wal` owns the write descriptor for its file. Replay opens its own
/// read-only handle, so any number of replays may run against a log that is
/// no longer being appended to.
pub struct Wal {
    file: File,
    path: PathBuf,
}

impl Wal {
    /// Opens the log for appending, creating it (mode `0644`) if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalError> {
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o644);
        }
        let file = opts.open(path.as_ref())?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Appends `BEGIN(txid)`. Not durable by itself.
    pub fn begin(&mut self, txid: u64) -> Result<(), WalError> {
        self.append_bytes(&encode_begin(txid))
    }

    /// Appends `PUT(txid, key, value)`. Not durable by itself.
    ///
    /// Over-limit keys or values are rejected before any byte reaches the
    /// file, so a failed put never poisons the log.
    pub fn put(&mut self, txid: u64, key: &[u8], value: &[u8]) -> Result<(), WalError> {
        check_key(key)?;
        if value.len() > MAX_VALUE_LEN as usize {
            return Err(WalError::ValueTooLarge { len: value.len() });
        }
        self.append_bytes(&encode_put(txid, key, value))
    }

    /// Appends `DELETE(txid, key)`. Not durable by itself.
    pub fn delete(&mut self, txid: u64, key: &[u8]) -> Result<(), WalError> {
        check_key(key)?;
        self.append_bytes(&encode_delete(txid, key))
    }

    /// Appends `COMMIT(txid)` and fsyncs.
    ///
    /// This is the single durability point: on `Ok`, every record of the
    /// transaction — and everything appended before it — has reached stable
    /// storage. Exactly one fsync is issued per commit.
    pub fn commit(&mut self, txid: u64) -> Result<(), WalError> {
        self.append_bytes(&encode_commit(txid))?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Writes one encoded record, retrying transparently on interrupt.
    fn append_bytes(&mut self, bytes: &[u8]) -> Result<(), WalError> {
        let mut written = 0;
        while written < bytes.len() {
            match self.file.write(&bytes[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(WalError::Io(e)),
            }
        }
        Ok(())
    }

    /// Replays the valid prefix of the log, invoking `apply` exactly once per
    /// `PUT`/`DELETE` record of every committed transaction.
    ///
    /// Transactions are applied in the order their `COMMIT` records appear;
    /// within one transaction, operations arrive in append order and
    /// contiguously. Records of uncommitted transactions are discarded.
    ///
    /// Corruption anywhere ends the prefix and the scan: the outcome is
    /// recorded in [`ReplayStats::corruption`] and logged, never raised. Only
    /// failing to open the file is an error.
    pub fn replay<F>(&self, mut apply: F) -> Result<ReplayStats, WalError>
    where
        F: FnMut(u64, TxOp),
    {
        let mut rdr = BufReader::new(File::open(&self.path)?);
        let mut stats = ReplayStats::default();

        // Pass 1: scan the valid prefix, bucketing ops by transaction.
        let mut pending: HashMap<u64, Vec<TxOp>> = HashMap::new();
        let mut committed: HashSet<u64> = HashSet::new();
        let mut commit_order: Vec<u64> = Vec::new();

        loop {
            let record = match decode_next(&mut rdr) {
                Decoded::Record(r) => r,
                Decoded::EndOfLog => break,
                Decoded::Corrupt(reason) => {
                    warn!(
                        record = stats.records_scanned + 1,
                        %reason,
                        "wal replay stopped at corrupt record; trusting prefix"
                    );
                    stats.corruption = Some(reason);
                    break;
                }
            };
            stats.records_scanned += 1;
            stats.max_txid = Some(stats.max_txid.map_or(record.txid, |m| m.max(record.txid)));

            match record.rtype {
                RecordType::Begin => {
                    pending.entry(record.txid).or_default();
                }
                RecordType::Put => match pending.get_mut(&record.txid) {
                    Some(ops) => ops.push(TxOp::Put {
                        key: record.key,
                        value: record.value,
                    }),
                    None => {
                        warn!(txid = record.txid, "orphan PUT without BEGIN, skipped");
                        stats.orphan_records += 1;
                    }
                },
                RecordType::Delete => match pending.get_mut(&record.txid) {
                    Some(ops) => ops.push(TxOp::Delete { key: record.key }),
                    None => {
                        warn!(txid = record.txid, "orphan DELETE without BEGIN, skipped");
                        stats.orphan_records += 1;
                    }
                },
                RecordType::Commit => {
                    if committed.insert(record.txid) {
                        commit_order.push(record.txid);
                    }
                }
            }
        }

        // Pass 2: apply committed transactions, commit order across
        // transactions, append order within one.
        for txid in &commit_order {
            let ops = pending.remove(txid).unwrap_or_default();
            for op in ops {
                apply(*txid, op);
                stats.ops_applied += 1;
            }
        }
        stats.committed_txns = commit_order.len() as u64;
        stats.discarded_txns = pending.len() as u64;

        for txid in pending.keys() {
            debug!(txid = *txid, "discarding uncommitted transaction");
        }
        debug!(
            records = stats.records_scanned,
            committed = stats.committed_txns,
            discarded = stats.discarded_txns,
            ops = stats.ops_applied,
            "wal replay finished"
        );
        Ok(stats)
    }
}

fn check_key(key: &[u8]) -> Result<(), WalError> {
    if key.len() > MAX_KEY_LEN as usize {
        return Err(WalError::KeyTooLarge { len: key.len() });
    }
    Ok(())
}
