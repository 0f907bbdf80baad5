//! Durable transaction status log
//!
//! Every status transition is persisted as an immutable fact keyed by
//! `(transaction id, status ordinal)` before the in-memory "last status" map
//! is updated. On startup the whole partition is scanned and, when several
//! entries exist for one id (a crash between writes can leave more than one),
//! the most advanced status wins: write order defines state progression
//! monotonically, so the surviving entry is the one whose status is not a
//! predecessor of any other observed entry for that id.

use crate::error::{Result, TransactionError};
use crate::status::TransactionStatus;
use crate::transaction_id::TransactionId;
use chrono::{DateTime, Utc};
use fjall::{Keyspace, Partition, PartitionCreateOptions, PersistMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const STATUS_PARTITION: &str = "txn_status";

/// One persisted status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub last_accessed: DateTime<Utc>,
    pub two_phase: bool,
}

impl TransactionLogEntry {
    pub fn new(transaction_id: TransactionId, status: TransactionStatus, two_phase: bool) -> Self {
        Self {
            transaction_id,
            status,
            last_accessed: Utc::now(),
            two_phase,
        }
    }
}

/// Append-only, crash-recoverable store of the last known status per
/// transaction id. The coordinator and each participant own independent
/// instances.
pub trait TransactionLog: Send + Sync {
    /// Durably persist a transition. The write is synced before this returns;
    /// a storage error is fatal to the calling operation, which must abort
    /// rather than proceed with an unlogged transition.
    fn log_status(&self, entry: TransactionLogEntry) -> Result<()>;

    /// Snapshot of the most advanced observed entry per transaction id.
    fn last_entries(&self) -> HashMap<TransactionId, TransactionLogEntry>;

    /// Snapshot of the most advanced observed status per transaction id.
    fn last_statuses(&self) -> HashMap<TransactionId, TransactionStatus> {
        self.last_entries()
            .into_iter()
            .map(|(id, entry)| (id, entry.status))
            .collect()
    }
}

fn encode_entry(entry: &TransactionLogEntry) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(entry, &mut bytes)
        .map_err(|e| TransactionError::LogEncoding(e.to_string()))?;
    Ok(bytes)
}

fn decode_entry(bytes: &[u8]) -> Result<TransactionLogEntry> {
    ciborium::de::from_reader(bytes).map_err(|e| TransactionError::LogEncoding(e.to_string()))
}

fn entry_key(id: TransactionId, status: TransactionStatus) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[..16].copy_from_slice(&id.to_bytes());
    key[16] = status.ordinal();
    key
}

/// Keep the more advanced of two candidate entries for the same id.
fn keep_most_advanced(
    entries: &mut HashMap<TransactionId, TransactionLogEntry>,
    candidate: TransactionLogEntry,
) {
    match entries.get(&candidate.transaction_id) {
        Some(current) if !current.status.is_predecessor_of(candidate.status) => {}
        _ => {
            entries.insert(candidate.transaction_id, candidate);
        }
    }
}

fn check_transition(
    last: Option<&TransactionLogEntry>,
    entry: &TransactionLogEntry,
) -> Result<()> {
    if let Some(last) = last
        && !entry.status.can_follow(last.status)
    {
        return Err(TransactionError::IllegalTransition {
            id: entry.transaction_id,
            status: entry.status,
            last: last.status,
        });
    }
    Ok(())
}

/// Durable log on a fjall keyspace.
pub struct FjallTransactionLog {
    keyspace: Keyspace,
    partition: Partition,
    entries: Mutex<HashMap<TransactionId, TransactionLogEntry>>,
}

impl FjallTransactionLog {
    /// Open (or create) a log at `path` and reconstruct the last-status map
    /// from all persisted entries.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| TransactionError::LogEncoding(e.to_string()))?;

        let keyspace = fjall::Config::new(path).open()?;
        let partition = keyspace.open_partition(
            STATUS_PARTITION,
            PartitionCreateOptions::default()
                .block_size(16 * 1024)
                .compression(fjall::CompressionType::None),
        )?;

        let mut entries = HashMap::new();
        for kv in partition.iter() {
            let (key, value) = kv?;
            if key.len() != 17 || TransactionStatus::from_ordinal(key[16]).is_none() {
                return Err(TransactionError::LogEncoding(format!(
                    "malformed log key: {key:?}"
                )));
            }
            let entry = decode_entry(&value)?;
            keep_most_advanced(&mut entries, entry);
        }

        tracing::info!(
            "Opened transaction log at {:?} with {} transaction(s)",
            path,
            entries.len()
        );

        Ok(Self {
            keyspace,
            partition,
            entries: Mutex::new(entries),
        })
    }
}

impl TransactionLog for FjallTransactionLog {
    fn log_status(&self, entry: TransactionLogEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        check_transition(entries.get(&entry.transaction_id), &entry)?;

        let key = entry_key(entry.transaction_id, entry.status);
        self.partition.insert(key, encode_entry(&entry)?)?;
        self.keyspace.persist(PersistMode::SyncAll)?;

        // The in-memory map only becomes authoritative once the write is on
        // stable storage.
        entries.insert(entry.transaction_id, entry);
        Ok(())
    }

    fn last_entries(&self) -> HashMap<TransactionId, TransactionLogEntry> {
        self.entries.lock().clone()
    }
}

/// In-memory log for tests. Supports write-failure injection.
#[derive(Default)]
pub struct MemoryTransactionLog {
    entries: Mutex<HashMap<TransactionId, TransactionLogEntry>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `log_status` fail with a storage error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

impl TransactionLog for MemoryTransactionLog {
    fn log_status(&self, entry: TransactionLogEntry) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(TransactionError::LogWriteFailed(
                "injected write failure".to_string(),
            ));
        }

        let mut entries = self.entries.lock();
        check_transition(entries.get(&entry.transaction_id), &entry)?;
        entries.insert(entry.transaction_id, entry);
        Ok(())
    }

    fn last_entries(&self) -> HashMap<TransactionId, TransactionLogEntry> {
        self.entries.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(
        id: TransactionId,
        status: TransactionStatus,
    ) -> TransactionLogEntry {
        TransactionLogEntry::new(id, status, true)
    }

    #[test]
    fn test_log_and_reload() {
        let dir = TempDir::new().unwrap();
        let id1 = TransactionId::new();
        let id2 = TransactionId::new();

        {
            let log = FjallTransactionLog::open(dir.path()).unwrap();
            log.log_status(entry(id1, TransactionStatus::BeginStarted))
                .unwrap();
            log.log_status(entry(id1, TransactionStatus::BeginFinished))
                .unwrap();
            log.log_status(entry(id1, TransactionStatus::PrepareStarted))
                .unwrap();
            log.log_status(entry(id1, TransactionStatus::PrepareFinished))
                .unwrap();
            log.log_status(entry(id2, TransactionStatus::BeginStarted))
                .unwrap();
        }

        let log = FjallTransactionLog::open(dir.path()).unwrap();
        let statuses = log.last_statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[&id1], TransactionStatus::PrepareFinished);
        assert_eq!(statuses[&id2], TransactionStatus::BeginStarted);
    }

    #[test]
    fn test_most_advanced_wins_regardless_of_scan_order() {
        // Simulates leftover duplicate entries after a crash: whichever order
        // the scan observes them in, the most advanced status must win.
        let id = TransactionId::new();
        let forward = [
            TransactionStatus::BeginStarted,
            TransactionStatus::BeginFinished,
            TransactionStatus::PrepareStarted,
        ];

        let mut entries = HashMap::new();
        for status in forward {
            keep_most_advanced(&mut entries, entry(id, status));
        }
        assert_eq!(entries[&id].status, TransactionStatus::PrepareStarted);

        let mut entries = HashMap::new();
        for status in forward.iter().rev() {
            keep_most_advanced(&mut entries, entry(id, *status));
        }
        assert_eq!(entries[&id].status, TransactionStatus::PrepareStarted);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let log = MemoryTransactionLog::new();
        let id = TransactionId::new();

        log.log_status(entry(id, TransactionStatus::BeginStarted))
            .unwrap();
        let result = log.log_status(entry(id, TransactionStatus::CommitStarted));
        assert!(matches!(
            result,
            Err(TransactionError::IllegalTransition { .. })
        ));

        // The rejected transition must not have touched the map.
        assert_eq!(
            log.last_statuses()[&id],
            TransactionStatus::BeginStarted
        );
    }

    #[test]
    fn test_terminal_status_is_retained() {
        let dir = TempDir::new().unwrap();
        let id = TransactionId::new();

        {
            let log = FjallTransactionLog::open(dir.path()).unwrap();
            for status in [
                TransactionStatus::BeginStarted,
                TransactionStatus::BeginFinished,
                TransactionStatus::PrepareStarted,
                TransactionStatus::PrepareFinished,
                TransactionStatus::CommitStarted,
                TransactionStatus::CommitFinished,
            ] {
                log.log_status(entry(id, status)).unwrap();
            }
        }

        let log = FjallTransactionLog::open(dir.path()).unwrap();
        assert_eq!(
            log.last_statuses()[&id],
            TransactionStatus::CommitFinished
        );
    }

    #[test]
    fn test_injected_write_failure() {
        let log = MemoryTransactionLog::new();
        let id = TransactionId::new();

        log.log_status(entry(id, TransactionStatus::BeginStarted))
            .unwrap();
        log.fail_writes(true);
        assert!(
            log.log_status(entry(id, TransactionStatus::BeginFinished))
                .is_err()
        );
        assert_eq!(log.last_statuses()[&id], TransactionStatus::BeginStarted);
    }
}
