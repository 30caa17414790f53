//! Durable log of administrative operations.
//!
//! Every successful mutation is appended as a JSON [`LogEntry`] under a
//! big-endian sequence key, so sled's key order is replay order. Reopening
//! an engine replays the entries with their original timestamps, which
//! restores every version and validity interval exactly.

use crate::catalog::{ColumnId, TableDef, TableId};
use crate::error::{Error, Result};
use crate::policy::{MaskingPolicyDef, PolicyKind, RowAccessPolicyDef};
use crate::role::Grantee;
use crate::version::Timestamp;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

const LOG_TREE_NAME: &[u8] = b"veil:log";

/// One administrative operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Table registered or redefined.
    RegisterTable(TableDef),
    /// Role created.
    CreateRole {
        /// Role name.
        name: String,
        /// Owner, if recorded.
        owner: Option<String>,
    },
    /// Role granted.
    Grant {
        /// Receiver.
        grantee: Grantee,
        /// Role granted.
        role: String,
        /// Issuer.
        granted_by: String,
    },
    /// Grant revoked.
    Revoke {
        /// Receiver.
        grantee: Grantee,
        /// Role revoked.
        role: String,
        /// Issuer.
        revoked_by: String,
    },
    /// Masking policy created or replaced.
    CreateMaskingPolicy {
        /// Definition; recompiled on replay.
        def: MaskingPolicyDef,
        /// `OR REPLACE`.
        replace: bool,
    },
    /// Row-access policy created or replaced.
    CreateRowAccessPolicy {
        /// Definition; recompiled on replay.
        def: RowAccessPolicyDef,
        /// `OR REPLACE`.
        replace: bool,
    },
    /// Policy dropped.
    DropPolicy {
        /// Masking or row access.
        kind: PolicyKind,
        /// Policy name.
        name: String,
    },
    /// Masking policy attached to a column.
    AttachMasking {
        /// Column.
        column: ColumnId,
        /// Policy name.
        policy: String,
    },
    /// Masking policy detached from a column.
    DetachMasking {
        /// Column.
        column: ColumnId,
    },
    /// Row-access policy attached to a table.
    AttachRowAccess {
        /// Table.
        table: TableId,
        /// Policy name.
        policy: String,
        /// Columns bound to the policy parameters.
        columns: Vec<String>,
    },
    /// Row-access policy detached from a table.
    DetachRowAccess {
        /// Table.
        table: TableId,
    },
}

/// A sequenced, timestamped [`LogRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log.
    pub seq: u64,
    /// Engine clock time the operation took effect.
    pub at: Timestamp,
    /// Operation.
    pub record: LogRecord,
}

/// Append-only operation log stored in a sled tree.
pub struct DurableLog {
    db: sled::Db,
    tree: sled::Tree,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for DurableLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableLog")
            .field("entries", &self.tree.len())
            .field("next_seq", &self.next_seq.load(Ordering::Relaxed))
            .finish()
    }
}

impl DurableLog {
    /// Open or create the log in the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Self::with_db(db)
    }

    /// Open the log inside an existing database.
    pub fn with_db(db: sled::Db) -> Result<Self> {
        let tree = db.open_tree(LOG_TREE_NAME)?;
        let next_seq = match tree.last()? {
            Some((key, _)) => Self::decode_seq(&key)? + 1,
            None => 0,
        };
        Ok(Self {
            db,
            tree,
            next_seq: AtomicU64::new(next_seq),
        })
    }

    /// Append a record and flush it to disk.
    pub fn append(&self, at: Timestamp, record: &LogRecord) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = LogEntry {
            seq,
            at,
            record: record.clone(),
        };
        let value = serde_json::to_vec(&entry)
            .map_err(|e| Error::Serialization(format!("log entry {}: {}", seq, e)))?;
        self.tree.insert(seq.to_be_bytes(), value)?;
        self.tree.flush()?;
        Ok(seq)
    }

    /// All entries in append order.
    pub fn entries(&self) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::with_capacity(self.tree.len());
        for item in self.tree.iter() {
            let (key, value) = item?;
            let seq = Self::decode_seq(&key)?;
            let entry: LogEntry = serde_json::from_slice(&value)
                .map_err(|e| Error::Serialization(format!("log entry {}: {}", seq, e)))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Flush the underlying database.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn decode_seq(key: &[u8]) -> Result<u64> {
        let bytes: [u8; 8] = key
            .try_into()
            .map_err(|_| Error::Serialization(format!("bad log key of {} bytes", key.len())))?;
        Ok(u64::from_be_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Expr;
    use crate::value::DataType;

    fn temp_log() -> (DurableLog, sled::Db) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let log = DurableLog::with_db(db.clone()).unwrap();
        (log, db)
    }

    #[test]
    fn test_append_and_replay_in_order() {
        let (log, _db) = temp_log();
        assert!(log.is_empty());

        log.append(
            10,
            &LogRecord::CreateRole {
                name: "ANALYST".into(),
                owner: None,
            },
        )
        .unwrap();
        log.append(
            11,
            &LogRecord::CreateMaskingPolicy {
                def: MaskingPolicyDef::new("m", "val", DataType::Text, Expr::arg("val")),
                replace: false,
            },
        )
        .unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 0);
        assert_eq!(entries[0].at, 10);
        assert_eq!(entries[1].seq, 1);
        assert!(matches!(
            entries[1].record,
            LogRecord::CreateMaskingPolicy { replace: false, .. }
        ));
    }

    #[test]
    fn test_sequence_continues_after_reopen() {
        let (log, db) = temp_log();
        log.append(1, &LogRecord::DetachMasking {
            column: ColumnId::new("t", "c"),
        })
        .unwrap();
        drop(log);

        let log = DurableLog::with_db(db).unwrap();
        let seq = log
            .append(2, &LogRecord::DetachRowAccess {
                table: TableId::new("t"),
            })
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_sequence_keys_sort_numerically() {
        let (log, _db) = temp_log();
        for i in 0..300u64 {
            log.append(i, &LogRecord::DropPolicy {
                kind: PolicyKind::Masking,
                name: format!("p{}", i),
            })
            .unwrap();
        }
        let entries = log.entries().unwrap();
        assert!(entries.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(entries[299].at, 299);
    }
}
