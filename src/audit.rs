//! Append-only security log.
//!
//! Each entry stores `sha256(prev_hash || payload)`; `verify_chain` walks the
//! chain from the first entry and fails on the first mismatch.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::security::Violation;
use crate::storage::{get_json, put_json, KeyValueStore, Namespace};

const HEAD_KEY: &str = "head";

/// Hashes a log entry payload with the previous chain hash.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    hasher.finalize().into()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub index: u64,
    pub recorded_at: u64,
    pub violation: Violation,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredEntry {
    payload_json: String,
    prev_hash: String,
    entry_hash: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ChainHead {
    count: u64,
    head_hash: String,
}

/// Append-only, hash-chained log of recorded violations.
pub struct SecurityLog {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    append_lock: Mutex<()>,
}

impl SecurityLog {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            append_lock: Mutex::new(()),
        }
    }

    pub fn append(&self, violation: &Violation) -> Result<AuditRecord> {
        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| anyhow!("security log lock poisoned"))?;
        let head = self.head()?;
        let prev_hash = decode_hash(&head.head_hash, "chain head")?;

        let record = AuditRecord {
            index: head.count,
            recorded_at: self.clock.now_ms() / 1000,
            violation: violation.clone(),
        };
        let payload_json = serde_json::to_string(&record)?;
        let entry_hash = hash_entry(&prev_hash, payload_json.as_bytes());

        put_json(
            self.store.as_ref(),
            Namespace::SecurityLog,
            &entry_key(record.index),
            &StoredEntry {
                payload_json,
                prev_hash: hex::encode(prev_hash),
                entry_hash: hex::encode(entry_hash),
            },
        )?;
        put_json(
            self.store.as_ref(),
            Namespace::SecurityLog,
            HEAD_KEY,
            &ChainHead {
                count: record.index + 1,
                head_hash: hex::encode(entry_hash),
            },
        )?;
        Ok(record)
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.head()?.count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns up to `limit` of the newest records, oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let count = self.head()?.count;
        let start = count.saturating_sub(limit as u64);
        (start..count)
            .map(|index| {
                let entry = self.entry(index)?;
                Ok(serde_json::from_str(&entry.payload_json)?)
            })
            .collect()
    }

    /// Walks the whole chain and returns the number of verified entries.
    pub fn verify_chain(&self) -> Result<u64> {
        let head = self.head()?;
        let mut expected_prev = [0u8; 32];
        for index in 0..head.count {
            let entry = self.entry(index)?;
            let prev_hash = decode_hash(&entry.prev_hash, "prev_hash")?;
            if prev_hash != expected_prev {
                return Err(anyhow!(
                    "integrity check failed at entry {}: prev_hash={}, expected_prev={}",
                    index,
                    entry.prev_hash,
                    hex::encode(expected_prev)
                ));
            }
            let stored = decode_hash(&entry.entry_hash, "entry_hash")?;
            let computed = hash_entry(&expected_prev, entry.payload_json.as_bytes());
            if computed != stored {
                return Err(anyhow!(
                    "integrity check failed at entry {}: computed_hash={}, stored_hash={}",
                    index,
                    hex::encode(computed),
                    entry.entry_hash
                ));
            }
            let record: AuditRecord = serde_json::from_str(&entry.payload_json)?;
            if record.index != index {
                return Err(anyhow!(
                    "integrity check failed at entry {}: payload claims index {}",
                    index,
                    record.index
                ));
            }
            expected_prev = computed;
        }
        if head.count > 0 && hex::encode(expected_prev) != head.head_hash {
            return Err(anyhow!(
                "integrity check failed: head_hash={} does not match last entry",
                head.head_hash
            ));
        }
        Ok(head.count)
    }

    fn head(&self) -> Result<ChainHead> {
        Ok(
            get_json(self.store.as_ref(), Namespace::SecurityLog, HEAD_KEY)?.unwrap_or(ChainHead {
                count: 0,
                head_hash: hex::encode([0u8; 32]),
            }),
        )
    }

    fn entry(&self, index: u64) -> Result<StoredEntry> {
        get_json(self.store.as_ref(), Namespace::SecurityLog, &entry_key(index))?
            .ok_or_else(|| anyhow!("security log entry {} missing", index))
    }
}

fn entry_key(index: u64) -> String {
    format!("entry:{:012}", index)
}

fn decode_hash(raw: &str, field: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(raw).map_err(|e| anyhow!("invalid {} hex: {}", field, e))?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("{} must be 32 bytes", field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::security::{Severity, ViolationKind};
    use crate::storage::InMemoryKeyValueStore;

    fn log_with_store() -> (SecurityLog, Arc<InMemoryKeyValueStore>) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let log = SecurityLog::new(store.clone(), Arc::new(ManualClock::new(1_700_000_000_000)));
        (log, store)
    }

    #[test]
    fn appends_chain_and_verify() -> Result<()> {
        let (log, _) = log_with_store();
        assert!(log.is_empty()?);
        assert_eq!(log.verify_chain()?, 0);

        log.append(&Violation::new(ViolationKind::UnauthorizedApp, "com.evil.game"))?;
        log.append(&Violation::new(ViolationKind::RootDetected, "su"))?;
        let third = log.append(&Violation::new(ViolationKind::AdminRevoked, "revoked"))?;

        assert_eq!(third.index, 2);
        assert_eq!(third.recorded_at, 1_700_000_000);
        assert_eq!(log.verify_chain()?, 3);

        let recent = log.recent(2)?;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].violation.kind, ViolationKind::RootDetected);
        assert_eq!(recent[1].violation.severity, Severity::Critical);
        assert_eq!(log.recent(10)?.len(), 3);
        Ok(())
    }

    #[test]
    fn tampered_payload_is_detected() -> Result<()> {
        let (log, store) = log_with_store();
        log.append(&Violation::new(ViolationKind::RootDetected, "su"))?;
        log.append(&Violation::new(ViolationKind::AdminBypass, "settings"))?;

        let key = entry_key(0);
        let mut entry: StoredEntry =
            get_json(store.as_ref(), Namespace::SecurityLog, &key)?.expect("entry");
        entry.payload_json = entry.payload_json.replace("critical", "low");
        put_json(store.as_ref(), Namespace::SecurityLog, &key, &entry)?;

        let err = log.verify_chain().expect_err("tampering must be detected");
        assert!(err.to_string().contains("integrity check failed at entry 0"));
        Ok(())
    }

    #[test]
    fn truncated_chain_is_detected() -> Result<()> {
        let (log, store) = log_with_store();
        log.append(&Violation::new(ViolationKind::RootDetected, "su"))?;
        let head: ChainHead =
            get_json(store.as_ref(), Namespace::SecurityLog, HEAD_KEY)?.expect("head");
        log.append(&Violation::new(ViolationKind::AdminBypass, "settings"))?;
        put_json(store.as_ref(), Namespace::SecurityLog, HEAD_KEY, &ChainHead {
            count: 1,
            head_hash: hex::encode([7u8; 32]),
        })?;
        assert!(log.verify_chain().is_err());

        put_json(store.as_ref(), Namespace::SecurityLog, HEAD_KEY, &head)?;
        assert_eq!(log.verify_chain()?, 1);
        Ok(())
    }
}
