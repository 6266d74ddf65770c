//! Ephemeral keyed store with per-key TTL.
//!
//! Every record the system keeps at runtime (verification sessions,
//! orchestration sessions) is a single JSON value under a single key, so a
//! write is all-or-nothing. The store offers atomic per-key get/set and no
//! cross-key transactions.
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`]: process-local map, the default.
//! - [`RedbStore`]: a redb file, for deployments that want records to
//!   survive a restart within their TTL.
//!
//! Both encode the deadline next to the value and treat a lapsed entry as
//! absent on read. Lapsed entries are physically removed by
//! [`EphemeralStore::purge_expired`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{Result, StepwiseError};

/// Key for a verification session record.
pub fn session_key(id: &str) -> String {
    format!("session:{id}")
}

/// Key for an orchestration session record.
pub fn orchestration_key(id: &str) -> String {
    format!("orchestration:{id}")
}

pub trait EphemeralStore: Send + Sync {
    /// Return the value under `key`, or `None` if absent or lapsed.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value` under `key`, replacing any previous value and deadline.
    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Remaining lifetime of `key`, or `None` if absent or lapsed.
    fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Remove `key`. Returns whether a live entry was removed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// Physically remove every lapsed entry. Returns the number removed.
    fn purge_expired(&self) -> Result<usize>;
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn deadline_ms(ttl: Duration) -> u64 {
    now_ms().saturating_add(ttl.as_millis().min(u64::MAX as u128) as u64)
}

fn remaining(expires_at_ms: u64) -> Option<Duration> {
    let now = now_ms();
    (expires_at_ms > now).then(|| Duration::from_millis(expires_at_ms - now))
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

struct Entry {
    expires_at_ms: u64,
    value: Vec<u8>,
}

/// In-process store backed by a mutex-guarded map.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EphemeralStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.lock();
        Ok(entries
            .get(key)
            .filter(|e| remaining(e.expires_at_ms).is_some())
            .map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.lock().insert(
            key.to_string(),
            Entry {
                expires_at_ms: deadline_ms(ttl),
                value: value.to_vec(),
            },
        );
        Ok(())
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.lock().get(key).and_then(|e| remaining(e.expires_at_ms)))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self
            .lock()
            .remove(key)
            .is_some_and(|e| remaining(e.expires_at_ms).is_some()))
    }

    fn purge_expired(&self) -> Result<usize> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| remaining(e.expires_at_ms).is_some());
        Ok(before - entries.len())
    }
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

/// Key: record key (`session:{id}` / `orchestration:{id}`)
/// Value: `[ expires_at_ms: u64 big-endian (8 bytes) | JSON record ]`
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

fn encode_entry(expires_at_ms: u64, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + value.len());
    buf.extend_from_slice(&expires_at_ms.to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

fn decode_deadline(raw: &[u8]) -> Result<u64> {
    let head: [u8; 8] = raw
        .get(..8)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| StepwiseError::Store("truncated record".into()))?;
    Ok(u64::from_be_bytes(head))
}

fn store_err(e: impl std::fmt::Display) -> StepwiseError {
    StepwiseError::Store(e.to_string())
}

/// Durable store for ephemeral records using redb.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the redb database at `path`.
    ///
    /// Creates the `RECORDS` table if it doesn't already exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(RECORDS).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    /// Raw entry (deadline + value) regardless of expiry.
    fn read_raw(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(RECORDS).map_err(store_err)?;
        let Some(guard) = table.get(key).map_err(store_err)? else {
            return Ok(None);
        };
        let raw = guard.value();
        let deadline = decode_deadline(raw)?;
        Ok(Some((deadline, raw[8..].to_vec())))
    }
}

impl EphemeralStore for RedbStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .read_raw(key)?
            .filter(|(deadline, _)| remaining(*deadline).is_some())
            .map(|(_, value)| value))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let entry = encode_entry(deadline_ms(ttl), value);
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(RECORDS).map_err(store_err)?;
            table.insert(key, entry.as_slice()).map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self
            .read_raw(key)?
            .and_then(|(deadline, _)| remaining(deadline)))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let live = {
            let mut table = wt.open_table(RECORDS).map_err(store_err)?;
            let removed = table.remove(key).map_err(store_err)?;
            match removed {
                Some(guard) => remaining(decode_deadline(guard.value())?).is_some(),
                None => false,
            }
        };
        wt.commit().map_err(store_err)?;
        Ok(live)
    }

    fn purge_expired(&self) -> Result<usize> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let count = {
            let mut table = wt.open_table(RECORDS).map_err(store_err)?;
            let mut lapsed = Vec::new();
            for entry in table.iter().map_err(store_err)? {
                let (k, v) = entry.map_err(store_err)?;
                if remaining(decode_deadline(v.value())?).is_none() {
                    lapsed.push(k.value().to_string());
                }
            }
            for key in &lapsed {
                table.remove(key.as_str()).map_err(store_err)?;
            }
            lapsed.len()
        };
        wt.commit().map_err(store_err)?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
