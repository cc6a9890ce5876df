//! Persistence Adapter (spec.md §4.6): throttled snapshot writes and
//! cold-start restore against an external blob store keyed by room-id.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use indexmap::IndexMap;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::records::{Record, RecordId};
use crate::schema::SchemaVersions;

/// One document-scope record plus the clock of its last mutation (spec.md
/// §3 "Room State" / §4.6 "Snapshot layout").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub state: Record,
    pub last_changed_clock: u64,
}

/// The canonical persisted shape of a room (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub clock: u64,
    pub tombstones: IndexMap<RecordId, u64>,
    pub schema: SchemaVersions,
    pub documents: Vec<SnapshotEntry>,
    /// Added by this crate's expansion of the legacy-format conversion path
    /// (see [`migrate_legacy_snapshot`]); absent on very old snapshots.
    #[serde(default)]
    pub tombstone_history_starts_at_clock: u64,
}

/// Contract with the host: two operations on an external blob store keyed
/// by room-id (spec.md §4.6).
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn get(&self, room_id: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn put(&self, room_id: &str, bytes: Vec<u8>) -> anyhow::Result<()>;
}

/// Production default: one `rooms` table in a local sqlite file, grounded
/// on the teacher's `db.rs` (`Connection::open` + WAL pragma + `CREATE
/// TABLE IF NOT EXISTS`).
pub struct SqliteBlobStore {
    conn: Mutex<Connection>,
}

impl SqliteBlobStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS rooms (
                room_id TEXT PRIMARY KEY,
                snapshot BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl PersistenceAdapter for SqliteBlobStore {
    async fn get(&self, room_id: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        let result = conn
            .query_row(
                "SELECT snapshot FROM rooms WHERE room_id = ?1",
                [room_id],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .map(Some);
        match result {
            Ok(bytes) => Ok(bytes),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, room_id: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        conn.execute(
            "INSERT INTO rooms (room_id, snapshot, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(room_id) DO UPDATE SET snapshot = excluded.snapshot, updated_at = excluded.updated_at",
            rusqlite::params![room_id, bytes],
        )?;
        Ok(())
    }
}

/// Test-support backing store: an in-memory map, no disk I/O. Mirrors the
/// teacher's pattern of swapping a real backend for an in-memory one under
/// test via a cargo feature.
#[cfg(any(test, feature = "test-support"))]
pub struct InMemoryBlobStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl PersistenceAdapter for InMemoryBlobStore {
    async fn get(&self, room_id: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .data
            .lock()
            .expect("in-memory store mutex poisoned")
            .get(room_id)
            .cloned())
    }

    async fn put(&self, room_id: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.data
            .lock()
            .expect("in-memory store mutex poisoned")
            .insert(room_id.to_string(), bytes);
        Ok(())
    }
}

/// Attempts to recognize a pre-tombstone-cap snapshot (no
/// `tombstone_history_starts_at_clock` field) and fill it in with `0`
/// (spec.md §4.6 "attempt one legacy-format conversion"). Any other
/// unrecognized shape returns `None`, and the caller falls back to
/// defaults.
pub fn migrate_legacy_snapshot(bytes: &[u8]) -> Option<RoomSnapshot> {
    let mut value: Value = serde_json::from_slice(bytes).ok()?;
    let obj = value.as_object_mut()?;
    obj.entry("tombstone_history_starts_at_clock")
        .or_insert(Value::from(0u64));
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemoryBlobStore::default();
        assert!(store.get("room-1").await.unwrap().is_none());
        store.put("room-1", b"hello".to_vec()).await.unwrap();
        assert_eq!(store.get("room-1").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn legacy_snapshot_without_tombstone_start_gets_zero_filled() {
        let legacy = json!({
            "clock": 5,
            "tombstones": {},
            "schema": {},
            "documents": [],
        });
        let bytes = serde_json::to_vec(&legacy).unwrap();
        let migrated = migrate_legacy_snapshot(&bytes).expect("legacy shape recognized");
        assert_eq!(migrated.tombstone_history_starts_at_clock, 0);
        assert_eq!(migrated.clock, 5);
    }

    #[test]
    fn unrecognizable_bytes_yield_none() {
        assert!(migrate_legacy_snapshot(b"not json").is_none());
    }
}
