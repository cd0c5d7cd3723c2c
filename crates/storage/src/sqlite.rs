/// SQLite-backed storage: one `entries` table keyed by (room, key)
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::{Backend, Result, Storage};

pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteBackend {
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", &"WAL")?;
        conn.pragma_update(None, "synchronous", &"NORMAL")?;
        apply_migrations(&conn)?;
        debug!("opened room database at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Storage view over the rows of one room.
    pub fn room(&self, room_id: &str) -> SqliteStorage {
        SqliteStorage {
            conn: self.conn.clone(),
            room: room_id.to_string(),
        }
    }
}

impl Backend for SqliteBackend {
    fn open_room(&self, room_id: &str) -> Result<Arc<dyn Storage>> {
        Ok(Arc::new(self.room(room_id)))
    }
}

/// Every call runs on tokio's blocking pool, so a slow query never parks an
/// async worker thread.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    room: String,
}

impl SqliteStorage {
    /// Run `f` against the shared connection and this room's id.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &str) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let room = self.room.clone();
        tokio::task::spawn_blocking(move || f(&conn.lock(), &room)).await?
    }
}

fn query_entries(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<(String, Value)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        let key: String = row.get(0)?;
        let raw: String = row.get(1)?;
        Ok((key, raw))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (key, raw) = row?;
        out.push((key, serde_json::from_str(&raw)?));
    }
    Ok(out)
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        self.with_conn(move |conn, room| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM entries WHERE room = ?1 AND key = ?2 LIMIT 1",
                    params![room, key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
        })
        .await
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn, room| {
            conn.execute(
                "INSERT INTO entries(room, key, value, updated_at) VALUES(?1, ?2, ?3, strftime('%s','now'))
                 ON CONFLICT(room, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![room, key, value.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn, room| {
            conn.execute(
                "DELETE FROM entries WHERE room = ?1 AND key = ?2",
                params![room, key],
            )?;
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn, room| {
            query_entries(
                conn,
                "SELECT key, value FROM entries \
                 WHERE room = ?1 AND substr(key, 1, length(?2)) = ?2 ORDER BY key",
                params![room, prefix],
            )
        })
        .await
    }

    async fn list_changed_since(&self, prefix: &str, version: u64) -> Result<Vec<(String, Value)>> {
        let prefix = prefix.to_string();
        let version = version as i64;
        self.with_conn(move |conn, room| {
            query_entries(
                conn,
                "SELECT key, value FROM entries \
                 WHERE room = ?1 AND substr(key, 1, length(?2)) = ?2 \
                 AND json_extract(value, '$.version') > ?3 ORDER BY key",
                params![room, prefix, version],
            )
        })
        .await
    }
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(include_str!("../migrations/V0001__entries.sql"))?;
    conn.execute(
        "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, strftime('%s','now'))",
        params!["V0001__entries"],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageExt;
    use serde_json::json;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let a = backend.room("a");
        let b = backend.room("b");

        assert_ok!(a.put("user/x", json!({"version": 1, "deleted": false, "value": 1})).await);
        assert_eq!(b.get("user/x").await.unwrap(), None);
        assert!(a.get("user/x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_put_overwrites_and_del_removes() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let room = backend.room("r");

        room.put("k", json!({"a": [1, 2, 3]})).await.unwrap();
        room.put("k", json!({"a": "replaced"})).await.unwrap();
        assert_eq!(room.get("k").await.unwrap(), Some(json!({"a": "replaced"})));

        room.del("k").await.unwrap();
        assert_eq!(room.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_changed_since_uses_version_field() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let room = backend.room("r");

        room.put("user/a", json!({"version": 1, "deleted": false, "value": "a"})).await.unwrap();
        room.put("user/b", json!({"version": 3, "deleted": true, "value": "b"})).await.unwrap();
        room.put("user/c", json!({"version": 2, "deleted": false, "value": "c"})).await.unwrap();
        room.put("client/x", json!({"lastMutationID": 4, "baseCookie": 9})).await.unwrap();
        room.put_typed("version", &3u64).await.unwrap();

        let all = room.list("user/").await.unwrap();
        let keys: Vec<_> = all.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["user/a", "user/b", "user/c"]);

        let changed = room.list_changed_since("user/", 1).await.unwrap();
        let keys: Vec<_> = changed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["user/b", "user/c"]);

        let version: Option<u64> = room.get_typed("version").await.unwrap();
        assert_eq!(version, Some(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_share_connection() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let room = backend.open_room("r").unwrap();

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let room = room.clone();
                tokio::spawn(async move {
                    room.put(&format!("user/{:02}", i), json!({"version": i, "value": i}))
                        .await
                })
            })
            .collect();
        for writer in writers {
            assert_ok!(writer.await.unwrap());
        }

        let listed = room.list("user/").await.unwrap();
        assert_eq!(listed.len(), 16);
        assert_eq!(listed[15].0, "user/15");
        let changed = room.list_changed_since("user/", 11).await.unwrap();
        assert_eq!(changed.len(), 4);
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rooms").join("sync.db");

        {
            let backend = SqliteBackend::open_or_create(&path).unwrap();
            let room = backend.open_room("r").unwrap();
            room.put("k", json!("persisted")).await.unwrap();
        }

        let backend = SqliteBackend::open_or_create(&path).unwrap();
        assert_eq!(backend.path(), Some(path.as_path()));
        let room = backend.open_room("r").unwrap();
        assert_eq!(room.get("k").await.unwrap(), Some(json!("persisted")));
    }
}
