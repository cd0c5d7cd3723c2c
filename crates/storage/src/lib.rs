/// Versioned key/value storage for replay rooms
/// Every room sees a flat JSON key space; backends decide where it lives.
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

mod mem;
pub use mem::*;

mod sqlite;
pub use sqlite::*;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("value at {key:?} does not match the expected shape: {source}")]
    Schema {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Raw JSON key/value store scoped to a single room.
///
/// No transactions are offered here. Callers buffer writes themselves and
/// rely on a single writer per room.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn put(&self, key: &str, value: Value) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>>;

    /// Entries under `prefix` whose value carries a `version` field greater
    /// than `version`.
    async fn list_changed_since(&self, prefix: &str, version: u64) -> Result<Vec<(String, Value)>> {
        let entries = self.list(prefix).await?;
        Ok(entries
            .into_iter()
            .filter(|(_, value)| entry_version(value).map_or(false, |v| v > version))
            .collect())
    }
}

/// Typed access on top of any [`Storage`].
#[async_trait]
pub trait StorageExt: Storage {
    /// Read `key` and decode it as `T`, failing with [`StorageError::Schema`]
    /// when the stored JSON has a different shape.
    async fn get_typed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StorageError::Schema {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    async fn put_typed<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(value)?;
        self.put(key, value).await
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

/// Hands out per-room storage views.
pub trait Backend: Send + Sync {
    fn open_room(&self, room_id: &str) -> Result<Arc<dyn Storage>>;
}

/// The `version` field of a stored envelope, if it has one.
pub fn entry_version(value: &Value) -> Option<u64> {
    value.get("version").and_then(Value::as_u64)
}
