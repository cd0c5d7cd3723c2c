/// In-memory storage, used by tests and servers started without a database
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::{Backend, Result, Storage};

#[derive(Debug, Default)]
pub struct MemStorage {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy of every entry, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.read().clone()
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// One [`MemStorage`] per room, created on first use.
#[derive(Debug, Default)]
pub struct MemBackend {
    rooms: Mutex<HashMap<String, Arc<MemStorage>>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemBackend {
    fn open_room(&self, room_id: &str) -> Result<Arc<dyn Storage>> {
        let mut rooms = self.rooms.lock();
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(MemStorage::new()))
            .clone();
        Ok(room)
    }
}
