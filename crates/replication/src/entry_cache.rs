/// Write-buffering read-through cache over a [`Storage`]
///
/// Caches stack: a cache can wrap another cache, so a mutation can write into
/// a private layer that is only folded into the frame's layer on `flush`.
use async_trait::async_trait;
use futures::future::try_join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use storage::{entry_version, Storage};

use crate::{Patch, PatchOp};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Option<Value>,
    dirty: bool,
}

pub struct EntryCache<'a> {
    inner: &'a dyn Storage,
    /// Keyed in first-touch order, which is the order of `pending()`
    entries: Mutex<IndexMap<String, CacheEntry>>,
}

impl<'a> EntryCache<'a> {
    pub fn new(inner: &'a dyn Storage) -> Self {
        Self {
            inner,
            entries: Mutex::new(IndexMap::new()),
        }
    }

    /// Dirty entries as a raw patch, in first-touch order.
    pub fn pending(&self) -> Patch {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(key, entry)| match &entry.value {
                Some(value) => PatchOp::Put {
                    key: key.clone(),
                    value: value.clone(),
                },
                None => PatchOp::Del { key: key.clone() },
            })
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.entries.lock().values().any(|entry| entry.dirty)
    }

    /// Write every dirty entry to the inner storage. Entries stay cached and
    /// become clean. On error the cache must be discarded, not flushed again.
    pub async fn flush(&self) -> storage::Result<()> {
        self.write_through(self.pending()).await
    }

    /// Like [`flush`](Self::flush), limited to dirty entries under `prefix`.
    /// Other dirty entries stay buffered.
    pub async fn flush_prefix(&self, prefix: &str) -> storage::Result<()> {
        let ops: Patch = self
            .pending()
            .into_iter()
            .filter(|op| op.key().starts_with(prefix))
            .collect();
        self.write_through(ops).await
    }

    async fn write_through(&self, ops: Patch) -> storage::Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        try_join_all(ops.iter().map(|op| async move {
            match op {
                PatchOp::Put { key, value } => self.inner.put(key, value.clone()).await,
                PatchOp::Del { key } => self.inner.del(key).await,
            }
        }))
        .await?;

        let mut entries = self.entries.lock();
        for op in &ops {
            if let Some(entry) = entries.get_mut(op.key()) {
                entry.dirty = false;
            }
        }
        Ok(())
    }

    fn write(&self, key: &str, value: Option<Value>) {
        self.entries
            .lock()
            .insert(key.to_string(), CacheEntry { value, dirty: true });
    }

    /// Apply cached entries under `prefix` on top of an inner listing.
    fn overlay(
        &self,
        prefix: &str,
        listed: Vec<(String, Value)>,
        keep: impl Fn(&Value) -> bool,
    ) -> Vec<(String, Value)> {
        let mut merged: BTreeMap<String, Value> = listed.into_iter().collect();
        let entries = self.entries.lock();
        for (key, entry) in entries.iter().filter(|(key, _)| key.starts_with(prefix)) {
            match &entry.value {
                Some(value) if keep(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                _ => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }
}

#[async_trait]
impl Storage for EntryCache<'_> {
    async fn get(&self, key: &str) -> storage::Result<Option<Value>> {
        if let Some(entry) = self.entries.lock().get(key) {
            return Ok(entry.value.clone());
        }

        let value = self.inner.get(key).await?;
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert(CacheEntry {
            value,
            dirty: false,
        });
        Ok(entry.value.clone())
    }

    async fn put(&self, key: &str, value: Value) -> storage::Result<()> {
        self.write(key, Some(value));
        Ok(())
    }

    async fn del(&self, key: &str) -> storage::Result<()> {
        self.write(key, None);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> storage::Result<Vec<(String, Value)>> {
        let listed = self.inner.list(prefix).await?;
        Ok(self.overlay(prefix, listed, |_| true))
    }

    async fn list_changed_since(
        &self,
        prefix: &str,
        version: u64,
    ) -> storage::Result<Vec<(String, Value)>> {
        let listed = self.inner.list_changed_since(prefix, version).await?;
        Ok(self.overlay(prefix, listed, |value| {
            entry_version(value).map_or(false, |v| v > version)
        }))
    }
}
