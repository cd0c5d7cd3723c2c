/// Transactional view handed to mutators
use async_trait::async_trait;
use serde_json::Value;
use storage::Storage;

use crate::{get_user_value, put_user_value, ClientId, Result, UserValue, Version};

/// What a mutator may do to the room's user data.
#[async_trait]
pub trait WriteTransaction: Send + Sync {
    /// Client whose mutation is running
    fn client_id(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Returns false when there was nothing to delete.
    async fn del(&self, key: &str) -> Result<bool>;
}

/// Writes user values stamped with the version of the frame being built.
pub struct MutationTransaction<'a> {
    client_id: ClientId,
    version: Version,
    storage: &'a dyn Storage,
}

impl<'a> MutationTransaction<'a> {
    pub fn new(client_id: impl Into<ClientId>, version: Version, storage: &'a dyn Storage) -> Self {
        Self {
            client_id: client_id.into(),
            version,
            storage,
        }
    }
}

#[async_trait]
impl WriteTransaction for MutationTransaction<'_> {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let entry = get_user_value(key, self.storage).await?;
        Ok(entry.filter(|entry| !entry.deleted).map(|entry| entry.value))
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let entry = UserValue {
            version: self.version,
            deleted: false,
            value,
        };
        put_user_value(key, &entry, self.storage).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let Some(previous) = self.get(key).await? else {
            return Ok(false);
        };
        let entry = UserValue {
            version: self.version,
            deleted: true,
            value: previous,
        };
        put_user_value(key, &entry, self.storage).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storage::MemStorage;

    #[tokio::test]
    async fn test_put_wraps_value_in_envelope() {
        let storage = MemStorage::new();
        let tx = MutationTransaction::new("c1", 4, &storage);

        tx.put("foo", json!({"x": 1})).await.unwrap();

        assert_eq!(tx.client_id(), "c1");
        assert_eq!(tx.get("foo").await.unwrap(), Some(json!({"x": 1})));
        assert!(tx.has("foo").await.unwrap());
        assert_eq!(
            storage.get("user/foo").await.unwrap(),
            Some(json!({"version": 4, "deleted": false, "value": {"x": 1}}))
        );
    }

    #[tokio::test]
    async fn test_del_is_soft_and_keeps_previous_value() {
        let storage = MemStorage::new();
        MutationTransaction::new("c1", 1, &storage)
            .put("foo", json!("bar"))
            .await
            .unwrap();

        let tx = MutationTransaction::new("c1", 2, &storage);
        assert!(tx.del("foo").await.unwrap());
        assert_eq!(tx.get("foo").await.unwrap(), None);
        assert!(!tx.has("foo").await.unwrap());
        assert_eq!(
            storage.get("user/foo").await.unwrap(),
            Some(json!({"version": 2, "deleted": true, "value": "bar"}))
        );

        // Already deleted and never written keys are both no-ops
        assert!(!tx.del("foo").await.unwrap());
        assert!(!tx.del("missing").await.unwrap());
        assert_eq!(storage.get("user/missing").await.unwrap(), None);
    }
}
