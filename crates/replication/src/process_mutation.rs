/// Applies one client mutation at a given version
use storage::Storage;
use tracing::{debug, warn};

use crate::{
    put_client_record, put_version, require_client_record, ClientMutation, EntryCache,
    MutationTransaction, MutatorRegistry, Result, Version,
};

/// What happened to a mutation handed to [`process_mutation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Mutator ran to completion
    Applied,
    /// Already processed; nothing written
    Duplicate,
    /// An earlier id is still missing; nothing written, retried next turn
    OutOfOrder,
    /// No mutator with that name; only the client's sequence advanced
    UnknownMutator,
    /// Mutator returned an error. Writes it made before failing are kept.
    Failed,
}

impl MutationOutcome {
    /// Whether the client's `lastMutationID` moved.
    pub fn advanced(&self) -> bool {
        matches!(self, Self::Applied | Self::UnknownMutator | Self::Failed)
    }
}

pub async fn process_mutation(
    pending: &ClientMutation,
    mutators: &MutatorRegistry,
    storage: &dyn Storage,
    version: Version,
) -> Result<MutationOutcome> {
    let client_id = &pending.client_id;
    let mutation = &pending.mutation;

    let mut record = require_client_record(client_id, storage).await?;
    let expected = record.last_mutation_id + 1;

    if mutation.id < expected {
        debug!(
            "mutation {} from {} already processed (expected {})",
            mutation.id, client_id, expected
        );
        return Ok(MutationOutcome::Duplicate);
    }
    if mutation.id > expected {
        debug!(
            "mutation {} from {} is ahead of {}, waiting",
            mutation.id, client_id, expected
        );
        return Ok(MutationOutcome::OutOfOrder);
    }

    let cache = EntryCache::new(storage);
    let outcome = match mutators.get(&mutation.name) {
        None => {
            warn!(
                "unknown mutator {} in mutation {} from {}",
                mutation.name, mutation.id, client_id
            );
            MutationOutcome::UnknownMutator
        }
        Some(mutator) => {
            let tx = MutationTransaction::new(client_id.clone(), version, &cache);
            match mutator.apply(&tx, mutation.args.clone()).await {
                Ok(()) => MutationOutcome::Applied,
                Err(err) => {
                    warn!(
                        "mutator {} failed for mutation {} from {}: {:#}",
                        mutation.name, mutation.id, client_id, err
                    );
                    MutationOutcome::Failed
                }
            }
        }
    };

    record.last_mutation_id = expected;
    put_client_record(client_id, &record, &cache).await?;
    if outcome != MutationOutcome::UnknownMutator {
        put_version(version, &cache).await?;
    }
    cache.flush().await?;

    debug!(
        "mutation {} from {} at version {}: {:?}",
        mutation.id, client_id, version, outcome
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        get_client_record, get_version, ClientRecord, Mutation, Mutator, ReplicationError,
        WriteTransaction,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use storage::MemStorage;

    struct PutThenFail;

    #[async_trait]
    impl Mutator for PutThenFail {
        async fn apply(&self, tx: &dyn WriteTransaction, _args: Value) -> anyhow::Result<()> {
            tx.put("partial", json!(true)).await?;
            anyhow::bail!("boom")
        }
    }

    async fn room_with_client() -> MemStorage {
        let storage = MemStorage::new();
        put_version(0, &storage).await.unwrap();
        put_client_record("c1", &ClientRecord::new(None), &storage)
            .await
            .unwrap();
        storage
    }

    fn put(id: u64, key: &str, value: Value) -> ClientMutation {
        ClientMutation::new(
            "c1",
            Mutation::new(id, "put", json!({"key": key, "value": value}), 0.0),
        )
    }

    async fn last_mutation_id(storage: &MemStorage) -> u64 {
        get_client_record("c1", storage)
            .await
            .unwrap()
            .unwrap()
            .last_mutation_id
    }

    #[tokio::test]
    async fn test_applies_next_mutation() {
        let storage = room_with_client().await;
        let mutators = MutatorRegistry::with_builtins();

        let outcome = process_mutation(&put(1, "foo", json!("bar")), &mutators, &storage, 1)
            .await
            .unwrap();

        assert_eq!(outcome, MutationOutcome::Applied);
        assert!(outcome.advanced());
        assert_eq!(last_mutation_id(&storage).await, 1);
        assert_eq!(get_version(&storage).await.unwrap(), Some(1));
        assert_eq!(
            storage.get("user/foo").await.unwrap(),
            Some(json!({"version": 1, "deleted": false, "value": "bar"}))
        );
    }

    #[tokio::test]
    async fn test_duplicate_is_a_silent_noop() {
        let storage = room_with_client().await;
        let mutators = MutatorRegistry::with_builtins();
        process_mutation(&put(1, "foo", json!(1)), &mutators, &storage, 1)
            .await
            .unwrap();

        let outcome = process_mutation(&put(1, "foo", json!(2)), &mutators, &storage, 2)
            .await
            .unwrap();

        assert_eq!(outcome, MutationOutcome::Duplicate);
        assert!(!outcome.advanced());
        assert_eq!(last_mutation_id(&storage).await, 1);
        assert_eq!(get_version(&storage).await.unwrap(), Some(1));
        assert_eq!(
            storage.get("user/foo").await.unwrap(),
            Some(json!({"version": 1, "deleted": false, "value": 1}))
        );
    }

    #[tokio::test]
    async fn test_gap_stalls_without_writes() {
        let storage = room_with_client().await;
        let before = storage.snapshot();

        let outcome = process_mutation(
            &put(3, "foo", json!(1)),
            &MutatorRegistry::with_builtins(),
            &storage,
            1,
        )
        .await
        .unwrap();

        assert_eq!(outcome, MutationOutcome::OutOfOrder);
        assert_eq!(storage.snapshot(), before);
    }

    #[tokio::test]
    async fn test_unknown_mutator_advances_sequence_only() {
        let storage = room_with_client().await;
        let mutation = ClientMutation::new("c1", Mutation::new(1, "nope", json!({}), 0.0));

        let outcome = process_mutation(&mutation, &MutatorRegistry::new(), &storage, 1)
            .await
            .unwrap();

        assert_eq!(outcome, MutationOutcome::UnknownMutator);
        assert_eq!(last_mutation_id(&storage).await, 1);
        assert_eq!(get_version(&storage).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_failed_mutator_keeps_partial_writes() {
        let storage = room_with_client().await;
        let mutators = MutatorRegistry::new().with_mutator("explode", PutThenFail);
        let mutation = ClientMutation::new("c1", Mutation::new(1, "explode", json!({}), 0.0));

        let outcome = process_mutation(&mutation, &mutators, &storage, 1)
            .await
            .unwrap();

        assert_eq!(outcome, MutationOutcome::Failed);
        assert_eq!(last_mutation_id(&storage).await, 1);
        assert_eq!(get_version(&storage).await.unwrap(), Some(1));
        assert_eq!(
            storage.get("user/partial").await.unwrap(),
            Some(json!({"version": 1, "deleted": false, "value": true}))
        );
    }

    #[tokio::test]
    async fn test_missing_client_record_is_fatal() {
        let storage = MemStorage::new();
        let result = process_mutation(
            &put(1, "foo", json!(1)),
            &MutatorRegistry::with_builtins(),
            &storage,
            1,
        )
        .await;

        assert!(matches!(result, Err(ReplicationError::ClientNotFound(id)) if id == "c1"));
    }
}
