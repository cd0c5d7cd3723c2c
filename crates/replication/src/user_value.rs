/// Key namespaces and versioned envelopes stored in a room
///
/// `user/*` holds application data visible to clients, `client/*` holds
/// per-client bookkeeping and `version` holds the room's version counter.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use storage::{Storage, StorageError, StorageExt};

use crate::{ClientId, Cookie, Patch, PatchOp, ReplicationError, Result, Version};

pub const USER_PREFIX: &str = "user/";
pub const CLIENT_PREFIX: &str = "client/";
pub const VERSION_KEY: &str = "version";

/// Envelope around every application value. Deletes are soft so that the
/// version of the delete survives for diffing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserValue {
    pub version: Version,
    pub deleted: bool,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Highest mutation id from this client that has been processed
    #[serde(rename = "lastMutationID")]
    pub last_mutation_id: u64,

    /// Version the client is known to have
    #[serde(rename = "baseCookie")]
    pub base_cookie: Cookie,
}

impl ClientRecord {
    pub fn new(base_cookie: Cookie) -> Self {
        Self {
            last_mutation_id: 0,
            base_cookie,
        }
    }
}

pub fn user_value_key(key: &str) -> String {
    format!("{}{}", USER_PREFIX, key)
}

pub fn client_record_key(client_id: &str) -> String {
    format!("{}{}", CLIENT_PREFIX, client_id)
}

pub async fn get_version(storage: &dyn Storage) -> Result<Option<Version>> {
    Ok(storage.get_typed(VERSION_KEY).await?)
}

pub async fn put_version(version: Version, storage: &dyn Storage) -> Result<()> {
    Ok(storage.put_typed(VERSION_KEY, &version).await?)
}

pub async fn get_user_value(key: &str, storage: &dyn Storage) -> Result<Option<UserValue>> {
    Ok(storage.get_typed(&user_value_key(key)).await?)
}

pub async fn put_user_value(key: &str, value: &UserValue, storage: &dyn Storage) -> Result<()> {
    Ok(storage.put_typed(&user_value_key(key), value).await?)
}

pub async fn get_client_record(
    client_id: &str,
    storage: &dyn Storage,
) -> Result<Option<ClientRecord>> {
    Ok(storage.get_typed(&client_record_key(client_id)).await?)
}

/// Like [`get_client_record`] but a missing record is an invariant violation.
pub async fn require_client_record(
    client_id: &str,
    storage: &dyn Storage,
) -> Result<ClientRecord> {
    get_client_record(client_id, storage)
        .await?
        .ok_or_else(|| ReplicationError::ClientNotFound(ClientId::from(client_id)))
}

pub async fn put_client_record(
    client_id: &str,
    record: &ClientRecord,
    storage: &dyn Storage,
) -> Result<()> {
    Ok(storage
        .put_typed(&client_record_key(client_id), record)
        .await?)
}

/// Translate a raw cache patch into the patch clients see.
///
/// System keys are dropped, the `user/` prefix is stripped and envelopes are
/// opened: soft-deleted values become `del`, everything else `put`. Raw
/// deletes never come out of a transaction, so one here is a bug.
pub fn unwrap_patch(raw: Patch) -> Result<Patch> {
    let mut patch = Patch::new();
    for op in raw {
        match op {
            PatchOp::Put { key, value } => {
                if let Some(stripped) = key.strip_prefix(USER_PREFIX) {
                    let envelope = decode_user_value(&key, value)?;
                    patch.push(envelope_op(stripped, envelope));
                }
            }
            PatchOp::Del { key } => return Err(ReplicationError::UnexpectedDelete(key)),
        }
    }
    Ok(patch)
}

/// Patch for a list of stored `user/*` entries, as returned by a range scan.
pub fn user_entries_patch(entries: Vec<(String, Value)>) -> Result<Patch> {
    entries
        .into_iter()
        .filter_map(|(key, value)| {
            let stripped = key.strip_prefix(USER_PREFIX)?.to_string();
            Some(decode_user_value(&key, value).map(|envelope| envelope_op(&stripped, envelope)))
        })
        .collect()
}

fn decode_user_value(key: &str, value: Value) -> Result<UserValue> {
    serde_json::from_value(value).map_err(|source| {
        ReplicationError::Storage(StorageError::Schema {
            key: key.to_string(),
            source,
        })
    })
}

fn envelope_op(key: &str, envelope: UserValue) -> PatchOp {
    if envelope.deleted {
        PatchOp::Del {
            key: key.to_string(),
        }
    } else {
        PatchOp::Put {
            key: key.to_string(),
            value: envelope.value,
        }
    }
}
