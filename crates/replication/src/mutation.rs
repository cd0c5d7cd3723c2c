/// Mutations pushed by clients and the pokes sent back to them
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ClientId, Cookie, Version};

/// A named, client-sequenced request to run a mutator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Client-local sequence number, starting at 1
    pub id: u64,

    /// Mutator to invoke
    pub name: String,

    /// Opaque arguments handed to the mutator
    #[serde(default)]
    pub args: Value,

    /// Milliseconds; adjusted to the server clock once queued
    pub timestamp: f64,
}

impl Mutation {
    pub fn new(id: u64, name: impl Into<String>, args: Value, timestamp: f64) -> Self {
        Self {
            id,
            name: name.into(),
            args,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMutation {
    #[serde(rename = "clientID")]
    pub client_id: ClientId,

    #[serde(flatten)]
    pub mutation: Mutation,
}

impl ClientMutation {
    pub fn new(client_id: impl Into<ClientId>, mutation: Mutation) -> Self {
        Self {
            client_id: client_id.into(),
            mutation,
        }
    }

    pub fn id(&self) -> u64 {
        self.mutation.id
    }

    pub fn timestamp(&self) -> f64 {
        self.mutation.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Put { key: String, value: Value },
    Del { key: String },
}

impl PatchOp {
    pub fn key(&self) -> &str {
        match self {
            PatchOp::Put { key, .. } | PatchOp::Del { key } => key,
        }
    }
}

pub type Patch = Vec<PatchOp>;

/// Delta taking a client from `base_cookie` to `cookie`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poke {
    #[serde(rename = "baseCookie")]
    pub base_cookie: Cookie,

    pub cookie: Version,

    #[serde(rename = "lastMutationID")]
    pub last_mutation_id: u64,

    pub patch: Patch,

    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientPokeBody {
    #[serde(rename = "clientID")]
    pub client_id: ClientId,

    pub poke: Poke,
}
