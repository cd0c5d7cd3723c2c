/// Room replay engine
/// Totally orders client mutations, replays them against versioned storage
/// and computes the pokes that bring every client to the same state.
use thiserror::Error;

mod mutation;
pub use mutation::*;

mod entry_cache;
pub use entry_cache::*;

mod user_value;
pub use user_value::*;

mod transaction;
pub use transaction::*;

pub mod mutators;
pub use mutators::{Mutator, MutatorRegistry};

mod client;
pub use client::*;

mod merge;
pub use merge::*;

mod process_mutation;
pub use process_mutation::*;

mod process_frame;
pub use process_frame::*;

mod fast_forward;
pub use fast_forward::*;

mod process_room;
pub use process_room::*;

mod protocol;
pub use protocol::*;

mod config;
pub use config::*;

mod server;
pub use server::*;

pub use storage::{Storage, StorageError, StorageExt};

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("client record not found: {0}")]
    ClientNotFound(ClientId),

    #[error("room version not initialized")]
    VersionNotFound,

    #[error("unexpected delete of {0} in transaction patch")]
    UnexpectedDelete(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("client not connected: {0}")]
    ClientNotConnected(ClientId),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Position in a room's history. Bumped once per frame that has an effect.
pub type Version = u64;

/// A client's acknowledged version; `None` means the client has no data yet.
pub type Cookie = Option<Version>;

pub type ClientId = String;

pub type RoomId = String;

/// Milliseconds on the server clock.
pub fn now_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}
