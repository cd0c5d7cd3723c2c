/// Per-connection client state: the socket handle and the pending queue
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{ClientId, Downstream, Mutation};

/// Identifies one socket; a reconnecting client gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// What the transport should do with a connection
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Message(Downstream),
    Close,
}

/// Server side of a client connection. The transport drains the paired
/// receiver and writes to the real socket.
#[derive(Debug, Clone)]
pub struct ClientSocket {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<SocketEvent>,
}

impl ClientSocket {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = Self {
            id: ConnectionId::new(),
            tx,
        };
        (socket, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message. Returns false once the transport has gone away.
    pub fn send(&self, message: Downstream) -> bool {
        if self.tx.send(SocketEvent::Message(message)).is_err() {
            debug!("connection {} already gone, dropping message", self.id.0);
            return false;
        }
        true
    }

    pub fn close(&self) {
        let _ = self.tx.send(SocketEvent::Close);
    }
}

#[derive(Debug)]
pub struct ClientState {
    pub socket: ClientSocket,

    /// Unapplied mutations, strictly increasing by id
    pub pending: Vec<Mutation>,

    /// `server_now - client_now` measured at connect
    pub clock_behind_by_ms: Option<f64>,
}

impl ClientState {
    pub fn new(socket: ClientSocket, clock_behind_by_ms: Option<f64>) -> Self {
        Self {
            socket,
            pending: Vec::new(),
            clock_behind_by_ms,
        }
    }

    /// Sorted insert by id. Returns false if the id is already queued.
    pub fn enqueue(&mut self, mutation: Mutation) -> bool {
        match self
            .pending
            .binary_search_by_key(&mutation.id, |queued| queued.id)
        {
            Ok(_) => false,
            Err(index) => {
                self.pending.insert(index, mutation);
                true
            }
        }
    }

    /// Queue pushed mutations with their timestamps moved onto the server
    /// clock. Returns how many were new.
    pub fn push_mutations(&mut self, mutations: Vec<Mutation>) -> usize {
        let offset = self.clock_behind_by_ms.unwrap_or(0.0);
        mutations
            .into_iter()
            .map(|mut mutation| {
                mutation.timestamp += offset;
                self.enqueue(mutation)
            })
            .filter(|added| *added)
            .count()
    }

    /// Drop everything already processed.
    pub fn trim_pending(&mut self, last_mutation_id: u64) {
        self.pending.retain(|mutation| mutation.id > last_mutation_id);
    }
}

/// Connected clients of one room, in connection order.
pub type ClientMap = IndexMap<ClientId, ClientState>;
