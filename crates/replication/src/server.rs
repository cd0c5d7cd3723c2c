/// Room registry and the turn loop
use std::collections::HashMap;
use std::sync::Arc;

use storage::Backend;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    get_client_record, now_ms, process_room, put_client_record, ClientMap, ClientSocket,
    ClientState, ConnectRequest, ConnectionId, Downstream, FrameMode, MutatorRegistry,
    ReplicationError, Result, RoomId, ServerConfig, TurnSpan, Upstream, FRAME_LENGTH_MS,
};

/// Connected clients of one room
#[derive(Debug, Default)]
pub struct Room {
    pub clients: ClientMap,

    /// End of the last frame replayed in span mode
    last_frame_end: Option<f64>,
}

impl Room {
    fn has_pending(&self) -> bool {
        self.clients.values().any(|client| !client.pending.is_empty())
    }
}

#[derive(Debug, Default)]
struct ServerState {
    rooms: HashMap<RoomId, Room>,
    timer_armed: bool,
}

struct ServerInner {
    /// Every operation runs as one critical section, in arrival order
    state: Mutex<ServerState>,
    backend: Arc<dyn Backend>,
    mutators: Arc<MutatorRegistry>,
    config: ServerConfig,
}

/// Shared handle to all rooms. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(backend: Arc<dyn Backend>, mutators: MutatorRegistry, config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                state: Mutex::new(ServerState::default()),
                backend,
                mutators: Arc::new(mutators),
                config,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Register a client connection. A client already connected under the
    /// same id has its old socket closed.
    pub async fn connect(
        &self,
        room_id: &str,
        request: ConnectRequest,
        socket: ClientSocket,
    ) -> Result<()> {
        let mut state = self.inner.state.lock().await;

        let storage = self.inner.backend.open_room(room_id)?;
        let mut record = get_client_record(&request.client_id, &*storage)
            .await?
            .unwrap_or_default();
        record.base_cookie = request.base_cookie;
        put_client_record(&request.client_id, &record, &*storage).await?;

        let clock_behind_by_ms = now_ms() - request.ts;
        let room = state.rooms.entry(room_id.to_string()).or_default();
        let client = ClientState::new(socket.clone(), Some(clock_behind_by_ms));
        if let Some(previous) = room.clients.insert(request.client_id.clone(), client) {
            info!(
                "client {} reconnected to room {}, closing previous connection",
                request.client_id, room_id
            );
            previous.socket.close();
        }

        socket.send(Downstream::Connected);
        info!(
            "client {} connected to room {} (baseCookie {:?}, lastMutationID {}, {} clients)",
            request.client_id,
            room_id,
            request.base_cookie,
            record.last_mutation_id,
            room.clients.len()
        );

        self.schedule_turn(&mut state);
        Ok(())
    }

    /// Handle a raw text frame. Malformed messages are answered with an
    /// `error` message; the connection stays open.
    pub async fn handle_text(
        &self,
        room_id: &str,
        client_id: &str,
        connection: ConnectionId,
        text: &str,
    ) -> Result<()> {
        match Upstream::from_text(text) {
            Ok(message) => {
                self.handle_message(room_id, client_id, connection, message)
                    .await
            }
            Err(err) => {
                warn!("bad message from {} in room {}: {}", client_id, room_id, err);
                let mut state = self.inner.state.lock().await;
                let client = connected_client(&mut state, room_id, client_id, connection)?;
                client.socket.send(Downstream::Error(err.to_string()));
                Ok(())
            }
        }
    }

    pub async fn handle_message(
        &self,
        room_id: &str,
        client_id: &str,
        connection: ConnectionId,
        message: Upstream,
    ) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let client = connected_client(&mut state, room_id, client_id, connection)?;

        match message {
            Upstream::Push(body) => {
                let received = body.mutations.len();
                let added = client.push_mutations(body.mutations);
                debug!(
                    "client {} pushed {} mutations ({} new), {} pending",
                    client_id,
                    received,
                    added,
                    client.pending.len()
                );
                self.schedule_turn(&mut state);
            }
            Upstream::Ping => {
                client.socket.send(Downstream::Pong);
            }
        }
        Ok(())
    }

    /// Forget a client, unless it has already reconnected on another socket.
    pub async fn disconnect(&self, room_id: &str, client_id: &str, connection: ConnectionId) {
        let mut state = self.inner.state.lock().await;
        let Some(room) = state.rooms.get_mut(room_id) else {
            return;
        };

        match room.clients.get(client_id) {
            Some(client) if client.socket.id() == connection => {
                room.clients.shift_remove(client_id);
                info!(
                    "client {} disconnected from room {} ({} clients left)",
                    client_id,
                    room_id,
                    room.clients.len()
                );
            }
            Some(_) => {
                debug!(
                    "stale disconnect for client {} in room {}, keeping newer connection",
                    client_id, room_id
                );
            }
            None => {}
        }

        if room.clients.is_empty() {
            state.rooms.remove(room_id);
            debug!("room {} closed", room_id);
        }
    }

    /// Run one turn for every room. Returns whether any mutations are
    /// still pending afterwards.
    pub async fn process_pending(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        self.run_turn(&mut state).await
    }

    pub async fn room_ids(&self) -> Vec<RoomId> {
        let state = self.inner.state.lock().await;
        let mut ids: Vec<_> = state.rooms.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn client_ids(&self, room_id: &str) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state
            .rooms
            .get(room_id)
            .map(|room| room.clients.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn pending_count(&self, room_id: &str, client_id: &str) -> Option<usize> {
        let state = self.inner.state.lock().await;
        state
            .rooms
            .get(room_id)?
            .clients
            .get(client_id)
            .map(|client| client.pending.len())
    }

    async fn run_turn(&self, state: &mut ServerState) -> bool {
        let now = now_ms();
        let mut pending = false;

        for (room_id, room) in state.rooms.iter_mut() {
            let span = match self.inner.config.frame_mode {
                FrameMode::Tick => TurnSpan::Tick,
                FrameMode::Span { delay } => {
                    let end = now - delay.as_secs_f64() * 1000.0;
                    let start = room.last_frame_end.unwrap_or(end - FRAME_LENGTH_MS);
                    TurnSpan::Frames { start, end }
                }
            };

            if let Err(err) = self.run_room_turn(room_id, room, now, span).await {
                error!("turn failed for room {}: {}", room_id, err);
            }
            pending |= room.has_pending();
        }

        pending
    }

    async fn run_room_turn(
        &self,
        room_id: &str,
        room: &mut Room,
        now: f64,
        span: TurnSpan,
    ) -> Result<()> {
        let storage = self.inner.backend.open_room(room_id)?;
        let pokes = process_room(&room.clients, &self.inner.mutators, &*storage, now, span).await?;

        if let Some(end) = span.frames_end() {
            room.last_frame_end = Some(end);
        }

        let poked = pokes.len();
        for body in pokes {
            if let Some(client) = room.clients.get(&body.client_id) {
                client.socket.send(Downstream::Poke(body.poke));
            }
        }

        for (client_id, client) in room.clients.iter_mut() {
            if client.pending.is_empty() {
                continue;
            }
            if let Some(record) = get_client_record(client_id, &*storage).await? {
                client.trim_pending(record.last_mutation_id);
            }
        }

        if poked > 0 {
            debug!("room {}: sent {} pokes", room_id, poked);
        }
        Ok(())
    }

    /// Arm the turn timer unless it is already running.
    fn schedule_turn(&self, state: &mut ServerState) {
        if state.timer_armed {
            return;
        }
        state.timer_armed = true;

        let server = self.clone();
        tokio::spawn(async move {
            server.run_timer().await;
        });
    }

    async fn run_timer(self) {
        loop {
            tokio::time::sleep(self.inner.config.turn_interval).await;

            let mut state = self.inner.state.lock().await;
            if !self.run_turn(&mut state).await {
                state.timer_armed = false;
                break;
            }
        }
    }
}

fn connected_client<'a>(
    state: &'a mut ServerState,
    room_id: &str,
    client_id: &str,
    connection: ConnectionId,
) -> Result<&'a mut ClientState> {
    state
        .rooms
        .get_mut(room_id)
        .and_then(|room| room.clients.get_mut(client_id))
        .filter(|client| client.socket.id() == connection)
        .ok_or_else(|| ReplicationError::ClientNotConnected(client_id.to_string()))
}
