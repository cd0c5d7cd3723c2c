/// One turn for a room: fast-forward, then replay pending mutations in frames
use storage::Storage;
use tracing::debug;

use crate::{
    fast_forward_room, get_version, process_frame, put_client_record, put_version,
    require_client_record, ClientId, ClientMap, ClientMutation, ClientPokeBody, EntryCache,
    MergedMutations, MutatorRegistry, Result,
};

/// Length of one fixed frame in milliseconds
pub const FRAME_LENGTH_MS: f64 = 1000.0 / 60.0;

/// How much of the pending timeline a turn consumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TurnSpan {
    /// Everything pending, as a single frame
    Tick,
    /// Fixed-length frames covering `[start, end)`, each stamped with its start
    Frames { start: f64, end: f64 },
}

impl TurnSpan {
    /// End of the last frame the span covers. Frames are fixed length, so
    /// this can overshoot `end`.
    pub fn frames_end(&self) -> Option<f64> {
        match *self {
            TurnSpan::Tick => None,
            TurnSpan::Frames { start, end } => {
                let frames = ((end - start) / FRAME_LENGTH_MS).ceil().max(0.0);
                Some(start + frames * FRAME_LENGTH_MS)
            }
        }
    }
}

/// Runs a turn for the connected `clients` and returns the pokes to deliver,
/// fast-forward pokes first. Nothing reaches `storage` unless the whole turn
/// succeeds.
///
/// Frames with no mutations are skipped, so a long idle span costs no more
/// than the frames that actually hold work.
pub async fn process_room(
    clients: &ClientMap,
    mutators: &MutatorRegistry,
    storage: &dyn Storage,
    timestamp: f64,
    span: TurnSpan,
) -> Result<Vec<ClientPokeBody>> {
    let client_ids: Vec<ClientId> = clients.keys().cloned().collect();
    let cache = EntryCache::new(storage);

    let current_version = match get_version(&cache).await? {
        Some(version) => version,
        None => {
            debug!("initializing room version");
            put_version(0, &cache).await?;
            0
        }
    };

    let mut pokes = fast_forward_room(&client_ids, current_version, &cache, timestamp).await?;
    for poke in &pokes {
        let mut record = require_client_record(&poke.client_id, &cache).await?;
        record.base_cookie = Some(current_version);
        put_client_record(&poke.client_id, &record, &cache).await?;
    }

    let mut mutations = MergedMutations::new(clients).peekable();
    match span {
        TurnSpan::Tick => {
            let frame =
                process_frame(&mut mutations, mutators, &client_ids, &cache, timestamp, None)
                    .await?;
            pokes.extend(frame);
        }
        TurnSpan::Frames { start, end } => {
            let mut frame_start = start;
            while frame_start < end {
                let Some(next) = mutations.peek().map(ClientMutation::timestamp) else {
                    break;
                };
                if next >= frame_start + FRAME_LENGTH_MS {
                    // Jump to the frame holding the next mutation, staying on the grid
                    let skipped = ((next - frame_start) / FRAME_LENGTH_MS).floor().max(1.0);
                    frame_start += skipped * FRAME_LENGTH_MS;
                    continue;
                }

                let frame_end = frame_start + FRAME_LENGTH_MS;
                let frame = process_frame(
                    &mut mutations,
                    mutators,
                    &client_ids,
                    &cache,
                    frame_start,
                    Some(frame_end),
                )
                .await?;
                pokes.extend(frame);
                frame_start = frame_end;
            }
        }
    }

    cache.flush().await?;
    Ok(pokes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{put_client_record, ClientRecord, ClientSocket, ClientState, Mutation, PatchOp};
    use serde_json::json;
    use storage::MemStorage;

    async fn connect(storage: &MemStorage, clients: &mut ClientMap, client_id: &str) {
        put_client_record(client_id, &ClientRecord::new(None), storage)
            .await
            .unwrap();
        let (socket, _rx) = ClientSocket::new();
        clients.insert(client_id.to_string(), ClientState::new(socket, None));
    }

    fn put(id: u64, key: &str, ts: f64) -> Mutation {
        Mutation::new(id, "put", json!({"key": key, "value": id}), ts)
    }

    #[tokio::test]
    async fn test_tick_fast_forwards_then_applies() {
        let storage = MemStorage::new();
        let mut clients = ClientMap::new();
        connect(&storage, &mut clients, "c1").await;
        clients["c1"].pending.push(put(1, "foo", 5.0));

        let pokes = process_room(
            &clients,
            &MutatorRegistry::with_builtins(),
            &storage,
            100.0,
            TurnSpan::Tick,
        )
        .await
        .unwrap();

        assert_eq!(pokes.len(), 2);
        assert_eq!(pokes[0].poke.base_cookie, None);
        assert_eq!(pokes[0].poke.cookie, 0);
        assert!(pokes[0].poke.patch.is_empty());
        assert_eq!(pokes[1].poke.base_cookie, Some(0));
        assert_eq!(pokes[1].poke.cookie, 1);
        assert_eq!(pokes[1].poke.last_mutation_id, 1);
        assert_eq!(pokes[1].poke.timestamp, 100.0);
        assert_eq!(get_version(&storage).await.unwrap(), Some(1));

        // Second turn with nothing pending is silent
        clients["c1"].trim_pending(1);
        let pokes = process_room(
            &clients,
            &MutatorRegistry::with_builtins(),
            &storage,
            200.0,
            TurnSpan::Tick,
        )
        .await
        .unwrap();
        assert!(pokes.is_empty());
    }

    #[tokio::test]
    async fn test_frames_split_by_timestamp() {
        let storage = MemStorage::new();
        let mut clients = ClientMap::new();
        connect(&storage, &mut clients, "c1").await;
        connect(&storage, &mut clients, "c2").await;
        clients["c1"].pending.push(put(1, "a", 1.0));
        clients["c2"].pending.push(put(1, "b", 2.0));
        clients["c2"].pending.push(put(2, "c", 20.0));

        let span = TurnSpan::Frames {
            start: 0.0,
            end: 3.0 * FRAME_LENGTH_MS,
        };
        let pokes = process_room(
            &clients,
            &MutatorRegistry::with_builtins(),
            &storage,
            0.0,
            span,
        )
        .await
        .unwrap();

        // Two fast-forwards, then two non-empty frames for two clients
        let frame_pokes: Vec<_> = pokes.iter().filter(|p| p.poke.base_cookie.is_some()).collect();
        assert_eq!(pokes.len(), 6);
        assert_eq!(frame_pokes.len(), 4);

        assert_eq!(frame_pokes[0].poke.cookie, 1);
        assert_eq!(frame_pokes[0].poke.timestamp, 0.0);
        let keys: Vec<_> = frame_pokes[0].poke.patch.iter().map(PatchOp::key).collect();
        assert_eq!(keys, vec!["a", "b"]);

        assert_eq!(frame_pokes[2].client_id, "c1");
        assert_eq!(frame_pokes[2].poke.cookie, 2);
        assert_eq!(frame_pokes[2].poke.timestamp, FRAME_LENGTH_MS);
        assert_eq!(frame_pokes[3].poke.last_mutation_id, 2);
        assert_eq!(get_version(&storage).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_failed_turn_leaves_storage_untouched() {
        let storage = MemStorage::new();
        let mut clients = ClientMap::new();
        let (socket, _rx) = ClientSocket::new();
        clients.insert("ghost".to_string(), ClientState::new(socket, None));

        let result = process_room(
            &clients,
            &MutatorRegistry::with_builtins(),
            &storage,
            0.0,
            TurnSpan::Tick,
        )
        .await;

        assert!(result.is_err());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_idle_span_skips_empty_frames() {
        let storage = MemStorage::new();
        let mut clients = ClientMap::new();
        connect(&storage, &mut clients, "c1").await;
        let ts = 43_200_005.0;
        clients["c1"].pending.push(put(1, "late", ts));

        // A whole day of frames, only one of which holds a mutation
        let span = TurnSpan::Frames {
            start: 0.0,
            end: 86_400_000.0,
        };
        let pokes = process_room(&clients, &MutatorRegistry::with_builtins(), &storage, 0.0, span)
            .await
            .unwrap();

        let frames: Vec<_> = pokes.iter().filter(|p| p.poke.base_cookie.is_some()).collect();
        assert_eq!(frames.len(), 1);
        let frame_start = frames[0].poke.timestamp;
        assert!(frame_start <= ts && ts < frame_start + FRAME_LENGTH_MS);
        let frame_index = frame_start / FRAME_LENGTH_MS;
        assert!((frame_index - frame_index.round()).abs() < 1e-6);
        assert_eq!(get_version(&storage).await.unwrap(), Some(1));
    }

    #[test]
    fn test_frames_end() {
        assert_eq!(TurnSpan::Tick.frames_end(), None);
        let span = TurnSpan::Frames {
            start: 0.0,
            end: 1.5 * FRAME_LENGTH_MS,
        };
        assert_eq!(span.frames_end(), Some(2.0 * FRAME_LENGTH_MS));
        let empty = TurnSpan::Frames {
            start: 10.0,
            end: 10.0,
        };
        assert_eq!(empty.frames_end(), Some(10.0));
    }
}
