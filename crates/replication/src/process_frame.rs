/// One frame: every mutation up to a cutoff, folded into a single version
use storage::Storage;
use tracing::debug;

use crate::{
    get_version, process_mutation, put_client_record, require_client_record, unwrap_patch,
    ClientId, ClientMutation, ClientPokeBody, EntryCache, MutatorRegistry, PeekIterator, Poke,
    ReplicationError, Result, CLIENT_PREFIX,
};

/// Process mutations with a timestamp before `end_time` (all of them when
/// `None`) at the room's next version and poke every client in `client_ids`.
///
/// Mutations past the cutoff stay in the iterator for the next frame. A frame
/// in which nothing touched the version keeps the room at its version and
/// yields no pokes, but still persists advanced `lastMutationID`s.
pub async fn process_frame<I>(
    mutations: &mut PeekIterator<I>,
    mutators: &MutatorRegistry,
    client_ids: &[ClientId],
    storage: &dyn Storage,
    timestamp: f64,
    end_time: Option<f64>,
) -> Result<Vec<ClientPokeBody>>
where
    I: Iterator<Item = ClientMutation>,
{
    let cache = EntryCache::new(storage);
    let prev_version = get_version(&cache)
        .await?
        .ok_or(ReplicationError::VersionNotFound)?;
    let next_version = prev_version + 1;

    let mut processed = 0usize;
    while let Some(mutation) =
        mutations.next_if(|m| end_time.map_or(true, |end| m.timestamp() < end))
    {
        process_mutation(&mutation, mutators, &cache, next_version).await?;
        processed += 1;
    }

    if get_version(&cache).await? == Some(prev_version) {
        cache.flush_prefix(CLIENT_PREFIX).await?;
        if processed > 0 {
            debug!(
                "frame at {} had no effect ({} mutations), staying at version {}",
                timestamp, processed, prev_version
            );
        }
        return Ok(Vec::new());
    }

    let patch = unwrap_patch(cache.pending())?;

    let mut pokes = Vec::with_capacity(client_ids.len());
    for client_id in client_ids {
        let mut record = require_client_record(client_id, &cache).await?;
        record.base_cookie = Some(next_version);
        put_client_record(client_id, &record, &cache).await?;

        pokes.push(ClientPokeBody {
            client_id: client_id.clone(),
            poke: Poke {
                base_cookie: Some(prev_version),
                cookie: next_version,
                last_mutation_id: record.last_mutation_id,
                patch: patch.clone(),
                timestamp,
            },
        });
    }

    cache.flush().await?;
    debug!(
        "frame at {}: {} mutations, version {} -> {}, {} ops",
        timestamp,
        processed,
        prev_version,
        next_version,
        patch.len()
    );
    Ok(pokes)
}
