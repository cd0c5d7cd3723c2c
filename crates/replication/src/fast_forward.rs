/// Catch-up pokes for clients behind the room's current version
use futures::future::try_join_all;
use std::collections::HashMap;
use storage::Storage;
use tracing::debug;

use crate::{
    require_client_record, user_entries_patch, ClientId, ClientPokeBody, Cookie, Patch, Poke,
    Result, Version, USER_PREFIX,
};

/// Poke every client whose `baseCookie` differs from `current_version` with
/// the user entries written since that cookie. Clients sharing a cookie share
/// one patch; up-to-date clients are skipped.
///
/// Records are not updated here; the caller owns that.
pub async fn fast_forward_room(
    client_ids: &[ClientId],
    current_version: Version,
    storage: &dyn Storage,
    timestamp: f64,
) -> Result<Vec<ClientPokeBody>> {
    let records = try_join_all(
        client_ids
            .iter()
            .map(|client_id| require_client_record(client_id, storage)),
    )
    .await?;

    let mut cookies: Vec<Cookie> = Vec::new();
    for record in &records {
        if record.base_cookie != Some(current_version) && !cookies.contains(&record.base_cookie) {
            cookies.push(record.base_cookie);
        }
    }
    if cookies.is_empty() {
        return Ok(Vec::new());
    }

    let patches = try_join_all(cookies.iter().map(|cookie| async move {
        let changed = storage
            .list_changed_since(USER_PREFIX, cookie.unwrap_or(0))
            .await?;
        Ok::<_, crate::ReplicationError>((*cookie, user_entries_patch(changed)?))
    }))
    .await?;
    let patches: HashMap<Cookie, Patch> = patches.into_iter().collect();

    let pokes: Vec<ClientPokeBody> = client_ids
        .iter()
        .zip(records)
        .filter_map(|(client_id, record)| {
            let patch = patches.get(&record.base_cookie)?;
            Some(ClientPokeBody {
                client_id: client_id.clone(),
                poke: Poke {
                    base_cookie: record.base_cookie,
                    cookie: current_version,
                    last_mutation_id: record.last_mutation_id,
                    patch: patch.clone(),
                    timestamp,
                },
            })
        })
        .collect();

    debug!(
        "fast-forwarding {} of {} clients to version {}",
        pokes.len(),
        client_ids.len(),
        current_version
    );
    Ok(pokes)
}
