/// Global ordering of pending mutations across clients
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::iter::Peekable;
use std::vec;

use crate::{ClientId, ClientMap, ClientMutation, Mutation};

/// Single-element look-ahead over a mutation stream.
pub type PeekIterator<I> = Peekable<I>;

struct Cursor {
    client_id: ClientId,
    mutations: PeekIterator<vec::IntoIter<Mutation>>,
}

impl Cursor {
    fn next_timestamp(&mut self) -> Option<f64> {
        self.mutations.peek().map(|mutation| mutation.timestamp)
    }
}

/// Merge of every client's pending queue, ordered by adjusted timestamp.
///
/// Built from a snapshot of the pending queues; build a new one to observe
/// later pushes. A client's own mutations keep their id order because each
/// cursor only ever exposes its head. Equal timestamps go to the cursor that
/// was queued first, starting from client connection order.
pub struct MergedMutations {
    /// Sorted ascending by the timestamp of each cursor's head
    cursors: VecDeque<(f64, Cursor)>,
}

impl MergedMutations {
    pub fn new(clients: &ClientMap) -> Self {
        let mut merged = Self {
            cursors: VecDeque::with_capacity(clients.len()),
        };
        for (client_id, client) in clients {
            let cursor = Cursor {
                client_id: client_id.clone(),
                mutations: client.pending.clone().into_iter().peekable(),
            };
            merged.insert(cursor);
        }
        merged
    }

    fn insert(&mut self, mut cursor: Cursor) {
        let Some(timestamp) = cursor.next_timestamp() else {
            return;
        };
        let index = self
            .cursors
            .partition_point(|(head, _)| head.total_cmp(&timestamp) != Ordering::Greater);
        self.cursors.insert(index, (timestamp, cursor));
    }
}

impl Iterator for MergedMutations {
    type Item = ClientMutation;

    fn next(&mut self) -> Option<Self::Item> {
        let (_, mut cursor) = self.cursors.pop_front()?;
        let mutation = cursor.mutations.next()?;
        let next = ClientMutation::new(cursor.client_id.clone(), mutation);
        self.insert(cursor);
        Some(next)
    }
}
