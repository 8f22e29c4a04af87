// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use tokio::sync::mpsc;

use crate::orchestrator::IslandContext;

///
/// Wire `n_islands` migration contexts into a ring: island i's elites flow to island
/// (i + 1) % n. Each context owns its own inbox; the matching outbox sender is handed to
/// its predecessor.
///
pub fn ring_contexts(n_islands: usize) -> Vec<IslandContext> {
    let mut senders = Vec::with_capacity(n_islands);
    let mut receivers = Vec::with_capacity(n_islands);
    for _ in 0..n_islands {
        let (sender, receiver) = mpsc::unbounded_channel();
        senders.push(sender);
        receivers.push(receiver);
    }
    receivers
        .into_iter()
        .enumerate()
        .map(|(island_id, inbox)| IslandContext {
            island_id,
            n_islands,
            outbox: senders[(island_id + 1) % n_islands].clone(),
            inbox,
        })
        .collect()
}

#[cfg(test)]
mod islands_tests {
    use candidates::Candidate;

    use super::ring_contexts;

    #[tokio::test]
    async fn ring_routes_to_the_successor() {
        let mut contexts = ring_contexts(3);
        contexts[0]
            .outbox
            .send(Candidate::new("Migrant from island 0."))
            .unwrap();
        contexts[2]
            .outbox
            .send(Candidate::new("Migrant from island 2."))
            .unwrap();

        let migrant = contexts[1].inbox.recv().await.unwrap();
        assert_eq!(migrant.text, "Migrant from island 0.");
        let wrapped = contexts[0].inbox.recv().await.unwrap();
        assert_eq!(wrapped.text, "Migrant from island 2.");
    }

    #[test]
    fn single_island_ring_loops_back() {
        let contexts = ring_contexts(1);
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].island_id, 0);
        assert_eq!(contexts[0].n_islands, 1);
    }
}
