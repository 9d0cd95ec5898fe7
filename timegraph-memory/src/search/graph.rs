//! Graph proximity around a center node

use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::edge::EntityEdge;

/// Hop distance from `center` to every node reachable within `max_depth`
/// over `edges`, ignoring direction. The center itself is at distance 0.
pub fn bfs_distances(edges: &[EntityEdge], center: Uuid, max_depth: usize) -> HashMap<Uuid, usize> {
    let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.source_node_uuid)
            .or_default()
            .push(edge.target_node_uuid);
        adjacency
            .entry(edge.target_node_uuid)
            .or_default()
            .push(edge.source_node_uuid);
    }

    let mut distances = HashMap::from([(center, 0)]);
    let mut queue = VecDeque::from([center]);
    while let Some(node) = queue.pop_front() {
        let depth = distances[&node];
        if depth >= max_depth {
            continue;
        }
        for next in adjacency.get(&node).into_iter().flatten() {
            if !distances.contains_key(next) {
                distances.insert(*next, depth + 1);
                queue.push_back(*next);
            }
        }
    }
    distances
}

/// Score shown for a hop distance
pub fn proximity_score(distance: usize) -> f32 {
    1.0 / (1.0 + distance as f32)
}

/// Edges with an endpoint in `distances`, nearest first, then most recent
/// `valid_at`, then uuid
pub fn rank_edges(edges: Vec<EntityEdge>, distances: &HashMap<Uuid, usize>) -> Vec<(EntityEdge, usize)> {
    let mut ranked: Vec<(EntityEdge, usize)> = edges
        .into_iter()
        .filter_map(|e| {
            let near = [e.source_node_uuid, e.target_node_uuid]
                .iter()
                .filter_map(|n| distances.get(n).copied())
                .min()?;
            Some((e, near))
        })
        .collect();
    ranked.sort_by_key(|(e, d)| (*d, Reverse(e.valid_at()), e.uuid));
    ranked
}
