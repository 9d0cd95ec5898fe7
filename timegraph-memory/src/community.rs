//! Community detection
//!
//! A community is a connected component of the group's currently valid
//! entity-edge graph with at least two members. Rebuilding replaces every
//! community of the group in one commit.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use uuid::Uuid;

use crate::config::ProviderPolicy;
use crate::edge::EdgeKind;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::node::{CommunityNode, EntityNode, Node, NodeKind};
use crate::retry::with_retry;
use crate::store::{EdgeFilter, GraphStore, NodeFilter, WriteBatch};
use crate::temporal::TemporalScope;

/// Names shown in a community's title
const TITLE_MEMBERS: usize = 3;

/// Rebuild attempts before a revision conflict is surfaced
const MAX_REBUILD_ATTEMPTS: u32 = 3;

/// Disjoint-set forest over node indices
struct Components {
    parent: Vec<usize>,
}

impl Components {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // smaller root wins so results do not depend on edge order
            let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[merge] = keep;
        }
    }
}

/// Group entity nodes into connected components by the given links.
/// Singletons are dropped; each component is sorted by name, then uuid.
pub fn connected_components(
    nodes: &[EntityNode],
    links: impl IntoIterator<Item = (Uuid, Uuid)>,
) -> Vec<Vec<EntityNode>> {
    let mut sorted: Vec<&EntityNode> = nodes.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name).then(a.uuid.cmp(&b.uuid)));
    let index: HashMap<Uuid, usize> = sorted.iter().enumerate().map(|(i, n)| (n.uuid, i)).collect();

    let mut forest = Components::new(sorted.len());
    for (a, b) in links {
        if let (Some(&i), Some(&j)) = (index.get(&a), index.get(&b)) {
            forest.union(i, j);
        }
    }

    let mut groups: HashMap<usize, Vec<EntityNode>> = HashMap::new();
    for (i, node) in sorted.iter().enumerate() {
        let root = forest.find(i);
        groups.entry(root).or_default().push((*node).clone());
    }

    let mut components: Vec<(usize, Vec<EntityNode>)> = groups
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .collect();
    components.sort_by_key(|(root, _)| *root);
    components.into_iter().map(|(_, members)| members).collect()
}

fn summarize(group_id: &str, members: &[EntityNode]) -> CommunityNode {
    let mut name = members
        .iter()
        .take(TITLE_MEMBERS)
        .map(|m| m.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    if members.len() > TITLE_MEMBERS {
        name.push_str(&format!(" and {} more", members.len() - TITLE_MEMBERS));
    }

    let summary = members
        .iter()
        .map(|m| {
            if m.summary.is_empty() {
                m.name.clone()
            } else {
                format!("{}: {}", m.name, m.summary)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    CommunityNode {
        uuid: Uuid::new_v4(),
        name,
        group_id: group_id.to_string(),
        summary,
        members: members.iter().map(|m| m.uuid).collect::<BTreeSet<_>>(),
        summary_embedding: None,
        created_at: Utc::now(),
    }
}

pub struct CommunityBuilder<'a> {
    store: &'a dyn GraphStore,
    embedder: &'a dyn Embedder,
    policy: &'a ProviderPolicy,
}

impl<'a> CommunityBuilder<'a> {
    pub fn new(
        store: &'a dyn GraphStore,
        embedder: &'a dyn Embedder,
        policy: &'a ProviderPolicy,
    ) -> Self {
        Self {
            store,
            embedder,
            policy,
        }
    }

    /// Recompute the group's communities and replace the stored ones.
    ///
    /// Components and summary embeddings are computed without the group
    /// lock; the lock is held only for the revision-checked commit. A
    /// concurrent write to the group restarts the rebuild.
    pub async fn rebuild(&self, group_id: &str) -> Result<Vec<CommunityNode>> {
        let mut attempt = 1;
        loop {
            let revision = self.store.group_revision(group_id).await?;
            let communities = self.plan(group_id).await?;

            let mut batch = WriteBatch::new().expect_revision(group_id, revision);
            batch.delete_nodes_matching(
                NodeFilter::new().group(group_id).kind(NodeKind::Community),
            );
            for community in &communities {
                batch.put_node(community.clone());
            }

            let committed = {
                let _lock = self.store.lock_group(group_id).await;
                self.store.commit(batch).await
            };
            match committed {
                Ok(_) => {
                    log::info!(
                        "Rebuilt {} communities for group '{}'",
                        communities.len(),
                        group_id
                    );
                    return Ok(communities);
                }
                Err(e) if e.is_conflict() && attempt < MAX_REBUILD_ATTEMPTS => {
                    log::debug!(
                        "Group '{}' changed during community rebuild, retrying ({}/{})",
                        group_id,
                        attempt,
                        MAX_REBUILD_ATTEMPTS
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn plan(&self, group_id: &str) -> Result<Vec<CommunityNode>> {
        let entities: Vec<EntityNode> = self
            .store
            .get_nodes(&NodeFilter::new().group(group_id).kind(NodeKind::Entity))
            .await?
            .into_iter()
            .filter_map(Node::into_entity)
            .collect();
        let links: Vec<(Uuid, Uuid)> = self
            .store
            .get_edges(
                &EdgeFilter::new()
                    .group(group_id)
                    .kind(EdgeKind::Entity)
                    .scope(TemporalScope::Current),
            )
            .await?
            .iter()
            .map(|e| (e.source_node_uuid(), e.target_node_uuid()))
            .collect();

        let mut communities: Vec<CommunityNode> = connected_components(&entities, links)
            .iter()
            .map(|members| summarize(group_id, members))
            .collect();

        if !communities.is_empty() {
            let summaries: Vec<String> = communities.iter().map(|c| c.summary.clone()).collect();
            let embeddings = with_retry(self.policy, "embedder", "embed communities", || {
                self.embedder.embed_batch(&summaries)
            })
            .await?;
            for (community, embedding) in communities.iter_mut().zip(embeddings) {
                community.summary_embedding = Some(embedding);
            }
        }
        Ok(communities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::{Edge, EntityEdge};
    use crate::error::ProviderError;
    use crate::node::GraphElement;
    use crate::store::MemoryGraphStore;
    use crate::temporal::Validity;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct LengthEmbedder;

    #[async_trait]
    impl Embedder for LengthEmbedder {
        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
            Ok(vec![text.len() as f32, 1.0])
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn link(a: &EntityNode, b: &EntityNode) -> EntityEdge {
        EntityEdge::new(
            "g",
            a.uuid,
            b.uuid,
            "KNOWS",
            format!("{} knows {}", a.name, b.name),
            Validity::starting(Utc::now()),
        )
    }

    #[test]
    fn test_components_drop_singletons() {
        let a = EntityNode::new("A", "g");
        let b = EntityNode::new("B", "g");
        let c = EntityNode::new("C", "g");
        let d = EntityNode::new("D", "g");
        let e = EntityNode::new("E", "g");
        let nodes = vec![a.clone(), b.clone(), c.clone(), d.clone(), e];

        let comps = connected_components(&nodes, [(a.uuid, b.uuid), (c.uuid, d.uuid), (b.uuid, a.uuid)]);
        assert_eq!(comps.len(), 2);
        assert_eq!(comps[0][0].name, "A");
        assert_eq!(comps[1][0].name, "C");
    }

    #[tokio::test]
    async fn test_rebuild_replaces_and_skips_ended_facts() {
        let store = MemoryGraphStore::new();
        let a = EntityNode::new("Alice", "g");
        let b = EntityNode::new("Bob", "g");
        let c = EntityNode::new("Carol", "g");
        store
            .save_nodes(vec![a.clone().into(), b.clone().into(), c.clone().into()])
            .await
            .unwrap();

        let mut ended = link(&b, &c);
        ended.validity.invalidate_at(ended.valid_at());
        store
            .save_edges(vec![Edge::Entity(link(&a, &b)), Edge::Entity(ended)])
            .await
            .unwrap();

        let policy = ProviderPolicy::default();
        let builder = CommunityBuilder::new(&store, &LengthEmbedder, &policy);
        let first = builder.rebuild("g").await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].members.len(), 2);
        assert!(first[0].summary_embedding.is_some());

        let second = builder.rebuild("g").await.unwrap();
        let stored = store
            .get_nodes(&NodeFilter::new().group("g").kind(NodeKind::Community))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].uuid(), second[0].uuid);
    }

    async fn seed_pair(store: &MemoryGraphStore) {
        let a = EntityNode::new("Alice", "g");
        let b = EntityNode::new("Bob", "g");
        store
            .save_nodes(vec![a.clone().into(), b.clone().into()])
            .await
            .unwrap();
        store.save_edges(vec![Edge::Entity(link(&a, &b))]).await.unwrap();
    }

    /// Takes its time on every call
    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(vec![text.len() as f32, 1.0])
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn test_embedding_runs_outside_the_group_lock() {
        let store = MemoryGraphStore::new();
        seed_pair(&store).await;

        let policy = ProviderPolicy::default();
        let builder = CommunityBuilder::new(&store, &SlowEmbedder, &policy);
        let (rebuilt, waited) = tokio::join!(builder.rebuild("g"), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let started = Instant::now();
            let _guard = store.lock_group("g").await;
            started.elapsed()
        });

        assert_eq!(rebuilt.unwrap().len(), 1);
        assert!(waited < Duration::from_millis(250), "lock waited {:?}", waited);
    }

    /// Writes to the group from inside its first embedding call
    struct InterferingEmbedder<'a> {
        store: &'a MemoryGraphStore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl<'a> Embedder for InterferingEmbedder<'a> {
        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.store
                    .save_nodes(vec![EntityNode::new("Dan", "g").into()])
                    .await
                    .map_err(|e| ProviderError::terminal("interfering", e.to_string()))?;
            }
            Ok(vec![text.len() as f32, 1.0])
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn test_concurrent_write_restarts_rebuild() {
        let store = MemoryGraphStore::new();
        seed_pair(&store).await;

        let embedder = InterferingEmbedder {
            store: &store,
            calls: AtomicUsize::new(0),
        };
        let policy = ProviderPolicy::default();
        let builder = CommunityBuilder::new(&store, &embedder, &policy);
        let communities = builder.rebuild("g").await.unwrap();

        assert_eq!(communities.len(), 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        let stored = store
            .get_nodes(&NodeFilter::new().group("g").kind(NodeKind::Community))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }
}
