//! Public entry point tying the store, providers and pipelines together

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::community::CommunityBuilder;
use crate::config::GraphConfig;
use crate::edge::{Edge, EdgeKind, EntityEdge};
use crate::embedding::{CachedEmbedder, Embedder};
use crate::error::{GraphError, Result};
use crate::extraction::Extractor;
use crate::ingest::{AddEpisodeResult, IngestionPipeline};
use crate::node::{
    validate_group_id, CommunityNode, EntityNode, EpisodicNode, GraphElement, NewEpisode, Node,
    NodeKind,
};
use crate::rerank::Reranker;
use crate::search::{SearchEngine, SearchRequest, SearchResults};
use crate::store::{
    CommitStats, EdgeFilter, GraphStore, MemoryGraphStore, NodeFilter, RocksGraphStore, WriteBatch,
};

/// Temporal knowledge graph
///
/// Episodes go in through [`Self::add_episode`]; facts come out through
/// [`Self::search`]. All state lives in the [`GraphStore`].
pub struct TemporalGraph {
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn Embedder>,
    config: Arc<GraphConfig>,
    ingestion: IngestionPipeline,
    search: SearchEngine,
}

impl TemporalGraph {
    /// Create a graph over `store`. The embedder is wrapped in an LRU cache.
    pub fn new(
        store: Arc<dyn GraphStore>,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn Extractor>,
        config: GraphConfig,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let embedder: Arc<dyn Embedder> = Arc::new(CachedEmbedder::new(
            embedder,
            config.embedding_cache_capacity,
        ));

        let ingestion = IngestionPipeline::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            extractor,
            Arc::clone(&config),
        );
        let search = SearchEngine::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            None,
            Arc::clone(&config),
        );

        log::info!("Temporal graph ready on {} store", store.backend_name());
        Ok(Self {
            store,
            embedder,
            config,
            ingestion,
            search,
        })
    }

    /// Graph held in process memory
    pub fn in_memory(
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn Extractor>,
        config: GraphConfig,
    ) -> Result<Self> {
        Self::new(Arc::new(MemoryGraphStore::new()), embedder, extractor, config)
    }

    /// Graph persisted in a RocksDB directory
    pub fn open(
        path: impl AsRef<Path>,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn Extractor>,
        config: GraphConfig,
    ) -> Result<Self> {
        let store = RocksGraphStore::open(path)?;
        Self::new(Arc::new(store), embedder, extractor, config)
    }

    /// Rerank search results with `reranker`
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.search = SearchEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.embedder),
            Some(reranker),
            Arc::clone(&self.config),
        );
        self
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Idempotent store setup
    pub async fn build_indices(&self) -> Result<()> {
        self.store.ensure_indices_and_constraints().await
    }

    pub async fn add_episode(&self, episode: NewEpisode) -> Result<AddEpisodeResult> {
        self.ingestion.add_episode(episode).await
    }

    /// Ingest many episodes; see [`IngestionPipeline::add_episodes`]
    pub async fn add_episodes(&self, episodes: Vec<NewEpisode>) -> Vec<Result<AddEpisodeResult>> {
        self.ingestion.add_episodes(episodes).await
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResults> {
        self.search.search(request).await
    }

    /// Episodes left in the staging journal by an interrupted ingestion
    pub async fn staged_episodes(&self) -> Result<Vec<EpisodicNode>> {
        self.store.staged_episodes().await
    }

    /// The `last_n` most recent episodes with a reference time at or before
    /// `reference_time` (now when `None`), oldest first
    pub async fn retrieve_episodes(
        &self,
        group_ids: &[String],
        last_n: usize,
        reference_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<EpisodicNode>> {
        for group_id in group_ids {
            validate_group_id(group_id)?;
        }
        if group_ids.is_empty() || last_n == 0 {
            return Ok(Vec::new());
        }

        let mut episodes: Vec<EpisodicNode> = self
            .store
            .get_nodes(
                &NodeFilter::new()
                    .group_ids(group_ids.iter().cloned())
                    .kind(NodeKind::Episodic)
                    .reference_time_before(reference_time.unwrap_or_else(Utc::now)),
            )
            .await?
            .into_iter()
            .filter_map(Node::into_episodic)
            .collect();
        episodes.sort_by_key(EpisodicNode::order);
        let skip = episodes.len().saturating_sub(last_n);
        Ok(episodes.split_off(skip))
    }

    pub async fn get_episode(&self, uuid: Uuid) -> Result<EpisodicNode> {
        self.node(uuid, NodeKind::Episodic)
            .await?
            .and_then(Node::into_episodic)
            .ok_or_else(|| GraphError::not_found("EpisodicNode", uuid))
    }

    pub async fn get_entity_node(&self, uuid: Uuid) -> Result<EntityNode> {
        self.node(uuid, NodeKind::Entity)
            .await?
            .and_then(Node::into_entity)
            .ok_or_else(|| GraphError::not_found("EntityNode", uuid))
    }

    pub async fn get_entity_edge(&self, uuid: Uuid) -> Result<EntityEdge> {
        self.store
            .get_edges(&EdgeFilter::new().uuids([uuid]).kind(EdgeKind::Entity))
            .await?
            .into_iter()
            .find_map(Edge::into_entity)
            .ok_or_else(|| GraphError::not_found("EntityEdge", uuid))
    }

    /// Facts attested by an episode
    pub async fn episode_edges(&self, episode_uuid: Uuid) -> Result<Vec<EntityEdge>> {
        self.get_episode(episode_uuid).await?;
        Ok(self
            .store
            .get_edges(
                &EdgeFilter::new()
                    .kind(EdgeKind::Entity)
                    .episode(episode_uuid),
            )
            .await?
            .into_iter()
            .filter_map(Edge::into_entity)
            .collect())
    }

    /// Remove an episode and its provenance.
    ///
    /// Facts attested by other episodes survive with this episode removed
    /// from their attestations. Entities left with no mentions and no facts
    /// are removed as well.
    pub async fn delete_episode(&self, uuid: Uuid) -> Result<CommitStats> {
        let group_id = self.get_episode(uuid).await?.group_id;
        let _lock = self.store.lock_group(&group_id).await;
        // may have been deleted while waiting for the lock
        self.get_episode(uuid).await?;

        let mut batch = WriteBatch::new();
        batch.delete_node(uuid);

        let attested = self
            .store
            .get_edges(&EdgeFilter::new().kind(EdgeKind::Entity).episode(uuid))
            .await?;
        let mut dropped_edges: HashSet<Uuid> = HashSet::new();
        for edge in attested.into_iter().filter_map(Edge::into_entity) {
            let mut edge = edge;
            edge.episodes.retain(|e| *e != uuid);
            if edge.episodes.is_empty() {
                dropped_edges.insert(edge.uuid);
                batch.delete_edge(edge.uuid);
            } else {
                batch.put_edge(edge);
            }
        }

        let mentioned: BTreeSet<Uuid> = self
            .store
            .get_edges(&EdgeFilter::new().kind(EdgeKind::Episodic).episode(uuid))
            .await?
            .iter()
            .map(Edge::target_node_uuid)
            .collect();
        for node in mentioned {
            if self.is_orphaned(node, uuid, &dropped_edges).await? {
                log::debug!("Removing entity {} with no remaining provenance", node);
                batch.delete_node(node);
            }
        }

        let stats = self.store.commit(batch).await?;
        log::info!(
            "Deleted episode {} from group '{}' ({} facts removed, {} entities removed)",
            uuid,
            group_id,
            dropped_edges.len(),
            stats.nodes_removed.saturating_sub(1)
        );
        Ok(stats)
    }

    /// An entity no other episode mentions and no surviving fact touches
    async fn is_orphaned(
        &self,
        node: Uuid,
        deleted_episode: Uuid,
        dropped_edges: &HashSet<Uuid>,
    ) -> Result<bool> {
        let touching = self
            .store
            .get_edges(&EdgeFilter::new().touching([node]))
            .await?;
        Ok(touching.iter().all(|edge| match edge {
            Edge::Episodic(e) => e.source_node_uuid == deleted_episode,
            Edge::Entity(e) => dropped_edges.contains(&e.uuid),
        }))
    }

    /// Remove every node, edge and staged episode of a group
    pub async fn delete_group(&self, group_id: &str) -> Result<CommitStats> {
        validate_group_id(group_id)?;
        let lock = self.store.lock_group(group_id).await;

        let mut batch = WriteBatch::new();
        batch.delete_nodes_matching(NodeFilter::new().group(group_id));
        batch.delete_edges_matching(EdgeFilter::new().group(group_id));
        let stats = self.store.commit(batch).await?;
        let discarded = self.discard_staged(|ep| ep.group_id == group_id).await?;

        drop(lock);
        self.store.release_idle_locks();

        log::info!(
            "Deleted group '{}': {} nodes, {} edges, {} staged episodes",
            group_id,
            stats.nodes_removed,
            stats.edges_removed,
            discarded
        );
        Ok(stats)
    }

    /// Remove every group
    pub async fn clear_data(&self) -> Result<CommitStats> {
        let mut groups: BTreeSet<String> = self
            .store
            .get_nodes(&NodeFilter::new())
            .await?
            .iter()
            .map(|n| n.group_id().to_string())
            .collect();
        groups.extend(
            self.store
                .staged_episodes()
                .await?
                .into_iter()
                .map(|ep| ep.group_id),
        );

        // sorted acquisition order
        let mut guards = Vec::with_capacity(groups.len());
        for group_id in &groups {
            guards.push(self.store.lock_group(group_id).await);
        }

        let mut batch = WriteBatch::new();
        batch.delete_nodes_matching(NodeFilter::new());
        batch.delete_edges_matching(EdgeFilter::new());
        let stats = self.store.commit(batch).await?;
        let discarded = self.discard_staged(|_| true).await?;

        drop(guards);
        self.store.release_idle_locks();

        log::info!(
            "Cleared {} groups and {} staged episodes",
            groups.len(),
            discarded
        );
        Ok(stats)
    }

    async fn discard_staged<F>(&self, matches: F) -> Result<usize>
    where
        F: Fn(&EpisodicNode) -> bool,
    {
        let staged: Vec<EpisodicNode> = self
            .store
            .staged_episodes()
            .await?
            .into_iter()
            .filter(|ep| matches(ep))
            .collect();
        for ep in &staged {
            self.store.discard_staged_episode(ep.uuid);
        }
        Ok(staged.len())
    }

    /// Recompute the communities of a group
    pub async fn build_communities(&self, group_id: &str) -> Result<Vec<CommunityNode>> {
        validate_group_id(group_id)?;
        CommunityBuilder::new(self.store.as_ref(), self.embedder.as_ref(), &self.config.provider)
            .rebuild(group_id)
            .await
    }

    pub async fn get_communities(&self, group_id: &str) -> Result<Vec<CommunityNode>> {
        validate_group_id(group_id)?;
        Ok(self
            .store
            .get_nodes(&NodeFilter::new().group(group_id).kind(NodeKind::Community))
            .await?
            .into_iter()
            .filter_map(Node::into_community)
            .collect())
    }

    async fn node(&self, uuid: Uuid, kind: NodeKind) -> Result<Option<Node>> {
        Ok(self
            .store
            .get_nodes(&NodeFilter::new().uuids([uuid]).kind(kind))
            .await?
            .into_iter()
            .next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::extraction::{ExtractedEntity, ExtractedRelation, Extraction, ExtractionContext};
    use async_trait::async_trait;

    struct FlatEmbedder;

    #[async_trait]
    impl Embedder for FlatEmbedder {
        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
            Ok(vec![1.0, text.len() as f32 / 100.0])
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    /// Every episode mentions Ann and Acme, with one fact between them
    struct AnnAtAcme;

    #[async_trait]
    impl Extractor for AnnAtAcme {
        async fn extract(
            &self,
            _ctx: ExtractionContext<'_>,
        ) -> std::result::Result<Extraction, ProviderError> {
            Ok(Extraction {
                entities: vec![ExtractedEntity::new("Ann"), ExtractedEntity::new("Acme")],
                relations: vec![ExtractedRelation::new(
                    "Ann",
                    "WORKS_AT",
                    "Acme",
                    "Ann works at Acme",
                )],
            })
        }

        async fn contradicts(&self, _a: &str, _b: &str) -> std::result::Result<bool, ProviderError> {
            Ok(false)
        }
    }

    fn graph() -> TemporalGraph {
        TemporalGraph::in_memory(
            Arc::new(FlatEmbedder),
            Arc::new(AnnAtAcme),
            GraphConfig::default(),
        )
        .unwrap()
    }

    fn episode(group: &str) -> NewEpisode {
        NewEpisode::builder()
            .name("note")
            .group_id(group)
            .content("Ann works at Acme")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_lookups_report_not_found() {
        let g = graph();
        let missing = Uuid::new_v4();
        assert!(matches!(
            g.get_episode(missing).await,
            Err(GraphError::NotFound { kind: "EpisodicNode", .. })
        ));
        assert!(g.get_entity_node(missing).await.is_err());
        assert!(g.get_entity_edge(missing).await.is_err());
        assert!(g.delete_episode(missing).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_last_episode_removes_orphans() {
        let g = graph();
        let added = g.add_episode(episode("g")).await.unwrap();
        assert_eq!(added.nodes.len(), 2);
        assert_eq!(added.edges.len(), 1);

        g.delete_episode(added.episode.uuid).await.unwrap();
        assert!(g.get_entity_edge(added.edges[0].uuid).await.is_err());
        for node in &added.nodes {
            assert!(g.get_entity_node(node.uuid).await.is_err());
        }
        assert!(g.retrieve_episodes(&["g".into()], 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_distinct_mentions_keep_their_fact_without_identity_check() {
        // FlatEmbedder puts "Ann" and "Acme" far above the threshold and
        // AnnAtAcme cannot answer identity questions
        let g = graph();
        let added = g.add_episode(episode("g")).await.unwrap();
        let names: Vec<&str> = added.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["Ann", "Acme"]);

        let fact = g.get_entity_edge(added.edges[0].uuid).await.unwrap();
        assert_eq!(fact.fact, "Ann works at Acme");
        assert_ne!(fact.source_node_uuid, fact.target_node_uuid);
    }

    #[tokio::test]
    async fn test_huge_search_limit_is_accepted() {
        let g = graph();
        g.add_episode(episode("g")).await.unwrap();
        let results = g
            .search(&SearchRequest::new("Ann").group("g").limit(usize::MAX))
            .await
            .unwrap();
        assert_eq!(results.facts(), vec!["Ann works at Acme"]);
    }

    #[tokio::test]
    async fn test_retrieve_episodes_is_chronological() {
        let g = graph();
        let base = Utc::now() - chrono::Duration::days(10);
        for day in [3, 1, 2] {
            let ep = NewEpisode::builder()
                .name(format!("day {}", day))
                .group_id("g")
                .content("Ann works at Acme")
                .reference_time(base + chrono::Duration::days(day))
                .build()
                .unwrap();
            g.add_episode(ep).await.unwrap();
        }

        let last_two = g.retrieve_episodes(&["g".into()], 2, None).await.unwrap();
        let names: Vec<&str> = last_two.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["day 2", "day 3"]);

        let before = g
            .retrieve_episodes(&["g".into()], 5, Some(base + chrono::Duration::days(1)))
            .await
            .unwrap();
        assert_eq!(before.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_data_and_communities() {
        let g = graph();
        g.add_episode(episode("a")).await.unwrap();
        g.add_episode(episode("b")).await.unwrap();

        let communities = g.build_communities("a").await.unwrap();
        assert_eq!(communities.len(), 1);
        assert_eq!(g.get_communities("a").await.unwrap().len(), 1);
        assert!(g.get_communities("b").await.unwrap().is_empty());

        g.clear_data().await.unwrap();
        assert!(g.retrieve_episodes(&["a".into(), "b".into()], 10, None).await.unwrap().is_empty());
        assert!(g.get_communities("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deletes_drop_staged_episodes_and_idle_locks() {
        let store = Arc::new(MemoryGraphStore::new());
        let g = TemporalGraph::new(
            store.clone(),
            Arc::new(FlatEmbedder),
            Arc::new(AnnAtAcme),
            GraphConfig::default(),
        )
        .unwrap();
        g.add_episode(episode("a")).await.unwrap();
        g.add_episode(episode("b")).await.unwrap();
        let stranded = EpisodicNode::from_new(episode("a"), 100);
        let other = EpisodicNode::from_new(episode("b"), 101);
        store.stage_episode(&stranded).await.unwrap();
        store.stage_episode(&other).await.unwrap();
        assert_eq!(store.lock_count(), 2);

        g.delete_group("a").await.unwrap();
        let left: Vec<Uuid> = g
            .staged_episodes()
            .await
            .unwrap()
            .iter()
            .map(|ep| ep.uuid)
            .collect();
        assert_eq!(left, vec![other.uuid]);
        assert_eq!(store.lock_count(), 0);

        g.clear_data().await.unwrap();
        assert!(g.staged_episodes().await.unwrap().is_empty());
        assert_eq!(store.lock_count(), 0);
    }
}
