//! Hybrid search engine
//!
//! Combines semantic similarity, BM25 text search and graph proximity
//! around an optional center node. Channels are merged with reciprocal-rank
//! fusion and optionally reranked. Episodes are matched on BM25 alone.

mod fusion;
mod graph;

pub use fusion::{reciprocal_rank_fusion, Channel, Fused, MatchReason};
pub use graph::{bfs_distances, proximity_score, rank_edges};

use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::GraphConfig;
use crate::edge::{Edge, EdgeKind, EntityEdge};
use crate::embedding::Embedder;
use crate::error::{GraphError, Result};
use crate::node::{
    validate_group_id, CommunityNode, EntityNode, EpisodicNode, Node, NodeKind,
};
use crate::rerank::Reranker;
use crate::retry::with_retry;
use crate::store::{EdgeFilter, GraphStore, NodeFilter};
use crate::temporal::TemporalScope;

/// Cosine floor for the semantic channel
const MIN_SIMILARITY: f32 = 0.0;

/// A search query and its filters
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub group_ids: Vec<String>,
    /// Point in time to evaluate validity at; `None` means current facts
    pub as_of: Option<DateTime<Utc>>,
    /// Node to bias results toward
    pub center_node_uuid: Option<Uuid>,
    /// Relation labels to keep; empty keeps all
    pub edge_types: Vec<String>,
    /// Entity labels to keep; empty keeps all
    pub node_labels: Vec<String>,
    /// Only elements created at or after this instant
    pub created_after: Option<DateTime<Utc>>,
    /// Only elements created at or before this instant
    pub created_before: Option<DateTime<Utc>>,
    /// Results per kind; falls back to the configured limit
    pub limit: Option<usize>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_ids.push(group_id.into());
        self
    }

    pub fn group_ids<I, S>(mut self, group_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_ids.extend(group_ids.into_iter().map(Into::into));
        self
    }

    pub fn as_of(mut self, time: DateTime<Utc>) -> Self {
        self.as_of = Some(time);
        self
    }

    pub fn center(mut self, node_uuid: Uuid) -> Self {
        self.center_node_uuid = Some(node_uuid);
        self
    }

    pub fn edge_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edge_types.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn node_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_labels.extend(labels.into_iter().map(Into::into));
        self
    }

    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(GraphError::validation("search query must not be empty"));
        }
        if self.group_ids.is_empty() {
            return Err(GraphError::validation("search needs at least one group_id"));
        }
        for group_id in &self.group_ids {
            validate_group_id(group_id)?;
        }
        if self.limit == Some(0) {
            return Err(GraphError::validation("search limit must be positive"));
        }
        if let (Some(after), Some(before)) = (self.created_after, self.created_before) {
            if after > before {
                return Err(GraphError::validation(
                    "created_after must not be later than created_before",
                ));
            }
        }
        Ok(())
    }

    fn scope(&self) -> TemporalScope {
        TemporalScope::from_as_of(self.as_of)
    }
}

/// A ranked result with the channel contributions that produced it
#[derive(Debug, Clone)]
pub struct Scored<T> {
    pub item: T,
    /// Fused reciprocal-rank score
    pub score: f64,
    pub reasons: Vec<MatchReason>,
    /// Set when a reranker reordered this result
    pub rerank_score: Option<f64>,
}

pub type ScoredEdge = Scored<EntityEdge>;
pub type ScoredNode = Scored<EntityNode>;
pub type ScoredCommunity = Scored<CommunityNode>;
pub type ScoredEpisode = Scored<EpisodicNode>;

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub edges: Vec<ScoredEdge>,
    pub nodes: Vec<ScoredNode>,
    pub communities: Vec<ScoredCommunity>,
    pub episodes: Vec<ScoredEpisode>,
}

impl SearchResults {
    /// Fact texts in rank order
    pub fn facts(&self) -> Vec<&str> {
        self.edges.iter().map(|e| e.item.fact.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
            && self.nodes.is_empty()
            && self.communities.is_empty()
            && self.episodes.is_empty()
    }
}

pub struct SearchEngine {
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    config: Arc<GraphConfig>,
}

impl SearchEngine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        config: Arc<GraphConfig>,
    ) -> Self {
        Self {
            store,
            embedder,
            reranker,
            config,
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResults> {
        request.validate()?;
        let limit = request.limit.unwrap_or(self.config.search.limit);
        let per_channel = self.config.search.channel_size(limit);
        let scope = request.scope();

        let query_vector = with_retry(&self.config.provider, "embedder", "embed query", || {
            self.embedder.embed(&request.query)
        })
        .await?;

        let created = (request.created_after, request.created_before);
        let mut edge_filter = EdgeFilter::new()
            .group_ids(request.group_ids.iter().cloned())
            .kind(EdgeKind::Entity)
            .scope(scope)
            .created_between(created.0, created.1);
        if !request.edge_types.is_empty() {
            edge_filter = edge_filter.names(request.edge_types.iter().cloned());
        }
        let mut node_filter = NodeFilter::new()
            .group_ids(request.group_ids.iter().cloned())
            .kind(NodeKind::Entity)
            .created_between(created.0, created.1);
        if !request.node_labels.is_empty() {
            node_filter = node_filter.labels(request.node_labels.iter().cloned());
        }
        let community_filter = NodeFilter::new()
            .group_ids(request.group_ids.iter().cloned())
            .kind(NodeKind::Community)
            .created_between(created.0, created.1);
        let mut episode_filter = NodeFilter::new()
            .group_ids(request.group_ids.iter().cloned())
            .kind(NodeKind::Episodic)
            .created_between(created.0, created.1);
        if let Some(as_of) = request.as_of {
            episode_filter = episode_filter.reference_time_before(as_of);
        }

        let proximity = match request.center_node_uuid {
            Some(center) => Some(self.proximity(request, center, scope).await?),
            None => None,
        };

        let edges = self
            .search_edges(request, &query_vector, &edge_filter, proximity.as_ref(), per_channel)
            .await?;
        let nodes = self
            .search_nodes(request, &query_vector, &node_filter, proximity.as_ref(), per_channel)
            .await?;
        let communities = self
            .search_communities(request, &query_vector, &community_filter, per_channel)
            .await?;
        let episodes = self
            .search_episodes(request, &episode_filter, per_channel)
            .await?;

        let mut results = SearchResults {
            edges: self
                .rerank(&request.query, edges, |e: &EntityEdge| e.fact.clone())
                .await,
            nodes: self
                .rerank(&request.query, nodes, EntityNode::searchable_text)
                .await,
            communities: self
                .rerank(&request.query, communities, CommunityNode::searchable_text)
                .await,
            episodes: self
                .rerank(&request.query, episodes, |ep: &EpisodicNode| ep.content.clone())
                .await,
        };
        results.edges.truncate(limit);
        results.nodes.truncate(limit);
        results.communities.truncate(limit);
        results.episodes.truncate(limit);

        log::debug!(
            "Search '{}' over {:?}: {} edges, {} nodes, {} communities, {} episodes",
            request.query,
            request.group_ids,
            results.edges.len(),
            results.nodes.len(),
            results.communities.len(),
            results.episodes.len()
        );
        Ok(results)
    }

    /// Hop distances from the center plus the edges eligible for traversal
    async fn proximity(
        &self,
        request: &SearchRequest,
        center: Uuid,
        scope: TemporalScope,
    ) -> Result<Proximity> {
        let traversable: Vec<EntityEdge> = self
            .store
            .get_edges(
                &EdgeFilter::new()
                    .group_ids(request.group_ids.iter().cloned())
                    .kind(EdgeKind::Entity)
                    .scope(scope),
            )
            .await?
            .into_iter()
            .filter_map(|e| e.into_entity())
            .collect();
        let distances = bfs_distances(&traversable, center, self.config.search.bfs_max_depth);
        Ok(Proximity {
            distances,
            traversable,
        })
    }

    async fn search_edges(
        &self,
        request: &SearchRequest,
        query_vector: &[f32],
        filter: &EdgeFilter,
        proximity: Option<&Proximity>,
        per_channel: usize,
    ) -> Result<Vec<ScoredEdge>> {
        let semantic = self
            .store
            .search_edges_by_embedding(query_vector, filter, MIN_SIMILARITY, per_channel)
            .await?;
        let lexical = self
            .store
            .search_edges_fulltext(&request.query, filter, per_channel)
            .await?;
        let graph: Vec<(EntityEdge, f32)> = match proximity {
            Some(p) => {
                let eligible = p
                    .traversable
                    .iter()
                    .filter(|e| filter.matches(&Edge::Entity((*e).clone())))
                    .cloned()
                    .collect();
                rank_edges(eligible, &p.distances)
                    .into_iter()
                    .take(per_channel)
                    .map(|(e, d)| (e, proximity_score(d)))
                    .collect()
            }
            None => Vec::new(),
        };

        let mut fused = fuse(
            vec![
                (Channel::Semantic, semantic),
                (Channel::Lexical, lexical),
                (Channel::GraphProximity, graph),
            ],
            |e: &EntityEdge| e.uuid,
            self.config.search.rrf_k,
        );
        fused.sort_by(|a, b| {
            by_score(a, b)
                .then_with(|| b.item.valid_at().cmp(&a.item.valid_at()))
                .then(a.item.uuid.cmp(&b.item.uuid))
        });
        Ok(fused)
    }

    async fn search_nodes(
        &self,
        request: &SearchRequest,
        query_vector: &[f32],
        filter: &NodeFilter,
        proximity: Option<&Proximity>,
        per_channel: usize,
    ) -> Result<Vec<ScoredNode>> {
        let semantic = self
            .store
            .search_nodes_by_embedding(query_vector, filter, MIN_SIMILARITY, per_channel)
            .await?;
        let lexical = self
            .store
            .search_nodes_fulltext(&request.query, filter, per_channel)
            .await?;
        let graph: Vec<(EntityNode, f32)> = match proximity {
            Some(p) => {
                let mut reachable: Vec<(EntityNode, usize)> = self
                    .store
                    .get_nodes(&filter.clone().uuids(p.distances.keys().copied()))
                    .await?
                    .into_iter()
                    .filter_map(Node::into_entity)
                    .filter_map(|n| p.distances.get(&n.uuid).map(|&d| (n, d)))
                    .collect();
                reachable.sort_by_key(|(n, d)| (*d, Reverse(n.created_at), n.uuid));
                reachable
                    .into_iter()
                    .take(per_channel)
                    .map(|(n, d)| (n, proximity_score(d)))
                    .collect()
            }
            None => Vec::new(),
        };

        let mut fused = fuse(
            vec![
                (Channel::Semantic, semantic),
                (Channel::Lexical, lexical),
                (Channel::GraphProximity, graph),
            ],
            |n: &EntityNode| n.uuid,
            self.config.search.rrf_k,
        );
        fused.sort_by(|a, b| {
            by_score(a, b)
                .then_with(|| b.item.created_at.cmp(&a.item.created_at))
                .then(a.item.uuid.cmp(&b.item.uuid))
        });
        Ok(fused)
    }

    async fn search_communities(
        &self,
        request: &SearchRequest,
        query_vector: &[f32],
        filter: &NodeFilter,
        per_channel: usize,
    ) -> Result<Vec<ScoredCommunity>> {
        let semantic = self
            .store
            .search_communities_by_embedding(query_vector, filter, MIN_SIMILARITY, per_channel)
            .await?;
        let lexical = self
            .store
            .search_communities_fulltext(&request.query, filter, per_channel)
            .await?;

        let mut fused = fuse(
            vec![(Channel::Semantic, semantic), (Channel::Lexical, lexical)],
            |c: &CommunityNode| c.uuid,
            self.config.search.rrf_k,
        );
        fused.sort_by(|a, b| {
            by_score(a, b)
                .then_with(|| b.item.created_at.cmp(&a.item.created_at))
                .then(a.item.uuid.cmp(&b.item.uuid))
        });
        Ok(fused)
    }

    async fn search_episodes(
        &self,
        request: &SearchRequest,
        filter: &NodeFilter,
        per_channel: usize,
    ) -> Result<Vec<ScoredEpisode>> {
        let lexical = self
            .store
            .search_episodes_fulltext(&request.query, filter, per_channel)
            .await?;

        let mut fused = fuse(
            vec![(Channel::Lexical, lexical)],
            |ep: &EpisodicNode| ep.uuid,
            self.config.search.rrf_k,
        );
        fused.sort_by(|a, b| {
            by_score(a, b)
                .then_with(|| b.item.order().cmp(&a.item.order()))
                .then(a.item.uuid.cmp(&b.item.uuid))
        });
        Ok(fused)
    }

    /// Reorder the head of `ranked` with the reranker, if one is set.
    /// Any reranker failure keeps the fused order.
    async fn rerank<T, F>(&self, query: &str, ranked: Vec<Scored<T>>, passage: F) -> Vec<Scored<T>>
    where
        F: Fn(&T) -> String,
    {
        let reranker = match &self.reranker {
            Some(r) if ranked.len() > 1 => r,
            _ => return ranked,
        };
        let window = ranked.len().min(self.config.search.rerank_window);
        let passages: Vec<String> = ranked[..window].iter().map(|s| passage(&s.item)).collect();

        let scores = match with_retry(&self.config.provider, reranker.name(), "rerank", || {
            reranker.rerank(query, &passages)
        })
        .await
        {
            Ok(scores) => scores,
            Err(e) => {
                log::warn!("Reranker failed, keeping fused order: {}", e);
                return ranked;
            }
        };

        let mut slots: Vec<Option<Scored<T>>> = ranked.into_iter().map(Some).collect();
        let mut reordered = Vec::with_capacity(slots.len());
        for (index, score) in scores {
            if index >= window {
                continue;
            }
            if let Some(mut item) = slots[index].take() {
                item.rerank_score = Some(score);
                reordered.push(item);
            }
        }
        reordered.extend(slots.into_iter().flatten());
        reordered
    }
}

struct Proximity {
    distances: HashMap<Uuid, usize>,
    traversable: Vec<EntityEdge>,
}

/// Fuse channel lists of items keyed by uuid
fn fuse<T, K>(channels: Vec<(Channel, Vec<(T, f32)>)>, key: K, c: f64) -> Vec<Scored<T>>
where
    K: Fn(&T) -> Uuid,
{
    let mut items: HashMap<Uuid, T> = HashMap::new();
    let keyed: Vec<(Channel, Vec<(Uuid, f32)>)> = channels
        .into_iter()
        .map(|(channel, list)| {
            let ranked = list
                .into_iter()
                .map(|(item, score)| {
                    let uuid = key(&item);
                    items.entry(uuid).or_insert(item);
                    (uuid, score)
                })
                .collect();
            (channel, ranked)
        })
        .collect();

    reciprocal_rank_fusion(keyed, c)
        .into_iter()
        .filter_map(|f| {
            items.remove(&f.key).map(|item| Scored {
                item,
                score: f.score,
                reasons: f.reasons,
                rerank_score: None,
            })
        })
        .collect()
}

fn by_score<T>(a: &Scored<T>, b: &Scored<T>) -> Ordering {
    b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)
}
