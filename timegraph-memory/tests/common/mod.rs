//! Scripted providers shared by the integration tests

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use timegraph_memory::{
    CommitStats, CommunityNode, Edge, EdgeFilter, EdgeKind, Embedder, EntityEdge, EntityNode,
    EpisodicNode, ExtractedEntity, ExtractedRelation, Extraction, ExtractionContext, Extractor,
    GraphConfig, GraphError, GraphStore, IdentityDecision, MemoryGraphStore, NewEpisode, Node,
    NodeFilter, NodeKind, ProviderError, ProviderPolicy, TemporalGraph, WriteBatch,
};

const DIMENSION: usize = 256;

/// Hashes lower-cased words into a fixed number of buckets
#[derive(Debug, Default)]
pub struct BagOfWordsEmbedder {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Embedder for BagOfWordsEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut vector = vec![0.0f32; DIMENSION];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            vector[(hasher.finish() as usize) % DIMENSION] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }
}

/// Every text maps to the same vector, so semantic similarity never decides
#[derive(Debug, Default)]
pub struct UniformEmbedder;

#[async_trait]
impl Embedder for UniformEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(vec![1.0, 0.0, 0.0])
    }

    fn dimension(&self) -> usize {
        3
    }
}

/// Verbs the pattern extractor understands: (phrase, relation, exclusive)
///
/// An exclusive relation holds for one object at a time, so the same
/// subject with another object is a contradiction.
const VERBS: &[(&str, &str, bool)] = &[
    (" moved to ", "LIVES_IN", true),
    (" works at ", "WORKS_AT", true),
    (" knows ", "KNOWS", false),
];

fn parse(sentence: &str) -> Option<(&str, &'static str, &str, bool)> {
    let sentence = sentence.trim().trim_end_matches('.');
    VERBS.iter().find_map(|(phrase, relation, exclusive)| {
        let (subject, object) = sentence.split_once(phrase)?;
        let (subject, object) = (subject.trim(), object.trim());
        (!subject.is_empty() && !object.is_empty()).then_some((subject, *relation, object, *exclusive))
    })
}

/// Reads sentences of the form "Alice moved to Boston." one per fact
#[derive(Debug, Default)]
pub struct PatternExtractor {
    pub extract_calls: AtomicUsize,
    pub contradiction_calls: AtomicUsize,
}

#[async_trait]
impl Extractor for PatternExtractor {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn extract(&self, ctx: ExtractionContext<'_>) -> Result<Extraction, ProviderError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        let mut extraction = Extraction::default();
        for sentence in ctx.episode.content.split('.') {
            let Some((subject, relation, object, _)) = parse(sentence) else {
                continue;
            };
            extraction.entities.push(ExtractedEntity::new(subject));
            extraction.entities.push(ExtractedEntity::new(object));
            extraction.relations.push(ExtractedRelation::new(
                subject,
                relation,
                object,
                format!("{}.", sentence.trim()),
            ));
        }
        Ok(extraction)
    }

    async fn contradicts(&self, existing: &str, new: &str) -> Result<bool, ProviderError> {
        self.contradiction_calls.fetch_add(1, Ordering::SeqCst);
        Ok(match (parse(existing), parse(new)) {
            (Some((s1, r1, o1, exclusive)), Some((s2, r2, o2, _))) => {
                exclusive && s1 == s2 && r1 == r2 && o1 != o2
            }
            _ => false,
        })
    }

    /// Names are exact in these tests; anything that did not match by name
    /// is a different entity, whatever the embeddings say
    async fn identify(
        &self,
        _candidate: &ExtractedEntity,
        _existing: &[EntityNode],
    ) -> Result<IdentityDecision, ProviderError> {
        Ok(IdentityDecision::Distinct)
    }
}

/// Fails every extraction permanently
#[derive(Debug, Default)]
pub struct BrokenExtractor;

#[async_trait]
impl Extractor for BrokenExtractor {
    async fn extract(&self, _ctx: ExtractionContext<'_>) -> Result<Extraction, ProviderError> {
        Err(ProviderError::terminal("broken", "invalid API key"))
    }

    async fn contradicts(&self, _a: &str, _b: &str) -> Result<bool, ProviderError> {
        Err(ProviderError::terminal("broken", "invalid API key"))
    }
}

/// Rate-limits the first `failures` extractions, then behaves
#[derive(Debug)]
pub struct FlakyExtractor {
    failures: AtomicU32,
    inner: PatternExtractor,
}

impl FlakyExtractor {
    pub fn new(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            inner: PatternExtractor::default(),
        }
    }

    pub fn extract_calls(&self) -> usize {
        self.inner.extract_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for FlakyExtractor {
    async fn extract(&self, ctx: ExtractionContext<'_>) -> Result<Extraction, ProviderError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(ProviderError::rate_limited("flaky", "429 Too Many Requests"));
        }
        self.inner.extract(ctx).await
    }

    async fn contradicts(&self, existing: &str, new: &str) -> Result<bool, ProviderError> {
        self.inner.contradicts(existing, new).await
    }

    async fn identify(
        &self,
        candidate: &ExtractedEntity,
        existing: &[EntityNode],
    ) -> Result<IdentityDecision, ProviderError> {
        self.inner.identify(candidate, existing).await
    }
}

/// Never answers for episodes of `group`; other groups are extracted normally
#[derive(Debug)]
pub struct StallingExtractor {
    pub group: String,
    inner: PatternExtractor,
}

impl StallingExtractor {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            inner: PatternExtractor::default(),
        }
    }
}

#[async_trait]
impl Extractor for StallingExtractor {
    async fn extract(&self, ctx: ExtractionContext<'_>) -> Result<Extraction, ProviderError> {
        if ctx.episode.group_id == self.group {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.inner.extract(ctx).await
    }

    async fn contradicts(&self, existing: &str, new: &str) -> Result<bool, ProviderError> {
        self.inner.contradicts(existing, new).await
    }

    async fn identify(
        &self,
        candidate: &ExtractedEntity,
        existing: &[EntityNode],
    ) -> Result<IdentityDecision, ProviderError> {
        self.inner.identify(candidate, existing).await
    }
}

/// Failure a [`ScriptedStore`] returns from a commit instead of applying it
#[derive(Debug, Clone, Copy)]
pub enum CommitFault {
    Conflict,
    Backend,
}

/// Memory store whose next commits fail as scripted; later commits apply
#[derive(Debug, Default)]
pub struct ScriptedStore {
    pub inner: MemoryGraphStore,
    faults: Mutex<VecDeque<CommitFault>>,
    pub commits: AtomicUsize,
}

impl ScriptedStore {
    pub fn failing(faults: impl IntoIterator<Item = CommitFault>) -> Self {
        Self {
            faults: Mutex::new(faults.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn commit_attempts(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphStore for ScriptedStore {
    fn backend_name(&self) -> &'static str {
        "scripted"
    }

    async fn ensure_indices_and_constraints(&self) -> timegraph_memory::Result<()> {
        self.inner.ensure_indices_and_constraints().await
    }

    async fn next_sequence(&self) -> timegraph_memory::Result<u64> {
        self.inner.next_sequence().await
    }

    async fn stage_episode(&self, episode: &EpisodicNode) -> timegraph_memory::Result<()> {
        self.inner.stage_episode(episode).await
    }

    fn discard_staged_episode(&self, uuid: Uuid) {
        self.inner.discard_staged_episode(uuid)
    }

    async fn staged_episodes(&self) -> timegraph_memory::Result<Vec<EpisodicNode>> {
        self.inner.staged_episodes().await
    }

    async fn group_revision(&self, group_id: &str) -> timegraph_memory::Result<u64> {
        self.inner.group_revision(group_id).await
    }

    async fn lock_group(&self, group_id: &str) -> OwnedMutexGuard<()> {
        self.inner.lock_group(group_id).await
    }

    fn release_idle_locks(&self) {
        self.inner.release_idle_locks()
    }

    async fn commit(&self, batch: WriteBatch) -> timegraph_memory::Result<CommitStats> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let fault = self.faults.lock().pop_front();
        match fault {
            Some(CommitFault::Conflict) => Err(GraphError::Conflict {
                group_id: "scripted".to_string(),
                expected: 0,
                found: 1,
            }),
            Some(CommitFault::Backend) => Err(GraphError::store("disk full")),
            None => self.inner.commit(batch).await,
        }
    }

    async fn get_nodes(&self, filter: &NodeFilter) -> timegraph_memory::Result<Vec<Node>> {
        self.inner.get_nodes(filter).await
    }

    async fn get_edges(&self, filter: &EdgeFilter) -> timegraph_memory::Result<Vec<Edge>> {
        self.inner.get_edges(filter).await
    }

    async fn search_nodes_by_embedding(
        &self,
        query: &[f32],
        filter: &NodeFilter,
        min_score: f32,
        limit: usize,
    ) -> timegraph_memory::Result<Vec<(EntityNode, f32)>> {
        self.inner
            .search_nodes_by_embedding(query, filter, min_score, limit)
            .await
    }

    async fn search_edges_by_embedding(
        &self,
        query: &[f32],
        filter: &EdgeFilter,
        min_score: f32,
        limit: usize,
    ) -> timegraph_memory::Result<Vec<(EntityEdge, f32)>> {
        self.inner
            .search_edges_by_embedding(query, filter, min_score, limit)
            .await
    }

    async fn search_nodes_fulltext(
        &self,
        query: &str,
        filter: &NodeFilter,
        limit: usize,
    ) -> timegraph_memory::Result<Vec<(EntityNode, f32)>> {
        self.inner.search_nodes_fulltext(query, filter, limit).await
    }

    async fn search_edges_fulltext(
        &self,
        query: &str,
        filter: &EdgeFilter,
        limit: usize,
    ) -> timegraph_memory::Result<Vec<(EntityEdge, f32)>> {
        self.inner.search_edges_fulltext(query, filter, limit).await
    }

    async fn search_communities_by_embedding(
        &self,
        query: &[f32],
        filter: &NodeFilter,
        min_score: f32,
        limit: usize,
    ) -> timegraph_memory::Result<Vec<(CommunityNode, f32)>> {
        self.inner
            .search_communities_by_embedding(query, filter, min_score, limit)
            .await
    }

    async fn search_communities_fulltext(
        &self,
        query: &str,
        filter: &NodeFilter,
        limit: usize,
    ) -> timegraph_memory::Result<Vec<(CommunityNode, f32)>> {
        self.inner
            .search_communities_fulltext(query, filter, limit)
            .await
    }

    async fn search_episodes_fulltext(
        &self,
        query: &str,
        filter: &NodeFilter,
        limit: usize,
    ) -> timegraph_memory::Result<Vec<(EpisodicNode, f32)>> {
        self.inner.search_episodes_fulltext(query, filter, limit).await
    }
}

/// Defaults with short provider backoff so retry tests stay fast
pub fn fast_config() -> GraphConfig {
    GraphConfig {
        provider: ProviderPolicy {
            timeout_ms: 2_000,
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        ..GraphConfig::default()
    }
}

pub fn memory_graph() -> TemporalGraph {
    graph_with(Arc::new(PatternExtractor::default()))
}

pub fn graph_on(store: Arc<dyn GraphStore>, extractor: Arc<dyn Extractor>) -> TemporalGraph {
    TemporalGraph::new(store, Arc::new(BagOfWordsEmbedder::default()), extractor, fast_config())
        .unwrap()
}

pub fn graph_with(extractor: Arc<dyn Extractor>) -> TemporalGraph {
    TemporalGraph::in_memory(Arc::new(BagOfWordsEmbedder::default()), extractor, fast_config())
        .unwrap()
}

/// `2024-01-01` plus `days`
pub fn day(days: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::days(days)
}

pub fn episode(group: &str, content: &str, at: DateTime<Utc>) -> NewEpisode {
    NewEpisode::builder()
        .name(format!("episode at {}", at.date_naive()))
        .group_id(group)
        .content(content)
        .source_description("integration test")
        .reference_time(at)
        .build()
        .unwrap()
}

/// Every fact of a group, current or not, oldest first
pub async fn facts(graph: &TemporalGraph, group: &str) -> Vec<EntityEdge> {
    graph
        .store()
        .get_edges(&EdgeFilter::new().group(group).kind(EdgeKind::Entity))
        .await
        .unwrap()
        .into_iter()
        .filter_map(|e| e.into_entity())
        .collect()
}

pub async fn fact(graph: &TemporalGraph, group: &str, text: &str) -> EntityEdge {
    facts(graph, group)
        .await
        .into_iter()
        .find(|e| e.fact == text)
        .unwrap_or_else(|| panic!("no fact '{}' in group {}", text, group))
}

pub async fn entities(graph: &TemporalGraph, group: &str) -> Vec<EntityNode> {
    graph
        .store()
        .get_nodes(&NodeFilter::new().group(group).kind(NodeKind::Entity))
        .await
        .unwrap()
        .into_iter()
        .filter_map(Node::into_entity)
        .collect()
}
