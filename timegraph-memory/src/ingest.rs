//! Episode ingestion
//!
//! Per episode:
//!
//! 1. stage the raw episode (durable, invisible)
//! 2. extract entities and relations with a window of prior episodes
//! 3. resolve mentions to entity nodes
//! 4. deduplicate facts and invalidate contradicted ones
//! 5. commit everything, promoting the staged episode, as one batch
//!
//! Steps 2-4 run without the group lock against the group's revision at
//! the time. The commit takes the lock and fails on a stale revision, in
//! which case steps 3-4 are redone once while holding the lock.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use uuid::Uuid;

use crate::config::GraphConfig;
use crate::dedup::{Deduplicator, ResolvedEntities};
use crate::edge::{EdgeKind, EntityEdge, EpisodicEdge};
use crate::embedding::Embedder;
use crate::error::{GraphError, Result};
use crate::extraction::{ExtractedRelation, Extraction, ExtractionContext, Extractor};
use crate::invalidation::TemporalInvalidator;
use crate::node::{normalize_name, EntityNode, EpisodicNode, NewEpisode, Node, NodeKind};
use crate::retry::with_retry;
use crate::store::{EdgeFilter, GraphStore, NodeFilter, WriteBatch};
use crate::temporal::Validity;

/// Graph effects of one ingested episode
#[derive(Debug, Clone)]
pub struct AddEpisodeResult {
    pub episode: EpisodicNode,
    /// Entity nodes the episode mentions, after resolution
    pub nodes: Vec<EntityNode>,
    /// Facts this episode created or attested again
    pub edges: Vec<EntityEdge>,
    /// Earlier facts this episode closed
    pub invalidated: Vec<EntityEdge>,
    pub episodic_edges: Vec<EpisodicEdge>,
}

impl AddEpisodeResult {
    /// Every entity edge the episode created, attested or invalidated
    pub fn affected_edge_uuids(&self) -> Vec<Uuid> {
        self.edges
            .iter()
            .chain(&self.invalidated)
            .map(|e| e.uuid)
            .collect()
    }
}

/// Removes the staged episode unless disarmed, so a failed or cancelled
/// ingestion leaves no trace
struct StagedEpisodeGuard {
    store: Arc<dyn GraphStore>,
    uuid: Uuid,
    armed: bool,
}

impl StagedEpisodeGuard {
    fn new(store: Arc<dyn GraphStore>, uuid: Uuid) -> Self {
        Self {
            store,
            uuid,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StagedEpisodeGuard {
    fn drop(&mut self) {
        if self.armed {
            self.store.discard_staged_episode(self.uuid);
        }
    }
}

/// A relation with resolved endpoints and its fact embedding
struct PreparedRelation {
    source: Uuid,
    target: Uuid,
    relation: ExtractedRelation,
    validity: Validity,
    embedding: Vec<f32>,
}

/// Everything one episode will write
#[derive(Default)]
struct Plan {
    entities: ResolvedEntities,
    new_edges: Vec<EntityEdge>,
    /// Stored edges this episode changes, keyed by uuid
    updated: HashMap<Uuid, EntityEdge>,
    attested: Vec<Uuid>,
    invalidated: Vec<Uuid>,
    episodic_edges: Vec<EpisodicEdge>,
}

impl Plan {
    fn to_batch(&self, episode: &EpisodicNode, revision: u64) -> WriteBatch {
        let mut batch = WriteBatch::new()
            .promote(episode.uuid)
            .expect_revision(episode.group_id.clone(), revision);
        for node in self.entities.to_write() {
            batch.put_node(node.clone());
        }
        for edge in self.new_edges.iter().chain(self.updated.values()) {
            batch.put_edge(edge.clone());
        }
        for edge in &self.episodic_edges {
            batch.put_edge(edge.clone());
        }
        batch
    }

    fn into_result(self, episode: EpisodicNode) -> AddEpisodeResult {
        let lookup = |uuid: &Uuid| {
            self.new_edges
                .iter()
                .find(|e| e.uuid == *uuid)
                .or_else(|| self.updated.get(uuid))
                .cloned()
        };
        let edges = self.attested.iter().filter_map(lookup).collect();
        let invalidated = self.invalidated.iter().filter_map(lookup).collect();
        AddEpisodeResult {
            episode,
            nodes: self.entities.nodes().to_vec(),
            edges,
            invalidated,
            episodic_edges: self.episodic_edges,
        }
    }

    /// Current planned version of an edge
    fn edge_mut(&mut self, uuid: Uuid) -> Option<&mut EntityEdge> {
        if let Some(i) = self.new_edges.iter().position(|e| e.uuid == uuid) {
            return self.new_edges.get_mut(i);
        }
        self.updated.get_mut(&uuid)
    }

    /// Planned edges that shadow or extend the stored graph
    fn pending(&self) -> HashMap<Uuid, EntityEdge> {
        self.updated
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .chain(self.new_edges.iter().map(|e| (e.uuid, e.clone())))
            .collect()
    }
}

pub struct IngestionPipeline {
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn Extractor>,
    config: Arc<GraphConfig>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn GraphStore>,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn Extractor>,
        config: Arc<GraphConfig>,
    ) -> Self {
        Self {
            store,
            embedder,
            extractor,
            config,
        }
    }

    /// Ingest one episode. Either every graph effect becomes visible or,
    /// on error or cancellation, none does.
    pub async fn add_episode(&self, episode: NewEpisode) -> Result<AddEpisodeResult> {
        let uuid = episode.uuid;
        let sequence = self
            .store
            .next_sequence()
            .await
            .map_err(|e| GraphError::ingestion(uuid, e))?;
        let episode = EpisodicNode::from_new(episode, sequence);

        self.store
            .stage_episode(&episode)
            .await
            .map_err(|e| GraphError::ingestion(uuid, e))?;
        let guard = StagedEpisodeGuard::new(Arc::clone(&self.store), uuid);

        match self.run(episode).await {
            Ok(result) => {
                guard.disarm();
                log::info!(
                    "Committed episode {} in group '{}': {} entities, {} facts, {} invalidated",
                    uuid,
                    result.episode.group_id,
                    result.nodes.len(),
                    result.edges.len(),
                    result.invalidated.len()
                );
                Ok(result)
            }
            Err(e) => {
                log::warn!("Ingestion of episode {} failed: {}", uuid, e);
                Err(GraphError::ingestion(uuid, e))
            }
        }
    }

    /// Ingest many episodes. Groups run concurrently; within a group
    /// episodes run one after another in reference-time order. Results are
    /// returned in input order.
    pub async fn add_episodes(&self, episodes: Vec<NewEpisode>) -> Vec<Result<AddEpisodeResult>> {
        let total = episodes.len();
        let mut by_group: HashMap<String, Vec<(usize, NewEpisode)>> = HashMap::new();
        for (i, ep) in episodes.into_iter().enumerate() {
            by_group.entry(ep.group_id.clone()).or_default().push((i, ep));
        }

        let runs = by_group.into_values().map(|mut queue| async move {
            queue.sort_by_key(|(_, ep)| ep.reference_time);
            let mut done = Vec::with_capacity(queue.len());
            for (i, ep) in queue {
                done.push((i, self.add_episode(ep).await));
            }
            done
        });

        let mut slots: Vec<Option<Result<AddEpisodeResult>>> = (0..total).map(|_| None).collect();
        for (i, result) in join_all(runs).await.into_iter().flatten() {
            slots[i] = Some(result);
        }
        slots.into_iter().flatten().collect()
    }

    async fn run(&self, episode: EpisodicNode) -> Result<AddEpisodeResult> {
        let group_id = episode.group_id.clone();

        let previous = self.previous_episodes(&episode).await?;
        let extraction = with_retry(
            &self.config.provider,
            self.extractor.name(),
            "extract",
            || {
                self.extractor.extract(ExtractionContext {
                    episode: &episode,
                    previous_episodes: &previous,
                })
            },
        )
        .await?;
        log::debug!(
            "Episode {}: extracted {} entities, {} relations",
            episode.uuid,
            extraction.entities.len(),
            extraction.relations.len()
        );

        let relations = sanitize_relations(&extraction);
        let facts: Vec<String> = relations.iter().map(|r| r.fact.clone()).collect();
        let embeddings = if facts.is_empty() {
            Vec::new()
        } else {
            with_retry(&self.config.provider, "embedder", "embed facts", || {
                self.embedder.embed_batch(&facts)
            })
            .await?
        };
        if embeddings.len() != relations.len() {
            return Err(GraphError::store(format!(
                "embedder returned {} vectors for {} facts",
                embeddings.len(),
                relations.len()
            )));
        }

        let revision = self.store.group_revision(&group_id).await?;
        let plan = self
            .plan(&episode, &extraction, &relations, &embeddings)
            .await?;

        let _lock = self.store.lock_group(&group_id).await;
        let plan = match self.store.commit(plan.to_batch(&episode, revision)).await {
            Ok(_) => plan,
            Err(e) if e.is_conflict() => {
                log::debug!(
                    "Episode {}: group '{}' changed during planning, replanning under lock",
                    episode.uuid,
                    group_id
                );
                let revision = self.store.group_revision(&group_id).await?;
                let plan = self
                    .plan(&episode, &extraction, &relations, &embeddings)
                    .await?;
                self.store.commit(plan.to_batch(&episode, revision)).await?;
                plan
            }
            Err(e) => return Err(e),
        };

        Ok(plan.into_result(episode))
    }

    /// Up to `episode_window` committed episodes of the group that precede
    /// `episode`, oldest first
    async fn previous_episodes(&self, episode: &EpisodicNode) -> Result<Vec<EpisodicNode>> {
        if self.config.episode_window == 0 {
            return Ok(Vec::new());
        }
        let mut earlier: Vec<EpisodicNode> = self
            .store
            .get_nodes(
                &NodeFilter::new()
                    .group(episode.group_id.clone())
                    .kind(NodeKind::Episodic)
                    .reference_time_before(episode.reference_time),
            )
            .await?
            .into_iter()
            .filter_map(Node::into_episodic)
            .filter(|ep| ep.uuid != episode.uuid && ep.order() < episode.order())
            .collect();
        earlier.sort_by_key(EpisodicNode::order);
        let skip = earlier.len().saturating_sub(self.config.episode_window);
        Ok(earlier.split_off(skip))
    }

    async fn plan(
        &self,
        episode: &EpisodicNode,
        extraction: &Extraction,
        relations: &[ExtractedRelation],
        embeddings: &[Vec<f32>],
    ) -> Result<Plan> {
        let dedup = Deduplicator::new(
            self.store.as_ref(),
            self.embedder.as_ref(),
            self.extractor.as_ref(),
            &self.config.dedup,
            &self.config.provider,
        );
        let invalidator = TemporalInvalidator::new(
            self.store.as_ref(),
            self.extractor.as_ref(),
            &self.config.invalidation,
            &self.config.provider,
        );

        let entities = dedup
            .resolve_all(&extraction.entities, &episode.group_id)
            .await?;

        let mut plan = Plan {
            episodic_edges: entities
                .nodes()
                .iter()
                .map(|n| EpisodicEdge::mention(episode.group_id.clone(), episode.uuid, n.uuid))
                .collect(),
            entities,
            ..Plan::default()
        };

        let prepared: Vec<PreparedRelation> = relations
            .iter()
            .zip(embeddings)
            .filter_map(|(relation, embedding)| {
                prepare_relation(episode, &plan.entities, relation, embedding)
            })
            .collect();

        for rel in prepared {
            if let Some(existing) = self.find_same_fact(&plan, &rel, &episode.group_id).await? {
                let uuid = existing.uuid;
                if plan.edge_mut(uuid).is_none() {
                    plan.updated.insert(uuid, existing);
                }
                if let Some(edge) = plan.edge_mut(uuid) {
                    edge.attest(episode.uuid);
                }
                if !plan.attested.contains(&uuid) {
                    plan.attested.push(uuid);
                }
                continue;
            }

            let mut edge = EntityEdge::new(
                episode.group_id.clone(),
                rel.source,
                rel.target,
                rel.relation.name.clone(),
                rel.relation.fact.trim(),
                rel.validity,
            );
            edge.fact_embedding = Some(rel.embedding);
            edge.sequence = episode.sequence;
            edge.attest(episode.uuid);

            let outcome = invalidator.invalidate(edge, &plan.pending()).await?;
            for closed in outcome.invalidated {
                if !plan.invalidated.contains(&closed.uuid) {
                    plan.invalidated.push(closed.uuid);
                }
                match plan.edge_mut(closed.uuid) {
                    Some(slot) => *slot = closed,
                    None => {
                        plan.updated.insert(closed.uuid, closed);
                    }
                }
            }
            plan.attested.push(outcome.candidate.uuid);
            plan.new_edges.push(outcome.candidate);
        }

        Ok(plan)
    }

    /// The planned or stored edge with the same endpoints and fact text
    /// whose window is still open at the new fact's start
    async fn find_same_fact(
        &self,
        plan: &Plan,
        rel: &PreparedRelation,
        group_id: &str,
    ) -> Result<Option<EntityEdge>> {
        let wanted = normalize_name(rel.relation.fact.trim_end_matches('.'));
        let matches = |e: &EntityEdge| {
            e.connects(rel.source, rel.target)
                && e.normalized_fact() == wanted
                && !e.validity.ended_by(rel.validity.valid_at)
        };

        if let Some(e) = plan.new_edges.iter().find(|e| matches(e)) {
            return Ok(Some(e.clone()));
        }

        let stored = self
            .store
            .get_edges(
                &EdgeFilter::new()
                    .group(group_id)
                    .kind(EdgeKind::Entity)
                    .node_pair(rel.source, rel.target),
            )
            .await?;
        Ok(stored
            .into_iter()
            .filter_map(|e| e.into_entity())
            .map(|e| plan.updated.get(&e.uuid).cloned().unwrap_or(e))
            .find(|e| matches(e)))
    }
}

/// Drop relations that cannot become edges
fn sanitize_relations(extraction: &Extraction) -> Vec<ExtractedRelation> {
    extraction
        .relations
        .iter()
        .filter(|r| {
            if r.fact.trim().is_empty() || r.name.trim().is_empty() {
                log::warn!(
                    "Skipping relation {} -> {} with empty name or fact",
                    r.source,
                    r.target
                );
                return false;
            }
            true
        })
        .cloned()
        .collect()
}

fn prepare_relation(
    episode: &EpisodicNode,
    entities: &ResolvedEntities,
    relation: &ExtractedRelation,
    embedding: &[f32],
) -> Option<PreparedRelation> {
    let (source, target) = match (
        entities.uuid_for(&relation.source),
        entities.uuid_for(&relation.target),
    ) {
        (Some(s), Some(t)) => (s, t),
        _ => {
            log::warn!(
                "Skipping relation '{}': endpoint '{}' or '{}' was not extracted as an entity",
                relation.fact,
                relation.source,
                relation.target
            );
            return None;
        }
    };
    if source == target {
        log::warn!("Skipping self-referencing relation '{}'", relation.fact);
        return None;
    }

    let valid_at = relation.valid_at.unwrap_or(episode.reference_time);
    if matches!(relation.invalid_at, Some(end) if end < valid_at) {
        log::warn!(
            "Relation '{}' ends before it starts; ignoring its end date",
            relation.fact
        );
    }

    Some(PreparedRelation {
        source,
        target,
        relation: relation.clone(),
        validity: Validity::bounded(valid_at, relation.invalid_at),
        embedding: embedding.to_vec(),
    })
}
