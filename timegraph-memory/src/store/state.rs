//! In-memory graph state shared by every backend
//!
//! Backends keep one `GraphState` behind a `parking_lot::RwLock`. A commit
//! runs [`GraphState::prepare`] (pure validation, may fail) and then
//! [`GraphState::apply`] (infallible) under the same write guard, so readers
//! see either the whole batch or none of it.
//!
//! Lexical queries run against BM25 indexes built lazily per corpus and
//! group. [`GraphState::apply`] drops the indexes of every group it touches.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use super::batch::{ChangeSet, WriteBatch};
use super::filter::{EdgeFilter, NodeFilter};
use crate::edge::{Edge, EdgeKind, EntityEdge};
use crate::error::{GraphError, Result};
use crate::index::{top_k_by_similarity, Bm25Index};
use crate::node::{
    validate_group_id, CommunityNode, EntityNode, EpisodicNode, GraphElement, Node, NodeKind,
};

#[derive(Debug, Default)]
pub struct GraphState {
    nodes: HashMap<Uuid, Node>,
    edges: HashMap<Uuid, Edge>,
    staged: HashMap<Uuid, EpisodicNode>,
    revisions: HashMap<String, u64>,
    fulltext: FulltextCache,
}

/// Document sets with their own BM25 statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Corpus {
    Entities,
    Facts,
    Communities,
    Episodes,
}

#[derive(Default)]
struct FulltextCache {
    indexes: Mutex<HashMap<(Corpus, String), Arc<Bm25Index>>>,
}

impl FulltextCache {
    fn get_or_build(
        &self,
        corpus: Corpus,
        group_id: &str,
        build: impl FnOnce() -> Bm25Index,
    ) -> Arc<Bm25Index> {
        let key = (corpus, group_id.to_string());
        if let Some(index) = self.indexes.lock().get(&key) {
            return Arc::clone(index);
        }
        // built outside the mutex; concurrent readers may build twice
        let index = Arc::new(build());
        self.indexes.lock().insert(key, Arc::clone(&index));
        index
    }

    fn invalidate(&mut self, group_id: &str) {
        self.indexes.get_mut().retain(|(_, g), _| g != group_id);
    }
}

impl fmt::Debug for FulltextCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FulltextCache").finish_non_exhaustive()
    }
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a persisted node without validation
    pub(crate) fn restore_node(&mut self, node: Node) {
        self.nodes.insert(node.uuid(), node);
    }

    /// Load a persisted edge without validation
    pub(crate) fn restore_edge(&mut self, edge: Edge) {
        self.edges.insert(edge.uuid(), edge);
    }

    /// Load a persisted staging-journal entry
    pub(crate) fn restore_staged(&mut self, episode: EpisodicNode) {
        self.staged.insert(episode.uuid, episode);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Highest ingestion sequence in use, staged episodes included
    pub fn max_sequence(&self) -> u64 {
        let committed = self.nodes.values().filter_map(|n| match n {
            Node::Episodic(ep) => Some(ep.sequence),
            _ => None,
        });
        let staged = self.staged.values().map(|ep| ep.sequence);
        committed.chain(staged).max().unwrap_or(0)
    }

    pub fn revision(&self, group_id: &str) -> u64 {
        self.revisions.get(group_id).copied().unwrap_or(0)
    }

    // ---- staging journal ----

    /// Check that `episode` may enter the staging journal
    pub fn check_stage(&self, episode: &EpisodicNode) -> Result<()> {
        validate_group_id(&episode.group_id)?;
        if self.nodes.contains_key(&episode.uuid) {
            return Err(GraphError::validation(format!(
                "episode {} already exists",
                episode.uuid
            )));
        }
        if self.staged.contains_key(&episode.uuid) {
            return Err(GraphError::validation(format!(
                "episode {} is already being ingested",
                episode.uuid
            )));
        }
        Ok(())
    }

    pub fn stage(&mut self, episode: EpisodicNode) -> Result<()> {
        self.check_stage(&episode)?;
        self.staged.insert(episode.uuid, episode);
        Ok(())
    }

    pub fn discard_staged(&mut self, uuid: Uuid) -> bool {
        self.staged.remove(&uuid).is_some()
    }

    /// Journal entries, oldest sequence first
    pub fn staged(&self) -> Vec<EpisodicNode> {
        let mut staged: Vec<_> = self.staged.values().cloned().collect();
        staged.sort_by_key(|ep| ep.sequence);
        staged
    }

    // ---- reads ----

    pub fn node(&self, uuid: Uuid) -> Option<&Node> {
        self.nodes.get(&uuid)
    }

    pub fn edge(&self, uuid: Uuid) -> Option<&Edge> {
        self.edges.get(&uuid)
    }

    /// Matching nodes ordered by creation time, then uuid
    pub fn get_nodes(&self, filter: &NodeFilter) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then(a.uuid().cmp(&b.uuid()))
        });
        nodes
    }

    /// Matching edges ordered by creation time, then uuid
    pub fn get_edges(&self, filter: &EdgeFilter) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .edges
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        edges.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then(a.uuid().cmp(&b.uuid()))
        });
        edges
    }

    // ---- index queries ----

    pub fn entity_nodes_by_embedding(
        &self,
        query: &[f32],
        filter: &NodeFilter,
        min_score: f32,
        limit: usize,
    ) -> Vec<(EntityNode, f32)> {
        let candidates = self.entities(filter);
        top_k_by_similarity(
            candidates,
            query,
            |n| n.name_embedding.as_deref(),
            min_score,
            limit,
        )
        .into_iter()
        .map(|(n, score)| (n.clone(), score))
        .collect()
    }

    pub fn entity_nodes_fulltext(
        &self,
        query: &str,
        filter: &NodeFilter,
        limit: usize,
    ) -> Vec<(EntityNode, f32)> {
        self.rank_fulltext(Corpus::Entities, &self.entities(filter), query, limit)
    }

    pub fn entity_edges_by_embedding(
        &self,
        query: &[f32],
        filter: &EdgeFilter,
        min_score: f32,
        limit: usize,
    ) -> Vec<(EntityEdge, f32)> {
        let candidates = self.entity_edges(filter);
        top_k_by_similarity(
            candidates,
            query,
            |e| e.fact_embedding.as_deref(),
            min_score,
            limit,
        )
        .into_iter()
        .map(|(e, score)| (e.clone(), score))
        .collect()
    }

    pub fn entity_edges_fulltext(
        &self,
        query: &str,
        filter: &EdgeFilter,
        limit: usize,
    ) -> Vec<(EntityEdge, f32)> {
        self.rank_fulltext(Corpus::Facts, &self.entity_edges(filter), query, limit)
    }

    pub fn communities_by_embedding(
        &self,
        query: &[f32],
        filter: &NodeFilter,
        min_score: f32,
        limit: usize,
    ) -> Vec<(CommunityNode, f32)> {
        let candidates = self.communities(filter);
        top_k_by_similarity(
            candidates,
            query,
            |c| c.summary_embedding.as_deref(),
            min_score,
            limit,
        )
        .into_iter()
        .map(|(c, score)| (c.clone(), score))
        .collect()
    }

    pub fn communities_fulltext(
        &self,
        query: &str,
        filter: &NodeFilter,
        limit: usize,
    ) -> Vec<(CommunityNode, f32)> {
        self.rank_fulltext(Corpus::Communities, &self.communities(filter), query, limit)
    }

    /// Committed episodes by BM25 over name, content and source description
    pub fn episodes_fulltext(
        &self,
        query: &str,
        filter: &NodeFilter,
        limit: usize,
    ) -> Vec<(EpisodicNode, f32)> {
        self.rank_fulltext(Corpus::Episodes, &self.episodes(filter), query, limit)
    }

    /// Rank `items` against the cached index of each group they belong to
    fn rank_fulltext<T>(
        &self,
        corpus: Corpus,
        items: &[&T],
        query: &str,
        limit: usize,
    ) -> Vec<(T, f32)>
    where
        T: GraphElement + Clone,
    {
        let by_id: HashMap<Uuid, &T> = items.iter().map(|&i| (i.uuid(), i)).collect();
        let groups: BTreeSet<&str> = items.iter().map(|&i| i.group_id()).collect();

        let mut ranked: Vec<(T, f32)> = Vec::new();
        for group_id in groups {
            let index = self.fulltext.get_or_build(corpus, group_id, || {
                let docs = self.documents(corpus, group_id);
                Bm25Index::build(docs.iter().map(|(id, text)| (*id, text.as_str())))
            });
            ranked.extend(
                index
                    .search(query, usize::MAX)
                    .into_iter()
                    .filter_map(|(id, score)| by_id.get(&id).map(|&item| (item.clone(), score))),
            );
        }
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.uuid().cmp(&b.0.uuid()))
        });
        ranked.truncate(limit);
        ranked
    }

    /// Every document of `corpus` in `group_id`, unfiltered
    fn documents(&self, corpus: Corpus, group_id: &str) -> Vec<(Uuid, String)> {
        if corpus == Corpus::Facts {
            return self
                .edges
                .values()
                .filter_map(|e| match e {
                    Edge::Entity(e) if e.group_id == group_id => {
                        Some((e.uuid, e.searchable_text()))
                    }
                    _ => None,
                })
                .collect();
        }
        self.nodes
            .values()
            .filter(|n| n.group_id() == group_id)
            .filter_map(|n| match (corpus, n) {
                (Corpus::Entities, Node::Entity(e)) => Some((e.uuid, e.searchable_text())),
                (Corpus::Communities, Node::Community(c)) => Some((c.uuid, c.searchable_text())),
                (Corpus::Episodes, Node::Episodic(ep)) => Some((ep.uuid, ep.searchable_text())),
                _ => None,
            })
            .collect()
    }

    fn entities(&self, filter: &NodeFilter) -> Vec<&EntityNode> {
        let mut out: Vec<&EntityNode> = self
            .nodes
            .values()
            .filter(|n| filter.matches(n))
            .filter_map(|n| match n {
                Node::Entity(e) => Some(e),
                _ => None,
            })
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uuid.cmp(&b.uuid)));
        out
    }

    fn entity_edges(&self, filter: &EdgeFilter) -> Vec<&EntityEdge> {
        let mut out: Vec<&EntityEdge> = self
            .edges
            .values()
            .filter(|e| filter.matches(e))
            .filter_map(|e| match e {
                Edge::Entity(e) => Some(e),
                _ => None,
            })
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uuid.cmp(&b.uuid)));
        out
    }

    fn episodes(&self, filter: &NodeFilter) -> Vec<&EpisodicNode> {
        let mut out: Vec<&EpisodicNode> = self
            .nodes
            .values()
            .filter(|n| filter.matches(n))
            .filter_map(|n| match n {
                Node::Episodic(ep) => Some(ep),
                _ => None,
            })
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uuid.cmp(&b.uuid)));
        out
    }

    fn communities(&self, filter: &NodeFilter) -> Vec<&CommunityNode> {
        let mut out: Vec<&CommunityNode> = self
            .nodes
            .values()
            .filter(|n| filter.matches(n))
            .filter_map(|n| match n {
                Node::Community(c) => Some(c),
                _ => None,
            })
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uuid.cmp(&b.uuid)));
        out
    }

    // ---- writes ----

    /// Validate `batch` against the current state and resolve it into the
    /// exact records to write and remove. Nothing is mutated.
    pub fn prepare(&self, batch: WriteBatch) -> Result<ChangeSet> {
        if let Some((group_id, expected)) = &batch.expected_revision {
            let found = self.revision(group_id);
            if found != *expected {
                return Err(GraphError::Conflict {
                    group_id: group_id.clone(),
                    expected: *expected,
                    found,
                });
            }
        }

        let mut touched: HashSet<String> = HashSet::new();

        // deletes, then cascade to incident edges
        let mut removed_nodes: HashSet<Uuid> = batch
            .delete_nodes
            .iter()
            .copied()
            .filter(|u| self.nodes.contains_key(u))
            .collect();
        for filter in &batch.delete_nodes_where {
            removed_nodes.extend(
                self.nodes
                    .values()
                    .filter(|n| filter.matches(n))
                    .map(|n| n.uuid()),
            );
        }

        let mut removed_edges: HashSet<Uuid> = batch
            .delete_edges
            .iter()
            .copied()
            .filter(|u| self.edges.contains_key(u))
            .collect();
        for filter in &batch.delete_edges_where {
            removed_edges.extend(
                self.edges
                    .values()
                    .filter(|e| filter.matches(e))
                    .map(|e| e.uuid()),
            );
        }
        removed_edges.extend(
            self.edges
                .values()
                .filter(|e| {
                    removed_nodes.contains(&e.source_node_uuid())
                        || removed_nodes.contains(&e.target_node_uuid())
                })
                .map(|e| e.uuid()),
        );

        for uuid in &removed_nodes {
            if let Some(n) = self.nodes.get(uuid) {
                touched.insert(n.group_id().to_string());
            }
        }
        for uuid in &removed_edges {
            if let Some(e) = self.edges.get(uuid) {
                touched.insert(e.group_id().to_string());
            }
        }

        // node upserts; the last write of a uuid wins
        let mut nodes: Vec<Node> = Vec::new();
        let mut node_pos: HashMap<Uuid, usize> = HashMap::new();
        let mut push_node = |node: Node, nodes: &mut Vec<Node>| {
            let uuid = node.uuid();
            match node_pos.get(&uuid).copied() {
                Some(i) => nodes[i] = node,
                None => {
                    node_pos.insert(uuid, nodes.len());
                    nodes.push(node);
                }
            }
        };

        if let Some(uuid) = batch.promote {
            let episode = self
                .staged
                .get(&uuid)
                .ok_or_else(|| GraphError::not_found("StagedEpisode", uuid))?;
            push_node(Node::Episodic(episode.clone()), &mut nodes);
        }
        for node in batch.nodes {
            self.check_node(&node, &removed_nodes)?;
            push_node(node, &mut nodes);
        }

        // keep community membership free of deleted entities
        if !removed_nodes.is_empty() {
            let stale: Vec<Node> = self
                .nodes
                .values()
                .filter_map(|n| match n {
                    Node::Community(c)
                        if !removed_nodes.contains(&c.uuid)
                            && c.members.iter().any(|m| removed_nodes.contains(m)) =>
                    {
                        let mut pruned = c.clone();
                        pruned.members.retain(|m| !removed_nodes.contains(m));
                        Some(Node::Community(pruned))
                    }
                    _ => None,
                })
                .collect();
            for community in stale {
                if !nodes.iter().any(|n| n.uuid() == community.uuid()) {
                    push_node(community, &mut nodes);
                }
            }
        }

        let upserted: HashMap<Uuid, &Node> = nodes.iter().map(|n| (n.uuid(), n)).collect();
        let lookup = |uuid: Uuid| {
            upserted.get(&uuid).copied().or_else(|| {
                if removed_nodes.contains(&uuid) {
                    None
                } else {
                    self.nodes.get(&uuid)
                }
            })
        };

        // edge upserts
        let mut edges: Vec<Edge> = Vec::new();
        let mut edge_pos: HashMap<Uuid, usize> = HashMap::new();
        for edge in batch.edges {
            self.check_edge(&edge, &removed_edges, &lookup)?;
            match edge_pos.get(&edge.uuid()).copied() {
                Some(i) => edges[i] = edge,
                None => {
                    edge_pos.insert(edge.uuid(), edges.len());
                    edges.push(edge);
                }
            }
        }

        touched.extend(nodes.iter().map(|n| n.group_id().to_string()));
        touched.extend(edges.iter().map(|e| e.group_id().to_string()));
        let mut revisions: Vec<(String, u64)> = touched
            .into_iter()
            .map(|g| {
                let next = self.revision(&g) + 1;
                (g, next)
            })
            .collect();
        revisions.sort();

        let mut removed_nodes: Vec<Uuid> = removed_nodes.into_iter().collect();
        removed_nodes.sort();
        let mut removed_edges: Vec<Uuid> = removed_edges.into_iter().collect();
        removed_edges.sort();

        Ok(ChangeSet {
            nodes,
            edges,
            removed_nodes,
            removed_edges,
            promoted: batch.promote,
            revisions,
        })
    }

    /// Apply a change set produced by [`Self::prepare`] on this state
    pub fn apply(&mut self, changes: ChangeSet) {
        if let Some(uuid) = changes.promoted {
            self.staged.remove(&uuid);
        }
        for uuid in &changes.removed_edges {
            self.edges.remove(uuid);
        }
        for uuid in &changes.removed_nodes {
            self.nodes.remove(uuid);
        }
        for node in changes.nodes {
            self.nodes.insert(node.uuid(), node);
        }
        for edge in changes.edges {
            self.edges.insert(edge.uuid(), edge);
        }
        for (group_id, revision) in changes.revisions {
            self.fulltext.invalidate(&group_id);
            self.revisions.insert(group_id, revision);
        }
    }

    fn check_node(&self, node: &Node, removed: &HashSet<Uuid>) -> Result<()> {
        validate_group_id(node.group_id())?;
        let existing = match self.nodes.get(&node.uuid()) {
            Some(existing) if !removed.contains(&node.uuid()) => existing,
            _ => return Ok(()),
        };
        if existing.kind() != node.kind() {
            return Err(GraphError::validation(format!(
                "node {} is a {}, cannot overwrite with a {}",
                node.uuid(),
                existing.kind_name(),
                node.kind_name()
            )));
        }
        if existing.group_id() != node.group_id() {
            return Err(GraphError::validation(format!(
                "node {} cannot move from group '{}' to '{}'",
                node.uuid(),
                existing.group_id(),
                node.group_id()
            )));
        }
        if let (Node::Episodic(old), Node::Episodic(new)) = (existing, node) {
            if !old.same_payload(new) {
                return Err(GraphError::validation(format!(
                    "episode {} is immutable",
                    new.uuid
                )));
            }
        }
        Ok(())
    }

    fn check_edge<'a, F>(&self, edge: &Edge, removed: &HashSet<Uuid>, lookup: &F) -> Result<()>
    where
        F: Fn(Uuid) -> Option<&'a Node>,
    {
        validate_group_id(edge.group_id())?;

        let endpoint = |uuid: Uuid| {
            lookup(uuid).ok_or_else(|| {
                GraphError::validation(format!(
                    "{} {} references missing node {}",
                    edge.kind_name(),
                    edge.uuid(),
                    uuid
                ))
            })
        };
        let source = endpoint(edge.source_node_uuid())?;
        let target = endpoint(edge.target_node_uuid())?;

        for n in [source, target] {
            if n.group_id() != edge.group_id() {
                return Err(GraphError::validation(format!(
                    "{} {} in group '{}' cannot reference node {} of group '{}'",
                    edge.kind_name(),
                    edge.uuid(),
                    edge.group_id(),
                    n.uuid(),
                    n.group_id()
                )));
            }
        }

        let endpoints_ok = match edge.kind() {
            EdgeKind::Entity => {
                source.kind() == NodeKind::Entity && target.kind() == NodeKind::Entity
            }
            EdgeKind::Episodic => {
                source.kind() == NodeKind::Episodic && target.kind() != NodeKind::Episodic
            }
        };
        if !endpoints_ok {
            return Err(GraphError::validation(format!(
                "{} {} connects a {} to a {}",
                edge.kind_name(),
                edge.uuid(),
                source.kind_name(),
                target.kind_name()
            )));
        }

        if let Edge::Entity(new) = edge {
            if let Some(end) = new.invalid_at() {
                if end < new.valid_at() {
                    return Err(GraphError::validation(format!(
                        "edge {} ends before it starts",
                        new.uuid
                    )));
                }
            }
            if let Some(Edge::Entity(old)) = self.edges.get(&new.uuid) {
                if !removed.contains(&new.uuid) {
                    if let Some(old_end) = old.invalid_at() {
                        let keeps_end = matches!(new.invalid_at(), Some(end) if end <= old_end);
                        if !keeps_end {
                            return Err(GraphError::validation(format!(
                                "edge {} invalid_at cannot be cleared or moved later",
                                new.uuid
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
