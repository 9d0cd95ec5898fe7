//! Entity resolution
//!
//! Maps each extracted mention to a stable [`EntityNode`]. Resolution order:
//!
//! 1. exact normalised-name match (oldest node wins, no provider call)
//! 2. top-K existing nodes by name-embedding similarity above the threshold
//! 3. the extractor's identity check over those candidates
//! 4. if the extractor cannot decide, the most similar candidate, ties going
//!    to the oldest node
//!
//! Nodes minted earlier in the same episode take part in steps 1-3, so one
//! episode never creates two nodes for one name. They are left out of step 4:
//! two distinct names the extractor reported side by side are never folded
//! together on embedding similarity alone.

use std::cmp::Ordering;
use std::collections::HashMap;

use uuid::Uuid;

use crate::config::{DedupConfig, ProviderPolicy};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::extraction::{ExtractedEntity, Extractor, IdentityDecision};
use crate::index::cosine_similarity;
use crate::node::{normalize_name, EntityNode, Node, NodeKind};
use crate::retry::with_retry;
use crate::store::{GraphStore, NodeFilter};

/// Outcome of resolving one mention
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// An existing node, with anything the mention added already merged in
    Existing { node: EntityNode, changed: bool },
    /// No match; a node to create
    New(EntityNode),
}

impl Resolution {
    pub fn node(&self) -> &EntityNode {
        match self {
            Self::Existing { node, .. } | Self::New(node) => node,
        }
    }

    pub fn into_node(self) -> EntityNode {
        match self {
            Self::Existing { node, .. } | Self::New(node) => node,
        }
    }

    /// Whether the node must be written
    pub fn needs_write(&self) -> bool {
        match self {
            Self::Existing { changed, .. } => *changed,
            Self::New(_) => true,
        }
    }
}

/// Every mention of one episode, resolved
#[derive(Debug, Clone, Default)]
pub struct ResolvedEntities {
    /// Distinct nodes in first-mention order
    nodes: Vec<EntityNode>,
    /// Nodes that are new or changed
    dirty: Vec<bool>,
    /// Nodes created by this episode
    minted: Vec<bool>,
    by_name: HashMap<String, usize>,
    by_uuid: HashMap<Uuid, usize>,
}

impl ResolvedEntities {
    /// Node a mention name resolved to
    pub fn uuid_for(&self, name: &str) -> Option<Uuid> {
        self.by_name
            .get(&normalize_name(name))
            .map(|&i| self.nodes[i].uuid)
    }

    pub fn nodes(&self) -> &[EntityNode] {
        &self.nodes
    }

    /// Nodes the commit has to write
    pub fn to_write(&self) -> impl Iterator<Item = &EntityNode> {
        self.nodes
            .iter()
            .zip(&self.dirty)
            .filter(|(_, dirty)| **dirty)
            .map(|(n, _)| n)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn minted_uuids(&self) -> Vec<Uuid> {
        self.nodes
            .iter()
            .zip(&self.minted)
            .filter(|(_, minted)| **minted)
            .map(|(n, _)| n.uuid)
            .collect()
    }

    fn record(&mut self, mention: &str, resolution: Resolution) {
        let dirty = resolution.needs_write();
        let minted = matches!(resolution, Resolution::New(_));
        let node = resolution.into_node();
        let idx = match self.by_uuid.get(&node.uuid).copied() {
            Some(i) => {
                self.dirty[i] |= dirty;
                self.nodes[i] = node;
                i
            }
            None => {
                self.by_uuid.insert(node.uuid, self.nodes.len());
                self.nodes.push(node);
                self.dirty.push(dirty);
                self.minted.push(minted);
                self.nodes.len() - 1
            }
        };
        self.by_name.insert(normalize_name(mention), idx);
    }
}

pub struct Deduplicator<'a> {
    store: &'a dyn GraphStore,
    embedder: &'a dyn Embedder,
    extractor: &'a dyn Extractor,
    config: &'a DedupConfig,
    policy: &'a ProviderPolicy,
}

impl<'a> Deduplicator<'a> {
    pub fn new(
        store: &'a dyn GraphStore,
        embedder: &'a dyn Embedder,
        extractor: &'a dyn Extractor,
        config: &'a DedupConfig,
        policy: &'a ProviderPolicy,
    ) -> Self {
        Self {
            store,
            embedder,
            extractor,
            config,
            policy,
        }
    }

    /// Resolve one mention against the group's existing entities
    pub async fn resolve(&self, candidate: &ExtractedEntity, group_id: &str) -> Result<Resolution> {
        self.resolve_with(candidate, group_id, &[], &[]).await
    }

    /// Resolve every mention of an episode
    pub async fn resolve_all(
        &self,
        mentions: &[ExtractedEntity],
        group_id: &str,
    ) -> Result<ResolvedEntities> {
        let mut resolved = ResolvedEntities::default();

        for mention in mentions {
            if mention.name.trim().is_empty() {
                log::warn!("Skipping entity mention with an empty name");
                continue;
            }

            // repeated name within the episode
            if let Some(&i) = resolved.by_name.get(&normalize_name(&mention.name)) {
                let changed = resolved.nodes[i].absorb(&mention.labels, &mention.summary);
                resolved.dirty[i] |= changed;
                continue;
            }

            let pending: Vec<EntityNode> = resolved
                .nodes
                .iter()
                .zip(&resolved.dirty)
                .filter(|(_, dirty)| **dirty)
                .map(|(n, _)| n.clone())
                .collect();
            let minted = resolved.minted_uuids();
            let resolution = self
                .resolve_with(mention, group_id, &pending, &minted)
                .await?;
            log::debug!(
                "Resolved '{}' to {} ({})",
                mention.name,
                resolution.node().uuid,
                if matches!(resolution, Resolution::New(_)) {
                    "new"
                } else {
                    "existing"
                }
            );
            resolved.record(&mention.name, resolution);
        }

        Ok(resolved)
    }

    /// `pending` holds nodes created or updated earlier in the same episode;
    /// they shadow their stored versions. `minted` are the uuids of those
    /// created by the episode.
    async fn resolve_with(
        &self,
        candidate: &ExtractedEntity,
        group_id: &str,
        pending: &[EntityNode],
        minted: &[Uuid],
    ) -> Result<Resolution> {
        let normalized = normalize_name(&candidate.name);

        // 1. exact name
        let mut exact: Vec<EntityNode> = pending
            .iter()
            .filter(|n| n.group_id == group_id && normalize_name(&n.name) == normalized)
            .cloned()
            .collect();
        let stored = self
            .store
            .get_nodes(
                &NodeFilter::new()
                    .group(group_id)
                    .kind(NodeKind::Entity)
                    .named(&candidate.name),
            )
            .await?;
        exact.extend(
            stored
                .into_iter()
                .filter_map(Node::into_entity)
                .filter(|n| !pending.iter().any(|p| p.uuid == n.uuid)),
        );
        if let Some(oldest) = exact.into_iter().min_by(oldest_first) {
            return Ok(self.merge(oldest, candidate, None));
        }

        // 2. similar names
        let embedding = with_retry(self.policy, "embedder", "embed entity name", || {
            self.embedder.embed(&candidate.name)
        })
        .await?;

        let mut similar: Vec<(EntityNode, f32)> = self
            .store
            .search_nodes_by_embedding(
                &embedding,
                &NodeFilter::new().group(group_id).kind(NodeKind::Entity),
                self.config.similarity_threshold,
                self.config.top_k,
            )
            .await?
            .into_iter()
            .map(|(stored, score)| {
                match pending.iter().find(|p| p.uuid == stored.uuid) {
                    Some(p) => (p.clone(), score),
                    None => (stored, score),
                }
            })
            .collect();
        for node in pending {
            if similar.iter().any(|(n, _)| n.uuid == node.uuid) {
                continue;
            }
            if let Some(v) = node.name_embedding.as_deref() {
                let score = cosine_similarity(&embedding, v);
                if score >= self.config.similarity_threshold {
                    similar.push((node.clone(), score));
                }
            }
        }
        similar.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| oldest_first(&a.0, &b.0))
        });
        similar.truncate(self.config.top_k);

        if similar.is_empty() {
            return Ok(Resolution::New(new_node(candidate, group_id, embedding)));
        }

        // 3. identity check
        let nodes: Vec<EntityNode> = similar.iter().map(|(n, _)| n.clone()).collect();
        let decision = with_retry(self.policy, self.extractor.name(), "identify", || {
            self.extractor.identify(candidate, &nodes)
        })
        .await?;

        match decision {
            IdentityDecision::Same(uuid) => {
                if let Some(node) = nodes.into_iter().find(|n| n.uuid == uuid) {
                    return Ok(self.merge(node, candidate, Some(embedding)));
                }
                log::warn!(
                    "Identity check for '{}' named unknown node {}; using similarity",
                    candidate.name,
                    uuid
                );
            }
            IdentityDecision::Distinct => {
                return Ok(Resolution::New(new_node(candidate, group_id, embedding)));
            }
            IdentityDecision::Unavailable => {}
        }

        // 4. most similar, oldest on ties; never a node this episode minted
        similar.retain(|(n, _)| !minted.contains(&n.uuid));
        if similar.is_empty() {
            return Ok(Resolution::New(new_node(candidate, group_id, embedding)));
        }
        let (best, _) = similar.swap_remove(0);
        Ok(self.merge(best, candidate, Some(embedding)))
    }

    fn merge(
        &self,
        mut node: EntityNode,
        candidate: &ExtractedEntity,
        embedding: Option<Vec<f32>>,
    ) -> Resolution {
        let mut changed = node.absorb(&candidate.labels, &candidate.summary);
        if node.name_embedding.is_none() {
            if let Some(v) = embedding {
                node.name_embedding = Some(v);
                changed = true;
            }
        }
        Resolution::Existing { node, changed }
    }
}

fn new_node(candidate: &ExtractedEntity, group_id: &str, embedding: Vec<f32>) -> EntityNode {
    EntityNode::new(candidate.name.trim(), group_id)
        .with_labels(candidate.labels.iter().cloned())
        .with_summary(candidate.summary.trim())
        .with_embedding(embedding)
}

fn oldest_first(a: &EntityNode, b: &EntityNode) -> Ordering {
    a.created_at.cmp(&b.created_at).then(a.uuid.cmp(&b.uuid))
}
