//! Edge types
//!
//! - [`EntityEdge`]: a fact between two entities, with a validity window
//! - [`EpisodicEdge`]: provenance link from an episode to a node it mentions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::{normalize_name, GraphElement};
use crate::temporal::{EpisodeOrder, Validity};

/// A factual relationship between two entity nodes.
///
/// Append-only with soft invalidation: after creation only `validity`
/// (closing the window) and `episodes` (new attestations) change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEdge {
    pub uuid: Uuid,
    pub group_id: String,
    pub source_node_uuid: Uuid,
    pub target_node_uuid: Uuid,
    /// Relation label, e.g. `WORKS_AT`
    pub name: String,
    /// Natural-language statement of the fact
    pub fact: String,
    pub fact_embedding: Option<Vec<f32>>,
    pub validity: Validity,
    pub created_at: DateTime<Utc>,
    /// Episodes attesting this fact, first attestation first
    pub episodes: Vec<Uuid>,
    /// Ingestion sequence of the first attesting episode
    pub sequence: u64,
}

impl EntityEdge {
    pub fn new(
        group_id: impl Into<String>,
        source_node_uuid: Uuid,
        target_node_uuid: Uuid,
        name: impl Into<String>,
        fact: impl Into<String>,
        validity: Validity,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            group_id: group_id.into(),
            source_node_uuid,
            target_node_uuid,
            name: name.into(),
            fact: fact.into(),
            fact_embedding: None,
            validity,
            created_at: Utc::now(),
            episodes: Vec::new(),
            sequence: 0,
        }
    }

    pub fn valid_at(&self) -> DateTime<Utc> {
        self.validity.valid_at
    }

    pub fn invalid_at(&self) -> Option<DateTime<Utc>> {
        self.validity.invalid_at
    }

    /// Position of this assertion in the group's history
    pub fn order(&self) -> EpisodeOrder {
        EpisodeOrder::new(self.validity.valid_at, self.sequence)
    }

    /// Record another attesting episode. Returns false if already present.
    pub fn attest(&mut self, episode_uuid: Uuid) -> bool {
        if self.episodes.contains(&episode_uuid) {
            return false;
        }
        self.episodes.push(episode_uuid);
        true
    }

    /// Incident to `node`
    pub fn touches(&self, node: Uuid) -> bool {
        self.source_node_uuid == node || self.target_node_uuid == node
    }

    /// Same directed endpoint pair
    pub fn connects(&self, source: Uuid, target: Uuid) -> bool {
        self.source_node_uuid == source && self.target_node_uuid == target
    }

    /// Shares at least one endpoint with `other`
    pub fn shares_endpoint(&self, other: &EntityEdge) -> bool {
        self.touches(other.source_node_uuid) || self.touches(other.target_node_uuid)
    }

    /// Normalised fact text used for exact fact deduplication
    pub fn normalized_fact(&self) -> String {
        normalize_name(self.fact.trim_end_matches('.'))
    }

    /// Text indexed for lexical search
    pub fn searchable_text(&self) -> String {
        format!("{} {}", self.fact, self.name.replace('_', " "))
    }
}

impl GraphElement for EntityEdge {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn kind_name(&self) -> &'static str {
        "EntityEdge"
    }
}

/// MENTIONS link from an episode to an entity or community node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicEdge {
    pub uuid: Uuid,
    pub group_id: String,
    /// The episode
    pub source_node_uuid: Uuid,
    /// The mentioned node
    pub target_node_uuid: Uuid,
    pub created_at: DateTime<Utc>,
}

impl EpisodicEdge {
    pub fn mention(group_id: impl Into<String>, episode_uuid: Uuid, node_uuid: Uuid) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            group_id: group_id.into(),
            source_node_uuid: episode_uuid,
            target_node_uuid: node_uuid,
            created_at: Utc::now(),
        }
    }
}

impl GraphElement for EpisodicEdge {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn kind_name(&self) -> &'static str {
        "EpisodicEdge"
    }
}

/// Discriminant used by filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    Entity,
    Episodic,
}

/// Any edge stored in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Entity(EntityEdge),
    Episodic(EpisodicEdge),
}

impl Edge {
    pub fn kind(&self) -> EdgeKind {
        match self {
            Self::Entity(_) => EdgeKind::Entity,
            Self::Episodic(_) => EdgeKind::Episodic,
        }
    }

    pub fn source_node_uuid(&self) -> Uuid {
        match self {
            Self::Entity(e) => e.source_node_uuid,
            Self::Episodic(e) => e.source_node_uuid,
        }
    }

    pub fn target_node_uuid(&self) -> Uuid {
        match self {
            Self::Entity(e) => e.target_node_uuid,
            Self::Episodic(e) => e.target_node_uuid,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Entity(e) => e.created_at,
            Self::Episodic(e) => e.created_at,
        }
    }

    pub fn into_entity(self) -> Option<EntityEdge> {
        match self {
            Self::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_episodic(self) -> Option<EpisodicEdge> {
        match self {
            Self::Episodic(e) => Some(e),
            _ => None,
        }
    }
}

impl GraphElement for Edge {
    fn uuid(&self) -> Uuid {
        match self {
            Self::Entity(e) => e.uuid,
            Self::Episodic(e) => e.uuid,
        }
    }
    fn group_id(&self) -> &str {
        match self {
            Self::Entity(e) => &e.group_id,
            Self::Episodic(e) => &e.group_id,
        }
    }
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Entity(e) => e.kind_name(),
            Self::Episodic(e) => e.kind_name(),
        }
    }
}

impl From<EntityEdge> for Edge {
    fn from(e: EntityEdge) -> Self {
        Self::Entity(e)
    }
}

impl From<EpisodicEdge> for Edge {
    fn from(e: EpisodicEdge) -> Self {
        Self::Episodic(e)
    }
}
