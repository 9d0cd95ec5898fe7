//! Node types and builders
//!
//! Three node variants share the [`GraphElement`] capability set:
//! entities (stable identities), episodes (immutable raw input) and
//! communities (derived clusters of entities).

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::temporal::EpisodeOrder;

/// Capabilities shared by every node and edge variant
pub trait GraphElement {
    /// Stable identity
    fn uuid(&self) -> Uuid;
    /// Partition the element belongs to
    fn group_id(&self) -> &str;
    /// Human-readable variant name, used in errors and logs
    fn kind_name(&self) -> &'static str;
}

/// Format of an episode's raw content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeType {
    #[default]
    Text,
    Json,
    Message,
}

impl fmt::Display for EpisodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Message => "message",
        };
        f.write_str(s)
    }
}

/// A real-world entity (person, place, organisation, concept)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityNode {
    pub uuid: Uuid,
    pub name: String,
    pub group_id: String,
    /// Type labels, e.g. `Person`
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub summary: String,
    /// Embedding of the entity name
    pub name_embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl EntityNode {
    pub fn new(name: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            group_id: group_id.into(),
            labels: Vec::new(),
            summary: String::new(),
            name_embedding: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.name_embedding = Some(embedding);
        self
    }

    /// Merge what a later mention says about this entity.
    ///
    /// Labels are unioned and a summary sentence is appended unless it is
    /// already contained. Returns true if anything changed.
    pub fn absorb(&mut self, labels: &[String], summary: &str) -> bool {
        let mut changed = false;
        for label in labels {
            if !label.is_empty() && !self.labels.contains(label) {
                self.labels.push(label.clone());
                changed = true;
            }
        }

        let summary = summary.trim();
        if !summary.is_empty() && !self.summary.contains(summary) {
            if self.summary.is_empty() {
                self.summary = summary.to_string();
            } else {
                self.summary.push(' ');
                self.summary.push_str(summary);
            }
            changed = true;
        }
        changed
    }

    /// Text indexed for lexical search
    pub fn searchable_text(&self) -> String {
        format!("{} {} {}", self.name, self.summary, self.labels.join(" "))
    }
}

impl GraphElement for EntityNode {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn kind_name(&self) -> &'static str {
        "EntityNode"
    }
}

/// A unit of raw input. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicNode {
    pub uuid: Uuid,
    pub name: String,
    pub group_id: String,
    pub source: EpisodeType,
    pub content: String,
    #[serde(default)]
    pub source_description: String,
    /// When the content occurred
    pub reference_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Ingestion sequence, secondary ordering key
    pub sequence: u64,
}

impl EpisodicNode {
    /// Materialise a validated input with its ingestion sequence
    pub fn from_new(episode: NewEpisode, sequence: u64) -> Self {
        Self {
            uuid: episode.uuid,
            name: episode.name,
            group_id: episode.group_id,
            source: episode.source,
            content: episode.content,
            source_description: episode.source_description,
            reference_time: episode.reference_time,
            created_at: Utc::now(),
            sequence,
        }
    }

    pub fn order(&self) -> EpisodeOrder {
        EpisodeOrder::new(self.reference_time, self.sequence)
    }

    /// Same immutable payload (ignores bookkeeping timestamps)
    pub fn same_payload(&self, other: &Self) -> bool {
        self.uuid == other.uuid
            && self.group_id == other.group_id
            && self.source == other.source
            && self.content == other.content
            && self.reference_time == other.reference_time
    }

    /// Text indexed for lexical search
    pub fn searchable_text(&self) -> String {
        format!("{} {} {}", self.name, self.content, self.source_description)
    }
}

impl GraphElement for EpisodicNode {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn kind_name(&self) -> &'static str {
        "EpisodicNode"
    }
}

/// Cluster of related entities, rebuilt on demand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityNode {
    pub uuid: Uuid,
    pub name: String,
    pub group_id: String,
    pub summary: String,
    pub members: BTreeSet<Uuid>,
    pub summary_embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl CommunityNode {
    pub fn searchable_text(&self) -> String {
        format!("{} {}", self.name, self.summary)
    }
}

impl GraphElement for CommunityNode {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn kind_name(&self) -> &'static str {
        "CommunityNode"
    }
}

/// Discriminant used by filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Entity,
    Episodic,
    Community,
}

/// Any node stored in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Entity(EntityNode),
    Episodic(EpisodicNode),
    Community(CommunityNode),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Entity(_) => NodeKind::Entity,
            Self::Episodic(_) => NodeKind::Episodic,
            Self::Community(_) => NodeKind::Community,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Entity(n) => n.created_at,
            Self::Episodic(n) => n.created_at,
            Self::Community(n) => n.created_at,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityNode> {
        match self {
            Self::Entity(n) => Some(n),
            _ => None,
        }
    }

    pub fn into_entity(self) -> Option<EntityNode> {
        match self {
            Self::Entity(n) => Some(n),
            _ => None,
        }
    }

    pub fn into_episodic(self) -> Option<EpisodicNode> {
        match self {
            Self::Episodic(n) => Some(n),
            _ => None,
        }
    }

    pub fn into_community(self) -> Option<CommunityNode> {
        match self {
            Self::Community(n) => Some(n),
            _ => None,
        }
    }
}

impl GraphElement for Node {
    fn uuid(&self) -> Uuid {
        match self {
            Self::Entity(n) => n.uuid,
            Self::Episodic(n) => n.uuid,
            Self::Community(n) => n.uuid,
        }
    }
    fn group_id(&self) -> &str {
        match self {
            Self::Entity(n) => &n.group_id,
            Self::Episodic(n) => &n.group_id,
            Self::Community(n) => &n.group_id,
        }
    }
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Entity(n) => n.kind_name(),
            Self::Episodic(n) => n.kind_name(),
            Self::Community(n) => n.kind_name(),
        }
    }
}

impl From<EntityNode> for Node {
    fn from(n: EntityNode) -> Self {
        Self::Entity(n)
    }
}

impl From<EpisodicNode> for Node {
    fn from(n: EpisodicNode) -> Self {
        Self::Episodic(n)
    }
}

impl From<CommunityNode> for Node {
    fn from(n: CommunityNode) -> Self {
        Self::Community(n)
    }
}

/// Case-folded, whitespace-collapsed form used for exact identity matches
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reject group ids outside `[A-Za-z0-9_-]+`
pub fn validate_group_id(group_id: &str) -> Result<(), EpisodeBuilderError> {
    if group_id.is_empty() {
        return Err(EpisodeBuilderError::MissingField("group_id"));
    }
    if !group_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(EpisodeBuilderError::InvalidGroupId(group_id.to_string()));
    }
    Ok(())
}

/// A validated episode waiting for ingestion
#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub uuid: Uuid,
    pub name: String,
    pub group_id: String,
    pub source: EpisodeType,
    pub content: String,
    pub source_description: String,
    pub reference_time: DateTime<Utc>,
}

impl NewEpisode {
    /// Create a new builder for an episode
    pub fn builder() -> EpisodeBuilder {
        EpisodeBuilder::new()
    }
}

/// Builder for [`NewEpisode`] with fluent API
#[derive(Debug, Default)]
pub struct EpisodeBuilder {
    uuid: Option<Uuid>,
    name: Option<String>,
    group_id: Option<String>,
    source: EpisodeType,
    content: Option<String>,
    source_description: String,
    reference_time: Option<DateTime<Utc>>,
}

impl EpisodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the episode uuid (auto-generated if not set)
    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn source(mut self, source: EpisodeType) -> Self {
        self.source = source;
        self
    }

    /// Set the raw body
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn source_description(mut self, description: impl Into<String>) -> Self {
        self.source_description = description.into();
        self
    }

    /// When the content occurred (defaults to now)
    pub fn reference_time(mut self, time: DateTime<Utc>) -> Self {
        self.reference_time = Some(time);
        self
    }

    /// Build the episode, validating required fields
    pub fn build(self) -> Result<NewEpisode, EpisodeBuilderError> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or(EpisodeBuilderError::MissingField("name"))?;
        let group_id = self
            .group_id
            .ok_or(EpisodeBuilderError::MissingField("group_id"))?;
        validate_group_id(&group_id)?;
        let content = self
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or(EpisodeBuilderError::MissingField("content"))?;

        if self.source == EpisodeType::Json {
            serde_json::from_str::<serde_json::Value>(&content)
                .map_err(|e| EpisodeBuilderError::InvalidJson(e.to_string()))?;
        }

        Ok(NewEpisode {
            uuid: self.uuid.unwrap_or_else(Uuid::new_v4),
            name,
            group_id,
            source: self.source,
            content,
            source_description: self.source_description,
            reference_time: self.reference_time.unwrap_or_else(Utc::now),
        })
    }
}

/// Errors from [`EpisodeBuilder::build`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EpisodeBuilderError {
    #[error("Missing or empty field: {0}")]
    MissingField(&'static str),

    #[error("Invalid group_id '{0}': only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidGroupId(String),

    #[error("Episode declared as JSON but does not parse: {0}")]
    InvalidJson(String),
}

impl From<EpisodeBuilderError> for crate::error::GraphError {
    fn from(e: EpisodeBuilderError) -> Self {
        Self::validation(e.to_string())
    }
}
