//! Extraction provider interface
//!
//! An [`Extractor`] turns episode text into entity mentions and relations and
//! answers the pairwise questions the pipeline needs: does one fact
//! contradict another, and is a mention the same entity as an existing node.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::node::{EntityNode, EpisodicNode};

/// Input handed to [`Extractor::extract`]
#[derive(Debug, Clone, Copy)]
pub struct ExtractionContext<'a> {
    pub episode: &'a EpisodicNode,
    /// Most recent earlier episodes of the same group, oldest first
    pub previous_episodes: &'a [EpisodicNode],
}

/// An entity mention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

impl ExtractedEntity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: Vec::new(),
            summary: String::new(),
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
}

/// A relation between two mentioned entities, referenced by name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub source: String,
    pub target: String,
    /// Relation label, e.g. `LIVES_IN`
    pub name: String,
    pub fact: String,
    /// When the fact became true, if the text says
    #[serde(default)]
    pub valid_at: Option<DateTime<Utc>>,
    /// When the fact stopped being true, if the text says
    #[serde(default)]
    pub invalid_at: Option<DateTime<Utc>>,
}

impl ExtractedRelation {
    pub fn new(
        source: impl Into<String>,
        name: impl Into<String>,
        target: impl Into<String>,
        fact: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            name: name.into(),
            fact: fact.into(),
            valid_at: None,
            invalid_at: None,
        }
    }

    pub fn with_dates(
        mut self,
        valid_at: Option<DateTime<Utc>>,
        invalid_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_at = valid_at;
        self.invalid_at = invalid_at;
        self
    }
}

/// Structured output of one extraction call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
}

impl Extraction {
    /// Parse a vendor's JSON answer. Malformed output is terminal: the same
    /// prompt is not expected to produce a different shape.
    pub fn from_json(provider: &'static str, json: &str) -> Result<Self, ProviderError> {
        serde_json::from_str(json)
            .map_err(|e| ProviderError::terminal(provider, format!("malformed extraction: {e}")))
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

/// Answer of [`Extractor::identify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityDecision {
    /// The mention is this existing node
    Same(Uuid),
    /// None of the candidates is the same entity
    Distinct,
    /// The provider cannot decide; fall back to similarity
    Unavailable,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Name used in errors and logs
    fn name(&self) -> &'static str {
        "extractor"
    }

    /// Extract entities and relations from an episode
    async fn extract(&self, ctx: ExtractionContext<'_>) -> Result<Extraction, ProviderError>;

    /// Whether `new_fact` logically contradicts `existing_fact`
    async fn contradicts(&self, existing_fact: &str, new_fact: &str)
        -> Result<bool, ProviderError>;

    /// Decide whether `candidate` names one of `existing`.
    ///
    /// `existing` is ordered by decreasing similarity.
    async fn identify(
        &self,
        _candidate: &ExtractedEntity,
        _existing: &[EntityNode],
    ) -> Result<IdentityDecision, ProviderError> {
        Ok(IdentityDecision::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;

    #[test]
    fn test_extraction_from_json_defaults_missing_fields() {
        let json = r#"{
            "entities": [{"name": "Alice"}, {"name": "Boston", "labels": ["City"]}],
            "relations": [{"source": "Alice", "target": "Boston", "name": "LIVES_IN",
                           "fact": "Alice moved to Boston"}]
        }"#;
        let extraction = Extraction::from_json("test", json).unwrap();
        assert_eq!(extraction.entities.len(), 2);
        assert!(extraction.entities[0].labels.is_empty());
        assert_eq!(extraction.entities[1].labels, vec!["City"]);
        assert!(extraction.relations[0].valid_at.is_none());
    }

    #[test]
    fn test_malformed_extraction_is_terminal() {
        let err = Extraction::from_json("test", "{\"entities\": 3}").unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Terminal);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_relation_builder() {
        let t = Utc::now();
        let rel = ExtractedRelation::new("Bob", "WORKS_AT", "Acme", "Bob works at Acme")
            .with_dates(Some(t), None);
        assert_eq!(rel.source, "Bob");
        assert_eq!(rel.target, "Acme");
        assert_eq!(rel.valid_at, Some(t));
        assert!(Extraction::default().is_empty());
    }
}
