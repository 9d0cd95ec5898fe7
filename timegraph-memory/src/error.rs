//! Error types for timegraph-memory

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Why an external provider call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The call did not finish within its deadline
    Timeout,
    /// The vendor asked us to slow down
    RateLimited,
    /// Temporary outage (connection reset, 5xx, ...)
    Unavailable,
    /// The request can never succeed as issued
    Terminal,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate limited",
            Self::Unavailable => "unavailable",
            Self::Terminal => "terminal",
        };
        f.write_str(s)
    }
}

/// Failure reported by an embedder, extractor or reranker
#[derive(Debug, Clone, Error)]
#[error("{provider} failed ({kind}): {message}")]
pub struct ProviderError {
    pub provider: &'static str,
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider: &'static str, kind: ProviderErrorKind, msg: impl Into<String>) -> Self {
        Self {
            provider,
            kind,
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(provider: &'static str, msg: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Timeout, msg)
    }

    /// Create a rate-limit error
    pub fn rate_limited(provider: &'static str, msg: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::RateLimited, msg)
    }

    /// Create a transient outage error
    pub fn unavailable(provider: &'static str, msg: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Unavailable, msg)
    }

    /// Create a non-retryable error
    pub fn terminal(provider: &'static str, msg: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Terminal, msg)
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self.kind, ProviderErrorKind::Terminal)
    }
}

/// Errors that can occur in the graph engine
#[derive(Debug, Error)]
pub enum GraphError {
    /// Malformed input, rejected before any side effect
    #[error("Validation error: {0}")]
    Validation(String),

    /// Embedding, extraction or reranking failure
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Persistence backend failure
    #[error("Store error: {0}")]
    Store(String),

    /// RocksDB error
    #[error("Storage error: {0}")]
    Rocks(#[from] rocksdb::Error),

    /// Serialization error (bincode)
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// UUID parsing error
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Lookup by uuid found nothing
    #[error("{kind} not found: {uuid}")]
    NotFound { kind: &'static str, uuid: Uuid },

    /// Concurrent writer changed the group underneath us
    #[error("Conflicting write in group '{group_id}' (expected revision {expected}, found {found})")]
    Conflict {
        group_id: String,
        expected: u64,
        found: u64,
    },

    /// An episode could not be ingested; nothing from it is visible
    #[error("Ingestion of episode {episode_uuid} failed: {source}")]
    Ingestion {
        episode_uuid: Uuid,
        #[source]
        source: Box<GraphError>,
    },
}

impl GraphError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a not found error
    pub fn not_found(kind: &'static str, uuid: Uuid) -> Self {
        Self::NotFound { kind, uuid }
    }

    /// Tag an error with the episode it aborted
    pub fn ingestion(episode_uuid: Uuid, source: GraphError) -> Self {
        match source {
            already @ Self::Ingestion { .. } => already,
            other => Self::Ingestion {
                episode_uuid,
                source: Box::new(other),
            },
        }
    }

    /// Whether the operation may succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::Conflict { .. } => true,
            Self::Ingestion { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Whether this is (or wraps) a revision conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Ingestion { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_transience() {
        assert!(ProviderError::timeout("embedder", "slow").is_transient());
        assert!(ProviderError::rate_limited("extractor", "429").is_transient());
        assert!(!ProviderError::terminal("extractor", "bad schema").is_transient());
    }

    #[test]
    fn test_ingestion_wrapping_is_not_nested() {
        let episode = Uuid::new_v4();
        let inner = GraphError::ingestion(episode, GraphError::store("disk full"));
        let outer = GraphError::ingestion(Uuid::new_v4(), inner);
        match outer {
            GraphError::Ingestion { episode_uuid, .. } => assert_eq!(episode_uuid, episode),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_retryable_classification() {
        let conflict = GraphError::Conflict {
            group_id: "g".into(),
            expected: 1,
            found: 2,
        };
        assert!(conflict.is_retryable());
        assert!(conflict.is_conflict());
        assert!(!GraphError::store("boom").is_retryable());
        assert!(!GraphError::not_found("EntityNode", Uuid::nil()).is_retryable());

        let wrapped = GraphError::ingestion(
            Uuid::new_v4(),
            ProviderError::unavailable("extractor", "503").into(),
        );
        assert!(wrapped.is_retryable());
    }

    #[test]
    fn test_error_messages_carry_uuid() {
        let uuid = Uuid::new_v4();
        let err = GraphError::ingestion(uuid, GraphError::validation("empty body"));
        let msg = err.to_string();
        assert!(msg.contains(&uuid.to_string()));
        assert!(msg.contains("empty body"));
    }
}
