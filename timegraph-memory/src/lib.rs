//! Timegraph Memory
//!
//! Temporal knowledge-graph memory for agents. Unstructured episodes are
//! turned into entities and facts, each fact carrying the time window during
//! which it was believed true.
//!
//! ## Features
//!
//! - **Bi-temporal facts** - Validity windows that close, never reopen, when a newer fact contradicts them
//! - **Entity resolution** - Exact-name, embedding and provider-assisted deduplication
//! - **Hybrid search** - Semantic + BM25 + graph proximity merged with reciprocal-rank fusion
//! - **Point-in-time queries** - Search the graph as it stood at any instant
//! - **RocksDB persistence** - Atomic per-episode commits with a staging journal for crash recovery
//!
//! ## Example
//!
//! ```ignore
//! use timegraph_memory::{GraphConfig, NewEpisode, SearchRequest, TemporalGraph};
//!
//! let graph = TemporalGraph::open(&db_path, embedder, extractor, GraphConfig::default())?;
//!
//! let episode = NewEpisode::builder()
//!     .name("standup")
//!     .group_id("team-a")
//!     .content("Alice moved to Seattle last week")
//!     .build()?;
//! graph.add_episode(episode).await?;
//!
//! let results = graph
//!     .search(&SearchRequest::new("where does Alice live").group("team-a"))
//!     .await?;
//! ```

pub mod community;
pub mod config;
pub mod dedup;
pub mod edge;
pub mod embedding;
pub mod error;
pub mod extraction;
pub mod graph;
pub mod index;
pub mod ingest;
pub mod invalidation;
pub mod node;
pub mod rerank;
pub mod retry;
pub mod search;
pub mod store;
pub mod temporal;

// Re-exports for convenience
pub use config::{DedupConfig, GraphConfig, InvalidationConfig, ProviderPolicy, SearchConfig};
pub use edge::{Edge, EdgeKind, EntityEdge, EpisodicEdge};
pub use embedding::{CachedEmbedder, Embedder};
#[cfg(feature = "fastembed")]
pub use embedding::{FastEmbedConfig, FastEmbedder};
pub use error::{GraphError, ProviderError, ProviderErrorKind, Result};
pub use extraction::{
    ExtractedEntity, ExtractedRelation, Extraction, ExtractionContext, Extractor, IdentityDecision,
};
pub use graph::TemporalGraph;
pub use ingest::AddEpisodeResult;
pub use node::{
    CommunityNode, EntityNode, EpisodeBuilder, EpisodeBuilderError, EpisodeType, EpisodicNode,
    GraphElement, NewEpisode, Node, NodeKind,
};
pub use rerank::Reranker;
pub use search::{
    Channel, MatchReason, Scored, ScoredCommunity, ScoredEdge, ScoredEpisode, ScoredNode,
    SearchRequest, SearchResults,
};
pub use store::{
    CommitStats, EdgeFilter, GraphStore, MemoryGraphStore, NodeFilter, RocksGraphStore, WriteBatch,
};
pub use temporal::{EpisodeOrder, TemporalScope, Validity};
