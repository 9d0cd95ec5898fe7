//! Graph persistence
//!
//! [`GraphStore`] is the seam between the engine and a storage backend.
//! Every mutation goes through [`GraphStore::commit`], which applies a
//! [`WriteBatch`] all-or-nothing; the CRUD helpers are thin wrappers over it.
//!
//! Two backends ship:
//! - [`MemoryGraphStore`]: process-local, for tests and ephemeral agents
//! - [`RocksGraphStore`]: RocksDB with bincode values and an in-memory read
//!   snapshot rebuilt on open

mod batch;
mod filter;
mod lock;
mod memory;
mod rocks;
mod schema;
mod state;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::edge::{Edge, EntityEdge};
use crate::error::Result;
use crate::node::{CommunityNode, EntityNode, EpisodicNode, Node};

pub use batch::{ChangeSet, CommitStats, WriteBatch};
pub use filter::{EdgeFilter, NodeFilter};
pub use lock::GroupLocks;
pub use memory::MemoryGraphStore;
pub use rocks::RocksGraphStore;
pub use schema::CURRENT_VERSION as SCHEMA_VERSION;
pub use state::GraphState;

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Backend name for logs
    fn backend_name(&self) -> &'static str;

    /// Idempotent setup of indices, constraints and schema metadata
    async fn ensure_indices_and_constraints(&self) -> Result<()>;

    /// Next ingestion sequence number, strictly increasing per store
    async fn next_sequence(&self) -> Result<u64>;

    /// Write `episode` to the staging journal. Staged episodes are durable
    /// but invisible to every read until promoted by a commit.
    async fn stage_episode(&self, episode: &EpisodicNode) -> Result<()>;

    /// Drop a staging-journal entry. Synchronous so it can run from `Drop`;
    /// failures are logged, the entry then shows up in `staged_episodes`.
    fn discard_staged_episode(&self, uuid: Uuid);

    /// Staging-journal entries left behind, oldest first
    async fn staged_episodes(&self) -> Result<Vec<EpisodicNode>>;

    /// Counter bumped by every commit that touches `group_id`
    async fn group_revision(&self, group_id: &str) -> Result<u64>;

    /// Exclusive write scope for `group_id`
    async fn lock_group(&self, group_id: &str) -> OwnedMutexGuard<()>;

    /// Forget group locks nobody holds or waits on
    fn release_idle_locks(&self);

    /// Apply `batch` atomically: either every write becomes visible or, on
    /// error, none does.
    async fn commit(&self, batch: WriteBatch) -> Result<CommitStats>;

    async fn get_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>>;

    async fn get_edges(&self, filter: &EdgeFilter) -> Result<Vec<Edge>>;

    async fn save_nodes(&self, nodes: Vec<Node>) -> Result<CommitStats> {
        self.commit(WriteBatch {
            nodes,
            ..WriteBatch::default()
        })
        .await
    }

    async fn save_edges(&self, edges: Vec<Edge>) -> Result<CommitStats> {
        self.commit(WriteBatch {
            edges,
            ..WriteBatch::default()
        })
        .await
    }

    /// Delete matching nodes and every edge incident to them
    async fn delete_nodes(&self, filter: NodeFilter) -> Result<usize> {
        let mut batch = WriteBatch::new();
        batch.delete_nodes_matching(filter);
        Ok(self.commit(batch).await?.nodes_removed)
    }

    async fn delete_edges(&self, filter: EdgeFilter) -> Result<usize> {
        let mut batch = WriteBatch::new();
        batch.delete_edges_matching(filter);
        Ok(self.commit(batch).await?.edges_removed)
    }

    /// Entity nodes by cosine similarity of their name embedding
    async fn search_nodes_by_embedding(
        &self,
        query: &[f32],
        filter: &NodeFilter,
        min_score: f32,
        limit: usize,
    ) -> Result<Vec<(EntityNode, f32)>>;

    /// Entity edges by cosine similarity of their fact embedding
    async fn search_edges_by_embedding(
        &self,
        query: &[f32],
        filter: &EdgeFilter,
        min_score: f32,
        limit: usize,
    ) -> Result<Vec<(EntityEdge, f32)>>;

    /// Entity nodes by BM25 over name, summary and labels
    async fn search_nodes_fulltext(
        &self,
        query: &str,
        filter: &NodeFilter,
        limit: usize,
    ) -> Result<Vec<(EntityNode, f32)>>;

    /// Entity edges by BM25 over fact text and relation label
    async fn search_edges_fulltext(
        &self,
        query: &str,
        filter: &EdgeFilter,
        limit: usize,
    ) -> Result<Vec<(EntityEdge, f32)>>;

    async fn search_communities_by_embedding(
        &self,
        query: &[f32],
        filter: &NodeFilter,
        min_score: f32,
        limit: usize,
    ) -> Result<Vec<(CommunityNode, f32)>>;

    async fn search_communities_fulltext(
        &self,
        query: &str,
        filter: &NodeFilter,
        limit: usize,
    ) -> Result<Vec<(CommunityNode, f32)>>;

    /// Committed episodes by BM25 over name, content and source description
    async fn search_episodes_fulltext(
        &self,
        query: &str,
        filter: &NodeFilter,
        limit: usize,
    ) -> Result<Vec<(EpisodicNode, f32)>>;
}
