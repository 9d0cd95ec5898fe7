//! Process-local store

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::{
    CommitStats, EdgeFilter, GraphState, GraphStore, GroupLocks, NodeFilter, WriteBatch,
};
use crate::edge::{Edge, EntityEdge};
use crate::error::Result;
use crate::node::{CommunityNode, EntityNode, EpisodicNode, Node};

/// Graph held entirely in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    state: RwLock<GraphState>,
    sequence: AtomicU64,
    locks: GroupLocks,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.state.read().node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.state.read().edge_count()
    }

    /// Group locks currently tracked
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_indices_and_constraints(&self) -> Result<()> {
        Ok(())
    }

    async fn next_sequence(&self) -> Result<u64> {
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn stage_episode(&self, episode: &EpisodicNode) -> Result<()> {
        self.state.write().stage(episode.clone())
    }

    fn discard_staged_episode(&self, uuid: Uuid) {
        if self.state.write().discard_staged(uuid) {
            log::debug!("Discarded staged episode {}", uuid);
        }
    }

    async fn staged_episodes(&self) -> Result<Vec<EpisodicNode>> {
        Ok(self.state.read().staged())
    }

    async fn group_revision(&self, group_id: &str) -> Result<u64> {
        Ok(self.state.read().revision(group_id))
    }

    async fn lock_group(&self, group_id: &str) -> OwnedMutexGuard<()> {
        self.locks.acquire(group_id).await
    }

    fn release_idle_locks(&self) {
        self.locks.prune();
    }

    async fn commit(&self, batch: WriteBatch) -> Result<CommitStats> {
        let mut state = self.state.write();
        let changes = state.prepare(batch)?;
        let stats = changes.stats();
        state.apply(changes);
        Ok(stats)
    }

    async fn get_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        Ok(self.state.read().get_nodes(filter))
    }

    async fn get_edges(&self, filter: &EdgeFilter) -> Result<Vec<Edge>> {
        Ok(self.state.read().get_edges(filter))
    }

    async fn search_nodes_by_embedding(
        &self,
        query: &[f32],
        filter: &NodeFilter,
        min_score: f32,
        limit: usize,
    ) -> Result<Vec<(EntityNode, f32)>> {
        Ok(self
            .state
            .read()
            .entity_nodes_by_embedding(query, filter, min_score, limit))
    }

    async fn search_edges_by_embedding(
        &self,
        query: &[f32],
        filter: &EdgeFilter,
        min_score: f32,
        limit: usize,
    ) -> Result<Vec<(EntityEdge, f32)>> {
        Ok(self
            .state
            .read()
            .entity_edges_by_embedding(query, filter, min_score, limit))
    }

    async fn search_nodes_fulltext(
        &self,
        query: &str,
        filter: &NodeFilter,
        limit: usize,
    ) -> Result<Vec<(EntityNode, f32)>> {
        Ok(self.state.read().entity_nodes_fulltext(query, filter, limit))
    }

    async fn search_edges_fulltext(
        &self,
        query: &str,
        filter: &EdgeFilter,
        limit: usize,
    ) -> Result<Vec<(EntityEdge, f32)>> {
        Ok(self.state.read().entity_edges_fulltext(query, filter, limit))
    }

    async fn search_communities_by_embedding(
        &self,
        query: &[f32],
        filter: &NodeFilter,
        min_score: f32,
        limit: usize,
    ) -> Result<Vec<(CommunityNode, f32)>> {
        Ok(self
            .state
            .read()
            .communities_by_embedding(query, filter, min_score, limit))
    }

    async fn search_communities_fulltext(
        &self,
        query: &str,
        filter: &NodeFilter,
        limit: usize,
    ) -> Result<Vec<(CommunityNode, f32)>> {
        Ok(self.state.read().communities_fulltext(query, filter, limit))
    }

    async fn search_episodes_fulltext(
        &self,
        query: &str,
        filter: &NodeFilter,
        limit: usize,
    ) -> Result<Vec<(EpisodicNode, f32)>> {
        Ok(self.state.read().episodes_fulltext(query, filter, limit))
    }
}
