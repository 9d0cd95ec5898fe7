//! RocksDB-backed store
//!
//! Values are bincode-encoded under prefixed keys:
//!
//! | Prefix  | Value          |
//! |---------|----------------|
//! | `node:` | [`Node`]       |
//! | `edge:` | [`Edge`]       |
//! | `stg:`  | staged [`EpisodicNode`] |
//!
//! Reads are served from an in-memory [`GraphState`] loaded on open. A
//! commit writes one RocksDB `WriteBatch` and then swaps the same changes
//! into the cache while holding the cache's write lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rocksdb::{IteratorMode, Options, DB};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::{
    schema, ChangeSet, CommitStats, EdgeFilter, GraphState, GraphStore, GroupLocks, NodeFilter,
    WriteBatch,
};
use crate::edge::{Edge, EntityEdge};
use crate::error::Result;
use crate::node::{CommunityNode, EntityNode, EpisodicNode, GraphElement, Node};

const NODE_PREFIX: &str = "node:";
const EDGE_PREFIX: &str = "edge:";
const STAGED_PREFIX: &str = "stg:";

fn key(prefix: &str, uuid: Uuid) -> Vec<u8> {
    format!("{}{}", prefix, uuid).into_bytes()
}

/// Persistent graph store
pub struct RocksGraphStore {
    db: Arc<DB>,
    path: PathBuf,
    state: RwLock<GraphState>,
    sequence: AtomicU64,
    locks: GroupLocks,
}

impl RocksGraphStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(2);
        opts.set_bytes_per_sync(1048576); // 1MB
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        schema::ensure_current(&db)?;

        let state = load_state(&db)?;
        let sequence = state.max_sequence();

        log::info!(
            "RocksGraphStore opened at {} ({} nodes, {} edges)",
            path.display(),
            state.node_count(),
            state.edge_count()
        );

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
            state: RwLock::new(state),
            sequence: AtomicU64::new(sequence),
            locks: GroupLocks::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn persist(&self, changes: &ChangeSet) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        if let Some(uuid) = changes.promoted {
            batch.delete(key(STAGED_PREFIX, uuid));
        }
        for uuid in &changes.removed_edges {
            batch.delete(key(EDGE_PREFIX, *uuid));
        }
        for uuid in &changes.removed_nodes {
            batch.delete(key(NODE_PREFIX, *uuid));
        }
        for node in &changes.nodes {
            batch.put(key(NODE_PREFIX, node.uuid()), bincode::serialize(node)?);
        }
        for edge in &changes.edges {
            batch.put(key(EDGE_PREFIX, edge.uuid()), bincode::serialize(edge)?);
        }
        self.db.write(batch)?;
        Ok(())
    }
}

/// Rebuild the read cache from disk, skipping records that fail to decode
fn load_state(db: &DB) -> Result<GraphState> {
    let mut state = GraphState::new();
    let mut loaded = 0usize;
    let mut skipped = 0usize;

    for item in db.iterator(IteratorMode::Start) {
        let (raw_key, value) = item?;
        let key_str = String::from_utf8_lossy(&raw_key);

        let decoded = if key_str.starts_with(NODE_PREFIX) {
            bincode::deserialize::<Node>(&value).map(|n| state.restore_node(n))
        } else if key_str.starts_with(EDGE_PREFIX) {
            bincode::deserialize::<Edge>(&value).map(|e| state.restore_edge(e))
        } else if key_str.starts_with(STAGED_PREFIX) {
            bincode::deserialize::<EpisodicNode>(&value).map(|ep| state.restore_staged(ep))
        } else {
            continue;
        };

        match decoded {
            Ok(()) => loaded += 1,
            Err(e) => {
                log::warn!("Failed to deserialize {}: {}. Skipping.", key_str, e);
                skipped += 1;
            }
        }
    }

    if loaded > 0 {
        log::info!("Loaded {} graph records from disk", loaded);
    }
    if skipped > 0 {
        log::warn!("Skipped {} records due to deserialization errors", skipped);
    }
    Ok(state)
}

#[async_trait]
impl GraphStore for RocksGraphStore {
    fn backend_name(&self) -> &'static str {
        "rocksdb"
    }

    async fn ensure_indices_and_constraints(&self) -> Result<()> {
        schema::ensure_current(&self.db)
    }

    async fn next_sequence(&self) -> Result<u64> {
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn stage_episode(&self, episode: &EpisodicNode) -> Result<()> {
        let mut state = self.state.write();
        state.check_stage(episode)?;
        self.db
            .put(key(STAGED_PREFIX, episode.uuid), bincode::serialize(episode)?)?;
        state.stage(episode.clone())
    }

    fn discard_staged_episode(&self, uuid: Uuid) {
        let mut state = self.state.write();
        if !state.discard_staged(uuid) {
            return;
        }
        match self.db.delete(key(STAGED_PREFIX, uuid)) {
            Ok(()) => log::debug!("Discarded staged episode {}", uuid),
            Err(e) => log::warn!(
                "Failed to discard staged episode {}: {}. It will be reported on reopen.",
                uuid,
                e
            ),
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
        self.persist(&changes)?;
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
