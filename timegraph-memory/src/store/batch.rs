//! Atomic unit of mutation

use uuid::Uuid;

use super::filter::{EdgeFilter, NodeFilter};
use crate::edge::Edge;
use crate::node::Node;

/// A set of writes applied all-or-nothing by [`super::GraphStore::commit`].
///
/// Deletes are resolved before upserts. Deleting a node also deletes every
/// edge incident to it.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub delete_nodes: Vec<Uuid>,
    pub delete_edges: Vec<Uuid>,
    /// Filters resolved against the committed state under the write lock
    pub delete_nodes_where: Vec<NodeFilter>,
    pub delete_edges_where: Vec<EdgeFilter>,
    /// Staged episode that becomes visible with this batch
    pub promote: Option<Uuid>,
    /// Optimistic concurrency check: `(group_id, revision the plan was built on)`
    pub expected_revision: Option<(String, u64)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the commit with a conflict unless `group_id` is still at `revision`
    pub fn expect_revision(mut self, group_id: impl Into<String>, revision: u64) -> Self {
        self.expected_revision = Some((group_id.into(), revision));
        self
    }

    pub fn promote(mut self, episode_uuid: Uuid) -> Self {
        self.promote = Some(episode_uuid);
        self
    }

    pub fn put_node(&mut self, node: impl Into<Node>) {
        self.nodes.push(node.into());
    }

    pub fn put_edge(&mut self, edge: impl Into<Edge>) {
        self.edges.push(edge.into());
    }

    pub fn delete_node(&mut self, uuid: Uuid) {
        self.delete_nodes.push(uuid);
    }

    pub fn delete_edge(&mut self, uuid: Uuid) {
        self.delete_edges.push(uuid);
    }

    pub fn delete_nodes_matching(&mut self, filter: NodeFilter) {
        self.delete_nodes_where.push(filter);
    }

    pub fn delete_edges_matching(&mut self, filter: EdgeFilter) {
        self.delete_edges_where.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.edges.is_empty()
            && self.delete_nodes.is_empty()
            && self.delete_edges.is_empty()
            && self.delete_nodes_where.is_empty()
            && self.delete_edges_where.is_empty()
            && self.promote.is_none()
    }
}

/// A validated batch with every filter and cascade resolved.
///
/// Produced by [`super::state::GraphState::prepare`]; backends persist it and
/// then hand it to [`super::state::GraphState::apply`].
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub removed_nodes: Vec<Uuid>,
    pub removed_edges: Vec<Uuid>,
    pub promoted: Option<Uuid>,
    /// New revision of every group the batch touched
    pub revisions: Vec<(String, u64)>,
}

impl ChangeSet {
    pub fn stats(&self) -> CommitStats {
        CommitStats {
            nodes_written: self.nodes.len(),
            edges_written: self.edges.len(),
            nodes_removed: self.removed_nodes.len(),
            edges_removed: self.removed_edges.len(),
        }
    }
}

/// What a commit did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub nodes_written: usize,
    pub edges_written: usize,
    pub nodes_removed: usize,
    pub edges_removed: usize,
}
