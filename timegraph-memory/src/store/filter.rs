//! Filter sets accepted by the store's read and delete operations
//!
//! Every field is optional; an unset field matches everything. Set fields
//! are combined with AND.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::edge::{Edge, EdgeKind};
use crate::node::{normalize_name, GraphElement, Node, NodeKind};
use crate::temporal::TemporalScope;

#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub uuids: Option<Vec<Uuid>>,
    pub group_ids: Option<Vec<String>>,
    pub kinds: Option<Vec<NodeKind>>,
    /// Entity nodes whose normalised name equals this (already normalised)
    pub normalized_name: Option<String>,
    /// Entity nodes carrying at least one of these labels
    pub labels: Option<Vec<String>>,
    /// Episodes that occurred at or before this instant
    pub reference_time_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl NodeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uuids(mut self, uuids: impl IntoIterator<Item = Uuid>) -> Self {
        self.uuids = Some(uuids.into_iter().collect());
        self
    }

    pub fn group(self, group_id: impl Into<String>) -> Self {
        self.group_ids([group_id.into()])
    }

    pub fn group_ids<I, S>(mut self, group_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_ids = Some(group_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn kind(mut self, kind: NodeKind) -> Self {
        self.kinds = Some(vec![kind]);
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.normalized_name = Some(normalize_name(name));
        self
    }

    pub fn labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    pub fn reference_time_before(mut self, time: DateTime<Utc>) -> Self {
        self.reference_time_before = Some(time);
        self
    }

    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn matches(&self, node: &Node) -> bool {
        if let Some(uuids) = &self.uuids {
            if !uuids.contains(&node.uuid()) {
                return false;
            }
        }
        if let Some(groups) = &self.group_ids {
            if !groups.iter().any(|g| g == node.group_id()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&node.kind()) {
                return false;
            }
        }
        if let Some(name) = &self.normalized_name {
            match node {
                Node::Entity(n) if normalize_name(&n.name) == *name => {}
                _ => return false,
            }
        }
        if let Some(labels) = &self.labels {
            match node {
                Node::Entity(n) if n.labels.iter().any(|l| labels.contains(l)) => {}
                _ => return false,
            }
        }
        if let Some(before) = self.reference_time_before {
            match node {
                Node::Episodic(ep) if ep.reference_time <= before => {}
                _ => return false,
            }
        }
        within(node.created_at(), self.created_after, self.created_before)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EdgeFilter {
    pub uuids: Option<Vec<Uuid>>,
    pub group_ids: Option<Vec<String>>,
    pub kinds: Option<Vec<EdgeKind>>,
    /// Directed (source, target) pair
    pub node_pair: Option<(Uuid, Uuid)>,
    /// Edges incident to any of these nodes
    pub touching: Option<Vec<Uuid>>,
    /// Entity edges attested by, or episodic edges originating from, this episode
    pub episode: Option<Uuid>,
    /// Entity edges with one of these relation labels
    pub names: Option<Vec<String>>,
    /// Validity predicate for entity edges; `None` admits the full history.
    /// Episodic edges have no validity and always pass.
    pub scope: Option<TemporalScope>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl EdgeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uuids(mut self, uuids: impl IntoIterator<Item = Uuid>) -> Self {
        self.uuids = Some(uuids.into_iter().collect());
        self
    }

    pub fn group(self, group_id: impl Into<String>) -> Self {
        self.group_ids([group_id.into()])
    }

    pub fn group_ids<I, S>(mut self, group_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_ids = Some(group_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn kind(mut self, kind: EdgeKind) -> Self {
        self.kinds = Some(vec![kind]);
        self
    }

    pub fn node_pair(mut self, source: Uuid, target: Uuid) -> Self {
        self.node_pair = Some((source, target));
        self
    }

    pub fn touching(mut self, nodes: impl IntoIterator<Item = Uuid>) -> Self {
        self.touching = Some(nodes.into_iter().collect());
        self
    }

    pub fn episode(mut self, episode_uuid: Uuid) -> Self {
        self.episode = Some(episode_uuid);
        self
    }

    pub fn names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn scope(mut self, scope: TemporalScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn matches(&self, edge: &Edge) -> bool {
        if let Some(uuids) = &self.uuids {
            if !uuids.contains(&edge.uuid()) {
                return false;
            }
        }
        if let Some(groups) = &self.group_ids {
            if !groups.iter().any(|g| g == edge.group_id()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&edge.kind()) {
                return false;
            }
        }
        if let Some((source, target)) = self.node_pair {
            if edge.source_node_uuid() != source || edge.target_node_uuid() != target {
                return false;
            }
        }
        if let Some(nodes) = &self.touching {
            if !nodes.contains(&edge.source_node_uuid()) && !nodes.contains(&edge.target_node_uuid())
            {
                return false;
            }
        }
        if let Some(episode) = self.episode {
            let attested = match edge {
                Edge::Entity(e) => e.episodes.contains(&episode),
                Edge::Episodic(e) => e.source_node_uuid == episode,
            };
            if !attested {
                return false;
            }
        }
        if let Some(names) = &self.names {
            match edge {
                Edge::Entity(e) if names.contains(&e.name) => {}
                _ => return false,
            }
        }
        if let (Some(scope), Edge::Entity(e)) = (&self.scope, edge) {
            if !scope.admits(&e.validity) {
                return false;
            }
        }
        within(edge.created_at(), self.created_after, self.created_before)
    }
}

fn within(at: DateTime<Utc>, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> bool {
    after.map_or(true, |a| at >= a) && before.map_or(true, |b| at <= b)
}
