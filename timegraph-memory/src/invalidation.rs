//! Temporal invalidation of contradicted facts
//!
//! A new fact closes the validity window of every older fact it
//! contradicts. When the contradicting fact is the newer one (an episode
//! about the past arrived late), the new fact is the one that gets closed.
//! Windows are never reopened.

use std::cmp::Ordering;
use std::collections::HashMap;

use uuid::Uuid;

use crate::config::{InvalidationConfig, ProviderPolicy};
use crate::edge::{EdgeKind, EntityEdge};
use crate::error::Result;
use crate::extraction::Extractor;
use crate::index::cosine_similarity;
use crate::retry::with_retry;
use crate::store::{EdgeFilter, GraphStore};

/// What invalidating one candidate decided
#[derive(Debug, Clone)]
pub struct InvalidationOutcome {
    /// The candidate, possibly closed by a newer contradicting fact
    pub candidate: EntityEdge,
    /// Existing facts whose window this candidate closed (new state)
    pub invalidated: Vec<EntityEdge>,
}

pub struct TemporalInvalidator<'a> {
    store: &'a dyn GraphStore,
    extractor: &'a dyn Extractor,
    config: &'a InvalidationConfig,
    policy: &'a ProviderPolicy,
}

impl<'a> TemporalInvalidator<'a> {
    pub fn new(
        store: &'a dyn GraphStore,
        extractor: &'a dyn Extractor,
        config: &'a InvalidationConfig,
        policy: &'a ProviderPolicy,
    ) -> Self {
        Self {
            store,
            extractor,
            config,
            policy,
        }
    }

    /// Check `candidate` against the facts around its endpoints.
    ///
    /// `pending` holds edges already planned in the same transaction, keyed
    /// by uuid; they shadow stored versions and are considered as well.
    pub async fn invalidate(
        &self,
        mut candidate: EntityEdge,
        pending: &HashMap<Uuid, EntityEdge>,
    ) -> Result<InvalidationOutcome> {
        let existing = self.candidates(&candidate, pending).await?;
        let mut invalidated = Vec::new();

        for mut edge in existing {
            // windows that cannot overlap
            if edge.validity.ended_by(candidate.valid_at())
                || candidate.validity.ended_by(edge.valid_at())
            {
                continue;
            }

            let contradicts = with_retry(self.policy, self.extractor.name(), "contradicts", || {
                self.extractor.contradicts(&edge.fact, &candidate.fact)
            })
            .await?;
            if !contradicts {
                continue;
            }

            match edge.order().cmp(&candidate.order()) {
                Ordering::Less => {
                    if edge.validity.invalidate_at(candidate.valid_at()) {
                        log::debug!(
                            "Fact {} '{}' invalidated at {} by '{}'",
                            edge.uuid,
                            edge.fact,
                            candidate.valid_at(),
                            candidate.fact
                        );
                        invalidated.push(edge);
                    }
                }
                Ordering::Greater => {
                    if candidate.validity.invalidate_at(edge.valid_at()) {
                        log::debug!(
                            "New fact '{}' already superseded at {} by {} '{}'",
                            candidate.fact,
                            edge.valid_at(),
                            edge.uuid,
                            edge.fact
                        );
                    }
                }
                Ordering::Equal => {
                    log::debug!(
                        "Facts {} and {} contradict at the same instant; keeping both",
                        edge.uuid,
                        candidate.uuid
                    );
                }
            }
        }

        Ok(InvalidationOutcome {
            candidate,
            invalidated,
        })
    }

    /// Edges sharing an endpoint with `candidate`: the same pair first, then
    /// by fact similarity, capped at `max_candidates`
    async fn candidates(
        &self,
        candidate: &EntityEdge,
        pending: &HashMap<Uuid, EntityEdge>,
    ) -> Result<Vec<EntityEdge>> {
        let endpoints = [candidate.source_node_uuid, candidate.target_node_uuid];
        let stored = self
            .store
            .get_edges(
                &EdgeFilter::new()
                    .group(candidate.group_id.clone())
                    .kind(EdgeKind::Entity)
                    .touching(endpoints),
            )
            .await?;

        let mut edges: Vec<EntityEdge> = stored
            .into_iter()
            .filter_map(|e| e.into_entity())
            .filter(|e| e.uuid != candidate.uuid)
            .map(|e| pending.get(&e.uuid).cloned().unwrap_or(e))
            .collect();
        for edge in pending.values() {
            if edge.uuid != candidate.uuid
                && edge.shares_endpoint(candidate)
                && !edges.iter().any(|e| e.uuid == edge.uuid)
            {
                edges.push(edge.clone());
            }
        }

        let similarity = |e: &EntityEdge| match (&candidate.fact_embedding, &e.fact_embedding) {
            (Some(a), Some(b)) => cosine_similarity(a, b),
            _ => 0.0,
        };
        let same_pair = |e: &EntityEdge| {
            e.connects(candidate.source_node_uuid, candidate.target_node_uuid)
        };
        edges.sort_by(|a, b| {
            same_pair(b)
                .cmp(&same_pair(a))
                .then_with(|| {
                    similarity(b)
                        .partial_cmp(&similarity(a))
                        .unwrap_or(Ordering::Equal)
                })
                .then(a.uuid.cmp(&b.uuid))
        });
        edges.truncate(self.config.max_candidates);
        Ok(edges)
    }
}
