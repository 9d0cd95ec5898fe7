//! Reciprocal-rank fusion

use std::collections::HashMap;
use std::hash::Hash;

/// Retrieval channel a candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Semantic,
    Lexical,
    GraphProximity,
}

/// Why a result matched: one entry per channel that returned it
#[derive(Debug, Clone, PartialEq)]
pub struct MatchReason {
    pub channel: Channel,
    /// Zero-based position in the channel's list
    pub rank: usize,
    /// Channel-native score (cosine, BM25, or inverse distance)
    pub raw_score: f32,
    /// `1 / (rank + c)`
    pub contribution: f64,
}

/// A candidate with its summed contributions
#[derive(Debug, Clone)]
pub struct Fused<K> {
    pub key: K,
    pub score: f64,
    pub reasons: Vec<MatchReason>,
}

/// Merge ranked lists. Every list contributes `1 / (rank + c)` per candidate.
/// Output is in first-seen order; callers sort with their own tie-breaks.
pub fn reciprocal_rank_fusion<K>(channels: Vec<(Channel, Vec<(K, f32)>)>, c: f64) -> Vec<Fused<K>>
where
    K: Eq + Hash + Clone,
{
    let mut fused: Vec<Fused<K>> = Vec::new();
    let mut slot: HashMap<K, usize> = HashMap::new();

    for (channel, ranked) in channels {
        for (rank, (key, raw_score)) in ranked.into_iter().enumerate() {
            let contribution = 1.0 / (rank as f64 + c);
            let reason = MatchReason {
                channel,
                rank,
                raw_score,
                contribution,
            };
            match slot.get(&key).copied() {
                Some(i) => {
                    // a channel lists each key once; keep the best rank
                    if fused[i].reasons.iter().any(|r| r.channel == channel) {
                        continue;
                    }
                    fused[i].score += contribution;
                    fused[i].reasons.push(reason);
                }
                None => {
                    slot.insert(key.clone(), fused.len());
                    fused.push(Fused {
                        key,
                        score: contribution,
                        reasons: vec![reason],
                    });
                }
            }
        }
    }

    fused
}
