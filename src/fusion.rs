//! Fusion ranker (C8): combines per-arm scores from the vector, metadata,
//! and graph arms of a query into a single ranked list.

use std::collections::BTreeMap;

/// Per-arm contribution to a candidate's final score, each already
/// normalized to `[0, 1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArmScores {
    pub vector: Option<f64>,
    pub field: Option<f64>,
    pub graph: Option<f64>,
}

/// User-selectable combination strategy (spec §4.8).
#[derive(Debug, Clone)]
pub enum FusionStrategy {
    /// Present arms share weight equally; absent arms are excluded.
    Adaptive,
    /// Explicit weights, renormalized over the arms that actually fired.
    Weighted { vector: f64, field: f64, graph: f64 },
    /// Rank-based fusion: `sum(1 / (k + rank_in_arm))`, `k = 60`.
    ReciprocalRank,
}

impl Default for FusionStrategy {
    fn default() -> Self {
        FusionStrategy::Adaptive
    }
}

/// Optional post-fusion score adjustment.
#[derive(Debug, Clone, Copy)]
pub enum Boost {
    /// Multiply the score by `exp(-age_ms / tau_ms)`.
    Recent { tau_ms: f64 },
}

/// A ranked fusion result.
#[derive(Debug, Clone)]
pub struct FusedResult {
    pub id: String,
    pub score: f64,
    pub arms: ArmScores,
}

fn weighted_score(arms: &ArmScores, vector_w: f64, field_w: f64, graph_w: f64) -> f64 {
    let mut total_weight = 0.0;
    let mut acc = 0.0;
    if let Some(v) = arms.vector {
        acc += v * vector_w;
        total_weight += vector_w;
    }
    if let Some(f) = arms.field {
        acc += f * field_w;
        total_weight += field_w;
    }
    if let Some(g) = arms.graph {
        acc += g * graph_w;
        total_weight += graph_w;
    }
    if total_weight <= 0.0 {
        0.0
    } else {
        acc / total_weight
    }
}

/// Combine per-candidate arm scores into a sorted, tie-broken ranking.
///
/// `rank_orders` supplies, per arm, the candidate ids in that arm's own
/// rank order (best first) — only consulted by [`FusionStrategy::ReciprocalRank`].
pub fn fuse(
    candidates: BTreeMap<String, ArmScores>,
    strategy: &FusionStrategy,
    rank_orders: Option<&[Vec<String>]>,
    boost: Option<Boost>,
    now_ms: i64,
    updated_at: &BTreeMap<String, i64>,
) -> Vec<FusedResult> {
    let mut results: Vec<FusedResult> = match strategy {
        FusionStrategy::Adaptive => candidates
            .into_iter()
            .map(|(id, arms)| {
                let present = [arms.vector, arms.field, arms.graph].iter().filter(|s| s.is_some()).count();
                let w = if present == 0 { 0.0 } else { 1.0 / present as f64 };
                FusedResult { id, score: weighted_score(&arms, w, w, w), arms }
            })
            .collect(),
        FusionStrategy::Weighted { vector, field, graph } => candidates
            .into_iter()
            .map(|(id, arms)| FusedResult { id, score: weighted_score(&arms, *vector, *field, *graph), arms })
            .collect(),
        FusionStrategy::ReciprocalRank => {
            const K: f64 = 60.0;
            let mut scores: BTreeMap<String, f64> = BTreeMap::new();
            if let Some(orders) = rank_orders {
                for order in orders {
                    for (rank, id) in order.iter().enumerate() {
                        *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (K + rank as f64 + 1.0);
                    }
                }
            }
            candidates
                .into_iter()
                .map(|(id, arms)| {
                    let score = scores.get(&id).copied().unwrap_or(0.0);
                    FusedResult { id, score, arms }
                })
                .collect()
        }
    };

    if let Some(Boost::Recent { tau_ms }) = boost {
        for result in &mut results {
            if let Some(updated) = updated_at.get(&result.id) {
                let age = (now_ms - updated).max(0) as f64;
                result.score *= (-age / tau_ms.max(1.0)).exp();
            }
        }
    }

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arms(v: Option<f64>, f: Option<f64>, g: Option<f64>) -> ArmScores {
        ArmScores { vector: v, field: f, graph: g }
    }

    #[test]
    fn adaptive_excludes_missing_arms_from_normalization() {
        let mut candidates = BTreeMap::new();
        candidates.insert("a".to_string(), arms(Some(1.0), None, None));
        candidates.insert("b".to_string(), arms(Some(0.5), Some(0.5), None));
        let out = fuse(candidates, &FusionStrategy::Adaptive, None, None, 0, &BTreeMap::new());
        assert_eq!(out[0].id, "a");
        assert!((out[0].score - 1.0).abs() < 1e-9);
        assert!((out[1].score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn weighted_renormalizes_over_present_arms() {
        let mut candidates = BTreeMap::new();
        candidates.insert("a".to_string(), arms(Some(1.0), None, None));
        let strategy = FusionStrategy::Weighted { vector: 0.5, field: 0.3, graph: 0.2 };
        let out = fuse(candidates, &strategy, None, None, 0, &BTreeMap::new());
        assert!((out[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn reciprocal_rank_favors_top_ranked_items() {
        let mut candidates = BTreeMap::new();
        candidates.insert("a".to_string(), ArmScores::default());
        candidates.insert("b".to_string(), ArmScores::default());
        let orders = vec![vec!["a".to_string(), "b".to_string()]];
        let out = fuse(candidates, &FusionStrategy::ReciprocalRank, Some(&orders), None, 0, &BTreeMap::new());
        assert_eq!(out[0].id, "a");
        assert!(out[0].score > out[1].score);
    }

    #[test]
    fn ties_break_on_smaller_id() {
        let mut candidates = BTreeMap::new();
        candidates.insert("z".to_string(), arms(Some(0.5), None, None));
        candidates.insert("a".to_string(), arms(Some(0.5), None, None));
        let out = fuse(candidates, &FusionStrategy::Adaptive, None, None, 0, &BTreeMap::new());
        assert_eq!(out[0].id, "a");
    }

    #[test]
    fn recent_boost_decays_older_items() {
        let mut candidates = BTreeMap::new();
        candidates.insert("old".to_string(), arms(Some(1.0), None, None));
        candidates.insert("new".to_string(), arms(Some(1.0), None, None));
        let mut updated = BTreeMap::new();
        updated.insert("old".to_string(), 0);
        updated.insert("new".to_string(), 1_000_000);
        let out = fuse(
            candidates,
            &FusionStrategy::Adaptive,
            None,
            Some(Boost::Recent { tau_ms: 1_000.0 }),
            1_000_000,
            &updated,
        );
        assert_eq!(out[0].id, "new");
    }
}
