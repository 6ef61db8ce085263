//! Distance metrics for the HNSW graph.
//!
//! Cosine is the documented default (spec §9 Open Question 4); Euclidean is
//! available without re-encoding stored vectors, since both operate
//! directly on the raw `f32` slices.

use serde::{Deserialize, Serialize};

/// Distance metric used by an [`super::HnswGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`, normalizing on the fly.
    Cosine,
    /// Squared Euclidean distance (monotonic with Euclidean distance, cheaper).
    Euclidean,
}

impl DistanceMetric {
    /// Distance between two vectors of equal length. `norm_a`/`norm_b` are
    /// the squared L2 norms of `a`/`b`, cached per-node to avoid recomputing
    /// them on every comparison.
    pub fn distance(&self, a: &[f32], b: &[f32], norm_a: f32, norm_b: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => {
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                let denom = (norm_a.sqrt() * norm_b.sqrt()).max(f32::EPSILON);
                1.0 - (dot / denom)
            }
            DistanceMetric::Euclidean => a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum(),
        }
    }
}

/// Squared L2 norm of a vector, cached per-node.
pub fn squared_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_vectors_is_zero_distance() {
        let v = vec![1.0, 2.0, 3.0];
        let n = squared_norm(&v);
        let d = DistanceMetric::Cosine.distance(&v, &v, n, n);
        assert!(d.abs() < 1e-5);
    }

    #[test]
    fn euclidean_matches_manual_computation() {
        let a = vec![0.0, 0.0];
        let b = vec![3.0, 4.0];
        let d = DistanceMetric::Euclidean.distance(&a, &b, squared_norm(&a), squared_norm(&b));
        assert!((d - 25.0).abs() < 1e-5);
    }
}
