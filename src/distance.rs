//! Distance kernel: scalar reference implementation and an `f32x8`
//! data-parallel implementation.
//!
//! [`distance`] returns each metric in its natural sense (L2 distance, dot
//! product, cosine similarity). Search code works on the "rank distance"
//! from [`DistanceMetric::rank`], where lower is always better, and turns it
//! back into a user-facing score with [`DistanceMetric::score`].

use crate::error::{Result, VexError};
use serde::{Deserialize, Serialize};

/// Distance metrics for measuring vector similarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Euclidean (L2) distance
    #[serde(alias = "euclidean")]
    L2,
    /// Inner product
    #[serde(alias = "dot")]
    DotProduct,
    /// Cosine similarity. Vectors are normalized at insertion so search
    /// reduces to a dot product.
    Cosine,
}

impl DistanceMetric {
    /// Lower-is-better distance between two stored vectors.
    ///
    /// For cosine both sides must already be normalized.
    #[inline]
    pub fn rank(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::L2 => simd::l2_distance(a, b),
            DistanceMetric::DotProduct | DistanceMetric::Cosine => -simd::dot_product(a, b),
        }
    }

    /// Convert a rank distance back into the score reported to callers.
    #[inline]
    pub fn score(&self, rank: f32) -> f32 {
        match self {
            DistanceMetric::L2 => rank,
            DistanceMetric::DotProduct | DistanceMetric::Cosine => -rank,
        }
    }

    /// Whether a larger score means a closer match.
    pub fn higher_is_better(&self) -> bool {
        !matches!(self, DistanceMetric::L2)
    }

    /// Apply the insertion-time transform for this metric (unit scaling for cosine).
    pub fn prepare(&self, vector: &mut [f32]) {
        if let DistanceMetric::Cosine = self {
            normalize(vector);
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::L2 => "l2",
            DistanceMetric::DotProduct => "dot_product",
            DistanceMetric::Cosine => "cosine",
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = VexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "l2" | "euclidean" => Ok(DistanceMetric::L2),
            "dot" | "dot_product" | "ip" => Ok(DistanceMetric::DotProduct),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(VexError::Config(format!("unknown metric: {}", other))),
        }
    }
}

/// Compute `metric` between two vectors with the data-parallel kernel.
///
/// Cosine of a zero vector is defined as 0 similarity.
pub fn distance(a: &[f32], b: &[f32], metric: DistanceMetric) -> Result<f32> {
    check_dimensions(a, b)?;
    Ok(match metric {
        DistanceMetric::L2 => simd::l2_distance(a, b),
        DistanceMetric::DotProduct => simd::dot_product(a, b),
        DistanceMetric::Cosine => {
            cosine_from_parts(simd::dot_product(a, b), simd::norm(a), simd::norm(b))
        }
    })
}

/// Scalar reference for [`distance`].
pub fn distance_scalar(a: &[f32], b: &[f32], metric: DistanceMetric) -> Result<f32> {
    check_dimensions(a, b)?;
    Ok(match metric {
        DistanceMetric::L2 => scalar::l2_distance(a, b),
        DistanceMetric::DotProduct => scalar::dot_product(a, b),
        DistanceMetric::Cosine => {
            cosine_from_parts(scalar::dot_product(a, b), scalar::norm(a), scalar::norm(b))
        }
    })
}

fn check_dimensions(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(VexError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(())
}

fn cosine_from_parts(dot: f32, norm_a: f32, norm_b: f32) -> f32 {
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    // Clamp to [-1, 1] to handle floating point errors
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = simd::norm(v);
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Plain iterator kernels. These are the reference the SIMD path is tested against.
pub mod scalar {
    pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
    }

    pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
        l2_distance_squared(a, b).sqrt()
    }

    pub fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }
}

/// Eight-lane kernels built on `wide::f32x8`.
pub mod simd {
    use wide::f32x8;

    const LANES: usize = 8;

    #[inline(always)]
    fn load(chunk: &[f32]) -> f32x8 {
        let mut lanes = [0.0f32; LANES];
        lanes.copy_from_slice(chunk);
        f32x8::new(lanes)
    }

    #[inline(always)]
    fn horizontal_sum(v: f32x8) -> f32 {
        v.to_array().iter().sum()
    }

    #[inline]
    pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");

        let chunks_a = a.chunks_exact(LANES);
        let chunks_b = b.chunks_exact(LANES);
        let tail_a = chunks_a.remainder();
        let tail_b = chunks_b.remainder();

        let mut acc = f32x8::splat(0.0);
        for (x, y) in chunks_a.zip(chunks_b) {
            acc = acc + load(x) * load(y);
        }

        let mut sum = horizontal_sum(acc);
        for (x, y) in tail_a.iter().zip(tail_b.iter()) {
            sum += x * y;
        }
        sum
    }

    #[inline]
    pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");

        let chunks_a = a.chunks_exact(LANES);
        let chunks_b = b.chunks_exact(LANES);
        let tail_a = chunks_a.remainder();
        let tail_b = chunks_b.remainder();

        let mut acc = f32x8::splat(0.0);
        for (x, y) in chunks_a.zip(chunks_b) {
            let d = load(x) - load(y);
            acc = acc + d * d;
        }

        let mut sum = horizontal_sum(acc);
        for (x, y) in tail_a.iter().zip(tail_b.iter()) {
            sum += (x - y) * (x - y);
        }
        sum
    }

    #[inline]
    pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
        l2_distance_squared(a, b).sqrt()
    }

    #[inline]
    pub fn norm(v: &[f32]) -> f32 {
        dot_product(v, v).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_euclidean_distance() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 5.0, 6.0];
        let dist = distance(&a, &b, DistanceMetric::L2).unwrap();
        assert_relative_eq!(dist, 5.196152, epsilon = 1e-5);
    }

    #[test]
    fn test_euclidean_same_vector() {
        let v = [1.0, 2.0, 3.0];
        let dist = distance(&v, &v, DistanceMetric::L2).unwrap();
        assert_relative_eq!(dist, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_dot_product() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 5.0, 6.0];
        let dot = distance(&a, &b, DistanceMetric::DotProduct).unwrap();
        assert_relative_eq!(dot, 32.0, epsilon = 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_opposite() {
        let x = [1.0, 0.0, 0.0];
        let y = [0.0, 1.0, 0.0];
        let neg = [-1.0, 0.0, 0.0];
        assert_relative_eq!(distance(&x, &x, DistanceMetric::Cosine).unwrap(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(distance(&x, &y, DistanceMetric::Cosine).unwrap(), 0.0, epsilon = 1e-6);
        assert_relative_eq!(distance(&x, &neg, DistanceMetric::Cosine).unwrap(), -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector_is_zero_similarity() {
        let zero = [0.0, 0.0, 0.0];
        let x = [1.0, 2.0, 3.0];
        assert_eq!(distance(&zero, &x, DistanceMetric::Cosine).unwrap(), 0.0);
        assert_eq!(distance_scalar(&zero, &zero, DistanceMetric::Cosine).unwrap(), 0.0);
    }

    #[test]
    fn test_simd_handles_tail_lanes() {
        // 19 = two full f32x8 chunks plus a three element tail
        let a: Vec<f32> = (0..19).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..19).map(|i| 1.0 - i as f32 * 0.25).collect();
        assert_relative_eq!(
            simd::dot_product(&a, &b),
            scalar::dot_product(&a, &b),
            max_relative = 1e-5
        );
        assert_relative_eq!(
            simd::l2_distance(&a, &b),
            scalar::l2_distance(&a, &b),
            max_relative = 1e-5
        );
    }

    #[test]
    fn test_rank_and_score_are_inverse() {
        let a = [0.6, 0.8];
        let b = [1.0, 0.0];
        for metric in [DistanceMetric::L2, DistanceMetric::DotProduct, DistanceMetric::Cosine] {
            let rank = metric.rank(&a, &b);
            let natural = distance(&a, &b, metric).unwrap();
            assert_relative_eq!(metric.score(rank), natural, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        DistanceMetric::Cosine.prepare(&mut v);
        assert_relative_eq!(v[0], 0.6, epsilon = 1e-6);
        assert_relative_eq!(v[1], 0.8, epsilon = 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = [1.0, 2.0];
        let b = [1.0, 2.0, 3.0];
        assert!(matches!(
            distance(&a, &b, DistanceMetric::L2),
            Err(VexError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!("euclidean".parse::<DistanceMetric>().unwrap(), DistanceMetric::L2);
        assert_eq!("dot".parse::<DistanceMetric>().unwrap(), DistanceMetric::DotProduct);
        assert!("manhattan".parse::<DistanceMetric>().is_err());
        let json = serde_json::to_string(&DistanceMetric::DotProduct).unwrap();
        assert_eq!(json, "\"dot_product\"");
    }
}
