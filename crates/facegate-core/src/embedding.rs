use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Fixed-length face embedding. Immutable once built; clones share storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Arc<[f32]>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values: values.into(),
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Distance metric of a similarity index, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Squared Euclidean distance.
    #[default]
    L2,
    /// `1 - cosine similarity`, in [0, 2].
    Cosine,
}

impl Metric {
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| {
                    let d = x - y;
                    d * d
                })
                .sum(),
            Metric::Cosine => {
                let mut dot = 0.0f32;
                let mut norm_a = 0.0f32;
                let mut norm_b = 0.0f32;
                for (x, y) in a.iter().zip(b) {
                    dot += x * y;
                    norm_a += x * x;
                    norm_b += y * y;
                }
                let zero_a = norm_a <= f32::EPSILON;
                let zero_b = norm_b <= f32::EPSILON;
                if zero_a && zero_b {
                    return 0.0;
                }
                if zero_a || zero_b {
                    // A zero vector is orthogonal to every non-zero one.
                    return 1.0;
                }
                let denom = norm_a.sqrt() * norm_b.sqrt();
                1.0 - (dot / denom).clamp(-1.0, 1.0)
            }
        }
    }

    /// Map a distance under this metric to a similarity confidence in [0, 1].
    pub fn confidence(self, distance: f32) -> f32 {
        match self {
            Metric::L2 => 1.0 / (1.0 + distance.max(0.0)),
            Metric::Cosine => (1.0 - distance).clamp(0.0, 1.0),
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Metric::L2 => 0,
            Metric::Cosine => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Metric::L2),
            1 => Some(Metric::Cosine),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_is_squared_euclidean() {
        let d = Metric::L2.distance(&[0.0, 0.0], &[3.0, 4.0]);
        assert!((d - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_identical_vectors_have_full_confidence() {
        let v = [0.2, -0.4, 0.9];
        for metric in [Metric::L2, Metric::Cosine] {
            let d = metric.distance(&v, &v);
            assert!((metric.confidence(d) - 1.0).abs() < 1e-5, "{metric:?}");
        }
    }

    #[test]
    fn test_cosine_opposite_vectors() {
        let d = Metric::Cosine.distance(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((d - 2.0).abs() < 1e-6);
        assert_eq!(Metric::Cosine.confidence(d), 0.0);
    }

    #[test]
    fn test_cosine_zero_vector() {
        let d = Metric::Cosine.distance(&[0.0, 0.0], &[1.0, 0.0]);
        assert_eq!(d, 1.0);
        assert_eq!(Metric::Cosine.distance(&[1.0, 0.0], &[0.0, 0.0]), 1.0);
    }

    #[test]
    fn test_zero_vectors_are_identical_under_every_metric() {
        let zero = [0.0f32; 4];
        for metric in [Metric::L2, Metric::Cosine] {
            let d = metric.distance(&zero, &zero);
            assert_eq!(d, 0.0, "{metric:?}");
            assert_eq!(metric.confidence(d), 1.0, "{metric:?}");
        }
    }

    #[test]
    fn test_is_finite() {
        assert!(Embedding::new(vec![0.0, 1.5, -2.0]).is_finite());
        assert!(!Embedding::new(vec![0.0, f32::NAN]).is_finite());
        assert!(!Embedding::new(vec![f32::INFINITY, 0.0]).is_finite());
    }

    #[test]
    fn test_metric_tag_roundtrip() {
        for metric in [Metric::L2, Metric::Cosine] {
            assert_eq!(Metric::from_tag(metric.tag()), Some(metric));
        }
        assert_eq!(Metric::from_tag(9), None);
    }
}
