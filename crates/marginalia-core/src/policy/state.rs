//! Policy state features

use serde::{Deserialize, Serialize};

/// Feature vector describing the context of one regeneration decision.
///
/// Built from hashed bag-of-words counts, L2-normalized, with a trailing bias
/// term fixed at 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    features: Vec<f32>,
}

impl StateSnapshot {
    /// Hash the words of every part into `dim` buckets
    pub fn from_text(parts: &[&str], dim: usize) -> Self {
        let dim = dim.max(1);
        let mut buckets = vec![0.0f32; dim];
        for part in parts {
            for word in part
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
            {
                let hash = fnv1a(&word.to_lowercase());
                buckets[(hash % dim as u64) as usize] += 1.0;
            }
        }

        let norm = buckets.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            buckets.iter_mut().for_each(|x| *x /= norm);
        }
        buckets.push(1.0);
        Self { features: buckets }
    }

    /// Wrap a precomputed feature vector
    pub fn from_features(features: Vec<f32>) -> Self {
        Self { features }
    }

    pub fn features(&self) -> &[f32] {
        &self.features
    }

    pub fn dim(&self) -> usize {
        self.features.len()
    }
}

fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}
