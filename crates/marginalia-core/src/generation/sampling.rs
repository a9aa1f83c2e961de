//! Token sampling strategies

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;

use super::{DecodeMode, GenerationRequest};
use crate::{CoreError, Result};

/// Per-decode sampler; owns its random number generator
#[derive(Debug)]
pub struct Sampler {
    mode: DecodeMode,
    temperature: f32,
    top_k: usize,
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    pub fn new(mode: DecodeMode, temperature: f32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            mode,
            temperature,
            top_k: 0,
            top_p: 1.0,
            rng,
        }
    }

    /// Sampler configured from a request
    pub fn for_request(request: &GenerationRequest) -> Self {
        let mut sampler = Self::new(request.mode(), request.temperature(), request.seed());
        sampler.top_k = request.top_k();
        sampler.top_p = request.top_p();
        sampler
    }

    /// Choose the next token id from last-position logits
    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            return Err(CoreError::internal("EMPTY_LOGITS", "Cannot sample from empty logits"));
        }

        match self.mode {
            DecodeMode::Greedy => greedy(logits),
            DecodeMode::Sample => self.temperature_sample(logits),
        }
    }

    fn temperature_sample(&mut self, logits: &[f32]) -> Result<u32> {
        let mut scaled: Vec<f32> = logits.iter().map(|&x| x / self.temperature).collect();

        // Overflow from a tiny temperature degenerates to the arg-max
        if scaled.iter().any(|x| x.is_nan() || *x == f32::INFINITY) {
            return greedy(logits);
        }

        if self.top_k > 0 && self.top_k < scaled.len() {
            apply_top_k(&mut scaled, self.top_k);
        }
        if self.top_p < 1.0 {
            apply_top_p(&mut scaled, self.top_p);
        }

        let probabilities = softmax(&scaled);
        Ok(sample_from_distribution(&probabilities, &mut self.rng))
    }
}

/// Index of the highest finite logit; ties resolve to the lowest index
pub fn greedy(logits: &[f32]) -> Result<u32> {
    logits
        .iter()
        .enumerate()
        .filter(|(_, x)| !x.is_nan())
        .fold(None, |best: Option<(usize, f32)>, (i, &x)| match best {
            Some((_, b)) if b >= x => best,
            _ => Some((i, x)),
        })
        .map(|(i, _)| i as u32)
        .ok_or_else(|| CoreError::internal("SAMPLING_FAILED", "All logits are NaN"))
}

/// Numerically stable softmax; falls back to uniform when nothing survives
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    let exp_logits: Vec<f32> = logits.iter().map(|&x| (x - max_logit).exp()).collect();
    let sum_exp: f32 = exp_logits.iter().sum();

    if sum_exp > 0.0 && sum_exp.is_finite() {
        exp_logits.iter().map(|&x| x / sum_exp).collect()
    } else {
        vec![1.0 / logits.len() as f32; logits.len()]
    }
}

/// Set every logit outside the `top_k` largest to negative infinity
pub fn apply_top_k(logits: &mut [f32], top_k: usize) {
    let mut sorted_indices: Vec<usize> = (0..logits.len()).collect();
    sorted_indices.sort_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap_or(Ordering::Equal));

    for &idx in sorted_indices.iter().skip(top_k) {
        logits[idx] = f32::NEG_INFINITY;
    }
}

/// Keep the smallest prefix of likely tokens whose mass reaches `top_p`
pub fn apply_top_p(logits: &mut [f32], top_p: f32) {
    let mut sorted_indices: Vec<usize> = (0..logits.len()).collect();
    sorted_indices.sort_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap_or(Ordering::Equal));

    let sorted_logits: Vec<f32> = sorted_indices.iter().map(|&i| logits[i]).collect();
    let sorted_probs = softmax(&sorted_logits);

    let mut cumulative_prob = 0.0;
    let mut cutoff_index = sorted_probs.len();
    for (i, &prob) in sorted_probs.iter().enumerate() {
        cumulative_prob += prob;
        if cumulative_prob >= top_p {
            cutoff_index = i + 1;
            break;
        }
    }

    for &idx in sorted_indices.iter().skip(cutoff_index) {
        logits[idx] = f32::NEG_INFINITY;
    }
}

/// Categorical draw from a probability vector
pub fn sample_from_distribution<R: Rng>(probabilities: &[f32], rng: &mut R) -> u32 {
    let total: f32 = probabilities.iter().sum();
    let target = rng.gen::<f32>() * total;

    let mut cumulative_prob = 0.0;
    let mut last_nonzero = 0;
    for (i, &prob) in probabilities.iter().enumerate() {
        if prob <= 0.0 {
            continue;
        }
        cumulative_prob += prob;
        last_nonzero = i;
        if target < cumulative_prob {
            return i as u32;
        }
    }

    // Rounding left the target past the final bucket
    last_nonzero as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_greedy_picks_first_maximum() {
        assert_eq!(greedy(&[0.1, 0.9, 0.9, 0.2]).unwrap(), 1);
        assert_eq!(greedy(&[f32::NAN, -1.0]).unwrap(), 1);
        assert!(greedy(&[f32::NAN]).is_err());
    }

    #[test]
    fn test_top_k_filtering() {
        let mut logits = vec![1.0, 5.0, 3.0, 4.0];
        apply_top_k(&mut logits, 2);
        assert_eq!(logits[0], f32::NEG_INFINITY);
        assert_eq!(logits[2], f32::NEG_INFINITY);
        assert_eq!(logits[1], 5.0);
        assert_eq!(logits[3], 4.0);
    }

    #[test]
    fn test_top_p_keeps_dominant_token() {
        let mut logits = vec![10.0, 0.0, 0.0];
        apply_top_p(&mut logits, 0.5);
        assert_eq!(logits[0], 10.0);
        assert!(logits[1..].iter().all(|&x| x == f32::NEG_INFINITY));
    }

    #[test]
    fn test_tiny_temperature_is_argmax() {
        let mut sampler = Sampler::new(DecodeMode::Sample, 1e-8, Some(3));
        for _ in 0..20 {
            assert_eq!(sampler.sample(&[0.5, 2.0, 1.9]).unwrap(), 1);
        }
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let logits = [0.3, 0.2, 0.1, 0.4];
        let mut a = Sampler::new(DecodeMode::Sample, 1.0, Some(11));
        let mut b = Sampler::new(DecodeMode::Sample, 1.0, Some(11));
        let xs: Vec<u32> = (0..32).map(|_| a.sample(&logits).unwrap()).collect();
        let ys: Vec<u32> = (0..32).map(|_| b.sample(&logits).unwrap()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_never_samples_masked_tokens() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..100 {
            let id = sample_from_distribution(&[0.0, 0.5, 0.0, 0.5], &mut rng);
            assert!(id == 1 || id == 3);
        }
    }
}
