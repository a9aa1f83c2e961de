//! Adapter bundles: per-user low-rank weight deltas
//!
//! A bundle adds `(alpha / rank) * (h A) B` to the base model's output logits,
//! with `A` of shape (hidden, rank) and `B` of shape (rank, vocab).

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::model::weights;
use crate::{CoreError, Result, UserId};

const WEIGHTS_MAGIC: &[u8; 4] = b"MRGA";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_weights.bin";

/// Metadata persisted alongside the adapter weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterMeta {
    /// The only user this adapter may be applied to
    pub user_id: UserId,
    /// Monotonic per-user version, assigned by the store on save
    pub version: u64,
    pub rank: usize,
    pub alpha: f32,
    pub hidden_size: usize,
    pub vocab_size: usize,
    /// Name of the base model the delta was trained against
    pub base_model: String,
    pub created_at: DateTime<Utc>,
    pub train_steps: usize,
    pub examples: usize,
    pub final_loss: Option<f32>,
}

/// A trained adapter, immutable once saved
#[derive(Debug, Clone)]
pub struct AdapterBundle {
    meta: AdapterMeta,
    /// (hidden, rank)
    a: Array2<f32>,
    /// (rank, vocab)
    b: Array2<f32>,
}

impl AdapterBundle {
    /// Fresh adapter: small random A, zero B, so the initial delta is zero
    pub fn initialized(
        user_id: UserId,
        base_model: &str,
        hidden_size: usize,
        vocab_size: usize,
        rank: usize,
        alpha: f32,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed ^ user_id);
        let std_a = (1.0 / hidden_size.max(1) as f32).sqrt();
        let a = Array2::from_shape_fn((hidden_size, rank), |_| rng.gen_range(-std_a..std_a));
        let b = Array2::zeros((rank, vocab_size));

        Self {
            meta: AdapterMeta {
                user_id,
                version: 0,
                rank,
                alpha,
                hidden_size,
                vocab_size,
                base_model: base_model.to_string(),
                created_at: Utc::now(),
                train_steps: 0,
                examples: 0,
                final_loss: None,
            },
            a,
            b,
        }
    }

    /// Assemble a bundle from trained matrices
    pub fn from_parts(meta: AdapterMeta, a: Array2<f32>, b: Array2<f32>) -> Result<Self> {
        if a.dim() != (meta.hidden_size, meta.rank) || b.dim() != (meta.rank, meta.vocab_size) {
            return Err(CoreError::invalid_parameter(
                "ADAPTER_SHAPE_MISMATCH",
                format!(
                    "A {:?} / B {:?} do not match rank {} hidden {} vocab {}",
                    a.dim(),
                    b.dim(),
                    meta.rank,
                    meta.hidden_size,
                    meta.vocab_size
                ),
                "Rebuild the adapter against the current base model",
            ));
        }
        Ok(Self { meta, a, b })
    }

    pub fn meta(&self) -> &AdapterMeta {
        &self.meta
    }

    pub fn user_id(&self) -> UserId {
        self.meta.user_id
    }

    pub fn version(&self) -> u64 {
        self.meta.version
    }

    pub fn a(&self) -> &Array2<f32> {
        &self.a
    }

    pub fn b(&self) -> &Array2<f32> {
        &self.b
    }

    /// Scaling factor (alpha / rank)
    pub fn scale(&self) -> f32 {
        self.meta.alpha / self.meta.rank.max(1) as f32
    }

    /// Logit delta for a hidden state
    pub fn delta_logits(&self, hidden: &Array1<f32>) -> Array1<f32> {
        let mut delta = hidden.dot(&self.a).dot(&self.b);
        delta *= self.scale();
        delta
    }

    /// Trainable parameter count
    pub fn param_count(&self) -> usize {
        self.a.len() + self.b.len()
    }

    pub(crate) fn into_parts(self) -> (AdapterMeta, Array2<f32>, Array2<f32>) {
        (self.meta, self.a, self.b)
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.meta.version = version;
    }

    /// Write config and weights into `dir`, which must already exist
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(ADAPTER_CONFIG_FILE);
        let json = serde_json::to_string_pretty(&self.meta)
            .map_err(|e| CoreError::internal("ADAPTER_META_SERIALIZE_FAILED", e.to_string()))?;
        std::fs::write(&config_path, json).map_err(|e| {
            CoreError::storage("ADAPTER_CONFIG_WRITE_FAILED", "Failed to write adapter config", &config_path, e)
        })?;

        let a = self.a.as_standard_layout();
        let b = self.b.as_standard_layout();
        weights::write_blob(
            &dir.join(ADAPTER_WEIGHTS_FILE),
            WEIGHTS_MAGIC,
            &[a.as_slice().unwrap_or_default(), b.as_slice().unwrap_or_default()],
        )
    }

    /// Read a bundle previously written with [`AdapterBundle::write_to`]
    pub fn read_from(dir: &Path) -> Result<Self> {
        let config_path = dir.join(ADAPTER_CONFIG_FILE);
        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            CoreError::storage("ADAPTER_CONFIG_READ_FAILED", "Failed to read adapter config", &config_path, e)
        })?;
        let meta: AdapterMeta = serde_json::from_str(&content).map_err(|e| {
            CoreError::corrupt("ADAPTER_CONFIG_INVALID", format!("Invalid adapter config: {}", e), &config_path)
        })?;

        let (h, r, v) = (meta.hidden_size, meta.rank, meta.vocab_size);
        let (a_len, b_len) = match (h.checked_mul(r), r.checked_mul(v)) {
            (Some(a_len), Some(b_len)) => (a_len, b_len),
            _ => {
                return Err(CoreError::corrupt(
                    "ADAPTER_SHAPE_MISMATCH",
                    format!("Adapter dimensions {}x{}x{} overflow", h, r, v),
                    &config_path,
                ))
            }
        };
        let mut tensors = weights::read_blob(&dir.join(ADAPTER_WEIGHTS_FILE), WEIGHTS_MAGIC, &[a_len, b_len])?;
        let b = Array2::from_shape_vec((r, v), tensors.pop().unwrap_or_default())
            .map_err(|e| CoreError::corrupt("ADAPTER_SHAPE_MISMATCH", e.to_string(), dir))?;
        let a = Array2::from_shape_vec((h, r), tensors.pop().unwrap_or_default())
            .map_err(|e| CoreError::corrupt("ADAPTER_SHAPE_MISMATCH", e.to_string(), dir))?;

        Self::from_parts(meta, a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_adapter_has_zero_delta() {
        let bundle = AdapterBundle::initialized(7, "base", 6, 10, 2, 4.0, 1);
        let delta = bundle.delta_logits(&Array1::from_elem(6, 0.5));
        assert!(delta.iter().all(|&d| d == 0.0));
        assert_eq!(bundle.scale(), 2.0);
        assert_eq!(bundle.param_count(), 6 * 2 + 2 * 10);
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut bundle = AdapterBundle::initialized(3, "base", 4, 5, 2, 8.0, 9);
        bundle.set_version(4);
        bundle.write_to(dir.path()).unwrap();

        let restored = AdapterBundle::read_from(dir.path()).unwrap();
        assert_eq!(restored.meta(), bundle.meta());
        assert_eq!(restored.a(), bundle.a());
        assert_eq!(restored.b(), bundle.b());
    }

    #[test]
    fn test_overflowing_dimensions_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = AdapterBundle::initialized(3, "base", 4, 5, 2, 8.0, 9);
        bundle.write_to(dir.path()).unwrap();

        let mut meta = bundle.meta().clone();
        meta.hidden_size = usize::MAX;
        meta.rank = 2;
        std::fs::write(dir.path().join(ADAPTER_CONFIG_FILE), serde_json::to_string(&meta).unwrap()).unwrap();

        let err = AdapterBundle::read_from(dir.path()).unwrap_err();
        assert_eq!(err.code(), "ADAPTER_SHAPE_MISMATCH");
    }

    #[test]
    fn test_from_parts_rejects_bad_shapes() {
        let bundle = AdapterBundle::initialized(3, "base", 4, 5, 2, 8.0, 9);
        let (meta, a, _) = bundle.into_parts();
        let err = AdapterBundle::from_parts(meta, a, Array2::zeros((3, 5))).unwrap_err();
        assert_eq!(err.code(), "ADAPTER_SHAPE_MISMATCH");
    }
}
