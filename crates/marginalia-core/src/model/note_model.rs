//! Bundled base model
//!
//! A compact causal model: an embedding table and an output head. The hidden
//! state at a position mixes the last token's embedding with the running mean
//! of every embedding so far, so the incremental cache only needs the running
//! sum, the last embedding and the position count.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use super::weights;
use super::{DecodeCache, LanguageModel, StepOutput};
use crate::{CoreError, Result};

const WEIGHTS_MAGIC: &[u8; 4] = b"MRGB";
pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "weights.bin";

/// Model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    /// Weight of the last token embedding against the running mean
    pub last_token_mix: f32,
}

impl ModelConfig {
    pub fn new<S: Into<String>>(name: S, vocab_size: usize, hidden_size: usize) -> Self {
        Self {
            name: name.into(),
            vocab_size,
            hidden_size,
            last_token_mix: 0.6,
        }
    }
}

/// Shared, read-only base model
#[derive(Debug, Clone)]
pub struct NoteModel {
    config: ModelConfig,
    /// (vocab_size, hidden_size)
    embeddings: Array2<f32>,
    /// (hidden_size, vocab_size)
    head: Array2<f32>,
    /// (vocab_size)
    bias: Array1<f32>,
}

impl NoteModel {
    /// Initialize weights randomly from a seed
    pub fn random(config: ModelConfig, seed: u64) -> Result<Self> {
        validate_config(&config)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let (v, h) = (config.vocab_size, config.hidden_size);
        let head_scale = 1.0 / (h as f32).sqrt();

        let embeddings = Array2::from_shape_fn((v, h), |_| rng.gen_range(-1.0..1.0));
        let head = Array2::from_shape_fn((h, v), |_| rng.gen_range(-head_scale..head_scale));
        let bias = Array1::zeros(v);

        Ok(Self {
            config,
            embeddings,
            head,
            bias,
        })
    }

    /// Load a model directory written by [`NoteModel::save`]
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            CoreError::storage("MODEL_CONFIG_READ_FAILED", "Failed to read model config", &config_path, e)
        })?;
        let config: ModelConfig = serde_json::from_str(&content).map_err(|e| {
            CoreError::corrupt("MODEL_CONFIG_INVALID", format!("Invalid model config: {}", e), &config_path)
        })?;
        validate_config(&config)?;

        let (v, h) = (config.vocab_size, config.hidden_size);
        let mut tensors = weights::read_blob(&dir.join(WEIGHTS_FILE), WEIGHTS_MAGIC, &[v * h, h * v, v])?;
        let bias = Array1::from_vec(tensors.pop().unwrap_or_default());
        let head = to_matrix(tensors.pop().unwrap_or_default(), (h, v))?;
        let embeddings = to_matrix(tensors.pop().unwrap_or_default(), (v, h))?;

        info!("Loaded base model '{}' ({} tokens, hidden {})", config.name, v, h);
        Ok(Self {
            config,
            embeddings,
            head,
            bias,
        })
    }

    /// Persist config and weights into `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .map_err(|e| CoreError::storage("MODEL_DIR_CREATE_FAILED", "Failed to create model directory", dir, e))?;

        let config_path = dir.join(CONFIG_FILE);
        let json = serde_json::to_string_pretty(&self.config)
            .map_err(|e| CoreError::internal("MODEL_CONFIG_SERIALIZE_FAILED", e.to_string()))?;
        std::fs::write(&config_path, json).map_err(|e| {
            CoreError::storage("MODEL_CONFIG_WRITE_FAILED", "Failed to write model config", &config_path, e)
        })?;

        let embeddings = self.embeddings.as_standard_layout();
        let head = self.head.as_standard_layout();
        weights::write_blob(
            &dir.join(WEIGHTS_FILE),
            WEIGHTS_MAGIC,
            &[
                embeddings.as_slice().unwrap_or_default(),
                head.as_slice().unwrap_or_default(),
                self.bias.as_slice().unwrap_or_default(),
            ],
        )
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    /// Fold `input_ids` into the cache and return the hidden state of the last position
    pub fn hidden_step(&self, input_ids: &[u32], cache: Option<DecodeCache>) -> Result<(Array1<f32>, DecodeCache)> {
        if input_ids.is_empty() {
            return Err(CoreError::invalid_named(
                "MODEL_EMPTY_INPUT",
                "input_ids",
                "Forward step requires at least one token",
                "Encode a non-empty prompt or add a BOS token",
            ));
        }

        let h = self.config.hidden_size;
        let (mut state, mut positions) = match cache {
            Some(cache) => cache.into_parts(),
            None => (vec![0.0; 2 * h], 0),
        };
        if state.len() != 2 * h {
            return Err(CoreError::internal(
                "MODEL_CACHE_MISMATCH",
                format!("Cache holds {} values, model expects {}", state.len(), 2 * h),
            ));
        }

        for &id in input_ids {
            let row = self.embedding(id)?;
            let (sum, last) = state.split_at_mut(h);
            for i in 0..h {
                sum[i] += row[i];
                last[i] = row[i];
            }
            positions += 1;
        }

        let hidden = self.mix(&state[..h], &state[h..], positions);
        Ok((hidden, DecodeCache::from_parts(state, positions)))
    }

    /// Hidden state after each prefix of `ids`: row t covers ids[..=t]
    pub fn hidden_states(&self, ids: &[u32]) -> Result<Array2<f32>> {
        let h = self.config.hidden_size;
        let mut out = Array2::zeros((ids.len(), h));
        let mut sum = vec![0.0f32; h];
        for (t, &id) in ids.iter().enumerate() {
            let row = self.embedding(id)?;
            for i in 0..h {
                sum[i] += row[i];
            }
            let hidden = self.mix(&sum, row.as_slice().unwrap_or(&[]), t + 1);
            out.row_mut(t).assign(&hidden);
        }
        Ok(out)
    }

    /// Base logits for a hidden state
    pub fn project(&self, hidden: &Array1<f32>) -> Array1<f32> {
        hidden.dot(&self.head) + &self.bias
    }

    /// Fit the output head to next-token statistics of `sequences`.
    ///
    /// Embeddings stay fixed; this gives freshly initialized models a usable
    /// starting distribution before any per-user adaptation.
    pub fn fit_head(&mut self, sequences: &[Vec<u32>], epochs: usize, learning_rate: f32) -> Result<f32> {
        let mut last_loss = f32::NAN;
        for epoch in 0..epochs {
            let mut total = 0.0f32;
            let mut count = 0usize;
            for seq in sequences.iter().filter(|s| s.len() > 1) {
                let hidden = self.hidden_states(seq)?;
                for t in 0..seq.len() - 1 {
                    let h_t = hidden.row(t).to_owned();
                    let target = seq[t + 1] as usize;
                    let mut grad = softmax(&self.project(&h_t));
                    total -= grad[target].max(1e-12).ln();
                    grad[target] -= 1.0;

                    let update = outer(&h_t.view(), &grad.view()) * learning_rate;
                    self.head -= &update;
                    self.bias.scaled_add(-learning_rate, &grad);
                    count += 1;
                }
            }
            last_loss = if count > 0 { total / count as f32 } else { 0.0 };
            debug!("Head fit epoch {}: loss {:.4}", epoch + 1, last_loss);
        }
        Ok(last_loss)
    }

    fn embedding(&self, id: u32) -> Result<ArrayView1<'_, f32>> {
        if (id as usize) >= self.config.vocab_size {
            return Err(CoreError::invalid_named(
                "MODEL_TOKEN_OUT_OF_RANGE",
                "input_ids",
                format!("Token id {} exceeds vocabulary size {}", id, self.config.vocab_size),
                "Check that the tokenizer matches the model",
            ));
        }
        Ok(self.embeddings.row(id as usize))
    }

    fn mix(&self, sum: &[f32], last: &[f32], positions: usize) -> Array1<f32> {
        let w = self.config.last_token_mix;
        let n = positions.max(1) as f32;
        Array1::from_iter(
            sum.iter()
                .zip(last.iter())
                .map(|(&s, &l)| (w * l + (1.0 - w) * s / n).tanh()),
        )
    }
}

impl LanguageModel for NoteModel {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward(&self, input_ids: &[u32], cache: Option<DecodeCache>) -> Result<StepOutput> {
        let (hidden, cache) = self.hidden_step(input_ids, cache)?;
        Ok(StepOutput {
            logits: self.project(&hidden).to_vec(),
            cache,
        })
    }
}

fn validate_config(config: &ModelConfig) -> Result<()> {
    if config.vocab_size == 0 || config.hidden_size == 0 {
        return Err(CoreError::invalid_parameter(
            "MODEL_CONFIG_INVALID",
            "vocab_size and hidden_size must be greater than 0",
            "Rebuild the model with a non-empty vocabulary",
        ));
    }
    if !(0.0..=1.0).contains(&config.last_token_mix) {
        return Err(CoreError::invalid_parameter(
            "MODEL_CONFIG_INVALID",
            "last_token_mix must be within [0, 1]",
            "Use a mixing weight between 0 and 1",
        ));
    }
    Ok(())
}

fn to_matrix(data: Vec<f32>, shape: (usize, usize)) -> Result<Array2<f32>> {
    Array2::from_shape_vec(shape, data)
        .map_err(|e| CoreError::internal("MODEL_SHAPE_MISMATCH", e.to_string()))
}

/// Numerically stable softmax
pub(crate) fn softmax(logits: &Array1<f32>) -> Array1<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    let exp = logits.mapv(|x| (x - max).exp());
    let sum = exp.sum();
    exp / sum
}

/// Outer product of two vectors
pub(crate) fn outer(a: &ArrayView1<'_, f32>, b: &ArrayView1<'_, f32>) -> Array2<f32> {
    let column = a.view().insert_axis(Axis(1));
    let row = b.view().insert_axis(Axis(0));
    column.dot(&row)
}
