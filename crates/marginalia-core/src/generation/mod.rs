//! Generation requests, results and the decoding loop

pub mod decoder;
pub mod sampling;

use serde::{Deserialize, Serialize};

use crate::model::{ModelHandle, ModelKind};
use crate::{CoreError, Result};

pub use decoder::{Decoder, SpawnedStream, TokenStream};
pub use sampling::Sampler;

/// Smallest temperature the sampler divides by; zero, negative and NaN
/// temperatures are clamped up to it
pub const TEMPERATURE_FLOOR: f32 = 1e-8;

/// How the next token is chosen from the logits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeMode {
    /// Categorical draw from the temperature-scaled distribution
    #[default]
    Sample,
    /// Always take the highest logit
    Greedy,
}

/// A validated generation request, immutable once built
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    prompt: String,
    max_tokens: usize,
    temperature: f32,
    model: ModelHandle,
    mode: DecodeMode,
    seed: Option<u64>,
    top_k: usize,
    top_p: f32,
}

impl GenerationRequest {
    /// Validate and build a request.
    ///
    /// Fails with `InvalidParameter` when `max_tokens` is 0. The temperature is
    /// clamped to [`TEMPERATURE_FLOOR`] instead of being rejected.
    pub fn new<S: Into<String>>(prompt: S, max_tokens: usize, temperature: f32, model: ModelHandle) -> Result<Self> {
        if max_tokens == 0 {
            return Err(CoreError::invalid_named(
                "GENERATION_MAX_TOKENS_ZERO",
                "max_tokens",
                "max_tokens must be greater than 0",
                "Request at least one token",
            ));
        }

        Ok(Self {
            prompt: prompt.into(),
            max_tokens,
            temperature: clamp_temperature(temperature),
            model,
            mode: DecodeMode::Sample,
            seed: None,
            top_k: 0,
            top_p: 1.0,
        })
    }

    pub fn with_mode(mut self, mode: DecodeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Seed the sampler so sampling-mode output is reproducible
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Keep only the `k` highest logits before sampling; 0 disables
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Nucleus filtering threshold in (0, 1]; 1.0 disables
    pub fn with_top_p(mut self, top_p: f32) -> Result<Self> {
        if !(top_p > 0.0 && top_p <= 1.0) {
            return Err(CoreError::invalid_named(
                "GENERATION_TOP_P_RANGE",
                "top_p",
                format!("top_p must be within (0, 1], got {}", top_p),
                "Use 1.0 to disable nucleus filtering",
            ));
        }
        self.top_p = top_p;
        Ok(self)
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Effective temperature, already clamped
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn top_p(&self) -> f32 {
        self.top_p
    }
}

fn clamp_temperature(temperature: f32) -> f32 {
    if temperature.is_nan() {
        TEMPERATURE_FLOOR
    } else {
        temperature.max(TEMPERATURE_FLOOR)
    }
}

/// One generated token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: u32,
    /// Decoded fragment; concatenating fragments in order forms the response
    pub text: String,
}

/// Reason why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Reached max_tokens limit
    MaxTokens,

    /// End of sequence token generated
    EndOfSequence,

    /// The consumer stopped reading
    Cancelled,

    /// Error during generation
    Error,
}

/// Result of a completed generation
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    /// Generated text
    pub text: String,

    /// Generated token ids, without the end-of-sequence token
    pub tokens: Vec<u32>,

    /// Reason generation stopped
    pub finish_reason: FinishReason,

    pub mode: DecodeMode,

    pub model_kind: ModelKind,

    /// Generation statistics
    pub stats: GenerationStats,
}

/// Statistics about the generation process
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationStats {
    pub prompt_tokens: usize,

    pub tokens_generated: usize,

    /// Time to first token (ms)
    pub time_to_first_token_ms: f64,

    /// Total generation time (ms)
    pub total_time_ms: f64,

    /// Tokens per second
    pub tokens_per_second: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelConfig, NoteModel};
    use std::sync::Arc;

    fn handle() -> ModelHandle {
        ModelHandle::base(Arc::new(NoteModel::random(ModelConfig::new("t", 8, 4), 1).unwrap()))
    }

    #[test]
    fn test_zero_max_tokens_rejected() {
        let err = GenerationRequest::new("hi", 0, 0.7, handle()).unwrap_err();
        assert_eq!(err.code(), "GENERATION_MAX_TOKENS_ZERO");
    }

    #[test]
    fn test_temperature_is_clamped() {
        for t in [0.0, -1.0, f32::NAN, 1e-12] {
            let request = GenerationRequest::new("hi", 5, t, handle()).unwrap();
            assert_eq!(request.temperature(), TEMPERATURE_FLOOR);
        }
        let request = GenerationRequest::new("hi", 5, 0.7, handle()).unwrap();
        assert_eq!(request.temperature(), 0.7);
    }

    #[test]
    fn test_top_p_range() {
        assert!(GenerationRequest::new("hi", 5, 0.7, handle()).unwrap().with_top_p(0.0).is_err());
        assert!(GenerationRequest::new("hi", 5, 0.7, handle()).unwrap().with_top_p(0.9).is_ok());
    }
}
