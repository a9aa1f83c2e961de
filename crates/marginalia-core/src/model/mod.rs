//! Model trait and implementations
//!
//! Models are driven one decode step at a time. Each step consumes only the
//! tokens that are not yet folded into the caller's [`DecodeCache`] and hands
//! back a new cache, so the full prefix is never recomputed.

pub mod adapted;
pub mod handle;
pub mod note_model;
pub mod weights;

use crate::Result;

pub use adapted::AdaptedModel;
pub use handle::{ModelHandle, ModelKind, ReinforcedModel};
pub use note_model::{ModelConfig, NoteModel};

/// Core trait for language models
pub trait LanguageModel: Send + Sync {
    /// Get the model name
    fn name(&self) -> &str;

    /// Get vocabulary size
    fn vocab_size(&self) -> usize;

    /// Run one incremental forward step.
    ///
    /// `input_ids` holds the tokens appended since the previous step (the
    /// whole prompt on the first step, when `cache` is `None`). Returns logits
    /// for the final position together with the cache that replaces `cache`.
    fn forward(&self, input_ids: &[u32], cache: Option<DecodeCache>) -> Result<StepOutput>;
}

/// Output from a single forward step
#[derive(Debug)]
pub struct StepOutput {
    /// Logits for the last position, one per vocabulary entry
    pub logits: Vec<f32>,

    /// Cache covering every position consumed so far
    pub cache: DecodeCache,
}

/// Per-decode incremental state returned by a model after each step.
///
/// The cache is deliberately not `Clone`: it moves from one step into the
/// next and is dropped with the decode that owns it.
#[derive(Debug)]
pub struct DecodeCache {
    state: Vec<f32>,
    positions: usize,
}

impl DecodeCache {
    /// Assemble a cache from model-specific state
    pub fn from_parts(state: Vec<f32>, positions: usize) -> Self {
        Self { state, positions }
    }

    /// Model-specific state
    pub fn state(&self) -> &[f32] {
        &self.state
    }

    /// Number of positions folded into this cache
    pub fn positions(&self) -> usize {
        self.positions
    }

    /// Take the state back for in-place update by the model
    pub fn into_parts(self) -> (Vec<f32>, usize) {
        (self.state, self.positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_cache_parts() {
        let cache = DecodeCache::from_parts(vec![1.0, 2.0], 3);
        assert_eq!(cache.positions(), 3);
        assert_eq!(cache.state(), &[1.0, 2.0]);

        let (state, positions) = cache.into_parts();
        assert_eq!(state.len(), 2);
        assert_eq!(positions, 3);
    }
}
