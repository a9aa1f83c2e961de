//! Base model and tokenizer lifecycle
//!
//! The registry owns the one shared base model/tokenizer pair. Components
//! receive the registry by reference and ask it for the pair per request, so
//! loading and unloading are explicit calls rather than import-time effects.

use parking_lot::RwLock;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::model::{LanguageModel, NoteModel};
use crate::tokenizer::{Tokenizer, WordTokenizer};
use crate::{CoreError, Result};

/// Tokenizer file stored next to the model weights
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// A base model together with the tokenizer it was built with
#[derive(Clone)]
pub struct ModelPair {
    pub model: Arc<NoteModel>,
    pub tokenizer: Arc<dyn Tokenizer>,
    /// Directory the pair was loaded from, if any
    pub source: Option<PathBuf>,
}

impl ModelPair {
    /// Pair a model with a tokenizer, checking that their vocabularies agree
    pub fn new(model: Arc<NoteModel>, tokenizer: Arc<dyn Tokenizer>) -> Result<Self> {
        if model.vocab_size() != tokenizer.vocab_size() {
            return Err(CoreError::model_unavailable(
                "MODEL_TOKENIZER_MISMATCH",
                format!(
                    "Model '{}' has {} tokens, tokenizer has {}",
                    model.name(),
                    model.vocab_size(),
                    tokenizer.vocab_size()
                ),
                "Load the tokenizer that was saved with the model",
            ));
        }
        Ok(Self {
            model,
            tokenizer,
            source: None,
        })
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.model.name().to_string(),
            vocab_size: self.model.vocab_size(),
            hidden_size: self.model.hidden_size(),
            source: self.source.clone(),
        }
    }
}

/// Summary of the loaded base model
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub source: Option<PathBuf>,
}

/// Holder of the shared base model/tokenizer pair
#[derive(Default)]
pub struct ModelRegistry {
    loaded: RwLock<Option<ModelPair>>,
}

impl ModelRegistry {
    /// Empty registry; [`ModelRegistry::pair`] fails until something is loaded
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the model directory written by [`save_model_dir`] and make it current
    pub fn load(&self, dir: &Path) -> Result<ModelPair> {
        let model = NoteModel::load(dir)?;
        let tokenizer = WordTokenizer::from_file(&dir.join(TOKENIZER_FILE))?;

        let mut pair = ModelPair::new(Arc::new(model), Arc::new(tokenizer))?;
        pair.source = Some(dir.to_path_buf());
        self.replace(pair.clone());
        Ok(pair)
    }

    /// Install an in-memory pair
    pub fn install(&self, model: Arc<NoteModel>, tokenizer: Arc<dyn Tokenizer>) -> Result<ModelPair> {
        let pair = ModelPair::new(model, tokenizer)?;
        self.replace(pair.clone());
        Ok(pair)
    }

    /// Drop the current pair; in-flight decodes keep their own references
    pub fn unload(&self) -> bool {
        let previous = self.loaded.write().take();
        if let Some(pair) = &previous {
            info!("Unloaded base model '{}'", pair.model.name());
        }
        previous.is_some()
    }

    /// The current pair, or `ModelUnavailable`
    pub fn pair(&self) -> Result<ModelPair> {
        self.loaded.read().clone().ok_or_else(|| {
            CoreError::model_unavailable(
                "MODEL_NOT_LOADED",
                "No base model is loaded",
                "Load a model directory or install a model before generating",
            )
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.read().is_some()
    }

    pub fn info(&self) -> Option<ModelInfo> {
        self.loaded.read().as_ref().map(ModelPair::info)
    }

    fn replace(&self, pair: ModelPair) {
        info!(
            "Loaded base model '{}' ({} tokens, hidden {})",
            pair.model.name(),
            pair.model.vocab_size(),
            pair.model.hidden_size()
        );
        *self.loaded.write() = Some(pair);
    }
}

/// Write a model directory: weights, config and tokenizer
pub fn save_model_dir(dir: &Path, model: &NoteModel, tokenizer: &WordTokenizer) -> Result<()> {
    if model.vocab_size() != tokenizer.vocab_size() {
        return Err(CoreError::invalid_parameter(
            "MODEL_TOKENIZER_MISMATCH",
            format!(
                "Model has {} tokens, tokenizer has {}",
                model.vocab_size(),
                tokenizer.vocab_size()
            ),
            "Build the model from the tokenizer's vocabulary size",
        ));
    }
    model.save(dir)?;
    tokenizer.save(&dir.join(TOKENIZER_FILE))
}
