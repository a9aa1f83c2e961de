//! Marginalia Core - personalized note generation engine
//!
//! This crate provides the generation-and-adaptation core of Marginalia:
//! token-by-token decoding with incremental cache reuse, the per-user adapter
//! lifecycle (train, persist, discover, load, overlay) and the feedback loop
//! that regenerates rejected notes and learns from accept/reject signals.

// Module declarations
pub mod adapter;
pub mod config;
pub mod engine;
pub mod feedback;
pub mod generation;
pub mod model;
pub mod policy;
pub mod prompt;
pub mod registry;
pub mod tokenizer;
pub mod trainer;

use std::path::PathBuf;
use thiserror::Error;

/// Identifier of an end user. Adapters are scoped to exactly one of these.
pub type UserId = u64;

/// Identifier of a stored note.
pub type NoteId = u64;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad request shape; rejected immediately and never retried
    #[error("Invalid parameter [{code}]: {message}\nSuggestion: {suggestion}")]
    InvalidParameter {
        code: &'static str,
        message: String,
        suggestion: String,
        parameter_name: Option<String>,
    },

    /// No model/tokenizer pair is loaded
    #[error("Model unavailable [{code}]: {message}\nSuggestion: {suggestion}")]
    ModelUnavailable {
        code: &'static str,
        message: String,
        suggestion: String,
    },

    /// No adapter bundle is stored for the user; callers fall back to the base model
    #[error("Adapter not found [{code}]: no adapter stored for user {user_id}")]
    AdapterNotFound {
        code: &'static str,
        user_id: UserId,
        path: PathBuf,
    },

    /// I/O failure while saving or loading persisted state
    #[error("Storage error [{code}]: {message}\nPath: {path:?}")]
    Storage {
        code: &'static str,
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Training produced a non-finite loss or ran past its deadline
    #[error("Training diverged [{code}] for user {user_id}: {reason}")]
    TrainingDiverged {
        code: &'static str,
        user_id: UserId,
        reason: String,
        step: usize,
    },

    /// Nothing usable to train on
    #[error("Empty dataset [{code}] for user {user_id}: {message}")]
    EmptyDataset {
        code: &'static str,
        user_id: UserId,
        message: String,
    },

    /// Another training run already holds the user's lock
    #[error("Training in progress [{code}]: user {user_id} is already being trained")]
    TrainingInProgress { code: &'static str, user_id: UserId },

    /// Tokenizer construction or lookup errors
    #[error("Tokenizer error [{code}]: {message}\nSuggestion: {suggestion}")]
    Tokenizer {
        code: &'static str,
        message: String,
        suggestion: String,
    },

    /// Configuration parsing and validation errors
    #[error("Configuration error [{code}]: {message}\nSuggestion: {suggestion}")]
    Configuration {
        code: &'static str,
        message: String,
        suggestion: String,
        config_path: Option<PathBuf>,
    },

    /// Other unexpected errors
    #[error("Internal error [{code}]: {message}")]
    Internal {
        code: &'static str,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create an invalid parameter error
    pub fn invalid_parameter<S1, S2>(code: &'static str, message: S1, suggestion: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::InvalidParameter {
            code,
            message: message.into(),
            suggestion: suggestion.into(),
            parameter_name: None,
        }
    }

    /// Create an invalid parameter error naming the offending parameter
    pub fn invalid_named<S1, S2, S3>(
        code: &'static str,
        parameter: S1,
        message: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::InvalidParameter {
            code,
            message: message.into(),
            suggestion: suggestion.into(),
            parameter_name: Some(parameter.into()),
        }
    }

    /// Create a model unavailable error
    pub fn model_unavailable<S1, S2>(code: &'static str, message: S1, suggestion: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::ModelUnavailable {
            code,
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an adapter not found error
    pub fn adapter_not_found<P: Into<PathBuf>>(user_id: UserId, path: P) -> Self {
        Self::AdapterNotFound {
            code: "ADAPTER_NOT_FOUND",
            user_id,
            path: path.into(),
        }
    }

    /// Create a storage error wrapping an I/O failure at a known path
    pub fn storage<S, P>(code: &'static str, message: S, path: P, source: std::io::Error) -> Self
    where
        S: Into<String>,
        P: Into<PathBuf>,
    {
        Self::Storage {
            code,
            message: message.into(),
            path: Some(path.into()),
            source: Some(source),
        }
    }

    /// Create a storage error for malformed persisted data
    pub fn corrupt<S, P>(code: &'static str, message: S, path: P) -> Self
    where
        S: Into<String>,
        P: Into<PathBuf>,
    {
        Self::Storage {
            code,
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Create a training divergence error
    pub fn diverged<S: Into<String>>(code: &'static str, user_id: UserId, step: usize, reason: S) -> Self {
        Self::TrainingDiverged {
            code,
            user_id,
            reason: reason.into(),
            step,
        }
    }

    /// Create an empty dataset error
    pub fn empty_dataset<S: Into<String>>(user_id: UserId, message: S) -> Self {
        Self::EmptyDataset {
            code: "TRAINING_EMPTY_DATASET",
            user_id,
            message: message.into(),
        }
    }

    /// Create a training in progress error
    pub fn training_in_progress(user_id: UserId) -> Self {
        Self::TrainingInProgress {
            code: "TRAINING_IN_PROGRESS",
            user_id,
        }
    }

    /// Create a tokenizer error
    pub fn tokenizer<S1, S2>(code: &'static str, message: S1, suggestion: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::Tokenizer {
            code,
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S1, S2>(code: &'static str, message: S1, suggestion: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::Configuration {
            code,
            message: message.into(),
            suggestion: suggestion.into(),
            config_path: None,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(code: &'static str, message: S) -> Self {
        Self::Internal {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Get the error code for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParameter { code, .. } => code,
            Self::ModelUnavailable { code, .. } => code,
            Self::AdapterNotFound { code, .. } => code,
            Self::Storage { code, .. } => code,
            Self::TrainingDiverged { code, .. } => code,
            Self::EmptyDataset { code, .. } => code,
            Self::TrainingInProgress { code, .. } => code,
            Self::Tokenizer { code, .. } => code,
            Self::Configuration { code, .. } => code,
            Self::Internal { code, .. } => code,
        }
    }

    /// Storage failures are the only ones worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { source: Some(_), .. })
    }

    /// Whether the caller is expected to recover by falling back rather than failing
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::AdapterNotFound { .. })
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => "IO_FILE_NOT_FOUND",
            std::io::ErrorKind::PermissionDenied => "IO_PERMISSION_DENIED",
            std::io::ErrorKind::InvalidData => "IO_INVALID_DATA",
            _ => "IO_UNKNOWN",
        };

        Self::Storage {
            code,
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            code: "INTERNAL_UNKNOWN",
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        adapter::{AdapterBundle, AdapterMeta, AdapterStore},
        config::EngineConfig,
        engine::{FeedbackOutcome, NoteInitializer, PersonalizationEngine, RegenerationOutcome},
        feedback::{FeedbackLabel, FeedbackRecord, Note, TrainingExample},
        generation::{
            decoder::{Decoder, TokenStream},
            DecodeMode, FinishReason, GenerationRequest, GenerationResult, Token,
        },
        model::{handle::ModelHandle, DecodeCache, LanguageModel, NoteModel, StepOutput},
        policy::{FeedbackPolicy, PolicyAction, StateSnapshot},
        registry::{ModelPair, ModelRegistry},
        tokenizer::{Tokenizer, WordTokenizer},
        trainer::{AdapterTrainer, TrainingReport},
        CoreError, NoteId, Result, UserId,
    };
}

// Re-export key types at the crate root
pub use config::EngineConfig;
pub use engine::PersonalizationEngine;
pub use registry::ModelRegistry;

pub mod error {
    pub use super::{CoreError, Result};
}
