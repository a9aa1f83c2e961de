//! Command implementations for Marginalia CLI

pub mod adapters;
pub mod generate;
pub mod init_model;
pub mod regenerate;
pub mod train;

use anyhow::{Context, Result};
use async_trait::async_trait;
use marginalia_core::config::EngineConfig;
use marginalia_core::model::LanguageModel;
use marginalia_core::{ModelRegistry, PersonalizationEngine};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Trait for CLI command execution
#[async_trait]
pub trait Command {
    /// Execute the command
    async fn execute(&self, config: &crate::config::Config, json_output: bool) -> Result<()>;
}

/// Load the model directory and build an engine around it
pub(crate) fn open_engine(engine_config: EngineConfig, model_dir: &Path) -> Result<PersonalizationEngine> {
    let registry = Arc::new(ModelRegistry::new());
    let pair = registry
        .load(model_dir)
        .with_context(|| format!("Failed to load model from {}", model_dir.display()))?;
    info!("Using base model '{}'", pair.model.name());

    PersonalizationEngine::new(engine_config, registry).context("Failed to start engine")
}
