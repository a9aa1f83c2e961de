//! Build a base model and tokenizer from a plain-text corpus

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Args;
use serde_json::json;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::commands::Command;
use crate::config::Config;
use crate::utils::{create_spinner, print_output, print_success};

use marginalia_core::model::{ModelConfig, NoteModel};
use marginalia_core::registry::save_model_dir;
use marginalia_core::tokenizer::{Tokenizer, WordTokenizer};

#[derive(Args, Debug)]
pub struct InitModelCommand {
    /// Corpus file, one passage per line
    #[arg(long)]
    pub corpus: PathBuf,

    /// Output model directory
    #[arg(short, long)]
    pub out: PathBuf,

    /// Model name recorded in the config and in every adapter trained on it
    #[arg(long, default_value = "marginalia-base")]
    pub name: String,

    /// Hidden size
    #[arg(long, default_value = "64")]
    pub hidden: usize,

    /// Maximum vocabulary size, special tokens included
    #[arg(long, default_value = "4096")]
    pub vocab: usize,

    /// Passes over the corpus when fitting the output head
    #[arg(long, default_value = "10")]
    pub epochs: usize,

    /// Learning rate for fitting the output head
    #[arg(long, default_value = "0.05")]
    pub learning_rate: f32,

    /// Seed for weight initialization
    #[arg(long, default_value = "0")]
    pub seed: u64,
}

#[async_trait]
impl Command for InitModelCommand {
    async fn execute(&self, _config: &Config, json_output: bool) -> Result<()> {
        debug!("Executing init-model command: {:?}", self);

        let content = std::fs::read_to_string(&self.corpus)
            .with_context(|| format!("Failed to read corpus: {}", self.corpus.display()))?;
        let passages: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if passages.is_empty() {
            bail!("Corpus {} has no text", self.corpus.display());
        }

        let tokenizer = WordTokenizer::from_corpus(passages.iter().map(String::as_str), self.vocab)
            .context("Failed to build vocabulary")?;
        info!("Built vocabulary of {} tokens from {} passages", tokenizer.vocab_size(), passages.len());

        let sequences = passages
            .iter()
            .map(|p| tokenizer.encode_with_special_tokens(p, true, true))
            .collect::<marginalia_core::Result<Vec<_>>>()
            .context("Failed to tokenize corpus")?;

        let model_config = ModelConfig::new(self.name.clone(), tokenizer.vocab_size(), self.hidden);
        let mut model = NoteModel::random(model_config, self.seed).context("Invalid model settings")?;

        let spinner = create_spinner("Fitting output head...", json_output);
        let (epochs, learning_rate) = (self.epochs, self.learning_rate);
        let (model, loss) = tokio::task::spawn_blocking(move || {
            let loss = model.fit_head(&sequences, epochs, learning_rate)?;
            Ok::<_, marginalia_core::CoreError>((model, loss))
        })
        .await
        .context("Fitting task panicked")??;
        spinner.finish_and_clear();

        save_model_dir(&self.out, &model, &tokenizer)
            .with_context(|| format!("Failed to write model to {}", self.out.display()))?;

        if !json_output {
            print_success(&format!("Model written to {}", self.out.display()));
        }
        let summary = json!({
            "name": self.name,
            "path": self.out,
            "vocab_size": tokenizer.vocab_size(),
            "hidden_size": self.hidden,
            "passages": passages.len(),
            "final_loss": loss,
        });
        print_output(&summary, json_output)
    }
}
