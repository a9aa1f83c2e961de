//! Generate a note, personalized when the user has an adapter

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Args;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;

use crate::commands::{open_engine, Command};
use crate::config::Config;
use crate::utils::{format_millis, print_output};

use marginalia_core::UserId;

#[derive(Args, Debug)]
pub struct GenerateCommand {
    /// Model directory (defaults to the configured model)
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Content to write a note about
    #[arg(long, conflicts_with = "file")]
    pub content: Option<String>,

    /// Read the content from a file instead
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// User whose adapter should be applied
    #[arg(short, long)]
    pub user: Option<UserId>,

    /// Maximum number of tokens to generate
    #[arg(long)]
    pub max_tokens: Option<usize>,

    /// Temperature for sampling
    #[arg(short, long)]
    pub temperature: Option<f32>,

    /// Seed for reproducible sampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Print tokens as they are produced
    #[arg(long)]
    pub stream: bool,
}

impl GenerateCommand {
    fn content(&self) -> Result<String> {
        match (&self.content, &self.file) {
            (Some(content), _) => Ok(content.clone()),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read content file: {}", path.display())),
            (None, None) => bail!("Pass either --content or --file"),
        }
    }
}

#[async_trait]
impl Command for GenerateCommand {
    async fn execute(&self, config: &Config, json_output: bool) -> Result<()> {
        debug!("Executing generate command: {:?}", self);

        let content = self.content()?;
        let model_dir = config.model_dir(self.model.as_deref())?;

        let mut engine_config = config.engine.clone();
        if let Some(max_tokens) = self.max_tokens {
            engine_config.generation.max_tokens = max_tokens;
        }
        if let Some(temperature) = self.temperature {
            engine_config.generation.temperature = temperature;
        }
        if self.seed.is_some() {
            engine_config.generation.seed = self.seed;
        }
        let engine = open_engine(engine_config, &model_dir)?;

        let start = Instant::now();
        let live = self.stream && !json_output;
        let mut stream = engine.stream_note(self.user, &content)?;
        let mut text = String::new();
        let mut tokens = 0usize;

        while let Some(token) = stream.recv().await {
            let token = token?;
            if live {
                print!("{}", token.text);
                std::io::stdout().flush()?;
            }
            text.push_str(&token.text);
            tokens += 1;
        }
        let finish_reason = stream.finish().await?;
        if live {
            println!();
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        if json_output {
            let result = json!({
                "text": text.trim(),
                "tokens": tokens,
                "finish_reason": finish_reason,
                "user_id": self.user,
                "elapsed_ms": elapsed_ms,
            });
            print_output(&result, true)?;
        } else if !live {
            println!("{}", text.trim());
        }
        debug!("Generated {} tokens in {}", tokens, format_millis(elapsed_ms));

        Ok(())
    }
}
