//! Replace a rejected note

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use serde_json::json;
use std::path::PathBuf;
use tracing::debug;

use crate::commands::{open_engine, Command};
use crate::config::Config;
use crate::utils::{print_output, print_warning};

use marginalia_core::UserId;

#[derive(Args, Debug)]
pub struct RegenerateCommand {
    /// Model directory (defaults to the configured model)
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// User who rejected the note
    #[arg(short, long)]
    pub user: UserId,

    /// Content the note was written for
    #[arg(long)]
    pub content: String,

    /// The rejected note
    #[arg(long)]
    pub prior: String,
}

#[async_trait]
impl Command for RegenerateCommand {
    async fn execute(&self, config: &Config, json_output: bool) -> Result<()> {
        debug!("Executing regenerate command: {:?}", self);

        let model_dir = config.model_dir(self.model.as_deref())?;
        let engine = open_engine(config.engine.clone(), &model_dir)?;

        let outcome = engine.regenerate_note(self.user, &self.content, &self.prior).await;
        if let Some(error) = &outcome.error {
            if !json_output {
                print_warning(&format!("Kept the prior note: {}", error));
            }
        }

        if json_output {
            let result = json!({
                "text": outcome.text,
                "fallback": outcome.is_fallback(),
                "model_kind": outcome.model_kind,
                "action": outcome.action,
                "finish_reason": outcome.finish_reason,
                "error_code": outcome.error.as_ref().map(|e| e.code()),
            });
            print_output(&result, true)
        } else {
            println!("{}", outcome.text);
            Ok(())
        }
    }
}
