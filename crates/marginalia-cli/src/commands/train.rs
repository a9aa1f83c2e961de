//! Train a user's adapter from a JSON-lines feedback file
//!
//! Each line is one example:
//! `{"input": "Gravity", "output": "Gravity pulls masses together.", "label": "like"}`

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Args;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::commands::{open_engine, Command};
use crate::config::Config;
use crate::utils::{create_spinner, format_millis, print_output, print_success};

use marginalia_core::feedback::TrainingExample;
use marginalia_core::UserId;

#[derive(Args, Debug)]
pub struct TrainCommand {
    /// Model directory (defaults to the configured model)
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// User the adapter belongs to
    #[arg(short, long)]
    pub user: UserId,

    /// Feedback examples, one JSON object per line
    #[arg(short, long)]
    pub examples: PathBuf,

    /// Override the configured step budget
    #[arg(long)]
    pub steps: Option<usize>,
}

/// Parse a JSON-lines file of training examples, skipping blank lines
pub fn read_examples(path: &Path) -> Result<Vec<TrainingExample>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read examples file: {}", path.display()))?;

    let mut examples = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let example: TrainingExample = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid training example", path.display(), index + 1))?;
        examples.push(example);
    }

    if examples.is_empty() {
        bail!("No training examples in {}", path.display());
    }
    Ok(examples)
}

#[async_trait]
impl Command for TrainCommand {
    async fn execute(&self, config: &Config, json_output: bool) -> Result<()> {
        debug!("Executing train command: {:?}", self);

        let examples = read_examples(&self.examples)?;
        info!("Loaded {} examples for user {}", examples.len(), self.user);

        let model_dir = config.model_dir(self.model.as_deref())?;
        let mut engine_config = config.engine.clone();
        if let Some(steps) = self.steps {
            engine_config.trainer.max_steps = steps;
        }
        let engine = open_engine(engine_config, &model_dir)?;

        let spinner = create_spinner(&format!("Training adapter for user {}...", self.user), json_output);
        let result = engine.train_from_accumulated_feedback(self.user, examples).await;
        spinner.finish_and_clear();
        let report = result.with_context(|| format!("Training failed for user {}", self.user))?;

        if !json_output {
            print_success(&format!(
                "Adapter v{} for user {} saved in {}",
                report.version,
                self.user,
                format_millis(report.duration_ms)
            ));
        }
        print_output(&serde_json::to_value(&report)?, json_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marginalia_core::feedback::FeedbackLabel;

    #[test]
    fn test_read_examples_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("examples.jsonl");
        std::fs::write(
            &path,
            "{\"input\":\"Gravity\",\"output\":\"Masses attract.\",\"label\":\"like\"}\n\n\
             {\"input\":\"Tides\",\"output\":\"The moon.\",\"label\":\"dislike\"}\n",
        )
        .unwrap();

        let examples = read_examples(&path).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].label, FeedbackLabel::Like);
        assert_eq!(examples[1].input, "Tides");
    }

    #[test]
    fn test_read_examples_reports_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("examples.jsonl");
        std::fs::write(&path, "{\"input\":\"a\",\"output\":\"b\",\"label\":\"like\"}\nnot json\n").unwrap();

        let err = read_examples(&path).unwrap_err();
        assert!(format!("{:#}", err).contains(":2:"));
    }
}
