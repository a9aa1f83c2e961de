//! Inspect the adapter store

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Subcommand};
use serde_json::json;
use tracing::debug;

use crate::commands::Command;
use crate::config::Config;
use crate::utils::{format_bytes, print_output};

use marginalia_core::adapter::AdapterStore;
use marginalia_core::UserId;

#[derive(Args, Debug)]
pub struct AdaptersCommand {
    #[command(subcommand)]
    pub action: AdaptersAction,
}

#[derive(Subcommand, Debug)]
pub enum AdaptersAction {
    /// List users that have an adapter
    List,

    /// Show one user's current adapter
    Info {
        /// User to inspect
        #[arg(short, long)]
        user: UserId,
    },
}

#[async_trait]
impl Command for AdaptersCommand {
    async fn execute(&self, config: &Config, json_output: bool) -> Result<()> {
        debug!("Executing adapters command: {:?}", self);
        let store = AdapterStore::new(&config.engine.adapters);

        match &self.action {
            AdaptersAction::List => {
                let mut users = Vec::new();
                for user in store.list_users()? {
                    let version = store.current_version(user)?;
                    let size = store.bundle_size_bytes(user)?;
                    users.push(json!({
                        "user_id": user,
                        "version": version,
                        "size": if json_output { json!(size) } else { json!(format_bytes(size)) },
                    }));
                }
                let listing = json!({
                    "root": store.root(),
                    "count": users.len(),
                    "adapters": users,
                });
                print_output(&listing, json_output)
            }
            AdaptersAction::Info { user } => {
                let bundle = store
                    .load_bundle(*user)
                    .with_context(|| format!("No usable adapter for user {}", user))?;
                let meta = bundle.meta();
                let size = store.bundle_size_bytes(*user)?;

                let info = json!({
                    "user_id": meta.user_id,
                    "version": meta.version,
                    "versions_on_disk": store.versions(*user)?,
                    "base_model": meta.base_model,
                    "rank": meta.rank,
                    "alpha": meta.alpha,
                    "hidden_size": meta.hidden_size,
                    "vocab_size": meta.vocab_size,
                    "parameters": bundle.param_count(),
                    "size": if json_output { json!(size) } else { json!(format_bytes(size)) },
                    "train_steps": meta.train_steps,
                    "examples": meta.examples,
                    "final_loss": meta.final_loss,
                    "created_at": meta.created_at.to_rfc3339(),
                    "path": store.path_for(*user),
                });
                print_output(&info, json_output)
            }
        }
    }
}
