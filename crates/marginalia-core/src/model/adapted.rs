//! Base model with a user's adapter layered on top

use std::sync::Arc;

use super::{DecodeCache, LanguageModel, NoteModel, StepOutput};
use crate::adapter::AdapterBundle;
use crate::{CoreError, Result, UserId};

/// Read-only overlay of one user's adapter on the shared base model.
///
/// The base weights are never touched; the adapter only contributes a logit
/// delta, so any number of overlays can decode against one base concurrently.
#[derive(Debug, Clone)]
pub struct AdaptedModel {
    base: Arc<NoteModel>,
    adapter: Arc<AdapterBundle>,
    name: String,
}

impl AdaptedModel {
    /// Overlay `adapter` on `base` for `user_id`
    pub fn new(base: Arc<NoteModel>, adapter: Arc<AdapterBundle>, user_id: UserId) -> Result<Self> {
        let meta = adapter.meta();
        if meta.user_id != user_id {
            return Err(CoreError::invalid_named(
                "ADAPTER_OWNER_MISMATCH",
                "user_id",
                format!("Adapter belongs to user {}, requested for user {}", meta.user_id, user_id),
                "Load adapters only for the user they were trained for",
            ));
        }
        if meta.hidden_size != base.hidden_size() || meta.vocab_size != base.vocab_size() {
            return Err(CoreError::model_unavailable(
                "ADAPTER_BASE_MISMATCH",
                format!(
                    "Adapter expects hidden {} / vocab {}, base model has hidden {} / vocab {}",
                    meta.hidden_size,
                    meta.vocab_size,
                    base.hidden_size(),
                    base.vocab_size()
                ),
                "Retrain the adapter against the current base model",
            ));
        }
        if meta.base_model != base.name() {
            return Err(CoreError::model_unavailable(
                "ADAPTER_BASE_MISMATCH",
                format!(
                    "Adapter was trained on '{}', loaded base model is '{}'",
                    meta.base_model,
                    base.name()
                ),
                "Retrain the adapter against the current base model",
            ));
        }

        let name = format!("{}+user-{}-v{}", base.name(), user_id, adapter.version());
        Ok(Self { base, adapter, name })
    }

    /// The only user this overlay may serve
    pub fn user_id(&self) -> UserId {
        self.adapter.user_id()
    }

    pub fn adapter(&self) -> &Arc<AdapterBundle> {
        &self.adapter
    }

    pub fn base(&self) -> &Arc<NoteModel> {
        &self.base
    }
}

impl LanguageModel for AdaptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn vocab_size(&self) -> usize {
        self.base.vocab_size()
    }

    fn forward(&self, input_ids: &[u32], cache: Option<DecodeCache>) -> Result<StepOutput> {
        let (hidden, cache) = self.base.hidden_step(input_ids, cache)?;
        let logits = self.base.project(&hidden) + self.adapter.delta_logits(&hidden);
        Ok(StepOutput {
            logits: logits.to_vec(),
            cache,
        })
    }
}
