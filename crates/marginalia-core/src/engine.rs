//! Personalization engine: the inbound surface of the core
//!
//! Wires the model registry, adapter store, trainer and feedback policy to the
//! application's note and feedback repositories. Decoding and training are
//! blocking work and always run on tokio's blocking pool.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::adapter::AdapterStore;
use crate::config::EngineConfig;
use crate::feedback::{
    FeedbackLabel, FeedbackRecord, FeedbackRepository, InMemoryFeedbackRepository, InMemoryNoteRepository, NewNote,
    Note, NoteRepository, TrainingExample,
};
use crate::generation::{Decoder, FinishReason, GenerationRequest, GenerationResult, SpawnedStream};
use crate::model::{ModelHandle, ModelKind};
use crate::policy::{FeedbackPolicy, PolicyAction, ReplayEntry, ReplayStats, StateSnapshot};
use crate::prompt;
use crate::registry::{ModelPair, ModelRegistry};
use crate::trainer::{AdapterTrainer, TrainingReport};
use crate::{CoreError, NoteId, Result, UserId};

/// External text-in/text-out service producing non-personalized initial notes.
///
/// Transient failures are for the implementation to retry; the engine calls
/// it once.
#[async_trait]
pub trait NoteInitializer: Send + Sync {
    async fn initial_note(&self, content: &str) -> Result<String>;
}

/// Result of a regeneration attempt.
///
/// On failure `text` is the prior note, unchanged, and `error` says why.
#[derive(Debug)]
pub struct RegenerationOutcome {
    pub text: String,
    pub note_id: Option<NoteId>,
    pub model_kind: Option<ModelKind>,
    pub action: Option<PolicyAction>,
    pub finish_reason: Option<FinishReason>,
    /// Policy state the new note was produced in
    pub state: Option<StateSnapshot>,
    pub error: Option<CoreError>,
}

impl RegenerationOutcome {
    fn fallback(prior: &str, error: CoreError) -> Self {
        Self {
            text: prior.to_string(),
            note_id: None,
            model_kind: None,
            action: None,
            finish_reason: None,
            state: None,
            error: Some(error),
        }
    }

    /// Whether the prior note was returned instead of a new one
    pub fn is_fallback(&self) -> bool {
        self.error.is_some()
    }
}

/// What recording one piece of feedback caused
#[derive(Debug)]
pub struct FeedbackOutcome {
    pub record: FeedbackRecord,
    /// Replacement note, produced for dislikes
    pub regenerated: Option<RegenerationOutcome>,
    /// Periodic replay pass triggered by this feedback
    pub replay: Option<ReplayStats>,
    /// Automatic training pass triggered by this feedback
    pub training: Option<TrainingReport>,
}

/// Generation-and-adaptation engine
pub struct PersonalizationEngine {
    config: EngineConfig,
    registry: Arc<ModelRegistry>,
    store: Arc<AdapterStore>,
    trainer: Arc<AdapterTrainer>,
    policy: Arc<FeedbackPolicy>,
    notes: Arc<dyn NoteRepository>,
    feedback: Arc<dyn FeedbackRepository>,
    initializer: Option<Arc<dyn NoteInitializer>>,
}

impl PersonalizationEngine {
    /// Create an engine backed by in-memory repositories
    pub fn new(config: EngineConfig, registry: Arc<ModelRegistry>) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(AdapterStore::new(&config.adapters));
        let trainer = Arc::new(AdapterTrainer::new(config.trainer.clone(), Arc::clone(&store)));
        let policy = Arc::new(FeedbackPolicy::new(&config.policy));

        Ok(Self {
            config,
            registry,
            store,
            trainer,
            policy,
            notes: Arc::new(InMemoryNoteRepository::new()),
            feedback: Arc::new(InMemoryFeedbackRepository::new()),
            initializer: None,
        })
    }

    /// Use the application's repositories
    pub fn with_repositories(mut self, notes: Arc<dyn NoteRepository>, feedback: Arc<dyn FeedbackRepository>) -> Self {
        self.notes = notes;
        self.feedback = feedback;
        self
    }

    /// Delegate initial notes to an external service
    pub fn with_initializer(mut self, initializer: Arc<dyn NoteInitializer>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<AdapterStore> {
        &self.store
    }

    pub fn trainer(&self) -> &Arc<AdapterTrainer> {
        &self.trainer
    }

    pub fn policy(&self) -> &Arc<FeedbackPolicy> {
        &self.policy
    }

    /// Pick the model for a request: the user's adapter if stored, else the base
    pub fn resolve_model(&self, user_id: Option<UserId>, pair: &ModelPair) -> Result<ModelHandle> {
        let base = ModelHandle::base(pair.model.clone());
        let handle = match user_id {
            None => base,
            Some(user_id) => {
                let loaded = self
                    .store
                    .with_storage_retry(|| self.store.try_load(user_id, Arc::clone(&pair.model)));
                match loaded {
                    Ok(Some(adapted)) => ModelHandle::adapted(adapted),
                    Ok(None) => {
                        debug!("No adapter for user {}, using base model", user_id);
                        base
                    }
                    Err(e) if e.code() == "ADAPTER_BASE_MISMATCH" => {
                        warn!("Ignoring stale adapter for user {}: {}", user_id, e);
                        base
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        if let Some(owner) = handle.user_id() {
            if Some(owner) != user_id {
                return Err(CoreError::internal(
                    "ADAPTER_OWNER_MISMATCH",
                    format!("Resolved adapter of user {} for user {:?}", owner, user_id),
                ));
            }
        }

        Ok(if self.config.policy.enabled {
            handle.reinforce(Arc::clone(&self.policy))
        } else {
            handle
        })
    }

    fn decoder(&self, pair: &ModelPair) -> Decoder {
        Decoder::new(Arc::clone(&pair.tokenizer))
            .with_stream_buffer(self.config.generation.stream_buffer)
            .with_token_tracing(self.config.logging.trace_tokens)
    }

    fn request(&self, prompt: String, handle: ModelHandle) -> Result<GenerationRequest> {
        let defaults = &self.config.generation;
        GenerationRequest::new(prompt, defaults.max_tokens, defaults.temperature, handle)?
            .with_seed(defaults.seed)
            .with_top_k(defaults.top_k)
            .with_top_p(defaults.top_p)
    }

    /// Produce a non-personalized note for `content`
    pub async fn generate_initial_note(&self, content: &str) -> Result<String> {
        require_content(content)?;

        if let Some(initializer) = &self.initializer {
            debug!("Delegating initial note to external initializer");
            return initializer.initial_note(content).await;
        }

        let pair = self.registry.pair()?;
        let handle = ModelHandle::base(pair.model.clone());
        let request = self.request(prompt::note_prompt(content), handle)?;
        let decoder = self.decoder(&pair);

        let result = run_blocking(move || decoder.generate(&request)).await?;
        complete_text(result).map(|(text, _)| text)
    }

    /// Generate an initial note and store it so feedback can refer to it
    pub async fn create_note(&self, user_id: Option<UserId>, content: &str) -> Result<Note> {
        let text = self.generate_initial_note(content).await?;
        let id = self
            .notes
            .insert(NewNote {
                user_id,
                content: content.to_string(),
                text,
                model_kind: ModelKind::Base,
                action: None,
                state: None,
            })
            .await?;
        self.notes
            .get(id)
            .await?
            .ok_or_else(|| CoreError::internal("NOTE_MISSING_AFTER_INSERT", format!("Note {} vanished", id)))
    }

    /// Stream a note for `content`, personalized when `user_id` has an adapter
    pub fn stream_note(&self, user_id: Option<UserId>, content: &str) -> Result<SpawnedStream> {
        require_content(content)?;
        let pair = self.registry.pair()?;
        let handle = self.resolve_model(user_id, &pair)?;
        let request = self.request(prompt::note_prompt(content), handle)?;
        self.decoder(&pair).spawn_stream(&request)
    }

    /// Replace a rejected note. Never fails: on error the prior text comes back
    pub async fn regenerate_note(&self, user_id: UserId, content: &str, prior_note: &str) -> RegenerationOutcome {
        match self.try_regenerate(user_id, content, prior_note).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Regeneration for user {} failed, keeping prior note: {}", user_id, e);
                RegenerationOutcome::fallback(prior_note, e)
            }
        }
    }

    async fn try_regenerate(&self, user_id: UserId, content: &str, prior_note: &str) -> Result<RegenerationOutcome> {
        require_content(content)?;
        let pair = self.registry.pair()?;
        let handle = self.resolve_model(Some(user_id), &pair)?;
        let model_kind = handle.kind();
        let state = self.policy.observe(content, prior_note, FeedbackLabel::Dislike.as_str());

        let request = self.request(prompt::regeneration_prompt(content, prior_note), handle.clone())?;
        let decoder = self.decoder(&pair);
        let policy = handle.policy().cloned();
        let decision_state = state.clone();

        let (action, result) = run_blocking(move || match policy {
            Some(policy) => {
                let (action, result) = policy.act(&decision_state, &decoder, request)?;
                Ok((Some(action), result))
            }
            None => Ok((None, decoder.generate(&request)?)),
        })
        .await?;

        let (text, finish_reason) = complete_text(result)?;
        let note_id = self
            .notes
            .insert(NewNote {
                user_id: Some(user_id),
                content: content.to_string(),
                text: text.clone(),
                model_kind,
                action,
                state: Some(state.clone()),
            })
            .await?;

        info!(
            "Regenerated note {} for user {} with {} model ({:?})",
            note_id, user_id, model_kind, action
        );
        Ok(RegenerationOutcome {
            text,
            note_id: Some(note_id),
            model_kind: Some(model_kind),
            action,
            finish_reason: Some(finish_reason),
            state: Some(state),
            error: None,
        })
    }

    /// Record a like or dislike on a stored note.
    ///
    /// A dislike regenerates a replacement. When the note came from a policy
    /// decision, the outcome is remembered for replay with reward +1 or -1.
    pub async fn record_feedback(&self, user_id: UserId, note_id: NoteId, like: bool) -> Result<FeedbackOutcome> {
        let note = self.notes.get(note_id).await?.ok_or_else(|| {
            CoreError::invalid_named(
                "FEEDBACK_UNKNOWN_NOTE",
                "note_id",
                format!("Note {} does not exist", note_id),
                "Send feedback only for notes returned by the engine",
            )
        })?;
        if let Some(owner) = note.user_id {
            if owner != user_id {
                return Err(CoreError::invalid_named(
                    "FEEDBACK_FOREIGN_NOTE",
                    "note_id",
                    format!("Note {} belongs to user {}, not user {}", note_id, owner, user_id),
                    "Users can only give feedback on their own notes",
                ));
            }
        }

        let label = FeedbackLabel::from_like(like);
        let record = FeedbackRecord {
            user_id,
            note_id,
            prompt: note.content.clone(),
            response: note.text.clone(),
            label,
            timestamp: Utc::now(),
        };
        self.feedback.append(record.clone()).await?;
        debug!("Recorded {} on note {} for user {}", label.as_str(), note_id, user_id);

        let regenerated = match label {
            FeedbackLabel::Dislike => Some(self.regenerate_note(user_id, &note.content, &note.text).await),
            FeedbackLabel::Like => None,
        };

        let replay = match (note.state, note.action) {
            (Some(state), Some(action)) => {
                let next_state = regenerated.as_ref().and_then(|r| r.state.clone());
                self.policy
                    .remember(ReplayEntry::new(state, action, label.reward(), next_state))
            }
            _ => None,
        };

        let training = match (label, self.config.adapters.auto_train_after_likes) {
            (FeedbackLabel::Like, Some(threshold)) => self.maybe_auto_train(user_id, threshold).await,
            _ => None,
        };

        Ok(FeedbackOutcome {
            record,
            regenerated,
            replay,
            training,
        })
    }

    async fn maybe_auto_train(&self, user_id: UserId, threshold: usize) -> Option<TrainingReport> {
        let likes = match self.feedback.pending(user_id).await {
            Ok(pending) => pending.iter().filter(|r| r.label == FeedbackLabel::Like).count(),
            Err(e) => {
                warn!("Could not count pending feedback for user {}: {}", user_id, e);
                return None;
            }
        };
        if likes < threshold {
            return None;
        }

        match self.train_pending(user_id).await {
            Ok(report) => Some(report),
            Err(CoreError::TrainingInProgress { .. }) => {
                debug!("Training already running for user {}", user_id);
                None
            }
            Err(e) => {
                warn!("Automatic training for user {} failed: {}", user_id, e);
                None
            }
        }
    }

    /// The user's pending feedback as training examples, oldest first
    pub async fn pending_examples(&self, user_id: UserId) -> Result<Vec<TrainingExample>> {
        let pending = self.feedback.pending(user_id).await?;
        Ok(pending.iter().map(TrainingExample::from).collect())
    }

    /// Train on the user's pending feedback
    pub async fn train_pending(&self, user_id: UserId) -> Result<TrainingReport> {
        let examples = self.pending_examples(user_id).await?;
        self.train_from_accumulated_feedback(user_id, examples).await
    }

    /// Train and save a new adapter for `user_id`, then clear the feedback it consumed.
    ///
    /// `EmptyDataset`, `TrainingDiverged` and `TrainingInProgress` leave the
    /// previous adapter and the pending feedback untouched.
    pub async fn train_from_accumulated_feedback(
        &self,
        user_id: UserId,
        examples: Vec<TrainingExample>,
    ) -> Result<TrainingReport> {
        let pair = self.registry.pair()?;
        let consumed = self.feedback.pending(user_id).await?.len();
        let trainer = Arc::clone(&self.trainer);

        let report = run_blocking(move || trainer.train(&pair, user_id, &examples)).await?;

        let cleared = self.feedback.clear(user_id, consumed).await?;
        info!(
            "Adapter v{} ready for user {}; cleared {} feedback records",
            report.version, user_id, cleared
        );
        Ok(report)
    }
}

fn require_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(CoreError::invalid_named(
            "NOTE_EMPTY_CONTENT",
            "content",
            "Content must not be empty",
            "Provide the source text the note should cover",
        ));
    }
    Ok(())
}

/// Trimmed text of a finished generation; an empty response is an error
fn complete_text(result: GenerationResult) -> Result<(String, FinishReason)> {
    let text = result.text.trim().to_string();
    if text.is_empty() {
        return Err(CoreError::internal(
            "GENERATION_EMPTY",
            format!("Model produced no text ({:?})", result.finish_reason),
        ));
    }
    Ok((text, result.finish_reason))
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CoreError::internal("BLOCKING_TASK_FAILED", e.to_string()))?
}
