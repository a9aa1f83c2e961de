//! Per-user adapter training
//!
//! Fits a low-rank logit delta on top of the frozen base model from liked
//! (content, note) pairs. The base model's hidden states and logits are
//! computed once per example; only the adapter matrices are optimized, for a
//! fixed number of steps.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ndarray::{Array2, Axis};
use rayon::prelude::*;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterBundle, AdapterMeta, AdapterStore};
use crate::config::TrainerConfig;
use crate::feedback::{FeedbackLabel, TrainingExample};
use crate::model::{LanguageModel, NoteModel};
use crate::prompt;
use crate::registry::ModelPair;
use crate::tokenizer::Tokenizer;
use crate::{CoreError, Result, UserId};

/// Set of users with a training run in flight
#[derive(Debug, Clone, Default)]
pub struct TrainingLocks {
    active: Arc<DashMap<UserId, Instant>>,
}

impl TrainingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the user's lock, failing immediately if it is held
    pub fn acquire(&self, user_id: UserId) -> Result<TrainingGuard> {
        match self.active.entry(user_id) {
            Entry::Occupied(_) => Err(CoreError::training_in_progress(user_id)),
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Ok(TrainingGuard {
                    active: Arc::clone(&self.active),
                    user_id,
                })
            }
        }
    }

    pub fn is_training(&self, user_id: UserId) -> bool {
        self.active.contains_key(&user_id)
    }
}

/// Releases the user's training lock on drop
#[derive(Debug)]
pub struct TrainingGuard {
    active: Arc<DashMap<UserId, Instant>>,
    user_id: UserId,
}

impl Drop for TrainingGuard {
    fn drop(&mut self) {
        if let Some((_, started)) = self.active.remove(&self.user_id) {
            debug!("Released training lock for user {} after {:?}", self.user_id, started.elapsed());
        }
    }
}

/// Summary of a successful training run
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub user_id: UserId,
    pub version: u64,
    pub path: PathBuf,
    pub steps: usize,
    pub examples_used: usize,
    pub examples_skipped: usize,
    pub initial_loss: f32,
    pub final_loss: f32,
    pub warm_started: bool,
    pub duration_ms: u64,
    #[serde(skip)]
    pub bundle: Arc<AdapterBundle>,
}

/// Precomputed frozen-base activations for one example's response span
struct PreparedExample {
    /// (positions, hidden)
    hidden: Array2<f32>,
    /// (positions, vocab)
    base_logits: Array2<f32>,
    targets: Vec<usize>,
}

/// Result of the optimization loop, before persistence
struct Fitted {
    bundle: AdapterBundle,
    steps: usize,
    initial_loss: f32,
    final_loss: f32,
    warm_started: bool,
}

/// Trains and persists per-user adapters
pub struct AdapterTrainer {
    config: TrainerConfig,
    store: Arc<AdapterStore>,
    locks: TrainingLocks,
    deadline: Option<Duration>,
}

impl AdapterTrainer {
    pub fn new(config: TrainerConfig, store: Arc<AdapterStore>) -> Self {
        let deadline = config.deadline();
        Self {
            config,
            store,
            locks: TrainingLocks::new(),
            deadline,
        }
    }

    /// Override the configured deadline
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn locks(&self) -> &TrainingLocks {
        &self.locks
    }

    pub fn store(&self) -> &Arc<AdapterStore> {
        &self.store
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Train `user_id`'s adapter from `examples` and save it as the current version.
    ///
    /// Holds the user's training lock for the whole run. Nothing is written
    /// unless optimization finishes with finite weights inside the deadline.
    pub fn train(&self, pair: &ModelPair, user_id: UserId, examples: &[TrainingExample]) -> Result<TrainingReport> {
        let _guard = self.locks.acquire(user_id)?;
        let started = Instant::now();

        if examples.is_empty() {
            return Err(CoreError::empty_dataset(user_id, "No training examples supplied"));
        }
        let likes: Vec<&TrainingExample> = examples.iter().filter(|e| e.label == FeedbackLabel::Like).collect();
        let skipped = examples.len() - likes.len();
        if likes.is_empty() {
            return Err(CoreError::empty_dataset(
                user_id,
                format!("All {} examples are dislikes", examples.len()),
            ));
        }

        info!(
            "Training adapter for user {} on {} liked examples ({} dislikes skipped)",
            user_id,
            likes.len(),
            skipped
        );

        let prepared = self.prepare(pair, user_id, &likes)?;
        let fitted = self.fit(pair, user_id, &prepared, started)?;

        let saved = self
            .store
            .with_storage_retry(|| self.store.save(user_id, fitted.bundle.clone()))?;

        let report = TrainingReport {
            user_id,
            version: saved.version,
            path: saved.path,
            steps: fitted.steps,
            examples_used: likes.len(),
            examples_skipped: skipped,
            initial_loss: fitted.initial_loss,
            final_loss: fitted.final_loss,
            warm_started: fitted.warm_started,
            duration_ms: started.elapsed().as_millis() as u64,
            bundle: saved.bundle,
        };
        info!(
            "Trained adapter v{} for user {}: loss {:.4} -> {:.4} in {} steps",
            report.version, user_id, report.initial_loss, report.final_loss, report.steps
        );
        Ok(report)
    }

    fn prepare(&self, pair: &ModelPair, user_id: UserId, likes: &[&TrainingExample]) -> Result<Vec<PreparedExample>> {
        let eos = pair.tokenizer.eos_token_id().ok_or_else(|| {
            CoreError::tokenizer(
                "TOKENIZER_NO_EOS",
                "Training requires an end-of-sequence token",
                "Rebuild the tokenizer with default special tokens",
            )
        })?;

        let sequences = likes
            .iter()
            .map(|example| -> Result<(Vec<u32>, usize)> {
                let (prompt_text, response_text) = prompt::training_pair(&example.input, &example.output);
                let prompt_ids = pair.tokenizer.encode_with_special_tokens(&prompt_text, true, false)?;
                let mut response_ids = pair.tokenizer.encode(&response_text)?;
                response_ids.push(eos);
                Ok(truncate(prompt_ids, response_ids, self.config.max_seq_len))
            })
            .collect::<Result<Vec<_>>>()?;

        let model: &NoteModel = &pair.model;
        let prepared: Vec<PreparedExample> = sequences
            .par_iter()
            .filter(|(ids, prompt_len)| ids.len() > *prompt_len && *prompt_len > 0)
            .map(|(ids, prompt_len)| prepare_example(model, ids, *prompt_len))
            .collect::<Result<Vec<_>>>()?;

        if prepared.is_empty() {
            return Err(CoreError::empty_dataset(user_id, "No example has a trainable response span"));
        }
        Ok(prepared)
    }

    fn initial_adapter(&self, pair: &ModelPair, user_id: UserId) -> Result<(AdapterBundle, bool)> {
        let base = &pair.model;
        if self.config.warm_start {
            if let Some(existing) = self.store.try_load_bundle(user_id)? {
                let meta = existing.meta();
                if meta.rank == self.config.rank
                    && meta.hidden_size == base.hidden_size()
                    && meta.vocab_size == base.vocab_size()
                    && meta.base_model == base.name()
                {
                    debug!("Warm-starting user {} from adapter v{}", user_id, existing.version());
                    return Ok((AdapterBundle::clone(&existing), true));
                }
                warn!(
                    "Existing adapter v{} for user {} does not fit the current base model, starting fresh",
                    existing.version(),
                    user_id
                );
            }
        }

        Ok((
            AdapterBundle::initialized(
                user_id,
                base.name(),
                base.hidden_size(),
                base.vocab_size(),
                self.config.rank,
                self.config.alpha,
                self.config.seed,
            ),
            false,
        ))
    }

    fn fit(&self, pair: &ModelPair, user_id: UserId, examples: &[PreparedExample], started: Instant) -> Result<Fitted> {
        let (initial, warm_started) = self.initial_adapter(pair, user_id)?;
        let (meta, mut a, mut b) = initial.into_parts();
        let scale = self.config.alpha / self.config.rank.max(1) as f32;
        let batch_size = self.config.batch_size.clamp(1, examples.len());

        let mut initial_loss = f32::NAN;
        let mut final_loss = f32::NAN;

        for step in 0..self.config.max_steps {
            if let Some(deadline) = self.deadline {
                if started.elapsed() >= deadline {
                    return Err(CoreError::diverged("TRAINING_DEADLINE", user_id, step, "deadline exceeded"));
                }
            }

            let mut grad_a = Array2::<f32>::zeros(a.raw_dim());
            let mut grad_b = Array2::<f32>::zeros(b.raw_dim());
            let mut loss_sum = 0.0f32;
            let mut positions = 0usize;

            for offset in 0..batch_size {
                let example = &examples[(step * batch_size + offset) % examples.len()];
                let projected = example.hidden.dot(&a);
                let logits = &example.base_logits + &(projected.dot(&b) * scale);

                let mut grad_logits = Array2::<f32>::zeros(logits.raw_dim());
                for (row, (logit_row, &target)) in logits.axis_iter(Axis(0)).zip(&example.targets).enumerate() {
                    let max = logit_row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
                    let sum_exp: f32 = logit_row.iter().map(|&x| (x - max).exp()).sum();
                    loss_sum += max + sum_exp.ln() - logit_row[target];

                    let mut g = grad_logits.row_mut(row);
                    for (g_i, &x) in g.iter_mut().zip(logit_row.iter()) {
                        *g_i = (x - max).exp() / sum_exp;
                    }
                    g[target] -= 1.0;
                }
                positions += example.targets.len();

                grad_b += &(projected.t().dot(&grad_logits) * scale);
                grad_a += &(example.hidden.t().dot(&grad_logits.dot(&b.t())) * scale);
            }

            let loss = loss_sum / positions.max(1) as f32;
            if !loss.is_finite() {
                return Err(CoreError::diverged(
                    "TRAINING_NON_FINITE_LOSS",
                    user_id,
                    step,
                    format!("loss became {}", loss),
                ));
            }
            if step == 0 {
                initial_loss = loss;
            }
            final_loss = loss;

            let inv = 1.0 / positions.max(1) as f32;
            grad_a *= inv;
            grad_b *= inv;
            let norm = (grad_a.iter().chain(grad_b.iter()).map(|g| g * g).sum::<f32>()).sqrt();
            if !norm.is_finite() {
                return Err(CoreError::diverged(
                    "TRAINING_NON_FINITE_GRADIENT",
                    user_id,
                    step,
                    "gradient norm became non-finite",
                ));
            }
            let clip = if norm > self.config.max_grad_norm && norm > 0.0 {
                self.config.max_grad_norm / norm
            } else {
                1.0
            };

            a.scaled_add(-self.config.learning_rate * clip, &grad_a);
            b.scaled_add(-self.config.learning_rate * clip, &grad_b);

            if step % 50 == 0 {
                debug!("User {} step {}: loss {:.4}, grad norm {:.4}", user_id, step, loss, norm);
            }
        }

        if a.iter().chain(b.iter()).any(|w| !w.is_finite()) {
            return Err(CoreError::diverged(
                "TRAINING_NON_FINITE_WEIGHTS",
                user_id,
                self.config.max_steps,
                "adapter weights became non-finite",
            ));
        }

        let meta = AdapterMeta {
            created_at: chrono::Utc::now(),
            train_steps: self.config.max_steps,
            examples: examples.len(),
            final_loss: final_loss.is_finite().then_some(final_loss),
            ..meta
        };
        Ok(Fitted {
            bundle: AdapterBundle::from_parts(meta, a, b)?,
            steps: self.config.max_steps,
            initial_loss,
            final_loss,
            warm_started,
        })
    }
}

/// Fit prompt + response into `max_len`, dropping prompt tokens first
fn truncate(mut prompt_ids: Vec<u32>, response_ids: Vec<u32>, max_len: usize) -> (Vec<u32>, usize) {
    let max_len = max_len.max(2);
    let total = prompt_ids.len() + response_ids.len();
    if total > max_len {
        let excess = total - max_len;
        let from_prompt = excess.min(prompt_ids.len().saturating_sub(1));
        prompt_ids.drain(..from_prompt);
    }
    let prompt_len = prompt_ids.len();
    let mut ids = prompt_ids;
    ids.extend(response_ids);
    ids.truncate(max_len);
    (ids, prompt_len)
}

fn prepare_example(model: &NoteModel, ids: &[u32], prompt_len: usize) -> Result<PreparedExample> {
    let states = model.hidden_states(ids)?;
    // Position t predicts ids[t + 1]; the response starts at prompt_len
    let span = (prompt_len - 1)..(ids.len() - 1);
    let hidden = states.slice(ndarray::s![span.clone(), ..]).to_owned();

    let mut base_logits = Array2::zeros((hidden.nrows(), model.vocab_size()));
    for (row, h) in hidden.axis_iter(Axis(0)).enumerate() {
        base_logits.row_mut(row).assign(&model.project(&h.to_owned()));
    }

    let targets = ids[span.start + 1..=span.end].iter().map(|&id| id as usize).collect();
    Ok(PreparedExample {
        hidden,
        base_logits,
        targets,
    })
}
