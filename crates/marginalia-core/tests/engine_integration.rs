//! End-to-end tests for the personalization engine
//!
//! Covers the decode contract against a scripted model, the dislike ->
//! regenerate path, the train -> save -> load lifecycle and per-user training
//! exclusion.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use marginalia_core::config::EngineConfig;
use marginalia_core::feedback::TrainingExample;
use marginalia_core::generation::{Decoder, FinishReason, GenerationRequest};
use marginalia_core::model::{DecodeCache, LanguageModel, ModelConfig, ModelHandle, ModelKind, NoteModel, StepOutput};
use marginalia_core::registry::ModelRegistry;
use marginalia_core::tokenizer::{Tokenizer, VocabularyBuilder, WordTokenizer};
use marginalia_core::engine::NoteInitializer;
use marginalia_core::{CoreError, PersonalizationEngine, Result};

const CORPUS: &[&str] = &[
    "### User: Write a study note about: Gravity\n### Assistant: Gravity pulls masses together.",
    "### User: Write a study note about: Photosynthesis\n### Assistant: Plants turn light into sugar.",
    "### User: Write a study note about: Mitosis\n### Assistant: Cells divide into two copies.",
    "The previous note was rejected:",
];

/// Stand-in for the external note service
struct EchoInitializer;

#[async_trait]
impl NoteInitializer for EchoInitializer {
    async fn initial_note(&self, content: &str) -> Result<String> {
        Ok(format!("Summary of {}", content))
    }
}

/// Always emits the same script of token ids, whatever the input
struct ScriptedModel {
    script: Vec<u32>,
    vocab_size: usize,
}

impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn forward(&self, _input_ids: &[u32], cache: Option<DecodeCache>) -> Result<StepOutput> {
        let step = cache.map_or(0, |c| c.positions());
        let mut logits = vec![0.0; self.vocab_size];
        logits[self.script[step.min(self.script.len() - 1)] as usize] = 50.0;
        Ok(StepOutput {
            logits,
            cache: DecodeCache::from_parts(Vec::new(), step + 1),
        })
    }
}

fn trained_pair() -> (Arc<NoteModel>, Arc<WordTokenizer>) {
    let tokenizer = WordTokenizer::from_corpus(CORPUS.iter().copied(), 256).unwrap();
    let mut model = NoteModel::random(ModelConfig::new("notes-base", tokenizer.vocab_size(), 16), 11).unwrap();
    let sequences: Vec<Vec<u32>> = CORPUS
        .iter()
        .map(|text| tokenizer.encode_with_special_tokens(text, true, true).unwrap())
        .collect();
    model.fit_head(&sequences, 40, 0.1).unwrap();
    (Arc::new(model), Arc::new(tokenizer))
}

fn config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.adapters.root_dir = root.to_path_buf();
    config.generation.max_tokens = 12;
    config.generation.seed = Some(3);
    config.trainer.max_steps = 30;
    config.trainer.learning_rate = 0.05;
    config.policy.seed = Some(5);
    config
}

/// Route engine logs to the test output
fn init_test_env() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("marginalia_core=debug")
        .with_test_writer()
        .try_init();
}

fn engine_with(config: EngineConfig) -> PersonalizationEngine {
    init_test_env();
    let (model, tokenizer) = trained_pair();
    let registry = Arc::new(ModelRegistry::new());
    registry.install(model, tokenizer).unwrap();
    PersonalizationEngine::new(config, registry).unwrap()
}

#[test]
fn test_stub_model_stops_at_end_of_sequence() {
    let vocab = VocabularyBuilder::with_default_specials()
        .add_tokens(vec!["Explain".into(), " gravity".into(), "A".into(), " B".into(), " C".into()])
        .build();
    let tokenizer: Arc<dyn Tokenizer> = Arc::new(WordTokenizer::new(vocab).unwrap());
    let abc = tokenizer.encode("A B C").unwrap();
    let eos = tokenizer.eos_token_id().unwrap();

    let model = Arc::new(ScriptedModel {
        script: vec![abc[0], abc[1], abc[2], eos],
        vocab_size: tokenizer.vocab_size(),
    });
    let request = GenerationRequest::new("Explain gravity", 5, 0.7, ModelHandle::base(model)).unwrap();

    let tokens: Vec<u32> = Decoder::new(tokenizer)
        .stream(&request)
        .unwrap()
        .map(|t| t.unwrap().id)
        .collect();
    assert_eq!(tokens, abc);
}

#[tokio::test]
async fn test_dislike_regenerates_with_base_model_without_creating_adapter() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(config(dir.path()));

    let note = engine.create_note(Some(7), "Gravity").await.unwrap();
    assert!(!note.text.is_empty());

    let outcome = engine.record_feedback(7, note.id, false).await.unwrap();
    let regenerated = outcome.regenerated.expect("dislike regenerates");
    assert!(!regenerated.is_fallback(), "{:?}", regenerated.error);
    assert_eq!(regenerated.model_kind, Some(ModelKind::Reinforced));
    assert!(regenerated.action.is_some());
    assert!(regenerated.note_id.is_some());

    assert!(!engine.store().exists(7).unwrap());
    assert_eq!(engine.pending_examples(7).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_training_makes_new_adapter_visible() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.policy.enabled = false;
    let engine = engine_with(config);

    let examples = vec![TrainingExample::like("Gravity", "Gravity pulls masses together.")];
    let first = engine.train_from_accumulated_feedback(7, examples.clone()).await.unwrap();
    assert_eq!(first.version, 1);
    assert!(engine.store().exists(7).unwrap());

    let pair = engine.registry().pair().unwrap();
    let handle = engine.resolve_model(Some(7), &pair).unwrap();
    assert_eq!(handle.kind(), ModelKind::Adapted);
    assert_eq!(handle.user_id(), Some(7));

    let second = engine.train_from_accumulated_feedback(7, examples).await.unwrap();
    assert_eq!(second.version, 2);
    let loaded = engine.store().load(7, Arc::clone(&pair.model)).unwrap();
    assert_eq!(loaded.adapter().version(), 2);

    // Another user never sees user 7's adapter
    let other = engine.resolve_model(Some(8), &pair).unwrap();
    assert_eq!(other.kind(), ModelKind::Base);
    assert_eq!(other.user_id(), None);
}

#[tokio::test]
async fn test_training_clears_consumed_feedback() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(config(dir.path()));

    let note = engine.create_note(Some(7), "Mitosis").await.unwrap();
    engine.record_feedback(7, note.id, true).await.unwrap();

    let report = engine.train_pending(7).await.unwrap();
    assert_eq!(report.examples_used, 1);
    assert!(engine.pending_examples(7).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_training_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(config(dir.path()));
    let examples = vec![TrainingExample::like("Gravity", "Gravity pulls masses together.")];

    let in_flight = engine.trainer().locks().acquire(7).unwrap();
    let err = engine
        .train_from_accumulated_feedback(7, examples.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::TrainingInProgress { user_id: 7, .. }));
    assert!(!engine.store().exists(7).unwrap());

    drop(in_flight);
    engine.train_from_accumulated_feedback(7, examples).await.unwrap();
    assert!(engine.store().exists(7).unwrap());
}

#[tokio::test]
async fn test_empty_training_leaves_feedback_and_adapter_alone() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(config(dir.path()));

    let note = engine.create_note(Some(7), "Gravity").await.unwrap();
    engine.record_feedback(7, note.id, false).await.unwrap();

    let err = engine.train_pending(7).await.unwrap_err();
    assert!(matches!(err, CoreError::EmptyDataset { .. }));
    assert_eq!(engine.pending_examples(7).await.unwrap().len(), 1);
    assert!(!engine.store().exists(7).unwrap());
}

#[tokio::test]
async fn test_failed_regeneration_returns_prior_note() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(config(dir.path()));
    engine.registry().unload();

    let outcome = engine.regenerate_note(7, "Gravity", "Things fall down.").await;
    assert!(outcome.is_fallback());
    assert_eq!(outcome.text, "Things fall down.");
    assert_eq!(outcome.error.unwrap().code(), "MODEL_NOT_LOADED");
    assert!(outcome.note_id.is_none());
}

#[tokio::test]
async fn test_feedback_on_foreign_note_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(config(dir.path()));

    let note = engine.create_note(Some(7), "Gravity").await.unwrap();
    let err = engine.record_feedback(8, note.id, true).await.unwrap_err();
    assert_eq!(err.code(), "FEEDBACK_FOREIGN_NOTE");

    let err = engine.record_feedback(7, 9_999, true).await.unwrap_err();
    assert_eq!(err.code(), "FEEDBACK_UNKNOWN_NOTE");
}

#[tokio::test]
async fn test_auto_training_after_enough_likes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.adapters.auto_train_after_likes = Some(2);
    let engine = engine_with(config);

    let first = engine.create_note(Some(7), "Gravity").await.unwrap();
    let outcome = engine.record_feedback(7, first.id, true).await.unwrap();
    assert!(outcome.training.is_none());

    let second = engine.create_note(Some(7), "Photosynthesis").await.unwrap();
    let outcome = engine.record_feedback(7, second.id, true).await.unwrap();
    let report = outcome.training.expect("second like trains");
    assert_eq!(report.examples_used, 2);
    assert!(engine.store().exists(7).unwrap());
}

#[tokio::test]
async fn test_streamed_note_matches_token_order() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(config(dir.path()));

    let mut stream = engine.stream_note(None, "Gravity").unwrap();
    let mut text = String::new();
    let mut count = 0;
    while let Some(token) = stream.recv().await {
        text.push_str(&token.unwrap().text);
        count += 1;
    }
    let reason = stream.finish().await.unwrap().unwrap();
    assert!(count <= 12);
    if count < 12 {
        assert_eq!(reason, FinishReason::EndOfSequence);
    }
    assert!(text.len() <= 12 * 64);
}

#[tokio::test]
async fn test_initial_notes_use_external_initializer() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(config(dir.path())).with_initializer(Arc::new(EchoInitializer));

    let note = engine.create_note(Some(7), "Tides").await.unwrap();
    assert_eq!(note.text, "Summary of Tides");
    assert_eq!(note.model_kind, ModelKind::Base);

    let err = engine.generate_initial_note("   ").await.unwrap_err();
    assert_eq!(err.code(), "NOTE_EMPTY_CONTENT");
}
