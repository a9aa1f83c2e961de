//! Property-based tests for decoding, the feedback policy and adapter storage
//!
//! These tests use proptest to generate random inputs and check the
//! invariants the engine relies on.

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

use marginalia_core::adapter::{AdapterBundle, AdapterStore};
use marginalia_core::generation::{DecodeMode, Decoder, FinishReason, GenerationRequest};
use marginalia_core::model::{ModelConfig, ModelHandle, NoteModel};
use marginalia_core::policy::replay::{ReplayEntry, ReplayMemory};
use marginalia_core::policy::state::StateSnapshot;
use marginalia_core::policy::{PolicyAction, PolicyState};
use marginalia_core::tokenizer::{Tokenizer, VocabularyBuilder, WordTokenizer};
use marginalia_core::CoreError;

const WORDS: &[&str] = &["Gravity", " pulls", " masses", " together", ".", " light", " cells"];

fn tokenizer() -> Arc<WordTokenizer> {
    let vocab = VocabularyBuilder::with_default_specials()
        .add_tokens(WORDS.iter().map(|w| w.to_string()).collect())
        .build();
    Arc::new(WordTokenizer::new(vocab).unwrap())
}

fn model(tokenizer: &WordTokenizer, seed: u64) -> Arc<NoteModel> {
    let config = ModelConfig::new("prop-base", tokenizer.vocab_size(), 8);
    Arc::new(NoteModel::random(config, seed).unwrap())
}

fn entry(reward: f32) -> ReplayEntry {
    ReplayEntry::new(StateSnapshot::from_features(vec![reward, 1.0]), PolicyAction::Exploit, reward, None)
}

prop_compose! {
    fn arb_prompt()(
        picks in prop::collection::vec(0..WORDS.len(), 1..6)
    ) -> String {
        picks.into_iter().map(|i| WORDS[i]).collect()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Non-positive temperatures still decode valid tokens
    #[test]
    fn test_non_positive_temperature_decodes(
        temperature in -10.0f32..=0.0,
        prompt in arb_prompt(),
        seed in any::<u64>()
    ) {
        let tokenizer = tokenizer();
        let request = GenerationRequest::new(prompt, 4, temperature, ModelHandle::base(model(&tokenizer, seed)))
            .unwrap()
            .with_seed(Some(seed));
        let vocab_size = tokenizer.vocab_size() as u32;

        let result = Decoder::new(tokenizer).generate(&request).unwrap();
        prop_assert!(result.tokens.iter().all(|t| *t < vocab_size));
    }

    /// Output length never exceeds the budget, and falls short only at end of sequence
    #[test]
    fn test_length_bounded_by_max_tokens(
        max_tokens in 1usize..12,
        prompt in arb_prompt(),
        seed in any::<u64>()
    ) {
        let tokenizer = tokenizer();
        let request = GenerationRequest::new(prompt, max_tokens, 1.0, ModelHandle::base(model(&tokenizer, seed)))
            .unwrap()
            .with_seed(Some(seed));

        let result = Decoder::new(tokenizer).generate(&request).unwrap();
        prop_assert!(result.tokens.len() <= max_tokens);
        if result.tokens.len() < max_tokens {
            prop_assert_eq!(result.finish_reason, FinishReason::EndOfSequence);
        } else {
            prop_assert_eq!(result.finish_reason, FinishReason::MaxTokens);
        }
    }

    /// Greedy decoding ignores the seed
    #[test]
    fn test_greedy_is_deterministic(
        prompt in arb_prompt(),
        model_seed in any::<u64>(),
        seed_a in any::<u64>(),
        seed_b in any::<u64>()
    ) {
        let tokenizer = tokenizer();
        let model = model(&tokenizer, model_seed);
        let decoder = Decoder::new(tokenizer);
        let run = |seed| {
            let request = GenerationRequest::new(prompt.clone(), 6, 0.9, ModelHandle::base(model.clone()))
                .unwrap()
                .with_mode(DecodeMode::Greedy)
                .with_seed(Some(seed));
            decoder.generate(&request).unwrap().text
        };
        prop_assert_eq!(run(seed_a), run(seed_b));
    }

    /// Epsilon after n decays is max(floor, initial * decay^n)
    #[test]
    fn test_epsilon_decay_schedule(
        initial in 0.0f32..=1.0,
        decay in 0.5f32..=1.0,
        floor in 0.0f32..=0.5,
        steps in 0usize..200
    ) {
        let mut state = PolicyState::new(initial, decay, floor);
        for _ in 0..steps {
            state.decay();
        }
        let expected = (initial.max(floor) * decay.powi(steps as i32)).max(floor);
        prop_assert!((state.epsilon() - expected).abs() < 1e-4);
        prop_assert!(state.epsilon() >= floor);
    }

    /// A full memory evicts exactly the oldest entry
    #[test]
    fn test_replay_memory_is_fifo(
        capacity in 1usize..16,
        pushes in 1usize..48
    ) {
        let mut memory = ReplayMemory::new(capacity);
        for i in 0..pushes {
            let evicted = memory.push(entry(i as f32));
            if i < capacity {
                prop_assert!(evicted.is_none());
            } else {
                prop_assert_eq!(evicted.unwrap().reward(), (i - capacity) as f32);
            }
        }

        prop_assert_eq!(memory.len(), pushes.min(capacity));
        let kept: Vec<f32> = memory.iter().map(|e| e.reward()).collect();
        let expected: Vec<f32> = (pushes.saturating_sub(capacity)..pushes).map(|i| i as f32).collect();
        prop_assert_eq!(kept, expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Loading succeeds exactly for users with a saved adapter
    #[test]
    fn test_load_fails_iff_adapter_missing(
        saved in prop::collection::hash_set(1u64..20, 0..5),
        probes in prop::collection::vec(1u64..20, 1..8)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = AdapterStore::at(dir.path());
        let tokenizer = tokenizer();
        let base = model(&tokenizer, 1);

        for &user in &saved {
            let bundle = AdapterBundle::initialized(user, "prop-base", 8, tokenizer.vocab_size(), 2, 4.0, 0);
            store.save(user, bundle).unwrap();
        }

        let saved: HashSet<u64> = saved;
        for user in probes {
            prop_assert_eq!(store.exists(user).unwrap(), saved.contains(&user));
            match store.load(user, base.clone()) {
                Ok(adapted) => {
                    prop_assert!(saved.contains(&user));
                    prop_assert_eq!(adapted.user_id(), user);
                }
                Err(CoreError::AdapterNotFound { user_id, .. }) => {
                    prop_assert!(!saved.contains(&user));
                    prop_assert_eq!(user_id, user);
                }
                Err(e) => prop_assert!(false, "unexpected error: {}", e),
            }
        }
    }
}
