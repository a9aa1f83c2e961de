//! Autoregressive decoding with incremental cache reuse
//!
//! A [`TokenStream`] owns the decode state for exactly one request. Each step
//! feeds only the tokens the model has not seen yet, together with the cache
//! returned by the previous step, and yields one token. Dropping the stream
//! drops the state; nothing shared is touched.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{
    DecodeMode, FinishReason, GenerationRequest, GenerationResult, GenerationStats, Sampler, Token,
};
use crate::model::{DecodeCache, LanguageModel, ModelKind};
use crate::tokenizer::Tokenizer;
use crate::{CoreError, Result};

const DEFAULT_STREAM_BUFFER: usize = 32;

/// Turns generation requests into token streams
#[derive(Clone)]
pub struct Decoder {
    tokenizer: Arc<dyn Tokenizer>,
    stream_buffer: usize,
    trace_tokens: bool,
}

impl Decoder {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            trace_tokens: false,
        }
    }

    /// Channel capacity used by [`Decoder::spawn_stream`]
    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    /// Log every sampled token at trace level
    pub fn with_token_tracing(mut self, enabled: bool) -> Self {
        self.trace_tokens = enabled;
        self
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// Start a lazy decode for `request`
    pub fn stream(&self, request: &GenerationRequest) -> Result<TokenStream> {
        let model = request.model().language_model();
        if model.vocab_size() != self.tokenizer.vocab_size() {
            return Err(CoreError::model_unavailable(
                "MODEL_TOKENIZER_MISMATCH",
                format!(
                    "Model '{}' has {} logits, tokenizer has {} tokens",
                    model.name(),
                    model.vocab_size(),
                    self.tokenizer.vocab_size()
                ),
                "Load the tokenizer that was saved with the model",
            ));
        }

        let prompt_ids = self.tokenizer.encode_with_special_tokens(request.prompt(), true, false)?;
        if prompt_ids.is_empty() {
            return Err(CoreError::invalid_named(
                "GENERATION_EMPTY_PROMPT",
                "prompt",
                "Prompt encodes to no tokens",
                "Provide a non-empty prompt",
            ));
        }

        debug!(
            "Decoding with {} ({}, {:?}): {} prompt tokens, max {}",
            model.name(),
            request.model().kind(),
            request.mode(),
            prompt_ids.len(),
            request.max_tokens()
        );

        Ok(TokenStream {
            model,
            tokenizer: Arc::clone(&self.tokenizer),
            model_kind: request.model().kind(),
            mode: request.mode(),
            sampler: Sampler::for_request(request),
            eos_token_id: self.tokenizer.eos_token_id(),
            remaining: request.max_tokens(),
            prompt_tokens: prompt_ids.len(),
            state: Some(DecodeState::new(prompt_ids)),
            finish_reason: None,
            trace_tokens: self.trace_tokens,
        })
    }

    /// Decode to completion and collect the response
    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let start = Instant::now();
        let mut stream = self.stream(request)?;

        let mut text = String::new();
        let mut tokens = Vec::new();
        let mut first_token_at = None;
        for token in stream.by_ref() {
            let token = token?;
            first_token_at.get_or_insert_with(|| start.elapsed());
            text.push_str(&token.text);
            tokens.push(token.id);
        }

        let total = start.elapsed();
        let tokens_per_second = if total.as_secs_f64() > 0.0 {
            tokens.len() as f64 / total.as_secs_f64()
        } else {
            0.0
        };

        Ok(GenerationResult {
            finish_reason: stream.finish_reason().unwrap_or(FinishReason::MaxTokens),
            mode: request.mode(),
            model_kind: request.model().kind(),
            stats: GenerationStats {
                prompt_tokens: stream.prompt_tokens(),
                tokens_generated: tokens.len(),
                time_to_first_token_ms: first_token_at.unwrap_or(total).as_secs_f64() * 1000.0,
                total_time_ms: total.as_secs_f64() * 1000.0,
                tokens_per_second,
            },
            text,
            tokens,
        })
    }

    /// Run a decode on the blocking pool, forwarding tokens through a bounded channel.
    ///
    /// Must be called from within a tokio runtime. Dropping the receiver stops
    /// the decode at its next step.
    pub fn spawn_stream(&self, request: &GenerationRequest) -> Result<SpawnedStream> {
        let mut stream = self.stream(request)?;
        let (tx, rx) = mpsc::channel(self.stream_buffer);

        let task = tokio::task::spawn_blocking(move || {
            while let Some(item) = stream.next() {
                if tx.blocking_send(item).is_err() {
                    debug!("Token receiver dropped, cancelling decode");
                    stream.cancel();
                    break;
                }
            }
            stream.finish_reason()
        });

        Ok(SpawnedStream { tokens: rx, task })
    }
}

/// A decode running on the blocking pool
pub struct SpawnedStream {
    /// Tokens in generation order
    pub tokens: mpsc::Receiver<Result<Token>>,
    task: JoinHandle<Option<FinishReason>>,
}

impl SpawnedStream {
    /// Receive the next token
    pub async fn recv(&mut self) -> Option<Result<Token>> {
        self.tokens.recv().await
    }

    /// Wait for the decode task and report why it stopped
    pub async fn finish(self) -> Result<Option<FinishReason>> {
        drop(self.tokens);
        self.task
            .await
            .map_err(|e| CoreError::internal("DECODE_TASK_FAILED", e.to_string()))
    }
}

/// State owned by one in-flight decode
#[derive(Debug)]
struct DecodeState {
    /// Prompt followed by every generated token
    ids: Vec<u32>,
    /// Number of leading `ids` already folded into `cache`
    consumed: usize,
    cache: Option<DecodeCache>,
}

impl DecodeState {
    fn new(prompt_ids: Vec<u32>) -> Self {
        Self {
            ids: prompt_ids,
            consumed: 0,
            cache: None,
        }
    }

    fn tail(&self) -> &[u32] {
        &self.ids[self.consumed..]
    }

    fn push(&mut self, id: u32) {
        self.ids.push(id);
    }
}

/// Lazy, finite, non-restartable sequence of generated tokens.
///
/// The end-of-sequence token stops the stream and is not yielded.
pub struct TokenStream {
    model: Arc<dyn LanguageModel>,
    tokenizer: Arc<dyn Tokenizer>,
    model_kind: ModelKind,
    mode: DecodeMode,
    sampler: Sampler,
    eos_token_id: Option<u32>,
    remaining: usize,
    prompt_tokens: usize,
    state: Option<DecodeState>,
    finish_reason: Option<FinishReason>,
    trace_tokens: bool,
}

impl TokenStream {
    /// Why the stream stopped; `None` while tokens may still be produced
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    pub fn model_kind(&self) -> ModelKind {
        self.model_kind
    }

    /// Positions covered by the running sequence, prompt included
    pub fn sequence_len(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.ids.len())
    }

    /// Stop decoding and release the decode state
    pub fn cancel(&mut self) {
        if self.state.take().is_some() {
            self.finish_reason = Some(FinishReason::Cancelled);
        }
    }

    fn finish(&mut self, reason: FinishReason) {
        self.state = None;
        self.finish_reason = Some(reason);
    }

    fn step(&mut self) -> Result<Option<Token>> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Ok(None),
        };

        let cache = state.cache.take();
        let output = self.model.forward(state.tail(), cache)?;
        state.consumed = state.ids.len();
        state.cache = Some(output.cache);

        if output.logits.len() != self.model.vocab_size() {
            return Err(CoreError::internal(
                "DECODE_LOGITS_SHAPE",
                format!("Expected {} logits, model produced {}", self.model.vocab_size(), output.logits.len()),
            ));
        }

        let id = self.sampler.sample(&output.logits)?;
        self.remaining -= 1;

        if Some(id) == self.eos_token_id {
            self.finish(FinishReason::EndOfSequence);
            return Ok(None);
        }

        state.push(id);
        let text = self.tokenizer.decode_token(id)?;
        if self.trace_tokens {
            trace!("token {} -> {:?}", id, text);
        }

        if self.remaining == 0 {
            self.finish(FinishReason::MaxTokens);
        }
        Ok(Some(Token { id, text }))
    }
}

impl Iterator for TokenStream {
    type Item = Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => None,
            Err(e) => {
                self.finish(FinishReason::Error);
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("model", &self.model.name())
            .field("mode", &self.mode)
            .field("remaining", &self.remaining)
            .field("finish_reason", &self.finish_reason)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelConfig, ModelHandle, NoteModel, StepOutput};
    use crate::tokenizer::{VocabularyBuilder, WordTokenizer};
    use parking_lot::Mutex;

    /// Emits a fixed script of tokens regardless of input, recording each tail it sees
    struct ScriptedModel {
        script: Vec<u32>,
        vocab: usize,
        tails: Mutex<Vec<usize>>,
    }

    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        fn vocab_size(&self) -> usize {
            self.vocab
        }

        fn forward(&self, input_ids: &[u32], cache: Option<DecodeCache>) -> Result<StepOutput> {
            self.tails.lock().push(input_ids.len());
            let step = cache.map_or(0, |c| c.positions());
            let next = self.script[step.min(self.script.len() - 1)];
            let mut logits = vec![-10.0; self.vocab];
            logits[next as usize] = 10.0;
            Ok(StepOutput {
                logits,
                cache: DecodeCache::from_parts(Vec::new(), step + 1),
            })
        }
    }

    fn tokenizer() -> Arc<dyn Tokenizer> {
        let vocab = VocabularyBuilder::with_default_specials()
            .add_tokens(vec!["A".into(), " B".into(), " C".into(), "Explain".into()])
            .build();
        Arc::new(WordTokenizer::new(vocab).unwrap())
    }

    fn scripted(tokenizer: &Arc<dyn Tokenizer>, script: Vec<u32>) -> Arc<ScriptedModel> {
        Arc::new(ScriptedModel {
            script,
            vocab: tokenizer.vocab_size(),
            tails: Mutex::new(Vec::new()),
        })
    }

    fn ids(tokenizer: &Arc<dyn Tokenizer>, text: &str) -> Vec<u32> {
        tokenizer.encode(text).unwrap()
    }

    #[test]
    fn test_stops_at_eos_without_yielding_it() {
        let tok = tokenizer();
        let abc = ids(&tok, "A B C");
        let eos = tok.eos_token_id().unwrap();
        let model = scripted(&tok, vec![abc[0], abc[1], abc[2], eos]);

        let request = GenerationRequest::new("Explain", 5, 0.7, ModelHandle::base(model)).unwrap();
        let result = Decoder::new(Arc::clone(&tok)).generate(&request).unwrap();

        assert_eq!(result.tokens, abc);
        assert_eq!(result.text, "A B C");
        assert_eq!(result.finish_reason, FinishReason::EndOfSequence);
    }

    #[test]
    fn test_max_tokens_bounds_output() {
        let tok = tokenizer();
        let a = ids(&tok, "A")[0];
        let model = scripted(&tok, vec![a]);

        let request = GenerationRequest::new("Explain", 3, 1.0, ModelHandle::base(model)).unwrap();
        let result = Decoder::new(tok).generate(&request).unwrap();

        assert_eq!(result.tokens.len(), 3);
        assert_eq!(result.finish_reason, FinishReason::MaxTokens);
    }

    #[test]
    fn test_feeds_only_the_tail_after_first_step() {
        let tok = tokenizer();
        let a = ids(&tok, "A")[0];
        let model = scripted(&tok, vec![a]);

        let handle = ModelHandle::base(model.clone());
        let request = GenerationRequest::new("Explain A B", 4, 1.0, handle).unwrap();
        Decoder::new(tok).generate(&request).unwrap();

        let tails = model.tails.lock().clone();
        assert_eq!(tails[0], 4); // BOS + three prompt pieces
        assert!(tails[1..].iter().all(|&len| len == 1));
    }

    #[test]
    fn test_sequence_grows_by_one_per_step() {
        let tok = tokenizer();
        let a = ids(&tok, "A")[0];
        let model = scripted(&tok, vec![a]);

        let request = GenerationRequest::new("Explain", 3, 1.0, ModelHandle::base(model)).unwrap();
        let mut stream = Decoder::new(tok).stream(&request).unwrap();
        let prompt = stream.prompt_tokens();
        assert_eq!(stream.sequence_len(), prompt);

        for generated in 1..=3 {
            assert!(stream.next().unwrap().is_ok());
            if generated < 3 {
                assert_eq!(stream.sequence_len(), prompt + generated);
            }
        }
        assert!(stream.next().is_none());
        assert_eq!(stream.finish_reason(), Some(FinishReason::MaxTokens));
    }

    #[test]
    fn test_greedy_is_deterministic() {
        let tok = tokenizer();
        let model = Arc::new(NoteModel::random(ModelConfig::new("t", tok.vocab_size(), 6), 4).unwrap());
        let decoder = Decoder::new(Arc::clone(&tok));

        let run = || {
            let request = GenerationRequest::new("Explain", 6, 0.7, ModelHandle::base(model.clone()))
                .unwrap()
                .with_mode(DecodeMode::Greedy);
            decoder.generate(&request).unwrap().tokens
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_cancel_releases_state() {
        let tok = tokenizer();
        let a = ids(&tok, "A")[0];
        let model = scripted(&tok, vec![a]);

        let request = GenerationRequest::new("Explain", 10, 1.0, ModelHandle::base(model)).unwrap();
        let mut stream = Decoder::new(tok).stream(&request).unwrap();
        assert!(stream.next().is_some());
        stream.cancel();
        assert!(stream.next().is_none());
        assert_eq!(stream.finish_reason(), Some(FinishReason::Cancelled));
        assert_eq!(stream.sequence_len(), 0);
    }

    #[test]
    fn test_mismatched_pair_is_unavailable() {
        let tok = tokenizer();
        let model = Arc::new(NoteModel::random(ModelConfig::new("t", 3, 2), 1).unwrap());
        let request = GenerationRequest::new("Explain", 2, 1.0, ModelHandle::base(model)).unwrap();
        let err = Decoder::new(tok).stream(&request).unwrap_err();
        assert_eq!(err.code(), "MODEL_TOKENIZER_MISMATCH");
    }

    #[tokio::test]
    async fn test_spawned_stream_delivers_in_order() {
        let tok = tokenizer();
        let abc = ids(&tok, "A B C");
        let eos = tok.eos_token_id().unwrap();
        let model = scripted(&tok, vec![abc[0], abc[1], abc[2], eos]);

        let request = GenerationRequest::new("Explain", 8, 0.7, ModelHandle::base(model)).unwrap();
        let mut spawned = Decoder::new(tok).with_stream_buffer(1).spawn_stream(&request).unwrap();

        let mut received = Vec::new();
        while let Some(token) = spawned.recv().await {
            received.push(token.unwrap().id);
        }
        assert_eq!(received, abc);
        assert_eq!(spawned.finish().await.unwrap(), Some(FinishReason::EndOfSequence));
    }

    #[tokio::test]
    async fn test_dropping_receiver_cancels_decode() {
        let tok = tokenizer();
        let a = ids(&tok, "A")[0];
        let model = scripted(&tok, vec![a]);

        let request = GenerationRequest::new("Explain", 1000, 1.0, ModelHandle::base(model)).unwrap();
        let mut spawned = Decoder::new(tok).with_stream_buffer(1).spawn_stream(&request).unwrap();
        assert!(spawned.recv().await.is_some());

        assert_eq!(spawned.finish().await.unwrap(), Some(FinishReason::Cancelled));
    }
}
