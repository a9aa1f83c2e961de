//! Word-level tokenizer with leading-space pieces
//!
//! Text is NFC-normalized and split into pieces that carry their leading
//! space (" gravity", " pulls", "."), so concatenating decoded pieces in
//! order reproduces the normalized text up to unknown words.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use unicode_normalization::{is_nfc, UnicodeNormalization};

use super::vocab::{Vocabulary, VocabularyBuilder};
use super::Tokenizer;
use crate::{CoreError, Result};

lazy_static! {
    static ref PIECE_PATTERN: Regex =
        Regex::new(r" ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]|\n|\s+").expect("piece pattern is valid");
}

/// Word-level tokenizer backed by a fixed vocabulary
#[derive(Debug, Clone)]
pub struct WordTokenizer {
    vocab: Vocabulary,
}

impl WordTokenizer {
    /// Wrap an existing vocabulary
    pub fn new(vocab: Vocabulary) -> Result<Self> {
        if vocab.unk_token_id().is_none() {
            return Err(CoreError::tokenizer(
                "TOKENIZER_NO_UNK",
                "Word tokenizer requires an unknown token",
                "Build the vocabulary with an <unk> special token",
            ));
        }
        Ok(Self { vocab })
    }

    /// Build a vocabulary from a corpus, keeping the most frequent pieces
    pub fn from_corpus<'a, I>(texts: I, max_vocab: usize) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for text in texts {
            for piece in pieces(&normalize(text)) {
                *counts.entry(piece.to_string()).or_insert(0) += 1;
            }
        }

        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        // Frequency first, then lexicographic so the vocabulary is deterministic
        ranked.sort_by(|(a, ca), (b, cb)| cb.cmp(ca).then_with(|| a.cmp(b)));

        let builder = VocabularyBuilder::with_default_specials();
        let budget = max_vocab.saturating_sub(4);
        let tokens = ranked.into_iter().take(budget).map(|(piece, _)| piece).collect();

        Self::new(builder.add_tokens(tokens).build())
    }

    /// Load a tokenizer from its JSON vocabulary file
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::new(Vocabulary::from_json_file(path)?)
    }

    /// Persist the vocabulary as JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        self.vocab.to_json_file(path)
    }

    /// Access the underlying vocabulary
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }
}

fn normalize(text: &str) -> String {
    if is_nfc(text) {
        text.to_string()
    } else {
        text.nfc().collect()
    }
}

fn pieces(text: &str) -> impl Iterator<Item = &str> {
    PIECE_PATTERN.find_iter(text).map(|m| m.as_str())
}

impl Tokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let normalized = normalize(text);
        let unk = self.vocab.unk_token_id().unwrap_or(0);

        Ok(pieces(&normalized)
            .map(|piece| {
                self.vocab
                    .token_to_id(piece)
                    // " Word" may be unknown while "Word" is known
                    .or_else(|| self.vocab.token_to_id(piece.trim_start()))
                    .unwrap_or(unk)
            })
            .collect())
    }

    fn decode_token(&self, id: u32) -> Result<String> {
        if self.vocab.is_special_id(id) {
            return Ok(String::new());
        }
        self.vocab.id_to_token(id).map(str::to_string).ok_or_else(|| {
            CoreError::tokenizer(
                "TOKENIZER_ID_OUT_OF_RANGE",
                format!("Token id {} is outside the vocabulary ({})", id, self.vocab.size()),
                "Check that the model and tokenizer were created together",
            )
        })
    }

    fn vocab_size(&self) -> usize {
        self.vocab.size()
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.vocab.bos_token_id()
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.vocab.eos_token_id()
    }

    fn unk_token_id(&self) -> Option<u32> {
        self.vocab.unk_token_id()
    }

    fn is_special_token(&self, id: u32) -> bool {
        self.vocab.is_special_id(id)
    }
}
