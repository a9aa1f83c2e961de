//! Vocabulary management for tokenizers
//!
//! Token-to-id and id-to-token mappings plus the special token slots. Ids are
//! dense: specials occupy the first slots, regular tokens follow.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::{CoreError, Result};

/// Special token spellings used when none are configured
pub const DEFAULT_UNK: &str = "<unk>";
pub const DEFAULT_BOS: &str = "<s>";
pub const DEFAULT_EOS: &str = "</s>";
pub const DEFAULT_PAD: &str = "<pad>";

/// Vocabulary container for managing token-to-id and id-to-token mappings
#[derive(Debug, Clone)]
pub struct Vocabulary {
    /// Token to ID mapping
    token_to_id: HashMap<String, u32>,

    /// ID to token mapping, indexed by id
    id_to_token: Vec<String>,

    /// Number of leading ids reserved for special tokens
    num_special: u32,

    unk_token_id: Option<u32>,
    bos_token_id: Option<u32>,
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
}

/// On-disk form of a vocabulary
#[derive(Debug, Serialize, Deserialize)]
struct VocabularyFile {
    unk_token: Option<String>,
    bos_token: Option<String>,
    eos_token: Option<String>,
    pad_token: Option<String>,
    /// Regular tokens in id order, after the specials
    tokens: Vec<String>,
}

impl Vocabulary {
    /// Create vocabulary with special tokens
    pub fn with_special_tokens(
        unk_token: Option<&str>,
        bos_token: Option<&str>,
        eos_token: Option<&str>,
        pad_token: Option<&str>,
    ) -> Self {
        let mut vocab = Self {
            token_to_id: HashMap::new(),
            id_to_token: Vec::new(),
            num_special: 0,
            unk_token_id: None,
            bos_token_id: None,
            eos_token_id: None,
            pad_token_id: None,
        };

        let unk = unk_token.map(|t| vocab.push(t));
        let bos = bos_token.map(|t| vocab.push(t));
        let eos = eos_token.map(|t| vocab.push(t));
        let pad = pad_token.map(|t| vocab.push(t));
        vocab.unk_token_id = unk;
        vocab.bos_token_id = bos;
        vocab.eos_token_id = eos;
        vocab.pad_token_id = pad;
        vocab.num_special = vocab.id_to_token.len() as u32;

        vocab
    }

    fn push(&mut self, token: &str) -> u32 {
        if let Some(&id) = self.token_to_id.get(token) {
            return id;
        }
        let id = self.id_to_token.len() as u32;
        self.token_to_id.insert(token.to_string(), id);
        self.id_to_token.push(token.to_string());
        id
    }

    /// Load vocabulary from its JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::storage("TOKENIZER_READ_FAILED", "Failed to read tokenizer file", path, e))?;
        Self::from_json(&content)
    }

    /// Load vocabulary from JSON format
    pub fn from_json(json_str: &str) -> Result<Self> {
        let file: VocabularyFile = serde_json::from_str(json_str).map_err(|e| {
            CoreError::tokenizer(
                "TOKENIZER_VOCAB_JSON_PARSE_ERROR",
                format!("Failed to parse JSON vocabulary: {}", e),
                "Check JSON format and syntax",
            )
        })?;

        let mut vocab = Self::with_special_tokens(
            file.unk_token.as_deref(),
            file.bos_token.as_deref(),
            file.eos_token.as_deref(),
            file.pad_token.as_deref(),
        );
        for token in &file.tokens {
            vocab.push(token);
        }
        Ok(vocab)
    }

    /// Serialize vocabulary to JSON
    pub fn to_json(&self) -> Result<String> {
        let special = |id: Option<u32>| id.map(|i| self.id_to_token[i as usize].clone());
        let file = VocabularyFile {
            unk_token: special(self.unk_token_id),
            bos_token: special(self.bos_token_id),
            eos_token: special(self.eos_token_id),
            pad_token: special(self.pad_token_id),
            tokens: self.id_to_token[self.num_special as usize..].to_vec(),
        };
        serde_json::to_string_pretty(&file)
            .map_err(|e| CoreError::internal("TOKENIZER_SERIALIZE_FAILED", e.to_string()))
    }

    /// Write vocabulary to its JSON file
    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        std::fs::write(path, json)
            .map_err(|e| CoreError::storage("TOKENIZER_WRITE_FAILED", "Failed to write tokenizer file", path, e))
    }

    /// Get token ID
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    /// Get token by ID
    pub fn id_to_token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(id as usize).map(|s| s.as_str())
    }

    /// Get vocabulary size
    pub fn size(&self) -> usize {
        self.id_to_token.len()
    }

    /// Check if an ID corresponds to a special token
    pub fn is_special_id(&self, id: u32) -> bool {
        id < self.num_special
    }

    pub fn unk_token_id(&self) -> Option<u32> {
        self.unk_token_id
    }

    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }
}

/// Builder for creating vocabularies
pub struct VocabularyBuilder {
    tokens: Vec<String>,
    unk_token: Option<String>,
    bos_token: Option<String>,
    eos_token: Option<String>,
    pad_token: Option<String>,
}

impl VocabularyBuilder {
    pub fn new() -> Self {
        Self {
            tokens: Vec::new(),
            unk_token: None,
            bos_token: None,
            eos_token: None,
            pad_token: None,
        }
    }

    /// Builder preloaded with the default special token spellings
    pub fn with_default_specials() -> Self {
        Self::new()
            .set_unk_token(DEFAULT_UNK.to_string())
            .set_bos_token(DEFAULT_BOS.to_string())
            .set_eos_token(DEFAULT_EOS.to_string())
            .set_pad_token(DEFAULT_PAD.to_string())
    }

    pub fn add_token(mut self, token: String) -> Self {
        self.tokens.push(token);
        self
    }

    pub fn add_tokens(mut self, tokens: Vec<String>) -> Self {
        self.tokens.extend(tokens);
        self
    }

    pub fn set_unk_token(mut self, token: String) -> Self {
        self.unk_token = Some(token);
        self
    }

    pub fn set_bos_token(mut self, token: String) -> Self {
        self.bos_token = Some(token);
        self
    }

    pub fn set_eos_token(mut self, token: String) -> Self {
        self.eos_token = Some(token);
        self
    }

    pub fn set_pad_token(mut self, token: String) -> Self {
        self.pad_token = Some(token);
        self
    }

    pub fn build(self) -> Vocabulary {
        let mut vocab = Vocabulary::with_special_tokens(
            self.unk_token.as_deref(),
            self.bos_token.as_deref(),
            self.eos_token.as_deref(),
            self.pad_token.as_deref(),
        );

        for token in &self.tokens {
            vocab.push(token);
        }

        vocab
    }
}

impl Default for VocabularyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
