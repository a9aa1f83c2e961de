//! Tokenizer module for text tokenization
//!
//! Converts note text to token ids and back. Decoding happens one token at a
//! time during generation, so every id must decode to a self-contained text
//! fragment that can be concatenated in generation order.

pub mod vocab;
pub mod word;

use crate::Result;

pub use vocab::{Vocabulary, VocabularyBuilder};
pub use word::WordTokenizer;

/// Main tokenizer trait that all tokenizer implementations must implement
pub trait Tokenizer: Send + Sync {
    /// Encode text into a sequence of token IDs
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Encode text, optionally wrapping it in BOS/EOS tokens
    fn encode_with_special_tokens(&self, text: &str, add_bos: bool, add_eos: bool) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        if add_bos {
            ids.extend(self.bos_token_id());
        }
        ids.extend(self.encode(text)?);
        if add_eos {
            ids.extend(self.eos_token_id());
        }
        Ok(ids)
    }

    /// Decode a single token ID into its text fragment; special tokens decode to ""
    fn decode_token(&self, id: u32) -> Result<String>;

    /// Decode a sequence of token IDs back into text
    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let mut text = String::new();
        for &id in tokens {
            text.push_str(&self.decode_token(id)?);
        }
        Ok(text)
    }

    /// Get the vocabulary size
    fn vocab_size(&self) -> usize;

    /// Get the beginning of sequence token ID
    fn bos_token_id(&self) -> Option<u32>;

    /// Get the end of sequence token ID
    fn eos_token_id(&self) -> Option<u32>;

    /// Get the unknown token ID
    fn unk_token_id(&self) -> Option<u32>;

    /// Check if a token ID is a special token
    fn is_special_token(&self, id: u32) -> bool;
}
