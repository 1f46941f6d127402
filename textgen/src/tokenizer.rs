//! Text <-> token id conversion backed by the `tokenizers` crate.

use std::path::Path;

use serde_json::{json, Map, Value};
use tokenizers::Tokenizer;

use crate::error::{Result, TextGenError};

/// Spellings checkpoints commonly use for their end-of-sequence token.
pub const EOS_CANDIDATES: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|end_of_text|>",
    "<eos>",
    "<|im_end|>",
];

/// Tokenizer handle matching a loaded model.
#[derive(Clone)]
pub struct TextTokenizer {
    inner: Tokenizer,
}

impl TextTokenizer {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = Tokenizer::from_file(path).map_err(TextGenError::tokenizer)?;
        Ok(Self { inner })
    }

    /// Parse a serialized `tokenizer.json`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = Tokenizer::from_bytes(bytes).map_err(TextGenError::tokenizer)?;
        Ok(Self { inner })
    }

    /// Lowercasing, whitespace-splitting word-level tokenizer over a fixed
    /// vocabulary. Ids follow the order of `words`; entries written as
    /// `<...>` are registered as special tokens. Unknown words map to
    /// `unk_token`, which must be in `words`.
    pub fn word_level(words: &[&str], unk_token: &str) -> Result<Self> {
        let json = serde_json::to_vec(&word_level_json(words, unk_token))?;
        Self::from_bytes(&json)
    }

    /// Write the tokenizer as `tokenizer.json`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.inner
            .save(path, false)
            .map_err(TextGenError::tokenizer)
    }

    /// Token ids for `text`, with the model's special tokens added.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(TextGenError::tokenizer)?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(TextGenError::tokenizer)
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab(true).len()
    }

    /// First conventional end-of-sequence token present in the vocabulary.
    pub fn eos_token_id(&self) -> Option<u32> {
        EOS_CANDIDATES
            .iter()
            .find_map(|token| self.token_to_id(token))
    }
}

fn is_special(word: &str) -> bool {
    word.len() > 2 && word.starts_with('<') && word.ends_with('>')
}

fn word_level_json(words: &[&str], unk_token: &str) -> Value {
    let mut vocab = Map::new();
    let mut added = Vec::new();
    for word in words {
        if vocab.contains_key(*word) {
            continue;
        }
        let id = vocab.len();
        vocab.insert(word.to_string(), json!(id));
        if is_special(word) {
            added.push(json!({
                "id": id,
                "content": word,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true,
            }));
        }
    }

    json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": { "type": "Lowercase" },
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": unk_token,
        },
    })
}
