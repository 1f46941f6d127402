//! Prompt-to-text generation over a loaded model.

use std::fmt;
use std::time::{Duration, Instant};

use crate::config::GenerationConfig;
use crate::error::{Result, TextGenError};
use crate::loader::LoadedModel;
use crate::model::CausalLm;
use crate::sampling::Sampler;

/// Decoded generations for one prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationOutput {
    /// Exactly one sequence was requested.
    Single(String),
    /// `num_return_sequences > 1`; one entry per sequence, in order.
    Multiple(Vec<String>),
}

impl GenerationOutput {
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multiple(texts) => texts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn texts(&self) -> Vec<&str> {
        match self {
            Self::Single(text) => vec![text.as_str()],
            Self::Multiple(texts) => texts.iter().map(String::as_str).collect(),
        }
    }

    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::Single(text) => vec![text],
            Self::Multiple(texts) => texts,
        }
    }
}

impl fmt::Display for GenerationOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(text) => f.write_str(text),
            Self::Multiple(texts) => {
                for (i, text) in texts.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "[{}] {}", i + 1, text)?;
                }
                Ok(())
            }
        }
    }
}

/// Counters from the most recent `generate` call.
#[derive(Clone, Debug, Default)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    /// New tokens over all returned sequences.
    pub generated_tokens: usize,
    pub elapsed: Duration,
}

impl GenerationStats {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.generated_tokens as f64 / secs
        } else {
            0.0
        }
    }
}

/// Right-pad every sequence with `pad` to the length of the longest one.
pub fn pad_sequences(sequences: &mut [Vec<u32>], pad: u32) {
    let longest = sequences.iter().map(Vec::len).max().unwrap_or(0);
    for seq in sequences.iter_mut() {
        seq.resize(longest, pad);
    }
}

/// Owns a loaded model and turns prompts into text.
pub struct TextGenerator {
    model: LoadedModel,
    last_stats: Option<GenerationStats>,
}

impl TextGenerator {
    pub fn new(model: LoadedModel) -> Self {
        Self {
            model,
            last_stats: None,
        }
    }

    pub fn model(&self) -> &LoadedModel {
        &self.model
    }

    pub fn into_inner(self) -> LoadedModel {
        self.model
    }

    pub fn last_stats(&self) -> Option<&GenerationStats> {
        self.last_stats.as_ref()
    }

    /// Generate `config.num_return_sequences` continuations of `prompt`.
    ///
    /// The decoded text includes the prompt. Sampling is stochastic unless a
    /// seed is set or greedy decoding is selected.
    pub fn generate(&mut self, prompt: &str, config: &GenerationConfig) -> Result<GenerationOutput> {
        config.check()?;
        let start = Instant::now();
        let prompt_ids = self.model.tokenizer.encode(prompt)?;
        if prompt_ids.is_empty() {
            return Err(TextGenError::Generation(
                "prompt encodes to no tokens".to_string(),
            ));
        }
        if prompt_ids.len() >= config.max_length {
            tracing::warn!(
                "prompt has {} tokens, max_length is {}; nothing will be generated",
                prompt_ids.len(),
                config.max_length
            );
        }
        tracing::info!(
            "generating {} sequence(s) from {} prompt tokens",
            config.num_return_sequences,
            prompt_ids.len()
        );

        let mut sampler = Sampler::new(config);
        let mut sequences = Vec::with_capacity(config.num_return_sequences);
        for i in 0..config.num_return_sequences {
            let seq = self.decode_one(&prompt_ids, config.max_length, &mut sampler)?;
            tracing::debug!("sequence {} finished with {} tokens", i + 1, seq.len());
            sequences.push(seq);
        }

        let generated_tokens: usize = sequences
            .iter()
            .map(|seq| seq.len() - prompt_ids.len())
            .sum();
        if let Some(pad) = config
            .pad_token_id
            .or_else(|| self.model.eos_token_ids.first().copied())
        {
            pad_sequences(&mut sequences, pad);
        }

        let mut texts = sequences
            .iter()
            .map(|seq| self.model.tokenizer.decode(seq, true))
            .collect::<Result<Vec<_>>>()?;

        let stats = GenerationStats {
            prompt_tokens: prompt_ids.len(),
            generated_tokens,
            elapsed: start.elapsed(),
        };
        tracing::info!(
            "{} tokens in {:.2}s ({:.1} tok/s)",
            stats.generated_tokens,
            stats.elapsed.as_secs_f64(),
            stats.tokens_per_second()
        );
        self.last_stats = Some(stats);

        Ok(if config.num_return_sequences == 1 {
            GenerationOutput::Single(texts.remove(0))
        } else {
            GenerationOutput::Multiple(texts)
        })
    }

    /// Run prompts one after another with the same config.
    pub fn generate_batch<S: AsRef<str>>(
        &mut self,
        prompts: &[S],
        config: &GenerationConfig,
    ) -> Result<Vec<GenerationOutput>> {
        prompts
            .iter()
            .map(|prompt| self.generate(prompt.as_ref(), config))
            .collect()
    }

    fn decode_one(&mut self, prompt_ids: &[u32], max_length: usize, sampler: &mut Sampler) -> Result<Vec<u32>> {
        let mut tokens = prompt_ids.to_vec();
        if tokens.len() >= max_length {
            return Ok(tokens);
        }

        let model: &mut dyn CausalLm = &mut *self.model.model;
        model.clear_kv_cache()?;
        let mut logits = model.forward(&tokens, 0)?;
        loop {
            let next = sampler.sample(&logits)?;
            tokens.push(next);
            if self.model.eos_token_ids.contains(&next) || tokens.len() >= max_length {
                break;
            }
            logits = model.forward(&[next], tokens.len() - 1)?;
        }
        Ok(tokens)
    }
}
