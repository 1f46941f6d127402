//! Generation parameters.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TextGenError};

/// Named sampling options passed to the decode loop.
///
/// Values are forwarded as given; out-of-range numbers are interpreted by the
/// sampler (e.g. `temperature <= 0` decodes greedily, `top_p >= 1` disables
/// nucleus filtering) rather than rejected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Total token budget, prompt included.
    pub max_length: usize,
    pub temperature: f64,
    /// Nucleus threshold.
    pub top_p: f64,
    pub num_return_sequences: usize,
    /// `false` selects the most likely token at every step.
    pub do_sample: bool,
    /// Fixed seed for repeatable sampling. `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Filler for sequences that stop early. Defaults to the end-of-sequence id.
    pub pad_token_id: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 100,
            temperature: 0.7,
            top_p: 0.9,
            num_return_sequences: 1,
            do_sample: true,
            seed: None,
            pad_token_id: None,
        }
    }
}

impl GenerationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a config from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_num_return_sequences(mut self, n: usize) -> Self {
        self.num_return_sequences = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn greedy(mut self) -> Self {
        self.do_sample = false;
        self
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.num_return_sequences == 0 {
            return Err(TextGenError::InvalidConfig(
                "num_return_sequences must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
