//! Model acquisition: checkpoint files to a ready model and tokenizer.

use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;

use crate::device::{device_label, select_device, DevicePreference, Precision};
use crate::error::Result;
use crate::hub::{self, CheckpointSource, HubOptions};
use crate::model::{CausalLm, HubModel, ModelConfig};
use crate::reference::{ReferenceConfig, ReferenceTransformer};
use crate::tokenizer::TextTokenizer;

/// Checkpoint loaded when none is named.
pub const DEFAULT_MODEL_ID: &str = "Qwen/Qwen2.5-7B";

/// Vocabulary of the offline reference backend.
pub const REFERENCE_VOCAB: &[&str] = &[
    "<pad>", "<unk>", "<s>", "</s>", "hello", "world", "how", "are", "you", "i", "am", "fine",
    "what", "is", "your", "name", "my", "assistant", "help", "can", "please", "thank", "yes",
    "no", "the", "and", "a", "to", "of", "in", "that", "have", "it", "for", "not", "on", "with",
    "he", "as", "his", "they", "be", "at", "this", "from", "or", "had", "good", "great", "nice",
    "bad", "ok", "sure", "maybe", "think", "know", "see", ".", ",", "?", "!",
];

/// What to load and where to put it.
#[derive(Clone, Debug)]
pub struct LoadOptions {
    pub source: CheckpointSource,
    pub device: DevicePreference,
    pub precision: Precision,
    pub hub: HubOptions,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            source: CheckpointSource::hub(DEFAULT_MODEL_ID),
            device: DevicePreference::Auto,
            precision: Precision::Bf16,
            hub: HubOptions::default(),
        }
    }
}

/// A model handle together with its matching tokenizer.
pub struct LoadedModel {
    pub model: Box<dyn CausalLm>,
    pub tokenizer: TextTokenizer,
    pub device: Device,
    pub dtype: DType,
    /// Generation stops after any of these ids.
    pub eos_token_ids: Vec<u32>,
    /// Where the weights came from.
    pub source: String,
}

impl LoadedModel {
    /// Assemble a handle from an already constructed backend.
    pub fn from_parts(
        model: Box<dyn CausalLm>,
        tokenizer: TextTokenizer,
        device: Device,
        dtype: DType,
        eos_token_ids: Vec<u32>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            model,
            tokenizer,
            device,
            dtype,
            eos_token_ids,
            source: source.into(),
        }
    }

    /// Randomly initialized reference transformer with a built-in word
    /// vocabulary. Runs on the CPU and needs no downloads.
    pub fn reference(seed: u64) -> Result<Self> {
        let tokenizer = TextTokenizer::word_level(REFERENCE_VOCAB, "<unk>")?;
        let config = ReferenceConfig {
            vocab_size: tokenizer.vocab_size(),
            ..ReferenceConfig::default()
        };
        let eos_token_ids = tokenizer.eos_token_id().into_iter().collect();
        Ok(Self::from_parts(
            Box::new(ReferenceTransformer::new(config, seed)),
            tokenizer,
            Device::Cpu,
            DType::F32,
            eos_token_ids,
            format!("reference (seed {seed})"),
        ))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Resolve, download if needed, and materialize a checkpoint.
///
/// Errors from the hub client, the tensor backend and the tokenizer are
/// returned as they occur; nothing is retried.
pub fn load(options: &LoadOptions) -> Result<LoadedModel> {
    let start = Instant::now();
    let files = hub::resolve(&options.source, &options.hub)?;
    let config = ModelConfig::from_json(&std::fs::read(&files.config)?)?;
    tracing::info!("architecture {:?}", config.architecture);

    let device = select_device(options.device)?;
    let dtype = options.precision.dtype_for(&device);
    tracing::info!(
        "loading {} weight file(s) as {:?} on {}",
        files.weights.len(),
        dtype,
        device_label(&device)
    );
    // SAFETY: the safetensors files are not modified while mapped.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
    let model = HubModel::load(&config, vb, dtype, &device)?;

    let tokenizer = TextTokenizer::from_file(&files.tokenizer)?;
    let eos_token_ids = if config.eos_token_ids.is_empty() {
        tokenizer.eos_token_id().into_iter().collect()
    } else {
        config.eos_token_ids.clone()
    };
    if eos_token_ids.is_empty() {
        tracing::warn!("no end-of-sequence token found, generation runs to max_length");
    }

    tracing::info!(
        "loaded {} in {:.1}s",
        options.source.describe(),
        start.elapsed().as_secs_f64()
    );
    Ok(LoadedModel::from_parts(
        Box::new(model),
        tokenizer,
        device,
        dtype,
        eos_token_ids,
        options.source.describe(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_point_at_default_checkpoint() {
        let options = LoadOptions::default();
        assert_eq!(options.source, CheckpointSource::hub(DEFAULT_MODEL_ID));
        assert_eq!(options.precision, Precision::Bf16);
        assert_eq!(options.device, DevicePreference::Auto);
    }

    #[test]
    fn reference_model_matches_tokenizer() {
        let loaded = LoadedModel::reference(0).unwrap();
        assert_eq!(loaded.model.vocab_size(), loaded.tokenizer.vocab_size());
        assert_eq!(loaded.eos_token_ids, vec![3]);
        assert!(loaded.device().is_cpu());
    }

    #[test]
    fn missing_local_checkpoint_fails_before_touching_device() {
        let dir = tempfile::tempdir().unwrap();
        let options = LoadOptions {
            source: CheckpointSource::Local(dir.path().to_path_buf()),
            device: DevicePreference::Cpu,
            ..LoadOptions::default()
        };
        assert!(load(&options).is_err());
    }
}
