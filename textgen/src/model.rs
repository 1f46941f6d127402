//! Causal language model backends.
//!
//! Pretrained checkpoints are served by the candle-transformers
//! implementations, selected from the checkpoint's `config.json`.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{llama, mistral, qwen2};
use serde_json::Value;

use crate::error::{Result, TextGenError};

/// A model that maps token ids to next-token logits.
pub trait CausalLm {
    /// Run `input_ids` starting at position `seqlen_offset` and return the
    /// logits of the last position. Offset 0 starts a fresh sequence.
    fn forward(&mut self, input_ids: &[u32], seqlen_offset: usize) -> Result<Vec<f32>>;

    /// Forget cached keys and values from previous calls.
    fn clear_kv_cache(&mut self) -> Result<()>;

    fn vocab_size(&self) -> usize;
}

/// Architectures with a candle implementation wired in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Architecture {
    Llama,
    Mistral,
    Qwen2,
}

impl Architecture {
    fn from_model_type(model_type: &str) -> Option<Self> {
        match model_type {
            "llama" => Some(Self::Llama),
            "mistral" => Some(Self::Mistral),
            "qwen2" => Some(Self::Qwen2),
            _ => None,
        }
    }

    fn from_class_name(class: &str) -> Option<Self> {
        match class {
            "LlamaForCausalLM" => Some(Self::Llama),
            "MistralForCausalLM" => Some(Self::Mistral),
            "Qwen2ForCausalLM" => Some(Self::Qwen2),
            _ => None,
        }
    }
}

/// The parts of `config.json` needed before picking a backend.
#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub architecture: Architecture,
    pub vocab_size: Option<usize>,
    /// End-of-sequence ids declared by the checkpoint, possibly empty.
    pub eos_token_ids: Vec<u32>,
    raw: Value,
}

impl ModelConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let raw: Value = serde_json::from_slice(bytes)?;

        let by_type = raw.get("model_type").and_then(Value::as_str);
        let by_class = raw
            .get("architectures")
            .and_then(Value::as_array)
            .and_then(|classes| classes.first())
            .and_then(Value::as_str);
        let architecture = by_type
            .and_then(Architecture::from_model_type)
            .or_else(|| by_class.and_then(Architecture::from_class_name))
            .ok_or_else(|| {
                TextGenError::UnsupportedArchitecture(
                    by_type.or(by_class).unwrap_or("unknown").to_string(),
                )
            })?;

        let vocab_size = raw
            .get("vocab_size")
            .and_then(Value::as_u64)
            .map(|v| v as usize);
        let eos_token_ids = match raw.get("eos_token_id") {
            Some(Value::Number(n)) => n.as_u64().map(|id| vec![id as u32]).unwrap_or_default(),
            Some(Value::Array(ids)) => ids
                .iter()
                .filter_map(Value::as_u64)
                .map(|id| id as u32)
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            architecture,
            vocab_size,
            eos_token_ids,
            raw,
        })
    }
}

enum Backend {
    Llama {
        model: llama::Llama,
        cache: llama::Cache,
        config: llama::Config,
        dtype: DType,
    },
    Mistral(mistral::Model),
    Qwen2(qwen2::ModelForCausalLM),
}

/// A pretrained checkpoint materialized on a device.
pub struct HubModel {
    backend: Backend,
    device: Device,
    vocab_size: usize,
}

impl HubModel {
    pub fn load(config: &ModelConfig, vb: VarBuilder, dtype: DType, device: &Device) -> Result<Self> {
        let backend = match config.architecture {
            Architecture::Llama => {
                let cfg: llama::LlamaConfig = serde_json::from_value(config.raw.clone())?;
                let cfg = cfg.into_config(false);
                let cache = llama::Cache::new(true, dtype, &cfg, device)?;
                let model = llama::Llama::load(vb, &cfg)?;
                Backend::Llama {
                    model,
                    cache,
                    config: cfg,
                    dtype,
                }
            }
            Architecture::Mistral => {
                let cfg: mistral::Config = serde_json::from_value(config.raw.clone())?;
                Backend::Mistral(mistral::Model::new(&cfg, vb)?)
            }
            Architecture::Qwen2 => {
                let cfg: qwen2::Config = serde_json::from_value(config.raw.clone())?;
                Backend::Qwen2(qwen2::ModelForCausalLM::new(&cfg, vb)?)
            }
        };
        Ok(Self {
            backend,
            device: device.clone(),
            vocab_size: config.vocab_size.unwrap_or_default(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl CausalLm for HubModel {
    fn forward(&mut self, input_ids: &[u32], seqlen_offset: usize) -> Result<Vec<f32>> {
        let input = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let logits = match &mut self.backend {
            Backend::Llama { model, cache, .. } => model.forward(&input, seqlen_offset, cache)?,
            Backend::Mistral(model) => model.forward(&input, seqlen_offset)?,
            Backend::Qwen2(model) => model.forward(&input, seqlen_offset)?,
        };
        Ok(logits.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }

    fn clear_kv_cache(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Llama {
                cache,
                config,
                dtype,
                ..
            } => *cache = llama::Cache::new(true, *dtype, config, &self.device)?,
            Backend::Mistral(model) => model.clear_kv_cache(),
            Backend::Qwen2(model) => model.clear_kv_cache(),
        }
        Ok(())
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}
