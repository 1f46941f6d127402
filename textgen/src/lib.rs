//! Load a pretrained causal language model from the Hugging Face Hub, sample
//! text from it, and release its memory afterwards.
//!
//! The flow is linear: [`env::EnvironmentReport`] for diagnostics,
//! [`loader::load`] for the model and tokenizer, [`TextGenerator`] for
//! generation, and [`MemoryReclaimer`] to drop the model and report usage.

pub mod config;
pub mod device;
pub mod env;
pub mod error;
pub mod generation;
pub mod hub;
pub mod loader;
pub mod memory;
pub mod model;
pub mod reference;
pub mod sampling;
pub mod tokenizer;

pub use config::GenerationConfig;
pub use device::{DevicePreference, Precision};
pub use error::{Result, TextGenError};
pub use generation::{GenerationOutput, GenerationStats, TextGenerator};
pub use hub::{CheckpointSource, HubOptions};
pub use loader::{load, LoadOptions, LoadedModel, DEFAULT_MODEL_ID};
pub use memory::{MemoryReclaimer, MemoryReport};
pub use model::CausalLm;
pub use tokenizer::TextTokenizer;
