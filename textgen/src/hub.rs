//! Resolving checkpoint files from the Hugging Face Hub or a local directory.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Cache, Repo, RepoType};
use serde::Deserialize;

use crate::error::{Result, TextGenError};

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Where a checkpoint comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckpointSource {
    Hub { model_id: String, revision: String },
    Local(PathBuf),
}

impl CheckpointSource {
    pub fn hub(model_id: impl Into<String>) -> Self {
        Self::Hub {
            model_id: model_id.into(),
            revision: "main".to_string(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Hub { model_id, revision } => format!("{model_id}@{revision}"),
            Self::Local(dir) => dir.display().to_string(),
        }
    }
}

/// Hub client settings.
#[derive(Clone, Debug)]
pub struct HubOptions {
    /// Access token for gated repositories. Falls back to `HF_TOKEN`.
    pub token: Option<String>,
    /// Overrides the default cache location (`HF_HOME`).
    pub cache_dir: Option<PathBuf>,
    pub progress: bool,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            token: None,
            cache_dir: None,
            progress: true,
        }
    }
}

/// Paths to the files a checkpoint is made of, all on local disk.
#[derive(Clone, Debug)]
pub struct CheckpointFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// Shard file names listed in a `model.safetensors.index.json`, sorted and
/// without duplicates.
pub fn shard_names(index_json: &[u8]) -> Result<Vec<String>> {
    let index: SafetensorsIndex = serde_json::from_slice(index_json)?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(shards.into_iter().collect())
}

/// Fetch (or find in cache) every file needed to load `source`.
pub fn resolve(source: &CheckpointSource, options: &HubOptions) -> Result<CheckpointFiles> {
    match source {
        CheckpointSource::Hub { model_id, revision } => {
            resolve_hub(model_id, revision, options)
        }
        CheckpointSource::Local(dir) => resolve_local(dir),
    }
}

fn resolve_hub(model_id: &str, revision: &str, options: &HubOptions) -> Result<CheckpointFiles> {
    let token = options
        .token
        .clone()
        .or_else(|| std::env::var("HF_TOKEN").ok());
    let mut builder = ApiBuilder::new().with_progress(options.progress);
    if token.is_some() {
        builder = builder.with_token(token);
    }
    if let Some(dir) = &options.cache_dir {
        builder = builder.with_cache_dir(dir.clone());
    }
    let api = builder.build()?;
    let repo_id = Repo::with_revision(model_id.to_string(), RepoType::Model, revision.to_string());
    let cache = match &options.cache_dir {
        Some(dir) => Cache::new(dir.clone()),
        None => Cache::default(),
    };
    let cached: Vec<&str> = [WEIGHTS_INDEX_FILE, SINGLE_WEIGHTS_FILE]
        .into_iter()
        .filter(|name| cache.repo(repo_id.clone()).get(name).is_some())
        .collect();
    let repo = api.repo(repo_id);

    tracing::info!("resolving {model_id}@{revision}");
    let config = repo.get(CONFIG_FILE)?;
    let tokenizer = repo.get(TOKENIZER_FILE)?;
    let weights = hub_weights(&repo, model_id, &cached)?;
    tracing::info!("{} weight file(s) ready", weights.len());

    Ok(CheckpointFiles {
        config,
        tokenizer,
        weights,
    })
}

/// Which weights entry point a repository listing offers: the shard index
/// when present, otherwise the single safetensors file.
pub fn weights_entry<'a>(files: impl IntoIterator<Item = &'a str>) -> Option<&'static str> {
    let mut single = false;
    for file in files {
        if file == WEIGHTS_INDEX_FILE {
            return Some(WEIGHTS_INDEX_FILE);
        }
        single |= file == SINGLE_WEIGHTS_FILE;
    }
    single.then_some(SINGLE_WEIGHTS_FILE)
}

fn hub_weights(repo: &ApiRepo, model_id: &str, cached: &[&str]) -> Result<Vec<PathBuf>> {
    let entry = match weights_entry(cached.iter().copied()) {
        Some(entry) => entry,
        None => {
            let info = repo.info()?;
            weights_entry(info.siblings.iter().map(|s| s.rfilename.as_str())).ok_or_else(
                || TextGenError::MissingFile(Path::new(model_id).join(SINGLE_WEIGHTS_FILE)),
            )?
        }
    };
    if entry == SINGLE_WEIGHTS_FILE {
        return Ok(vec![repo.get(SINGLE_WEIGHTS_FILE)?]);
    }
    let index_path = repo.get(WEIGHTS_INDEX_FILE)?;
    shard_names(&std::fs::read(index_path)?)?
        .iter()
        .map(|name| -> Result<PathBuf> {
            tracing::debug!("fetching shard {name}");
            Ok(repo.get(name)?)
        })
        .collect()
}

fn resolve_local(dir: &Path) -> Result<CheckpointFiles> {
    let existing = |name: &str| -> Result<PathBuf> {
        let path = dir.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(TextGenError::MissingFile(path))
        }
    };

    let config = existing(CONFIG_FILE)?;
    let tokenizer = existing(TOKENIZER_FILE)?;
    let index = dir.join(WEIGHTS_INDEX_FILE);
    let weights = if index.is_file() {
        shard_names(&std::fs::read(&index)?)?
            .iter()
            .map(|name| existing(name))
            .collect::<Result<Vec<_>>>()?
    } else {
        vec![existing(SINGLE_WEIGHTS_FILE)?]
    };

    Ok(CheckpointFiles {
        config,
        tokenizer,
        weights,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn weights_entry_prefers_the_shard_index() {
        let listing = ["config.json", "model.safetensors", "model.safetensors.index.json"];
        assert_eq!(weights_entry(listing), Some(WEIGHTS_INDEX_FILE));
        assert_eq!(
            weights_entry(["config.json", "model.safetensors"]),
            Some(SINGLE_WEIGHTS_FILE)
        );
        assert_eq!(weights_entry(["config.json", "pytorch_model.bin"]), None);
    }

    #[test]
    fn shard_names_are_unique_and_sorted() {
        let index = r#"{
            "metadata": {"total_size": 10},
            "weight_map": {
                "lm_head.weight": "model-00002-of-00002.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "model.norm.weight": "model-00002-of-00002.safetensors"
            }
        }"#;
        let names = shard_names(index.as_bytes()).unwrap();
        assert_eq!(
            names,
            vec![
                "model-00001-of-00002.safetensors",
                "model-00002-of-00002.safetensors"
            ]
        );
    }

    #[test]
    fn local_single_file_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), TOKENIZER_FILE, "{}");
        touch(dir.path(), SINGLE_WEIGHTS_FILE, "");

        let files = resolve(&CheckpointSource::Local(dir.path().to_path_buf()), &HubOptions::default())
            .unwrap();
        assert_eq!(files.weights, vec![dir.path().join(SINGLE_WEIGHTS_FILE)]);
        assert_eq!(files.config, dir.path().join(CONFIG_FILE));
    }

    #[test]
    fn local_sharded_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), TOKENIZER_FILE, "{}");
        touch(
            dir.path(),
            WEIGHTS_INDEX_FILE,
            r#"{"weight_map": {"a": "part-2.safetensors", "b": "part-1.safetensors"}}"#,
        );
        touch(dir.path(), "part-1.safetensors", "");
        touch(dir.path(), "part-2.safetensors", "");

        let files = resolve_local(dir.path()).unwrap();
        assert_eq!(
            files.weights,
            vec![
                dir.path().join("part-1.safetensors"),
                dir.path().join("part-2.safetensors")
            ]
        );
    }

    #[test]
    fn local_missing_shard_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        touch(dir.path(), TOKENIZER_FILE, "{}");
        touch(
            dir.path(),
            WEIGHTS_INDEX_FILE,
            r#"{"weight_map": {"a": "part-1.safetensors"}}"#,
        );

        match resolve_local(dir.path()) {
            Err(TextGenError::MissingFile(path)) => {
                assert_eq!(path, dir.path().join("part-1.safetensors"))
            }
            other => panic!("expected missing shard, got {other:?}"),
        }
    }

    #[test]
    fn local_missing_tokenizer_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE, "{}");
        assert!(matches!(
            resolve_local(dir.path()),
            Err(TextGenError::MissingFile(_))
        ));
    }

    #[test]
    fn hub_source_describes_revision() {
        assert_eq!(CheckpointSource::hub("org/model").describe(), "org/model@main");
    }
}
