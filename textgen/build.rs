//! Exposes the resolved versions of the model framework crates to
//! `env::EnvironmentReport` as `TEXTGEN_<NAME>_VERSION` variables.

use std::env;
use std::fs;
use std::path::PathBuf;

const FRAMEWORK_CRATES: &[&str] = &[
    "candle-core",
    "candle-nn",
    "candle-transformers",
    "tokenizers",
    "hf-hub",
];

fn find_lockfile() -> Option<PathBuf> {
    let manifest_dir = PathBuf::from(env::var_os("CARGO_MANIFEST_DIR")?);
    manifest_dir
        .ancestors()
        .map(|dir| dir.join("Cargo.lock"))
        .find(|path| path.is_file())
}

fn locked_version(lock: &str, name: &str) -> Option<String> {
    let wanted = format!("name = \"{name}\"");
    lock.split("[[package]]").find_map(|block| {
        let mut lines = block.lines().map(str::trim);
        lines.find(|line| *line == wanted)?;
        lines
            .find_map(|line| line.strip_prefix("version = \""))
            .map(|rest| rest.trim_end_matches('"').to_string())
    })
}

fn main() {
    let lockfile = find_lockfile();
    let lock = lockfile
        .as_ref()
        .and_then(|path| fs::read_to_string(path).ok())
        .unwrap_or_default();
    if let Some(path) = &lockfile {
        println!("cargo:rerun-if-changed={}", path.display());
    }
    println!("cargo:rerun-if-changed=build.rs");

    for name in FRAMEWORK_CRATES {
        let version = locked_version(&lock, name).unwrap_or_else(|| "unknown".to_string());
        let var = name.to_uppercase().replace('-', "_");
        println!("cargo:rustc-env=TEXTGEN_{var}_VERSION={version}");
    }
}
