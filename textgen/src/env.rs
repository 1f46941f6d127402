//! Read-only environment diagnostics.

use std::fmt;

use candle_core::utils;

use crate::device::{device_label, select_device, DevicePreference};

/// Versions of the model framework crates this build was linked against,
/// taken from the lockfile at build time ("unknown" when there was none).
pub const FRAMEWORK_VERSIONS: &[(&str, &str)] = &[
    ("candle-core", env!("TEXTGEN_CANDLE_CORE_VERSION")),
    ("candle-nn", env!("TEXTGEN_CANDLE_NN_VERSION")),
    ("candle-transformers", env!("TEXTGEN_CANDLE_TRANSFORMERS_VERSION")),
    ("tokenizers", env!("TEXTGEN_TOKENIZERS_VERSION")),
    ("hf-hub", env!("TEXTGEN_HF_HUB_VERSION")),
];

/// Snapshot of what this build and machine can run on.
#[derive(Clone, Debug)]
pub struct EnvironmentReport {
    pub crate_version: &'static str,
    pub framework_versions: Vec<(&'static str, &'static str)>,
    pub cuda_compiled: bool,
    pub metal_compiled: bool,
    pub cuda_available: bool,
    pub metal_available: bool,
    pub mkl: bool,
    pub accelerate: bool,
    pub avx: bool,
    pub neon: bool,
    pub f16c: bool,
    pub num_threads: usize,
    /// Device that automatic placement would pick.
    pub auto_device: String,
}

impl EnvironmentReport {
    pub fn collect() -> Self {
        let auto_device = match select_device(DevicePreference::Auto) {
            Ok(device) => device_label(&device),
            Err(e) => format!("unavailable ({e})"),
        };
        Self {
            crate_version: env!("CARGO_PKG_VERSION"),
            framework_versions: FRAMEWORK_VERSIONS.to_vec(),
            cuda_compiled: cfg!(feature = "cuda"),
            metal_compiled: cfg!(feature = "metal"),
            cuda_available: utils::cuda_is_available(),
            metal_available: utils::metal_is_available(),
            mkl: utils::has_mkl(),
            accelerate: utils::has_accelerate(),
            avx: utils::with_avx(),
            neon: utils::with_neon(),
            f16c: utils::with_f16c(),
            num_threads: utils::get_num_threads(),
            auto_device,
        }
    }

    pub fn accelerator_available(&self) -> bool {
        self.cuda_available || self.metal_available
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

impl fmt::Display for EnvironmentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "hub-textgen {}", self.crate_version)?;
        let versions: Vec<String> = self
            .framework_versions
            .iter()
            .map(|(name, version)| format!("{name}={version}"))
            .collect();
        writeln!(f, "Libs:   {}", versions.join(" "))?;
        writeln!(
            f,
            "CUDA:   available={} (compiled={})",
            yes_no(self.cuda_available),
            yes_no(self.cuda_compiled)
        )?;
        writeln!(
            f,
            "Metal:  available={} (compiled={})",
            yes_no(self.metal_available),
            yes_no(self.metal_compiled)
        )?;
        writeln!(
            f,
            "CPU:    threads={} avx={} neon={} f16c={} mkl={} accelerate={}",
            self.num_threads,
            yes_no(self.avx),
            yes_no(self.neon),
            yes_no(self.f16c),
            yes_no(self.mkl),
            yes_no(self.accelerate)
        )?;
        write!(f, "Device: {}", self.auto_device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_is_consistent_with_build() {
        let report = EnvironmentReport::collect();
        assert_eq!(report.crate_version, env!("CARGO_PKG_VERSION"));
        assert!(report.num_threads >= 1);
        if !report.cuda_compiled {
            assert!(!report.cuda_available);
        }
        if !report.accelerator_available() {
            assert_eq!(report.auto_device, "cpu");
        }
    }

    #[test]
    fn display_lists_every_section() {
        let text = EnvironmentReport::collect().to_string();
        for section in ["hub-textgen", "Libs:", "CUDA:", "Metal:", "CPU:", "Device:"] {
            assert!(text.contains(section), "missing {section} in {text}");
        }
        for lib in ["candle-core=", "tokenizers=", "hf-hub="] {
            assert!(text.contains(lib), "missing {lib} in {text}");
        }
    }

    #[test]
    fn framework_versions_come_from_the_lockfile() {
        let report = EnvironmentReport::collect();
        let names: Vec<&str> = report.framework_versions.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            ["candle-core", "candle-nn", "candle-transformers", "tokenizers", "hf-hub"]
        );
        for (name, version) in &report.framework_versions {
            assert!(!version.is_empty(), "{name} has no version");
        }
        let (_, candle) = report.framework_versions[0];
        if candle != "unknown" {
            assert!(candle.starts_with("0.8."), "candle-core {candle}");
        }
    }
}
