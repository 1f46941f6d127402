use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hub_textgen::env::EnvironmentReport;
use hub_textgen::{
    CheckpointSource, DevicePreference, GenerationConfig, HubOptions, LoadOptions, LoadedModel,
    MemoryReclaimer, MemoryReport, Precision, TextGenerator, DEFAULT_MODEL_ID,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sample text from a pretrained causal language model")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print accelerator availability and build information.
    Env,
    /// Print current memory usage per device.
    Memory,
    /// Load a checkpoint and generate text.
    Generate(GenerateArgs),
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Prompt to complete.
    #[arg(long)]
    prompt: Option<String>,

    /// Input file with prompts (one per line).
    #[arg(long)]
    input_file: Option<PathBuf>,

    /// Run in interactive mode; `/exit` quits.
    #[arg(long)]
    interactive: bool,

    /// Hub repository of the checkpoint.
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model_id: String,

    #[arg(long, default_value = "main")]
    revision: String,

    /// Load from a local checkpoint directory instead of the hub.
    #[arg(long, conflicts_with = "model_id")]
    local_dir: Option<PathBuf>,

    /// Use the offline reference model with random weights.
    #[arg(long, conflicts_with_all = ["model_id", "local_dir"])]
    reference: bool,

    /// Run on CPU rather than on an accelerator.
    #[arg(long)]
    cpu: bool,

    /// Weight precision: bf16, f16 or f32.
    #[arg(long, default_value = "bf16")]
    dtype: Precision,

    /// Hub cache directory (defaults to HF_HOME).
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Maximum total length in tokens, prompt included.
    #[arg(long, default_value_t = 100)]
    max_length: usize,

    /// Sampling temperature.
    #[arg(long, default_value_t = 0.7)]
    temperature: f64,

    /// Nucleus sampling probability cutoff.
    #[arg(long, default_value_t = 0.9)]
    top_p: f64,

    /// Number of sequences to return per prompt.
    #[arg(long, default_value_t = 1)]
    num_return_sequences: usize,

    /// The seed to use when generating random samples.
    #[arg(long)]
    seed: Option<u64>,

    /// Always pick the most likely token.
    #[arg(long)]
    greedy: bool,

    /// JSON generation config; replaces the sampling flags above.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl GenerateArgs {
    fn generation_config(&self) -> Result<GenerationConfig> {
        if let Some(path) = &self.config {
            return GenerationConfig::from_json_file(path)
                .with_context(|| format!("reading generation config {}", path.display()));
        }
        Ok(GenerationConfig {
            max_length: self.max_length,
            temperature: self.temperature,
            top_p: self.top_p,
            num_return_sequences: self.num_return_sequences,
            do_sample: !self.greedy,
            seed: self.seed,
            pad_token_id: None,
        })
    }

    fn load_options(&self) -> LoadOptions {
        let source = match &self.local_dir {
            Some(dir) => CheckpointSource::Local(dir.clone()),
            None => CheckpointSource::Hub {
                model_id: self.model_id.clone(),
                revision: self.revision.clone(),
            },
        };
        LoadOptions {
            source,
            device: if self.cpu {
                DevicePreference::Cpu
            } else {
                DevicePreference::Auto
            },
            precision: self.dtype,
            hub: HubOptions {
                cache_dir: self.cache_dir.clone(),
                ..HubOptions::default()
            },
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_prompts(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading prompts from {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

fn run_generate(args: &GenerateArgs) -> Result<()> {
    let config = args.generation_config()?;
    let loaded = if args.reference {
        LoadedModel::reference(args.seed.unwrap_or(0))?
    } else {
        let options = args.load_options();
        hub_textgen::load(&options)
            .with_context(|| format!("loading {}", options.source.describe()))?
    };
    info!(source = %loaded.source, dtype = ?loaded.dtype, "model ready");
    let reclaimer = MemoryReclaimer::for_device(loaded.device());
    let mut generator = TextGenerator::new(loaded);

    if args.interactive {
        let stdin = io::stdin();
        let mut input = String::new();
        loop {
            print!(">>> ");
            io::stdout().flush()?;
            input.clear();
            if stdin.lock().read_line(&mut input)? == 0 {
                break;
            }
            let trimmed = input.trim();
            if trimmed == "/exit" {
                break;
            }
            if trimmed.is_empty() {
                continue;
            }
            println!("{}", generator.generate(trimmed, &config)?);
        }
    } else if let Some(path) = &args.input_file {
        let prompts = load_prompts(path)?;
        let outputs = generator.generate_batch(&prompts, &config)?;
        for (prompt, output) in prompts.iter().zip(outputs.iter()) {
            println!("Prompt: {}", prompt);
            println!("Completion: {}\n", output);
        }
    } else {
        let prompt = args
            .prompt
            .as_deref()
            .context("one of --prompt, --input-file or --interactive is required")?;
        println!("{}", generator.generate(prompt, &config)?);
    }
    if let Some(stats) = generator.last_stats() {
        info!(
            generated = stats.generated_tokens,
            tokens_per_second = stats.tokens_per_second(),
            "generation finished"
        );
    }

    println!("{}", reclaimer.reclaim(generator));
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Command::Env => println!("{}", EnvironmentReport::collect()),
        Command::Memory => println!("{}", MemoryReport::collect()),
        Command::Generate(args) => run_generate(args)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn generate_defaults_match_library_defaults() {
        let cli = Cli::parse_from(["textgen", "generate", "--prompt", "hi"]);
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.generation_config().unwrap(), GenerationConfig::default());
        let options = args.load_options();
        assert_eq!(options.source, CheckpointSource::hub(DEFAULT_MODEL_ID));
        assert_eq!(options.precision, Precision::Bf16);
    }

    #[test]
    fn flags_override_sampling() {
        let cli = Cli::parse_from([
            "textgen",
            "generate",
            "--prompt",
            "hi",
            "--temperature",
            "0.2",
            "--top-p",
            "0.5",
            "--num-return-sequences",
            "4",
            "--greedy",
            "--cpu",
            "--dtype",
            "f16",
        ]);
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        let cfg = args.generation_config().unwrap();
        assert_eq!(cfg.temperature, 0.2);
        assert_eq!(cfg.top_p, 0.5);
        assert_eq!(cfg.num_return_sequences, 4);
        assert!(!cfg.do_sample);
        let options = args.load_options();
        assert_eq!(options.device, DevicePreference::Cpu);
        assert_eq!(options.precision, Precision::F16);
    }

    #[test]
    fn local_dir_becomes_local_source() {
        let cli = Cli::parse_from(["textgen", "generate", "--prompt", "hi", "--local-dir", "/tmp/ckpt"]);
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(
            args.load_options().source,
            CheckpointSource::Local(PathBuf::from("/tmp/ckpt"))
        );
    }

    #[test]
    fn prompts_file_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompts.txt");
        fs::write(&path, "first\n\n  second  \n").unwrap();
        assert_eq!(load_prompts(&path).unwrap(), vec!["first", "second"]);
    }
}
