// Notation Synth CLI entry point.
//
// Builds the synthetic dataset from the PrIMuS archive. The pipeline:
// archive → incipits → MEI patch → normalizer batches → pages → renderer
// → staff crops → dataset tree.
//
// Usage:
//   cargo run -p notation_synth --bin synthesize -- build [--config synth.json]
//     [--seed N] [--max-pages N] [--archive PATH] [--output DIR] [--exact-progress]
//   cargo run -p notation_synth --bin synthesize -- count [--config synth.json] [--archive PATH]
//   cargo run -p notation_synth --bin synthesize -- print-config
//
// Without --config the built-in defaults are used. Log verbosity follows
// RUST_LOG (default: info).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use notation_synth::config::SynthConfig;
use notation_synth::corpus::PrimusCorpus;
use notation_synth::synth::{Synthesizer, refined_incipits};

#[derive(Parser)]
#[command(name = "synthesize", version, about = "Synthetic handwritten music page generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate the dataset
    Build {
        /// JSON run configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the configured seed
        #[arg(long)]
        seed: Option<u64>,

        /// Stop after this many pages
        #[arg(long)]
        max_pages: Option<usize>,

        /// Override the archive path
        #[arg(long)]
        archive: Option<PathBuf>,

        /// Override the output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Count the corpus with a full pass first, for exact progress
        #[arg(long)]
        exact_progress: bool,
    },

    /// Count the incipits that survive filtering
    Count {
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(long)]
        archive: Option<PathBuf>,
    },

    /// Print the default configuration as JSON
    PrintConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<SynthConfig> {
    match path {
        Some(path) => SynthConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(SynthConfig::default()),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Build {
            config,
            seed,
            max_pages,
            archive,
            output,
            exact_progress,
        } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(seed) = seed {
                config.seed = seed;
            }
            if max_pages.is_some() {
                config.max_pages = max_pages;
            }
            if let Some(archive) = archive {
                config.archive = archive;
            }
            if let Some(output) = output {
                config.output_dir = output;
            }
            build(&config, exact_progress)
        }
        Command::Count { config, archive } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(archive) = archive {
                config.archive = archive;
            }
            let corpus = PrimusCorpus::new(&config.archive);
            let count = corpus
                .count_records()
                .with_context(|| format!("Failed to read {}", config.archive.display()))?;
            println!("{count}");
            Ok(())
        }
        Command::PrintConfig => {
            let json = serde_json::to_string_pretty(&SynthConfig::default())?;
            println!("{json}");
            Ok(())
        }
    }
}

fn build(config: &SynthConfig, exact_progress: bool) -> Result<()> {
    info!(
        "Building dataset from {} into {} (seed {})",
        config.archive.display(),
        config.output_dir.display(),
        config.seed
    );

    let corpus = PrimusCorpus::new(&config.archive);
    let expected = corpus.expected_len();
    let corpus = corpus.restartable();

    let expected = if exact_progress {
        info!("Counting incipits...");
        let counted = corpus
            .iter()
            .try_fold(0usize, |n, record| record.map(|_| n + 1))
            .with_context(|| format!("Failed to read {}", config.archive.display()))?;
        info!("{counted} incipits");
        counted
    } else {
        expected
    };

    let incipits = refined_incipits(
        corpus.iter(),
        config.refiner.runner(),
        config.refine_settings(),
        config.refiner.batch_size,
    )?;
    let summary = Synthesizer::new(config, config.renderer())
        .with_expected_incipits(expected)
        .run(incipits)
        .context("Synthesis failed")?;

    println!(
        "{} pages, {} staves, {} render failures",
        summary.pages_written, summary.staves_written, summary.render_failures
    );
    Ok(())
}
