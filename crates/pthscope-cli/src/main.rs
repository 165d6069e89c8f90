//! pthscope CLI
//!
//! Prints a JSON description of a checkpoint: its keys, parameter counts,
//! tensor shapes and module hierarchy.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use pthscope::prelude::*;
use pthscope::utils::abbreviate;
use pthscope::ScopeError;

#[derive(Parser)]
#[command(name = "pthscope")]
#[command(version, about = "Describe the structure of a PyTorch checkpoint as JSON", long_about = None)]
struct Cli {
    /// Path to the checkpoint (.pth, .pt, .bin, .safetensors)
    model_path: PathBuf,

    /// Write the description to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Container format (auto, pickle, safetensors, torchscript)
    #[arg(long, default_value = "auto")]
    format: CheckpointFormat,

    /// Emit compact JSON instead of 4-space indentation
    #[arg(long)]
    compact: bool,

    /// Maximum pickle nesting depth to convert
    #[arg(long, default_value = "128")]
    max_depth: usize,
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries only the document
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = LoadConfig::new()
        .format(cli.format)
        .max_depth(cli.max_depth);
    let style = if cli.compact {
        ReportStyle::Compact
    } else {
        ReportStyle::Pretty
    };

    let document = describe_file(&cli.model_path, &config);
    if let Some(result) = document.result() {
        tracing::info!(
            path = %cli.model_path.display(),
            keys = result.summary.num_keys,
            params = %result.num_parameters().map(abbreviate).unwrap_or_else(|| "n/a".into()),
            "Analyzed checkpoint"
        );
    }

    match cli.output {
        Some(path) => match document.write_to(&path, style) {
            Ok(()) => println!("Model description saved to {}", path.display()),
            Err(ScopeError::Write { source, .. }) => {
                println!("Failed to save output to {}: {}", path.display(), source)
            }
            Err(e) => println!("Failed to save output to {}: {}", path.display(), e),
        },
        None => println!("{}", document.to_json(style)?),
    }

    Ok(())
}
