//! Windlass CLI - inspect and compact exported context windows

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use windlass_core::prelude::*;

#[derive(Parser)]
#[command(name = "windlass")]
#[command(about = "Tiered context window tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to windlass.toml plus WINDLASS_* variables)
    #[arg(short, long, global = true, env = "WINDLASS_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the size analysis of an exported context
    Analyze {
        /// Exported context JSON
        file: PathBuf,

        /// Override the token ceiling
        #[arg(long)]
        max_tokens: Option<usize>,
    },
    /// Compress an exported context and write the result
    Compress {
        /// Exported context JSON
        file: PathBuf,

        /// Strategy name (default: configured or recommended)
        #[arg(short, long)]
        strategy: Option<String>,

        /// Override the token ceiling
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Override the number of preserved recent messages
        #[arg(long)]
        preserve: Option<usize>,

        /// Compress even when the context is within its ceiling
        #[arg(long)]
        force: bool,

        /// Write the compressed export here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List compression strategies
    Strategies,
    /// Version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze { file, max_tokens } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(max) = max_tokens {
                config.window = config.window.with_max_tokens(max);
            }
            let window = open_window(config, &file).await?;
            let analysis = window.analyze_context();
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Commands::Compress {
            file,
            strategy,
            max_tokens,
            preserve,
            force,
            output,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(max) = max_tokens {
                config.window = config.window.with_max_tokens(max);
            }
            if let Some(count) = preserve {
                config.window = config.window.with_preserve_last_n(count);
            }
            let mut window = open_window(config, &file).await?;

            let report = match (strategy.as_deref(), force) {
                (Some(name), _) => window.compress_context_named(name).await?,
                (None, true) => window.compress_context(None).await,
                (None, false) => window.compress().await,
            };
            print_report(&report);

            let export = serde_json::to_string_pretty(&window.export_context())?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, export)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    tracing::info!(path = %path.display(), "compressed context written");
                }
                None => println!("{}", export),
            }
        }
        Commands::Strategies => {
            for kind in StrategyKind::ALL {
                println!(
                    "{:<18} expected ratio {:.2}",
                    kind.as_str(),
                    kind.expected_ratio()
                );
            }
        }
        Commands::Version => {
            println!("windlass {}", env!("CARGO_PKG_VERSION"));
            println!("windlass-core {}", windlass_core::VERSION);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<WindlassConfig> {
    let config = match path {
        Some(path) => WindlassConfig::from_file(path)?,
        None => WindlassConfig::load()?,
    };
    Ok(config)
}

/// In-memory window holding the contents of an export file
async fn open_window(mut config: WindlassConfig, file: &Path) -> Result<ContextWindowManager> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let payload: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("{} is not JSON", file.display()))?;

    let provider = LLMProviderFactory::create_or_stub(config.llm.as_ref())?;
    config.window = config.window.with_auto_compress(false).with_auto_persist(false);

    let session_id = payload
        .get("sessionId")
        .and_then(|v| v.as_str())
        .unwrap_or("cli")
        .to_string();

    let mut window = ContextWindowManager::builder(session_id)
        .config(config)
        .llm(provider)
        .build()
        .await?;
    window.import_context(&payload)?;
    Ok(window)
}

fn print_report(report: &CompressionReport) {
    if let Some(reason) = &report.skipped {
        eprintln!("compression skipped: {:?}", reason);
        return;
    }
    if let Some(result) = &report.result {
        if result.success {
            eprintln!(
                "{}: {} -> {} tokens (ratio {:.2}, loss ~{:.2}{})",
                result.strategy,
                result.original_tokens,
                result.compressed_tokens,
                result.compression_ratio,
                result.loss_estimate,
                if result.used_fallback { ", fallback" } else { "" }
            );
        } else {
            eprintln!(
                "{} failed: {}",
                result.strategy,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    eprintln!(
        "window: {} -> {} tokens, {} evicted",
        report.tokens_before,
        report.tokens_after,
        report.evicted.len()
    );
}
