mod demo;

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stagerun_core::config::AppConfig;
use stagerun_core::types::ExecContext;

#[derive(Parser)]
#[command(name = "stagerun", version, about = "Bundle execution plans for staged pipelines")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stagerun.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reference pipeline through a plan (default)
    Run {
        /// Override the number of bundles
        #[arg(long)]
        bundles: Option<usize>,
        /// Override the number of elements per bundle
        #[arg(long)]
        elements: Option<usize>,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stagerun", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        Some(AppConfig::load(&cli.config)?)
    } else {
        None
    };

    // Initialize tracing
    let directive = config
        .as_ref()
        .and_then(|c| c.log.filter.clone())
        .unwrap_or_else(|| "stagerun=info,warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)),
        )
        .with_target(false)
        .init();

    let mut config = match config {
        Some(config) => {
            info!(path = %cli.config.display(), "Loaded config");
            config
        }
        None => {
            warn!(path = %cli.config.display(), "No config file found, using defaults");
            AppConfig::default()
        }
    };

    match cli.command {
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Some(Commands::Run { bundles, elements }) => {
            if let Some(bundles) = bundles {
                config.demo.bundles = bundles;
            }
            if let Some(elements) = elements {
                config.demo.elements = elements;
            }
            config.validate()?;
            run(&config).await?;
        }
        None => run(&config).await?,
        Some(Commands::Completions { .. }) => unreachable!("handled before config load"),
    }

    Ok(())
}

async fn run(config: &AppConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let ctx = ExecContext::with_cancel(cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling bundle");
            cancel.cancel();
        }
    });

    let report = demo::run(config, &ctx).await?;
    for bundle in &report.bundles {
        match bundle.split_at {
            Some(offset) => println!(
                "{}: {} in, {} out (split at {})",
                bundle.bundle_id, bundle.input, bundle.output, offset
            ),
            None => println!("{}: {} in, {} out", bundle.bundle_id, bundle.input, bundle.output),
        }
    }
    println!("{}", serde_json::to_string_pretty(&report.metrics)?);
    info!(plan_id = %report.plan, "Plan finished");
    Ok(())
}
