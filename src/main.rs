use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ast_labeler::checkpoint::HttpFetcher;
use ast_labeler::client::{self, Action, LabelOptions, ResultPathOptions};
use ast_labeler::config::Config;
use ast_labeler::export::{self, ExportOptions};
use ast_labeler::service::{self, ServiceOptions};
use ast_labeler::telemetry;

#[derive(Debug, Parser)]
#[command(about, long_about = None, version)]
struct Cli {
    /// Config file, defaults to ~/.ast-labeler.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download the pretrained checkpoint if needed and export the servable artifact
    Export {
        /// Local checkpoint path
        #[arg(long)]
        checkpoint: Option<String>,

        /// Checkpoint download URL
        #[arg(long)]
        url: Option<String>,

        /// Artifact output path
        #[arg(short, long)]
        output: Option<String>,

        /// Skip the forward pass check before writing
        #[arg(long)]
        no_verify: bool,
    },

    /// Serve an exported artifact over HTTP
    Serve {
        #[arg(short, long)]
        address: Option<String>,

        #[arg(short, long)]
        model_path: Option<String>,

        #[arg(short, long)]
        batch_size: Option<usize>,

        /// How long a batch waits to fill, in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Label an audio file or every audio file under a directory
    Label {
        #[arg(required = true)]
        path: PathBuf,

        /// Service address
        #[arg(short, long)]
        address: Option<String>,

        #[command(subcommand)]
        route: Option<Route>,
    },
}

#[derive(Debug, Subcommand)]
enum Route {
    /// Copy each file into its label's directory
    Copy(RouteDirs),
    /// Move each file into its label's directory
    Move(RouteDirs),
}

#[derive(Debug, clap::Args)]
struct RouteDirs {
    #[arg(short, long)]
    speech_dir: Option<PathBuf>,

    #[arg(short, long)]
    music_dir: Option<PathBuf>,

    #[arg(short, long)]
    noise_dir: Option<PathBuf>,
}

impl Route {
    fn into_routing(self) -> (Action, ResultPathOptions) {
        let (action, dirs) = match self {
            Self::Copy(dirs) => (Action::Copy, dirs),
            Self::Move(dirs) => (Action::Move, dirs),
        };
        let options = ResultPathOptions {
            speech_dir: dirs.speech_dir,
            music_dir: dirs.music_dir,
            noise_dir: dirs.noise_dir,
        };
        (action, options)
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")
}

// reqwest's blocking client panics inside a runtime; only serve and label get one
#[allow(clippy::print_stdout)]
fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    telemetry::init(config.telemetry.enabled, &config.telemetry.log_path)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ast-labeler starting");

    match cli.command {
        Command::Export {
            checkpoint,
            url,
            output,
            no_verify,
        } => {
            if let Some(checkpoint) = checkpoint {
                config.checkpoint.path = checkpoint;
            }
            if let Some(url) = url {
                config.checkpoint.url = url;
            }
            if let Some(output) = output {
                config.export.output = output;
            }
            if no_verify {
                config.export.verify = false;
            }

            let options = ExportOptions::from_config(&config)?;
            let fetcher = HttpFetcher::new().context("failed to build HTTP client")?;
            let report = export::export_model(&options, &fetcher)?;

            if report.downloaded {
                println!("✓ Checkpoint downloaded to {}", options.checkpoint_path.display());
            }
            println!(
                "✓ Exported {} tensors to {}",
                report.tensors,
                report.output_path.display()
            );
        }

        Command::Serve {
            address,
            model_path,
            batch_size,
            timeout_ms,
        } => {
            if let Some(address) = address {
                config.service.address = address;
            }
            if let Some(model_path) = model_path {
                config.service.model_path = model_path;
            }
            if let Some(batch_size) = batch_size {
                config.service.batch_size = batch_size;
            }
            if let Some(timeout_ms) = timeout_ms {
                config.service.timeout_ms = timeout_ms;
            }

            let options = ServiceOptions::from_config(&config)?;
            runtime()?.block_on(service::serve(options))?;
        }

        Command::Label {
            path,
            address,
            route,
        } => {
            if let Some(address) = address {
                config.client.address = address;
            }

            let options = LabelOptions {
                routing: route.map(Route::into_routing),
                ..LabelOptions::from_config(&config)
            };
            let report = runtime()?.block_on(client::run(&path, &options))?;

            if !report.failed.is_empty() {
                for (path, reason) in &report.failed {
                    println!("✗ {}: {reason}", path.display());
                }
                anyhow::bail!(
                    "{} of {} files failed",
                    report.failed.len(),
                    report.failed.len() + report.labelled.len()
                );
            }
        }
    }

    Ok(())
}
