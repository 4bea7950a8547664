//! kiln - binary entry point.
//!
//! Three subcommands: `init` writes a configuration template, `check`
//! validates a configuration (including every module's options), and
//! `serve` runs the loader phase and then the listeners until SIGINT or
//! SIGTERM.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kiln_config::{Config, ProviderKind, template};
use kiln_loader::Loader;
use kiln_providers::{Fetcher, FileProvider, Provider, RestProvider};
use kiln_server::Server;
use kiln_store::{MemoryStore, Store};

#[derive(Parser)]
#[command(name = "kiln", disable_version_flag = true)]
struct Cli {
    /// Print program name and version.
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Configuration file.
    #[arg(short = 'c', long = "config", default_value = kiln_config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Write a configuration template.
    Init {
        /// Template name: default or example.
        #[arg(short = 't', long = "template")]
        template: Option<String>,
    },
    /// Parse the configuration and validate all module configs.
    Check,
    /// Run the server until SIGINT or SIGTERM.
    Serve,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("kiln {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let Some(command) = cli.command else {
        let _ = Cli::command().print_help();
        return ExitCode::FAILURE;
    };

    match command {
        Command::Init { template } => run_init(&cli.config, template.as_deref()),
        Command::Check => run_check(&cli.config),
        Command::Serve => run_serve(&cli.config),
    }
}

fn run_init(path: &Path, template_name: Option<&str>) -> ExitCode {
    let result = template::by_name(template_name)
        .and_then(|contents| template::write(path, contents));
    match result {
        Ok(()) => {
            println!("Wrote {}", path.display());
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("init failed: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run_check(path: &Path) -> ExitCode {
    match check(path) {
        Ok(()) => {
            println!("Configuration is valid");
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("{error:#}");
            println!("Configuration is not valid");
            ExitCode::FAILURE
        }
    }
}

/// Parse the document and construct every configured module, so
/// provider and site options are validated the same way `serve` would.
fn check(path: &Path) -> Result<()> {
    let config = Config::load(path)?;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    build_fetcher(&config)?;
    Server::new(&config, store)?;
    Ok(())
}

fn run_serve(path: &Path) -> ExitCode {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("failed to load configuration: {error}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.log_level.as_str());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(&config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = format!("{error:#}"), "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: &Config) -> Result<()> {
    let store = Arc::new(MemoryStore::new());

    let fetcher = Arc::new(build_fetcher(config)?);
    if !config.parsers.is_empty() {
        let loader = Loader::new(fetcher, Arc::clone(&store) as Arc<dyn Store>);
        loader
            .run(&config.parsers)
            .await
            .context("resource loading failed")?;
        tracing::info!(resources = store.len(), "resource loading finished");
    }

    let server = Server::new(config, store as Arc<dyn Store>)?;
    server.run(shutdown_signal()).await?;
    Ok(())
}

/// Build the provider registry declared in the configuration.
fn build_fetcher(config: &Config) -> Result<Fetcher> {
    let mut builder = Fetcher::builder();
    for (name, spec) in &config.providers {
        let provider: Arc<dyn Provider> = match spec.kind {
            ProviderKind::File => Arc::new(FileProvider::new()),
            ProviderKind::Rest => Arc::new(
                RestProvider::new(&spec.options)
                    .with_context(|| format!("provider {name}"))?,
            ),
        };
        builder = builder.register(name.clone(), provider);
    }
    Ok(builder.build())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
