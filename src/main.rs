//! rewritemeta -- add a missing environment label to every Thanos block
//! `meta.json` in a long-term-storage bucket.
//!
//! Dry-run by default: without `--confirm` the tool only reports the bucket
//! and label value it would use.  SIGTERM/SIGINT stop the scan between
//! objects; objects already in flight are finished, never left half-done.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use thanos_relabel::config::{Config, LoggingConfig};
use thanos_relabel::controller;
use thanos_relabel::storage::backend::ObjectStore;
use thanos_relabel::storage::gcs::GcsStore;
use thanos_relabel::storage::local::LocalStore;

/// Command-line arguments for rewritemeta.
#[derive(Parser, Debug)]
#[command(
    name = "rewritemeta",
    version,
    about = "Add a missing environment label to Thanos block metadata in a GCS bucket"
)]
struct Cli {
    /// Bucket to migrate, with or without the gs:// prefix.
    bucket: String,

    /// Confirm you want to make changes to the bucket.
    #[arg(long)]
    confirm: bool,

    /// Path to a YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the directory backups are written to.
    #[arg(long)]
    backup_dir: Option<String>,

    /// Override the number of objects processed at once.
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..=64))]
    concurrency: Option<u16>,

    /// Override the object store backend.
    #[arg(long, value_parser = ["gcs", "local"])]
    backend: Option<String>,
}

impl Cli {
    /// Load the config file (or defaults) and apply command-line overrides.
    fn resolve_config(&self) -> anyhow::Result<Config> {
        let mut config = match self.config {
            Some(ref path) => thanos_relabel::config::load_config(path)?,
            None => Config::default(),
        };
        if let Some(ref dir) = self.backup_dir {
            config.backup.dir = dir.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.migration.concurrency = usize::from(concurrency);
        }
        if let Some(ref backend) = self.backend {
            config.storage.backend = backend.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    let storage = config.storage.clone();
    let open_store = move || -> anyhow::Result<Arc<dyn ObjectStore>> {
        match storage.backend.as_str() {
            "local" => {
                let store = LocalStore::new(&storage.local.root_dir)?;
                info!("Local object store initialized at {}", storage.local.root_dir);
                Ok(Arc::new(store))
            }
            _ => Ok(Arc::new(GcsStore::new(&storage.gcs)?)),
        }
    };

    match controller::execute(&config, &cli.bucket, cli.confirm, open_store, &shutdown).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize tracing: `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, finishing in-flight objects");
        },
        _ = terminate => {
            info!("Received SIGTERM, finishing in-flight objects");
        },
    }
}
