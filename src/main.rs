//! s3-storage: command-line access to S3-backed file storage.
//!
//! Every command goes through the same `S3Storage` adapter an application
//! would use, so names are `scheme://bucket/path` and the gzip, key-prefix
//! and endpoint settings from the configuration file all apply.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use s3_file_storage::client::backend::ClientMethod;
use s3_file_storage::config::{load_config, Config, LoggingConfig};
use s3_file_storage::storage::{Content, S3Storage, Storage};
use s3_file_storage::SettingsLayer;
use tracing::info;

/// Command-line arguments for s3-storage.
#[derive(Parser, Debug)]
#[command(
    name = "s3-storage",
    version,
    about = "File operations on S3-compatible object storage"
)]
struct Cli {
    /// Path to the YAML configuration file.  Built-in defaults are used
    /// when it does not exist.
    #[arg(short, long, default_value = "s3-storage.yaml")]
    config: PathBuf,

    /// Print Prometheus metrics to stderr after the command.
    #[arg(long, default_value_t = false)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List directories and files directly under a path
    Ls { path: String },
    /// Write a file's contents to stdout
    Cat { name: String },
    /// Upload a local file; prints the name it was stored under
    Put { local: PathBuf, name: String },
    /// Delete a file
    Rm { name: String },
    /// Copy a file
    Cp { src: String, dst: String },
    /// Move a file (copy, then delete the source)
    Mv { src: String, dst: String },
    /// Print a file's metadata as JSON
    Stat { name: String },
    /// Print a presigned URL
    Url {
        name: String,
        /// Operation the URL authorises: get, head, put or delete.
        #[arg(long, default_value = "get")]
        method: ClientMethod,
        /// Extra request parameter, e.g. `ResponseContentDisposition=attachment`.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Print whether a file or directory exists
    Exists { name: String },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw:?}"))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    if logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        load_config(&cli.config)
            .with_context(|| format!("loading configuration from {}", cli.config.display()))?
    } else {
        Config::default()
    };
    init_tracing(&config.logging);
    info!("Configuration: {}", cli.config.display());

    if cli.print_metrics {
        s3_file_storage::metrics::init_metrics()?;
        s3_file_storage::metrics::describe_metrics();
    }

    let storage = S3Storage::new(SettingsLayer::default(), &config).await?;
    info!("Schemes: {:?}", storage.schemes());
    run(&storage, cli.command).await?;

    if cli.print_metrics {
        if let Some(text) = s3_file_storage::metrics::render() {
            eprintln!("{text}");
        }
    }
    Ok(())
}

async fn run(storage: &S3Storage, command: Commands) -> anyhow::Result<()> {
    let mut stdout = io::stdout().lock();
    match command {
        Commands::Ls { path } => {
            let (dirs, files) = storage.listdir(&path).await?;
            for dir in dirs {
                writeln!(stdout, "{dir}/")?;
            }
            for file in files {
                writeln!(stdout, "{file}")?;
            }
        }
        Commands::Cat { name } => {
            let mut file = storage.open(&name, "rb").await?;
            io::copy(&mut file, &mut stdout)?;
        }
        Commands::Put { local, name } => {
            let mut file = std::fs::File::open(&local)
                .with_context(|| format!("opening {}", local.display()))?;
            let saved = storage.save(&name, Content::Bytes(&mut file), None).await?;
            writeln!(stdout, "{saved}")?;
        }
        Commands::Rm { name } => storage.delete(&name).await?,
        Commands::Cp { src, dst } => storage.copy(&src, &dst).await?,
        Commands::Mv { src, dst } => storage.rename(&src, &dst).await?,
        Commands::Stat { name } => {
            let meta = storage.meta(&name).await?;
            let size = storage.size(&name).await?;
            let stat = serde_json::json!({
                "name": name,
                "size": size,
                "meta": meta,
            });
            writeln!(stdout, "{}", serde_json::to_string_pretty(&stat)?)?;
        }
        Commands::Url {
            name,
            method,
            params,
        } => {
            let params = params.into_iter().collect();
            let url = storage.url_with(&name, &params, method).await?;
            writeln!(stdout, "{url}")?;
        }
        Commands::Exists { name } => {
            writeln!(stdout, "{}", storage.exists(&name).await?)?;
        }
    }
    Ok(())
}
