mod config;

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use config::Config;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use trove_core::monitor::{DEFAULT_UPDATE_INTERVAL, Monitor, Status, StatusSetter};
use trove_core::progress::format_byte_count;
use trove_core::{
    Artifact, ArtifactId, ArtifactKind, CharmStore, Channel, ContentSource, FileSource, Progress,
    Repository, TroveError, infer_repository,
};

#[derive(Parser)]
#[command(name = "trove")]
#[command(about = "Fetch, push and publish charms and bundles")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an archive into the cache and print its path
    Fetch { id: String },

    /// Resolve an id, local path or local: reference to a fully qualified id
    Resolve { reference: String },

    /// Upload a charm or bundle directory or archive
    Push { id: String, path: PathBuf },

    /// Upload a resource file
    PushResource {
        id: String,
        name: String,
        file: PathBuf,

        /// Continue an interrupted multipart upload
        #[arg(long)]
        resume: Option<String>,
    },

    /// Download a resource, checking its fingerprint
    GetResource {
        id: String,
        name: String,

        #[arg(long)]
        revision: Option<u32>,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Publish an entity to one or more channels
    Publish {
        id: String,

        #[arg(long = "channel", required = true)]
        channels: Vec<String>,

        /// Resource revision to publish with, as name=revision
        #[arg(long = "resource")]
        resources: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trove=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let cfg = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli.command, cfg).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands, cfg: Config) -> anyhow::Result<()> {
    match command {
        Commands::Fetch { id } => {
            let id = ArtifactId::parse(&id)?;
            let store = CharmStore::new(cfg.store_params()?)?;
            let artifact = match id.kind() {
                ArtifactKind::Charm => store.get(&id).await?,
                ArtifactKind::Bundle => store.get_bundle(&id).await?,
            };
            println!("{}", artifact.path().display());
        }
        Commands::Resolve { reference } => {
            let repo = infer_repository(
                &reference,
                cfg.store_params()?,
                cfg.local_repository.as_deref(),
            )
            .await?;
            let (resolved, series) = match (&repo, ArtifactId::parse(&reference)) {
                (Repository::Path(path), _) => (path.resolve(None).await?, Vec::new()),
                (_, Ok(id)) => repo.resolve(&id).await?,
                (_, Err(e)) => return Err(e.into()),
            };
            if series.is_empty() {
                println!("{}", resolved);
            } else {
                println!("{} (supported series: {})", resolved, series.join(", "));
            }
        }
        Commands::Push { id, path } => {
            let id = ArtifactId::parse(&id)?;
            let artifact = Artifact::open(&path)
                .await
                .with_context(|| format!("cannot open {}", path.display()))?;
            let client = cfg.client_builder()?.build()?;
            let pushed = match id.revision {
                None => client.upload_archive(&id, &artifact).await?,
                Some(_) => client.upload_archive_with_revision(&id, &artifact, None).await?,
            };
            println!("{}", pushed);
        }
        Commands::PushResource {
            id,
            name,
            file,
            resume,
        } => {
            let id = ArtifactId::parse(&id)?;
            let client = cfg.client_builder()?.build()?;
            let source = Arc::new(FileSource::open(&file).await?);
            let filename = file_name(&file)?;
            let monitor = Monitor::start(source.size(), DEFAULT_UPDATE_INTERVAL, Arc::new(LogStatus));
            let progress: Arc<dyn Progress> = Arc::new(monitor.progress(Arc::new(LogProgress)));
            let revision = match resume {
                Some(upload_id) => {
                    client
                        .resume_upload_resource(&upload_id, &id, &name, &filename, source, progress)
                        .await
                }
                None => {
                    client
                        .upload_resource(&id, &name, &filename, source, progress)
                        .await
                }
            };
            monitor.stop().await;
            match revision {
                Ok(revision) => println!("{} revision {}", name, revision),
                Err(e @ TroveError::UploadSessionNotFound { .. }) => {
                    bail!("{}; start a new upload without --resume", e)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::GetResource {
            id,
            name,
            revision,
            output,
        } => {
            let id = ArtifactId::parse(&id)?;
            let client = cfg.client_builder()?.build()?;
            let download = client.get_resource(&id, &name, revision).await?;
            let fingerprint = download.fingerprint.clone();
            let written = write_resource(download, &output).await?;
            println!(
                "{} ({}, {})",
                output.display(),
                format_byte_count(written),
                fingerprint
            );
        }
        Commands::Publish {
            id,
            channels,
            resources,
        } => {
            let id = ArtifactId::parse(&id)?;
            let channels = channels
                .iter()
                .map(|c| Channel::parse(c))
                .collect::<trove_core::Result<Vec<_>>>()?;
            let resources = parse_resources(&resources)?;
            let store = CharmStore::new(cfg.store_params()?)?;
            store.publish(&id, &channels, resources).await?;
            let names: Vec<&str> = channels.iter().map(Channel::as_str).collect();
            println!("published {} to {}", id, names.join(", "));
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))
}

fn parse_resources(specs: &[String]) -> anyhow::Result<HashMap<String, u32>> {
    let mut resources = HashMap::new();
    for spec in specs {
        let (name, revision) = spec
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid resource {:?}: expected name=revision", spec))?;
        let revision = revision
            .trim()
            .parse::<u32>()
            .with_context(|| format!("invalid revision in resource {:?}", spec))?;
        resources.insert(name.trim().to_string(), revision);
    }
    Ok(resources)
}

/// Writes to a temporary sibling of `output` and renames it into place once
/// the fingerprint has been checked.
async fn write_resource(
    download: trove_core::ResourceDownload,
    output: &Path,
) -> anyhow::Result<u64> {
    let temp_path = output.with_file_name(format!(".{}.part", file_name(output)?));
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .with_context(|| format!("cannot create {}", temp_path.display()))?;
    let written = match download.copy_verified(&mut file).await {
        Ok(written) => written,
        Err(e) => {
            drop(file);
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
    };
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&temp_path, output).await?;
    Ok(written)
}

struct LogProgress;

impl Progress for LogProgress {
    fn start(&self, upload_id: &str, expires: Option<DateTime<Utc>>) {
        match expires {
            Some(expires) if !upload_id.is_empty() => tracing::info!(
                "Upload {} started (resumable with --resume {} until {})",
                upload_id,
                upload_id,
                expires
            ),
            _ => tracing::info!("Upload started"),
        }
    }

    fn transferred(&self, _total: u64) {}

    fn error(&self, err: &TroveError) {
        tracing::warn!("Upload error, retrying: {}", err);
    }

    fn finalizing(&self) {
        tracing::info!("Finalizing upload");
    }
}

struct LogStatus;

impl StatusSetter for LogStatus {
    fn set_status(&self, status: Status) {
        tracing::info!(
            "Uploaded {} of {}",
            format_byte_count(status.current),
            format_byte_count(status.total)
        );
    }
}
