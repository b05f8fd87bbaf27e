//! strata-arc - archive ingestion and tiering
//!
//! Stores objects from files, runs the archiving scheduler and exposes the
//! operator actions (manual copy/move of a study, subject merge).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use strata_arc::identity::{PersonName, SubjectDemographics};
use strata_arc::models::SubjectId;
use strata_arc::storage::RetrieveService;
use strata_arc::utils::begin_monitored;
use strata_arc::Archive;
use strata_common::config::{
    load_toml_config, resolve_config_path, resolve_root_folder, LoggingConfig, TomlConfig,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for strata-arc
#[derive(Parser, Debug)]
#[command(name = "strata-arc")]
#[command(about = "Archive ingestion and storage tiering")]
#[command(version)]
struct Args {
    /// Configuration file (falls back to STRATA_CONFIG, then the user and system config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root folder for database, spool and relative storage paths
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store object files as if received from SOURCE_AET
    Store {
        #[arg(long)]
        source_aet: String,
        /// Local AE title receiving the objects
        #[arg(long)]
        local_aet: String,
        files: Vec<PathBuf>,
    },
    /// Run the archiving scheduler until interrupted
    Run,
    /// Copy every series of a study to another storage group
    CopyStudy {
        study_iuid: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Move every series of a study to another storage group
    MoveStudy {
        study_iuid: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Merge the subject identified by LOSER into the one identified by WINNER
    Merge {
        /// Identifier in `value^^^namespace&universal&type` form
        #[arg(long)]
        loser: String,
        #[arg(long)]
        winner: String,
    },
    /// Print a stored object as seen by AE_TITLE
    Retrieve {
        sop_iuid: String,
        #[arg(long)]
        ae_title: String,
    },
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid log level")?;

    match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}

fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    match resolve_config_path(cli_arg, "STRATA_CONFIG") {
        Some(path) => load_toml_config(&path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(TomlConfig::default()),
    }
}

fn demographics(cx: &str) -> SubjectDemographics {
    SubjectDemographics::new(vec![SubjectId::parse_cx(cx)], PersonName::default())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let toml_config = load_config(args.config.as_deref())?;
    init_tracing(&toml_config.logging)?;

    let root_folder = resolve_root_folder(
        args.root_folder.as_deref(),
        "STRATA_ROOT_FOLDER",
        toml_config.root_folder.as_deref(),
    );
    std::fs::create_dir_all(&root_folder).with_context(|| {
        format!("Failed to create root folder {}", root_folder.display())
    })?;
    let database_path = toml_config.database_path(&root_folder);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        built = env!("BUILD_TIMESTAMP"),
        "Starting strata-arc"
    );
    info!("Root folder: {}", root_folder.display());
    info!("Database: {}", database_path.display());

    let archive = Archive::open(toml_config.archive, &root_folder, &database_path)
        .await
        .context("Failed to open archive")?;

    match args.command {
        Command::Store {
            source_aet,
            local_aet,
            files,
        } => {
            let mut failed = 0usize;
            for file in &files {
                let bytes = tokio::fs::read(file)
                    .await
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                match archive.store.store(&source_aet, &local_aet, &bytes).await {
                    Ok(outcome) => println!(
                        "{}\t{:?}\t{}",
                        file.display(),
                        outcome.action,
                        outcome.sop_iuid
                    ),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}\t{}\t{}", file.display(), e.category().as_str(), e);
                    }
                }
            }
            if failed > 0 {
                bail!("{} of {} objects rejected", failed, files.len());
            }
        }
        Command::Run => {
            let cancel = CancellationToken::new();
            let run = archive.scheduler.run(cancel.clone());
            tokio::pin!(run);
            tokio::select! {
                _ = &mut run => {}
                _ = shutdown_signal() => {
                    cancel.cancel();
                    run.await;
                }
            }
        }
        Command::CopyStudy {
            study_iuid,
            from,
            to,
        } => {
            let tasks = archive
                .scheduler
                .copy_study(&study_iuid, &from, &to)
                .await
                .context("Failed to schedule study copy")?;
            println!("Scheduled {} archiving task(s)", tasks.len());
        }
        Command::MoveStudy {
            study_iuid,
            from,
            to,
        } => {
            let tasks = archive
                .scheduler
                .move_study(&study_iuid, &from, &to)
                .await
                .context("Failed to schedule study move")?;
            println!("Scheduled {} archiving task(s)", tasks.len());
        }
        Command::Merge { loser, winner } => {
            let mut tx = begin_monitored(&archive.pool, "merge").await?;
            let subject = archive
                .resolver
                .merge_by_identifiers(
                    tx.conn()?,
                    &demographics(&loser),
                    &demographics(&winner),
                    Utc::now(),
                )
                .await
                .context("Merge failed")?;
            tx.commit().await?;
            println!("Surviving subject {}", subject.pk);
        }
        Command::Retrieve { sop_iuid, ae_title } => {
            let object = archive
                .retrieve_service()
                .retrieve(&ae_title, &sop_iuid)
                .await
                .with_context(|| format!("Failed to retrieve {}", sop_iuid))?;
            println!("{}", serde_json::to_string_pretty(object.dataset.as_map())?);
        }
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
