//! TAKT — CLI entry point
//!
//! Provider adapters are outside this crate's scope (the abstract contract
//! in `provider.rs` is what's specified); until a concrete adapter is
//! wired in, the binary runs against the in-memory mock provider.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use takt::cli::{Cli, Command, FacetCommand, PieceCommand, TaskCommand};
use takt::config::Config;
use takt::engine::EngineOptions;
use takt::events::FileSink;
use takt::facet::{FacetStore, FacetType};
use takt::provider::MockProvider;
use takt::scheduler::{Scheduler, SchedulerConfig};
use takt::session::SessionRegistry;
use takt::task::TaskManifest;
use takt::worktree::{WorktreeConfig, WorktreeManager};
use takt::PieceLoader;

fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("takt").join("logs");
    fs::create_dir_all(&log_dir).context("failed to create log directory")?;

    let default_level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()))
        .init();

    info!(verbose, "logging initialized");
    Ok(())
}

fn engine_options(config: &Config) -> EngineOptions {
    EngineOptions {
        ai_fix_pattern: EngineOptions::default_ai_fix_pattern(),
        ai_review_pattern: EngineOptions::default_ai_review_pattern(),
        cycle_window: config.cycle_window,
        arbitration_movement: None,
        language: "en".to_string(),
        permission_mode_resolver: config.permission_resolver(),
        interactive: false,
    }
}

fn facet_type_from_str(s: &str) -> Result<FacetType> {
    match s {
        "persona" => Ok(FacetType::Persona),
        "policy" => Ok(FacetType::Policy),
        "knowledge" => Ok(FacetType::Knowledge),
        "instruction" => Ok(FacetType::Instruction),
        "output-contract" => Ok(FacetType::OutputContract),
        other => Err(eyre::eyre!("unknown facet type `{other}`; expected persona/policy/knowledge/instruction/output-contract")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose || std::env::var("TAKT_VERBOSE").as_deref() == Ok("true");
    setup_logging(verbose).context("failed to set up logging")?;

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(scenario) = &config.mock_scenario {
        info!(scenario, "running against a mock provider scenario");
    }

    match cli.command {
        Command::Run { concurrency } => {
            let manifest = Arc::new(TaskManifest::load(config.paths.manifest_path.clone()).await?);
            let worktrees = Arc::new(WorktreeManager::new(WorktreeConfig {
                base_dir: config.git.worktree_dir.clone(),
                repo_root: std::env::current_dir()?,
                branch_prefix: config.git.branch_prefix.clone(),
                base_branch: config.git.base_branch.clone(),
            }));
            let loader = Arc::new(PieceLoader::new(
                Some(config.paths.pieces_dir.clone()),
                dirs::config_dir().map(|d| d.join("takt").join("pieces")),
                None,
                config.paths.pieces_dir.clone(),
                config.paths.pieces_dir.join("schemas"),
            ));
            let provider = Arc::new(MockProvider::new(Vec::new()));
            let facets = Arc::new(FacetStore::new(
                Some(config.paths.pieces_dir.join("facets")),
                dirs::config_dir().map(|d| d.join("takt").join("facets")),
                config.paths.pieces_dir.join("facets"),
            ));
            let sessions = Arc::new(SessionRegistry::new(config.paths.sessions_dir.clone()));
            let sink = Arc::new(FileSink::create(config.paths.manifest_path.with_file_name("session.ndjson"))?);

            let scheduler_config = SchedulerConfig {
                concurrency: concurrency.unwrap_or(config.concurrency.max_workers),
                task_poll_interval_ms: config.task_poll_interval_ms,
            };
            let config_for_options = config.clone();
            let scheduler = Arc::new(Scheduler::new(
                scheduler_config,
                manifest,
                worktrees,
                loader,
                provider,
                facets,
                sessions,
                sink,
                Arc::new(move || engine_options(&config_for_options)),
            ));

            let abort = CancellationToken::new();
            let abort_for_signal = abort.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT, propagating abort to all workers");
                abort_for_signal.cancel();
            });

            scheduler.run(abort).await;
        }

        Command::Task { command } => {
            let manifest = TaskManifest::load(config.paths.manifest_path.clone()).await?;
            match command {
                TaskCommand::Add { name, content, piece } => {
                    manifest.add_task(name, content, piece).await?;
                }
                TaskCommand::List => {
                    for task in manifest.list().await {
                        println!("{}\t{:?}\t{}", task.name, task.status, task.piece);
                    }
                }
                TaskCommand::Requeue { name } => {
                    manifest.requeue_task(&name).await?;
                }
                TaskCommand::Rerun { name } => {
                    manifest.start_re_execution(&name).await?;
                }
            }
        }

        Command::Piece { command } => match command {
            PieceCommand::Validate { reference } => {
                let loader = PieceLoader::new(
                    Some(config.paths.pieces_dir.clone()),
                    dirs::config_dir().map(|d| d.join("takt").join("pieces")),
                    None,
                    config.paths.pieces_dir.clone(),
                    config.paths.pieces_dir.join("schemas"),
                );
                let piece = loader.load(&reference)?;
                println!("`{reference}` is valid: {} movements, initial `{}`", piece.movements.len(), piece.initial_movement);
            }
        },

        Command::Facet { command } => match command {
            FacetCommand::Eject { facet_type, name, user } => {
                let facet_type = facet_type_from_str(&facet_type)?;
                let facets_dir = config.paths.pieces_dir.join("facets");
                let project_dir = if user { None } else { Some(facets_dir.clone()) };
                let user_dir = dirs::config_dir().map(|d| d.join("takt").join("facets"));
                let store = FacetStore::new(project_dir, user_dir, facets_dir);
                let dest = store.eject(facet_type, &name)?;
                println!("ejected to {}", dest.display());
            }
        },
    }

    Ok(())
}
