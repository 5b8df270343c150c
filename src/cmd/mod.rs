//! CLI command implementations.
//!
//! Every command prints one JSON document on stdout; logs go to stderr.
//!
//! | Module    | Commands handled                                           |
//! |-----------|------------------------------------------------------------|
//! | `config`  | `Init`, `Config`                                           |
//! | `jobs`    | `SubmitJob`, `Claim`, `Complete`, `Fail`, `Jobs`           |
//! | `session` | `StartSession`, `Session`, `Progress`, `CloneRecipe`, `SubmitStage`, `Drain` |

pub mod config;
pub mod jobs;
pub mod session;

use anyhow::{Context, Result};
use serde::Serialize;

use dialectic_orchestrator::Orchestrator;
use dialectic_orchestrator::config::DialecticConfig;
use dialectic_orchestrator::db::{DbHandle, OrchestratorDb};

use crate::{Cli, Commands};

pub use config::{cmd_config, cmd_init};

/// Resolve configuration (file, env, flags) and install logging.
pub fn load_config(cli: &Cli) -> Result<DialecticConfig> {
    let mut config = DialecticConfig::resolve(&cli.config)?;
    if let Some(db) = &cli.db {
        config.database.path = db.clone();
    }
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    dialectic_orchestrator::logging::init(&config.logging);
    Ok(config)
}

pub async fn open_orchestrator(config: &DialecticConfig) -> Result<Orchestrator> {
    let path = config.database.path.clone();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let db = tokio::task::spawn_blocking(move || OrchestratorDb::new(&path))
        .await
        .context("DB open task panicked")?
        .with_context(|| format!("Failed to open database {}", config.database.path.display()))?;
    let orch = Orchestrator::start(DbHandle::new(db), config.pipeline(), config.settings()).await?;
    Ok(orch)
}

pub async fn dispatch(orch: &Orchestrator, command: &Commands) -> Result<()> {
    match command {
        Commands::StartSession { models } => session::cmd_start_session(orch, models).await,
        Commands::SubmitJob {
            session,
            stage,
            iteration,
            job_type,
            step,
            prerequisite,
            parent,
            payload,
            max_retries,
        } => {
            jobs::cmd_submit_job(
                orch,
                jobs::SubmitArgs {
                    session,
                    stage,
                    iteration: *iteration,
                    job_type: *job_type,
                    step: step.as_deref(),
                    prerequisite: prerequisite.as_deref(),
                    parent: parent.as_deref(),
                    payload: payload.as_deref(),
                    max_retries: *max_retries,
                },
            )
            .await
        }
        Commands::Claim { job_id } => jobs::cmd_claim(orch, job_id).await,
        Commands::Complete {
            job_id,
            results,
            children,
        } => jobs::cmd_complete(orch, job_id, results, children.as_deref()).await,
        Commands::Fail {
            job_id,
            message,
            code,
        } => jobs::cmd_fail(orch, job_id, code, message).await,
        Commands::Jobs {
            session,
            iteration,
            stage,
        } => jobs::cmd_jobs(orch, session, *iteration, stage.as_deref()).await,
        Commands::Progress { session, iteration } => {
            session::cmd_progress(orch, session, *iteration).await
        }
        Commands::Session {
            session_id,
            history,
        } => session::cmd_session(orch, session_id, *history).await,
        Commands::CloneRecipe { session, stage } => {
            session::cmd_clone_recipe(orch, session, stage).await
        }
        Commands::SubmitStage { session, stage } => {
            session::cmd_submit_stage(orch, session, stage).await
        }
        Commands::Drain => session::cmd_drain(orch).await,
        Commands::Init { .. } | Commands::Config { .. } => {
            anyhow::bail!("command does not use the orchestrator")
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", out);
    Ok(())
}

/// Parse a JSON command-line argument.
pub fn parse_json_arg(name: &str, raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("--{} is not valid JSON", name))
}
