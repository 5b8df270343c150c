use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use dialectic_orchestrator::jobs::JobType;

mod cmd;

#[derive(Parser)]
#[command(name = "dialectic")]
#[command(version, about = "Job graph orchestrator for the dialectic generation pipeline")]
pub struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "dialectic.toml")]
    pub config: PathBuf,

    /// SQLite database path. Overrides dialectic.toml and DIALECTIC_DB_PATH.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default dialectic.toml (if missing) and create the database
    Init {
        /// Overwrite an existing dialectic.toml
        #[arg(long)]
        force: bool,
    },
    /// Start a session on the first pipeline stage
    StartSession {
        /// Selected model id (repeatable)
        #[arg(short, long = "model")]
        models: Vec<String>,
    },
    /// Create a job; its initial status is derived from its prerequisite
    SubmitJob {
        #[arg(long)]
        session: String,
        #[arg(long)]
        stage: String,
        #[arg(long, default_value = "1")]
        iteration: u32,
        /// PLAN, EXECUTE or RENDER
        #[arg(long = "type")]
        job_type: JobType,
        #[arg(long)]
        step: Option<String>,
        #[arg(long)]
        prerequisite: Option<String>,
        #[arg(long)]
        parent: Option<String>,
        /// JSON object handed to the executor
        #[arg(long)]
        payload: Option<String>,
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Claim a pending job for execution
    Claim { job_id: String },
    /// Complete a processing job
    Complete {
        job_id: String,
        /// JSON results
        #[arg(long, default_value = "{}")]
        results: String,
        /// JSON array of child jobs to insert (PLAN jobs only)
        #[arg(long)]
        children: Option<String>,
    },
    /// Fail a job; dependents fail with it
    Fail {
        job_id: String,
        #[arg(long)]
        message: String,
        /// upstream_prerequisite_failed, insufficient_funds, execution_error or aborted
        #[arg(long, default_value = "execution_error")]
        code: String,
    },
    /// List jobs of a session iteration
    Jobs {
        session: String,
        #[arg(long, default_value = "1")]
        iteration: u32,
        #[arg(long)]
        stage: Option<String>,
    },
    /// Per-stage progress for a session iteration
    Progress {
        session: String,
        #[arg(long, default_value = "1")]
        iteration: u32,
    },
    /// Show a session
    Session {
        session_id: String,
        /// Include the status history
        #[arg(long)]
        history: bool,
    },
    /// Give a session its own copy of a stage's template recipe
    CloneRecipe { session: String, stage: String },
    /// Move a session past a completed stage
    SubmitStage { session: String, stage: String },
    /// Process unprocessed job events
    Drain,
    /// View configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = cmd::load_config(&cli)?;

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&cli, &config, *force)?,
        Commands::Config { command } => cmd::cmd_config(&cli, &config, command.clone())?,
        command => {
            let orch = cmd::open_orchestrator(&config).await?;
            let result = cmd::dispatch(&orch, command).await;
            orch.shutdown().await?;
            result?;
        }
    }
    Ok(())
}
