//! Project setup and configuration view: `dialectic init`, `dialectic config`.

use anyhow::{Context, Result};
use serde_json::json;

use dialectic_orchestrator::config::DialecticConfig;
use dialectic_orchestrator::db::OrchestratorDb;

use super::print_json;
use crate::{Cli, ConfigCommands};

pub fn cmd_init(cli: &Cli, config: &DialecticConfig, force: bool) -> Result<()> {
    let config_written = force || !cli.config.exists();
    if config_written {
        config.save(&cli.config)?;
    }

    let db_path = &config.database.path;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    OrchestratorDb::new(db_path)
        .with_context(|| format!("Failed to create database {}", db_path.display()))?;
    tracing::info!(config = %cli.config.display(), db = %db_path.display(), "initialized");

    print_json(&json!({
        "config": cli.config,
        "config_written": config_written,
        "database": db_path,
    }))
}

pub fn cmd_config(cli: &Cli, config: &DialecticConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => print_json(&json!({
            "config_file": cli.config,
            "config_file_exists": cli.config.exists(),
            "effective": config,
            "pipeline": config.pipeline(),
        })),
    }
}
