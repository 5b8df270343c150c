//! Configuration loaded from `dialectic.toml`.
//!
//! Every field has a default, so a missing file means the built-in
//! five-stage pipeline over `dialectic.db` with inline reconciliation.
//!
//! ```toml
//! [database]
//! path = "dialectic.db"
//!
//! [reconciler]
//! mode = "inline"              # or "background"
//!
//! [session]
//! advance_policy = "auto"      # or "await_submission"
//!
//! [logging]
//! level = "info"
//! format = "pretty"            # or "json"
//!
//! [[pipeline.stages]]
//! slug = "thesis"
//!
//! [[pipeline.stages.steps]]
//! step_key = "thesis_plan"
//! job_type = "PLAN"
//! ```
//!
//! `DIALECTIC_DB_PATH` overrides `[database] path`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::orchestrator::{AdvancePolicy, OrchestratorSettings, ReconcilerMode};
use crate::recipe::Pipeline;

pub const CONFIG_FILE: &str = "dialectic.toml";
pub const DB_PATH_ENV: &str = "DIALECTIC_DB_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("dialectic.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerSection {
    #[serde(default)]
    pub mode: ReconcilerMode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default)]
    pub advance_policy: AdvancePolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DialecticConfig {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub reconciler: ReconcilerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingSection,
    /// Replaces the built-in pipeline when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Pipeline>,
}

impl DialecticConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse dialectic.toml")?;
        if let Some(pipeline) = &config.pipeline {
            pipeline.validate().context("Invalid [pipeline] section")?;
        }
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load, then apply environment overrides.
    pub fn resolve(path: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_db_override(std::env::var(DB_PATH_ENV).ok());
        Ok(config)
    }

    pub fn apply_db_override(&mut self, db_path: Option<String>) {
        if let Some(path) = db_path.filter(|p| !p.trim().is_empty()) {
            self.database.path = PathBuf::from(path);
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize dialectic.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline.clone().unwrap_or_default()
    }

    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            reconciler: self.reconciler.mode,
            advance_policy: self.session.advance_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_all_defaults() -> Result<()> {
        let config = DialecticConfig::parse("")?;
        assert_eq!(config, DialecticConfig::default());
        assert_eq!(config.database.path, PathBuf::from("dialectic.db"));
        assert_eq!(config.settings(), OrchestratorSettings::default());
        assert_eq!(config.pipeline().stages.len(), 5);
        Ok(())
    }

    #[test]
    fn test_sections_parse() -> Result<()> {
        let config = DialecticConfig::parse(
            r#"
            [database]
            path = "/tmp/jobs.db"

            [reconciler]
            mode = "background"

            [session]
            advance_policy = "await_submission"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )?;
        assert_eq!(config.database.path, PathBuf::from("/tmp/jobs.db"));
        assert_eq!(config.reconciler.mode, ReconcilerMode::Background);
        assert_eq!(config.session.advance_policy, AdvancePolicy::AwaitSubmission);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        Ok(())
    }

    #[test]
    fn test_custom_pipeline_replaces_default() -> Result<()> {
        let config = DialecticConfig::parse(
            r#"
            [[pipeline.stages]]
            slug = "draft"

            [[pipeline.stages.steps]]
            step_key = "draft_plan"
            job_type = "PLAN"

            [[pipeline.stages.steps]]
            step_key = "draft_write"
            job_type = "EXECUTE"
            cardinality = "per_model"
            "#,
        )?;
        let pipeline = config.pipeline();
        assert_eq!(pipeline.stages.len(), 1);
        assert_eq!(pipeline.stages[0].steps.len(), 2);
        Ok(())
    }

    #[test]
    fn test_invalid_pipeline_is_rejected() {
        let err = DialecticConfig::parse(
            r#"
            [[pipeline.stages]]
            slug = "draft"
            [[pipeline.stages]]
            slug = "draft"
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("pipeline"));
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(DialecticConfig::parse("[reconciler]\nmode = \"sometimes\"").is_err());
    }

    #[test]
    fn test_db_override() {
        let mut config = DialecticConfig::default();
        config.apply_db_override(Some("  ".into()));
        assert_eq!(config.database.path, PathBuf::from("dialectic.db"));
        config.apply_db_override(Some("/data/other.db".into()));
        assert_eq!(config.database.path, PathBuf::from("/data/other.db"));
    }

    #[test]
    fn test_save_and_load_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CONFIG_FILE);
        let mut config = DialecticConfig::default();
        config.session.advance_policy = AdvancePolicy::AwaitSubmission;
        config.save(&path)?;
        assert_eq!(DialecticConfig::load(&path)?, config);
        assert_eq!(
            DialecticConfig::load_or_default(&dir.path().join("missing.toml"))?,
            DialecticConfig::default()
        );
        Ok(())
    }
}
