//! Recipe resolution.
//!
//! A recipe is the read-only list of steps a stage requires. Two physical
//! sources exist: the shared template defined by the pipeline, and a
//! per-session clone stored alongside the jobs. Both are exposed through
//! [`RecipeStepProvider`], and [`RecipeResolver`] consults them in order so
//! the rest of the orchestrator never cares where a step came from.

mod pipeline;

use std::fmt;
use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::recipes;
use crate::errors::{OrchestratorError, Result};
use crate::jobs::JobType;

pub use pipeline::{Pipeline, StageDefinition};

/// How many jobs a step is instantiated into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Exactly one job.
    #[default]
    Single,
    /// One job per selected model.
    PerModel,
    /// One job per ordered pair of selected models (each model against each
    /// model's output).
    PerModelPair,
}

impl Cardinality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::PerModel => "per_model",
            Self::PerModelPair => "per_model_pair",
        }
    }

    /// Number of parallel jobs for a session with `model_count` models.
    pub fn expected_jobs(&self, model_count: usize) -> usize {
        match self {
            Self::Single => 1,
            Self::PerModel => model_count,
            Self::PerModelPair => model_count * model_count,
        }
    }
}

impl std::str::FromStr for Cardinality {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "per_model" => Ok(Self::PerModel),
            "per_model_pair" => Ok(Self::PerModelPair),
            _ => Err(format!("Invalid cardinality: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeStep {
    pub step_key: String,
    pub job_type: JobType,
    #[serde(default)]
    pub cardinality: Cardinality,
    /// Document this step produces, used when a RENDER job's payload does
    /// not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_key: Option<String>,
}

impl RecipeStep {
    pub fn new(step_key: &str, job_type: JobType) -> Self {
        Self {
            step_key: step_key.to_string(),
            job_type,
            cardinality: Cardinality::Single,
            document_key: None,
        }
    }

    pub fn fan_out(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn with_document(mut self, document_key: &str) -> Self {
        self.document_key = Some(document_key.to_string());
        self
    }

    /// RENDER steps never hold a stage open: a stuck render must not block
    /// the pipeline.
    pub fn gates_stage_completion(&self) -> bool {
        self.job_type != JobType::Render
    }

    pub fn produces_documents(&self) -> bool {
        self.job_type == JobType::Render
    }
}

/// Where a resolved recipe came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeSource {
    Template,
    Cloned,
}

impl fmt::Display for RecipeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Template => f.write_str("template"),
            Self::Cloned => f.write_str("cloned"),
        }
    }
}

/// A source of recipe steps for a `(session, stage)` pair.
///
/// Returns `Ok(None)` when this source has nothing for the pair, letting the
/// resolver fall through to the next provider.
pub trait RecipeStepProvider: Send + Sync {
    fn source(&self) -> RecipeSource;

    fn steps(
        &self,
        conn: &Connection,
        session_id: &str,
        stage_slug: &str,
    ) -> Result<Option<Vec<RecipeStep>>>;
}

/// Steps from the shared pipeline template.
pub struct TemplateRecipeProvider {
    pipeline: Arc<Pipeline>,
}

impl TemplateRecipeProvider {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

impl RecipeStepProvider for TemplateRecipeProvider {
    fn source(&self) -> RecipeSource {
        RecipeSource::Template
    }

    fn steps(
        &self,
        _conn: &Connection,
        _session_id: &str,
        stage_slug: &str,
    ) -> Result<Option<Vec<RecipeStep>>> {
        Ok(self.pipeline.stage(stage_slug).map(|s| s.steps.clone()))
    }
}

/// Steps cloned into `session_recipe_steps` for one session.
#[derive(Default)]
pub struct ClonedRecipeProvider;

impl RecipeStepProvider for ClonedRecipeProvider {
    fn source(&self) -> RecipeSource {
        RecipeSource::Cloned
    }

    fn steps(
        &self,
        conn: &Connection,
        session_id: &str,
        stage_slug: &str,
    ) -> Result<Option<Vec<RecipeStep>>> {
        let steps = recipes::load_cloned_steps(conn, session_id, stage_slug)?;
        Ok(if steps.is_empty() { None } else { Some(steps) })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRecipe {
    pub stage_slug: String,
    pub source: RecipeSource,
    pub steps: Vec<RecipeStep>,
}

impl ResolvedRecipe {
    pub fn step(&self, step_key: &str) -> Option<&RecipeStep> {
        self.steps.iter().find(|s| s.step_key == step_key)
    }

    /// Steps that must be `completed` before the stage is done.
    pub fn gating_steps(&self) -> impl Iterator<Item = &RecipeStep> {
        self.steps.iter().filter(|s| s.gates_stage_completion())
    }
}

/// Ordered chain of providers; the first one with steps wins.
pub struct RecipeResolver {
    providers: Vec<Arc<dyn RecipeStepProvider>>,
}

impl RecipeResolver {
    pub fn new(providers: Vec<Arc<dyn RecipeStepProvider>>) -> Self {
        Self { providers }
    }

    /// Session clones first, then the shared template.
    pub fn for_pipeline(pipeline: Arc<Pipeline>) -> Self {
        Self::new(vec![
            Arc::new(ClonedRecipeProvider),
            Arc::new(TemplateRecipeProvider::new(pipeline)),
        ])
    }

    pub fn resolve(
        &self,
        conn: &Connection,
        session_id: &str,
        stage_slug: &str,
    ) -> Result<ResolvedRecipe> {
        for provider in &self.providers {
            if let Some(steps) = provider.steps(conn, session_id, stage_slug)? {
                return Ok(ResolvedRecipe {
                    stage_slug: stage_slug.to_string(),
                    source: provider.source(),
                    steps,
                });
            }
        }
        Err(OrchestratorError::stage_not_found(stage_slug))
    }
}
