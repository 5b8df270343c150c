//! Ordered stage list with each stage's template recipe.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::RecipeStep;
use crate::errors::{OrchestratorError, Result};
use crate::session::is_ambiguous_stage_slug;

const DEFAULT_PIPELINE_TOML: &str = include_str!("../../config/default_pipeline.toml");

/// One stage of the pipeline and its shared template recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub slug: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub steps: Vec<RecipeStep>,
}

/// The ordered stages a session walks through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub stages: Vec<StageDefinition>,
}

impl Default for Pipeline {
    fn default() -> Self {
        // The embedded file is validated by `test_default_pipeline_is_valid`.
        Self::from_toml_str(DEFAULT_PIPELINE_TOML).unwrap_or(Self { stages: Vec::new() })
    }
}

impl Pipeline {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let pipeline: Pipeline = toml::from_str(raw)
            .map_err(|e| OrchestratorError::Config(format!("invalid pipeline: {}", e)))?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Reject empty pipelines, duplicate or ambiguous stage slugs and
    /// duplicate step keys.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(OrchestratorError::Config(
                "pipeline must define at least one stage".to_string(),
            ));
        }
        let mut slugs = HashSet::new();
        for stage in &self.stages {
            if stage.slug.trim().is_empty() {
                return Err(OrchestratorError::Config(
                    "stage slug must not be empty".to_string(),
                ));
            }
            if is_ambiguous_stage_slug(&stage.slug) {
                return Err(OrchestratorError::Config(format!(
                    "stage slug '{}' clashes with a session status prefix or suffix",
                    stage.slug
                )));
            }
            if !slugs.insert(stage.slug.as_str()) {
                return Err(OrchestratorError::Config(format!(
                    "duplicate stage '{}'",
                    stage.slug
                )));
            }
            let mut keys = HashSet::new();
            for step in &stage.steps {
                if step.step_key.trim().is_empty() {
                    return Err(OrchestratorError::Config(format!(
                        "stage '{}' has a step with an empty step_key",
                        stage.slug
                    )));
                }
                if !keys.insert(step.step_key.as_str()) {
                    return Err(OrchestratorError::Config(format!(
                        "stage '{}' defines step '{}' twice",
                        stage.slug, step.step_key
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn first_stage(&self) -> Option<&StageDefinition> {
        self.stages.first()
    }

    pub fn stage(&self, slug: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.slug == slug)
    }

    /// The stage after `slug`, or `None` when `slug` is the last stage.
    pub fn next_stage(&self, slug: &str) -> Result<Option<&StageDefinition>> {
        let index = self
            .stages
            .iter()
            .position(|s| s.slug == slug)
            .ok_or_else(|| OrchestratorError::stage_not_found(slug))?;
        Ok(self.stages.get(index + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobType;

    #[test]
    fn test_default_pipeline_is_valid() {
        let pipeline = Pipeline::from_toml_str(DEFAULT_PIPELINE_TOML).unwrap();
        let slugs: Vec<&str> = pipeline.stages.iter().map(|s| s.slug.as_str()).collect();
        assert_eq!(
            slugs,
            vec!["thesis", "antithesis", "synthesis", "parenthesis", "paralysis"]
        );
        assert_eq!(Pipeline::default(), pipeline);
    }

    #[test]
    fn test_default_thesis_has_five_gating_steps() {
        let pipeline = Pipeline::default();
        let thesis = pipeline.stage("thesis").unwrap();
        let gating = thesis
            .steps
            .iter()
            .filter(|s| s.gates_stage_completion())
            .count();
        assert_eq!(gating, 5);
        assert_eq!(thesis.steps[0].job_type, JobType::Plan);
    }

    #[test]
    fn test_next_stage() {
        let pipeline = Pipeline::default();
        assert_eq!(
            pipeline.next_stage("thesis").unwrap().map(|s| s.slug.as_str()),
            Some("antithesis")
        );
        assert!(pipeline.next_stage("paralysis").unwrap().is_none());
        assert!(pipeline.next_stage("nope").is_err());
    }

    #[test]
    fn test_duplicate_step_keys_rejected() {
        let raw = r#"
            [[stages]]
            slug = "thesis"
            [[stages.steps]]
            step_key = "a"
            job_type = "PLAN"
            [[stages.steps]]
            step_key = "a"
            job_type = "EXECUTE"
        "#;
        let err = Pipeline::from_toml_str(raw).unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let raw = r#"
            [[stages]]
            slug = "thesis"
            [[stages]]
            slug = "thesis"
        "#;
        assert!(Pipeline::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_status_like_slugs_rejected() {
        for slug in ["pending_review", "generating_x", "draft_generation_complete", "review_failed"] {
            let raw = format!("[[stages]]\nslug = \"{}\"\n", slug);
            let err = Pipeline::from_toml_str(&raw).unwrap_err();
            assert!(err.to_string().contains("clashes"), "{} accepted", slug);
        }
        assert!(Pipeline::from_toml_str("[[stages]]\nslug = \"review\"\n").is_ok());
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        assert!(Pipeline::from_toml_str("stages = []").is_err());
    }
}
