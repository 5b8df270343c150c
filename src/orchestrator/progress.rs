//! Stage progress aggregation.
//!
//! Rolls job rows up into per-step summaries and per-document descriptors
//! for one `(session, iteration)`. Nothing here writes; callers run it
//! inside a single transaction so the whole report reads one snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::{jobs, sessions};
use crate::errors::{OrchestratorError, Result};
use crate::jobs::{Job, JobStatus, JobType, StageScope};
use crate::recipe::{RecipeResolver, RecipeSource, ResolvedRecipe};

/// Prefix of the synthetic key given to jobs with no `step_key`.
pub const UNBOUND_PREFIX: &str = "__job:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    /// Collapse a group of job statuses: any failure fails the group, all
    /// completed completes it, an empty group has not started.
    pub fn from_jobs<'a>(statuses: impl IntoIterator<Item = &'a JobStatus>) -> Self {
        let mut seen = false;
        let mut all_completed = true;
        for status in statuses {
            seen = true;
            match status {
                JobStatus::Failed => return Self::Failed,
                JobStatus::Completed => {}
                _ => all_completed = false,
            }
        }
        match (seen, all_completed) {
            (false, _) => Self::NotStarted,
            (true, true) => Self::Completed,
            (true, false) => Self::InProgress,
        }
    }
}

/// Per-model status inside a fan-out step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ModelStatus {
    fn from_jobs<'a>(statuses: impl IntoIterator<Item = &'a JobStatus>) -> Self {
        let (mut in_progress, mut pending) = (false, false);
        for status in statuses {
            match status {
                JobStatus::Failed => return Self::Failed,
                JobStatus::Processing => in_progress = true,
                JobStatus::Pending | JobStatus::WaitingForPrerequisite => pending = true,
                JobStatus::Completed => {}
            }
        }
        if in_progress {
            Self::InProgress
        } else if pending {
            Self::Pending
        } else {
            Self::Completed
        }
    }
}

/// Why a step group does not line up with the resolved recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAnomaly {
    /// A job with no `step_key`, keyed `__job:<id>`.
    Unbound,
    /// Jobs whose `step_key` is absent from the recipe.
    NotInRecipe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepProgress {
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub in_progress_jobs: usize,
    /// `pending` plus `waiting_for_prerequisite`.
    pub pending_jobs: usize,
    pub failed_jobs: usize,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_type: Option<JobType>,
    /// Jobs the recipe's cardinality calls for, given the session's models.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_jobs: Option<usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub model_statuses: BTreeMap<String, ModelStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<StepAnomaly>,
}

impl StepProgress {
    fn from_group(group: &[&Job]) -> Self {
        let count = |pred: fn(&JobStatus) -> bool| group.iter().filter(|j| pred(&j.status)).count();

        let mut by_model: BTreeMap<String, Vec<JobStatus>> = BTreeMap::new();
        for job in group.iter().filter(|j| j.job_type == JobType::Execute) {
            if let Some(model) = job.model_id() {
                by_model.entry(model.to_string()).or_default().push(job.status);
            }
        }

        Self {
            total_jobs: group.len(),
            completed_jobs: count(|s| *s == JobStatus::Completed),
            in_progress_jobs: count(|s| *s == JobStatus::Processing),
            pending_jobs: count(|s| {
                matches!(s, JobStatus::Pending | JobStatus::WaitingForPrerequisite)
            }),
            failed_jobs: count(|s| *s == JobStatus::Failed),
            status: StepStatus::from_jobs(group.iter().map(|j| &j.status)),
            job_type: group.first().map(|j| j.job_type),
            expected_jobs: None,
            model_statuses: by_model
                .into_iter()
                .map(|(model, statuses)| (model, ModelStatus::from_jobs(&statuses)))
                .collect(),
            anomaly: None,
        }
    }

    fn not_started(job_type: JobType) -> Self {
        Self {
            total_jobs: 0,
            completed_jobs: 0,
            in_progress_jobs: 0,
            pending_jobs: 0,
            failed_jobs: 0,
            status: StepStatus::NotStarted,
            job_type: Some(job_type),
            expected_jobs: None,
            model_statuses: BTreeMap::new(),
            anomaly: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Idle,
    Generating,
    Completed,
    Failed,
}

impl From<JobStatus> for DocumentStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::WaitingForPrerequisite | JobStatus::Pending => Self::Idle,
            JobStatus::Processing => Self::Generating,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
        }
    }
}

/// One document a RENDER step produced (or is producing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDocument {
    pub document_key: String,
    /// The most recent render attempt for this document.
    pub job_id: String,
    pub step_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub status: DocumentStatus,
    /// Resource from the latest completed render, if any render completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_rendered_resource_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageProgressEntry {
    pub stage_slug: String,
    pub iteration_number: u32,
    /// `None` when the stage has jobs but no recipe resolves for it.
    pub recipe_source: Option<RecipeSource>,
    pub steps: BTreeMap<String, StepProgress>,
    pub documents: Vec<StageDocument>,
    /// Step keys the recipe says must complete before the stage is done.
    #[serde(default)]
    pub required_steps: Vec<String>,
}

impl StageProgressEntry {
    pub fn any_failed(&self) -> bool {
        self.steps.values().any(|s| s.status == StepStatus::Failed)
    }

    /// Every gating recipe step is `completed`. False when the recipe has no
    /// gating steps.
    pub fn all_required_completed(&self) -> bool {
        !self.required_steps.is_empty()
            && self.required_steps.iter().all(|key| {
                self.steps
                    .get(key)
                    .is_some_and(|s| s.status == StepStatus::Completed)
            })
    }

    /// One collapsed value for callers that want it.
    pub fn stage_status(&self) -> StepStatus {
        if self.any_failed() {
            StepStatus::Failed
        } else if self.all_required_completed() {
            StepStatus::Completed
        } else if self.steps.values().all(|s| s.total_jobs == 0) {
            StepStatus::NotStarted
        } else {
            StepStatus::InProgress
        }
    }

    pub fn anomalies(&self) -> impl Iterator<Item = (&str, StepAnomaly)> {
        self.steps
            .iter()
            .filter_map(|(key, s)| s.anomaly.map(|a| (key.as_str(), a)))
    }
}

pub struct ProgressAggregator {
    recipes: Arc<RecipeResolver>,
}

impl ProgressAggregator {
    pub fn new(recipes: Arc<RecipeResolver>) -> Self {
        Self { recipes }
    }

    /// Progress for every stage with at least one job in `(session,
    /// iteration)`, ordered by stage slug.
    pub fn get_stage_progress(
        &self,
        conn: &Connection,
        session_id: &str,
        iteration: u32,
    ) -> Result<Vec<StageProgressEntry>> {
        let session = sessions::get_session(conn, session_id)?;
        let models = session.selected_model_ids.len();

        let mut by_stage: BTreeMap<String, Vec<Job>> = BTreeMap::new();
        for job in jobs::iteration_jobs(conn, session_id, iteration)? {
            by_stage.entry(job.stage_slug.clone()).or_default().push(job);
        }

        by_stage
            .into_iter()
            .map(|(stage, stage_jobs)| {
                let scope = StageScope::new(session_id, &stage, iteration);
                self.aggregate(conn, &scope, &stage_jobs, models)
            })
            .collect()
    }

    /// Progress for one stage, including recipe steps with no jobs yet.
    pub fn stage_progress(&self, conn: &Connection, scope: &StageScope) -> Result<StageProgressEntry> {
        let session = sessions::get_session(conn, &scope.session_id)?;
        let stage_jobs = jobs::scope_jobs(conn, scope)?;
        self.aggregate(conn, scope, &stage_jobs, session.selected_model_ids.len())
    }

    fn aggregate(
        &self,
        conn: &Connection,
        scope: &StageScope,
        stage_jobs: &[Job],
        models: usize,
    ) -> Result<StageProgressEntry> {
        let recipe = match self.recipes.resolve(conn, &scope.session_id, &scope.stage_slug) {
            Ok(recipe) => Some(recipe),
            Err(OrchestratorError::StageNotFound { .. }) => {
                tracing::warn!(scope = %scope, "no recipe resolves for stage with jobs");
                None
            }
            Err(e) => return Err(e),
        };

        let mut groups: BTreeMap<String, Vec<&Job>> = BTreeMap::new();
        for job in stage_jobs {
            let key = match &job.step_key {
                Some(key) => key.clone(),
                None => format!("{UNBOUND_PREFIX}{}", job.id),
            };
            groups.entry(key).or_default().push(job);
        }

        let mut steps = BTreeMap::new();
        for (key, group) in &groups {
            let mut progress = StepProgress::from_group(group);
            match recipe.as_ref().and_then(|r| r.step(key)) {
                Some(step) => {
                    progress.job_type = Some(step.job_type);
                    progress.expected_jobs = Some(step.cardinality.expected_jobs(models));
                }
                None if key.starts_with(UNBOUND_PREFIX) => {
                    progress.anomaly = Some(StepAnomaly::Unbound);
                }
                None => {
                    tracing::warn!(scope = %scope, step_key = %key, "jobs reference a step missing from the recipe");
                    progress.anomaly = Some(StepAnomaly::NotInRecipe);
                }
            }
            steps.insert(key.clone(), progress);
        }

        let mut required_steps = Vec::new();
        if let Some(recipe) = &recipe {
            for step in &recipe.steps {
                steps.entry(step.step_key.clone()).or_insert_with(|| {
                    let mut empty = StepProgress::not_started(step.job_type);
                    empty.expected_jobs = Some(step.cardinality.expected_jobs(models));
                    empty
                });
            }
            required_steps = recipe
                .gating_steps()
                .map(|s| s.step_key.clone())
                .collect();
        }

        Ok(StageProgressEntry {
            stage_slug: scope.stage_slug.clone(),
            iteration_number: scope.iteration_number,
            recipe_source: recipe.as_ref().map(|r| r.source),
            documents: recipe
                .as_ref()
                .map(|r| collect_documents(r, stage_jobs))
                .unwrap_or_default(),
            steps,
            required_steps,
        })
    }
}

/// Build document descriptors from RENDER jobs bound to document-producing
/// steps. Jobs are in creation order, so a later job for the same
/// `(document, model)` is the more recent attempt.
fn collect_documents(recipe: &ResolvedRecipe, stage_jobs: &[Job]) -> Vec<StageDocument> {
    struct Slot<'a> {
        latest: &'a Job,
        step_key: &'a str,
        rendered: Option<(DateTime<Utc>, String)>,
    }

    let mut slots: BTreeMap<(String, Option<String>), Slot<'_>> = BTreeMap::new();
    for job in stage_jobs.iter().filter(|j| j.job_type == JobType::Render) {
        let Some(step) = job.step_key.as_deref().and_then(|k| recipe.step(k)) else {
            continue;
        };
        if !step.produces_documents() {
            continue;
        }
        let Some(document_key) = job.document_key().or(step.document_key.as_deref()) else {
            tracing::warn!(job_id = %job.id, step_key = %step.step_key, "render job names no document");
            continue;
        };

        let slot = slots
            .entry((document_key.to_string(), job.model_id().map(str::to_string)))
            .or_insert(Slot {
                latest: job,
                step_key: &step.step_key,
                rendered: None,
            });
        slot.latest = job;
        slot.step_key = &step.step_key;

        let resource = job
            .results
            .as_ref()
            .and_then(|r| r.get("resource_id"))
            .and_then(|v| v.as_str());
        if let (JobStatus::Completed, Some(at), Some(resource)) = (job.status, job.completed_at, resource) {
            // Ties keep the later-created job.
            if slot.rendered.as_ref().is_none_or(|(seen, _)| at >= *seen) {
                slot.rendered = Some((at, resource.to_string()));
            }
        }
    }

    slots
        .into_iter()
        .map(|((document_key, model_id), slot)| StageDocument {
            document_key,
            job_id: slot.latest.id.clone(),
            step_key: slot.step_key.to_string(),
            model_id,
            status: slot.latest.status.into(),
            latest_rendered_resource_id: slot.rendered.map(|(_, id)| id),
        })
        .collect()
}
