//! Job graph orchestration.
//!
//! [`Orchestrator`] is the async entry point executors and query surfaces
//! talk to. Writes go to the job store; every terminal write leaves an
//! outbox event that the [`reconciler`] turns into dependency resolution
//! ([`resolver`]) and session advancement ([`advancer`]).

pub mod advancer;
pub mod progress;
pub mod reconciler;
pub mod resolver;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::db::DbHandle;
use crate::db::jobs::PlanCompletion;
use crate::errors::{OrchestratorError, Result};
use crate::jobs::{ErrorDetails, Job, NewJob, TerminalOutcome};
use crate::recipe::{Pipeline, RecipeResolver, RecipeStep};
use crate::session::{Session, SessionStatusChange};

pub use advancer::{AdvanceOutcome, AdvancePolicy, StageAdvancer};
pub use progress::{
    DocumentStatus, ModelStatus, ProgressAggregator, StageDocument, StageProgressEntry, StepAnomaly,
    StepProgress, StepStatus,
};
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerMode};
pub use resolver::Resolution;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub reconciler: ReconcilerMode,
    pub advance_policy: AdvancePolicy,
}

struct Background {
    events: mpsc::Sender<i64>,
    task: JoinHandle<()>,
}

pub struct Orchestrator {
    db: DbHandle,
    pipeline: Arc<Pipeline>,
    progress: Arc<ProgressAggregator>,
    reconciler: Arc<Reconciler>,
    background: Option<Background>,
}

impl Orchestrator {
    /// Build the orchestrator and recover: unprocessed events left by a
    /// previous run are drained before this returns (inline mode) or first
    /// thing in the background task.
    pub async fn start(db: DbHandle, pipeline: Pipeline, settings: OrchestratorSettings) -> Result<Self> {
        let pipeline = Arc::new(pipeline);
        let recipes = Arc::new(RecipeResolver::for_pipeline(pipeline.clone()));
        let progress = Arc::new(ProgressAggregator::new(recipes));
        let reconciler = Arc::new(Reconciler::new(StageAdvancer::new(
            pipeline.clone(),
            progress.clone(),
            settings.advance_policy,
        )));

        let background = match settings.reconciler {
            ReconcilerMode::Inline => {
                let r = reconciler.clone();
                db.call(move |db| r.drain_pending(db)).await?;
                None
            }
            ReconcilerMode::Background => {
                let (events, task) = reconciler.clone().spawn_background(db.clone());
                Some(Background { events, task })
            }
        };
        tracing::info!(
            mode = %settings.reconciler,
            policy = ?settings.advance_policy,
            stages = pipeline.stages.len(),
            "orchestrator started"
        );

        Ok(Self {
            db,
            pipeline,
            progress,
            reconciler,
            background,
        })
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub async fn start_session(&self, models: Vec<String>) -> Result<Session> {
        let pipeline = self.pipeline.clone();
        self.db
            .call(move |db| db.create_session(&pipeline, &models))
            .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        let id = session_id.to_string();
        self.db.call(move |db| db.get_session(&id)).await
    }

    pub async fn session_history(&self, session_id: &str) -> Result<Vec<SessionStatusChange>> {
        let id = session_id.to_string();
        self.db.call(move |db| db.session_history(&id)).await
    }

    /// Give a session its own copy of a stage's template recipe.
    pub async fn clone_recipe(&self, session_id: &str, stage_slug: &str) -> Result<Vec<RecipeStep>> {
        let pipeline = self.pipeline.clone();
        let (id, stage) = (session_id.to_string(), stage_slug.to_string());
        self.db
            .call(move |db| db.clone_recipe_for_session(&pipeline, &id, &stage))
            .await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        let id = job_id.to_string();
        self.db.call(move |db| db.get_job(&id)).await
    }

    pub async fn list_jobs(
        &self,
        session_id: &str,
        iteration: u32,
        stage: Option<&str>,
    ) -> Result<Vec<Job>> {
        let id = session_id.to_string();
        let stage = stage.map(str::to_string);
        self.db
            .call(move |db| db.list_jobs(&id, iteration, stage.as_deref()))
            .await
    }

    /// Create a root job, or a dependent of an existing one.
    pub async fn submit_job(&self, new: NewJob) -> Result<Job> {
        if self.pipeline.stage(&new.stage_slug).is_none() {
            return Err(OrchestratorError::stage_not_found(&new.stage_slug));
        }
        let (job, event) = self.db.call(move |db| db.create_job_with_event(&new)).await?;
        if let Some(event_id) = event {
            self.dispatch(event_id).await?;
        }
        Ok(job)
    }

    pub async fn claim_job(&self, job_id: &str) -> Result<Option<Job>> {
        let id = job_id.to_string();
        self.db.call(move |db| db.claim_job(&id)).await
    }

    pub async fn complete_job(&self, job_id: &str, results: Value) -> Result<TerminalOutcome> {
        let id = job_id.to_string();
        let outcome = self.db.call(move |db| db.complete_job(&id, results)).await?;
        if let Some(event_id) = outcome.event_id() {
            self.dispatch(event_id).await?;
        }
        Ok(outcome)
    }

    /// Complete a PLAN job, inserting its children bound to it.
    pub async fn complete_plan_job(
        &self,
        job_id: &str,
        results: Value,
        children: Vec<NewJob>,
    ) -> Result<PlanCompletion> {
        if let Some(child) = children
            .iter()
            .find(|c| self.pipeline.stage(&c.stage_slug).is_none())
        {
            return Err(OrchestratorError::stage_not_found(&child.stage_slug));
        }
        let id = job_id.to_string();
        let done = self
            .db
            .call(move |db| db.complete_plan_job(&id, results, children))
            .await?;
        if let Some(event_id) = done.outcome.event_id() {
            self.dispatch(event_id).await?;
        }
        Ok(done)
    }

    /// Fail a job. Failing a pending or waiting job is how a caller aborts
    /// the pipeline behind it.
    pub async fn fail_job(&self, job_id: &str, details: ErrorDetails) -> Result<TerminalOutcome> {
        let id = job_id.to_string();
        let outcome = self.db.call(move |db| db.fail_job(&id, details)).await?;
        if let Some(event_id) = outcome.event_id() {
            self.dispatch(event_id).await?;
        }
        Ok(outcome)
    }

    /// Per-stage progress for one session iteration, read from one snapshot.
    pub async fn get_stage_progress(
        &self,
        session_id: &str,
        iteration: u32,
    ) -> Result<Vec<StageProgressEntry>> {
        let id = session_id.to_string();
        let progress = self.progress.clone();
        self.db
            .call(move |db| {
                let tx = db.read_tx()?;
                let entries = progress.get_stage_progress(&tx, &id, iteration)?;
                tx.commit()?;
                Ok(entries)
            })
            .await
    }

    pub async fn submit_stage(&self, session_id: &str, stage_slug: &str) -> Result<AdvanceOutcome> {
        let (id, stage) = (session_id.to_string(), stage_slug.to_string());
        let reconciler = self.reconciler.clone();
        self.db
            .call(move |db| {
                let tx = db.write_tx()?;
                let outcome = reconciler.advancer().submit_stage(&tx, &id, &stage)?;
                tx.commit()?;
                Ok(outcome)
            })
            .await
    }

    /// Replay every unprocessed outbox event.
    pub async fn drain_pending(&self) -> Result<Vec<ReconcileReport>> {
        let reconciler = self.reconciler.clone();
        self.db.call(move |db| reconciler.drain_pending(db)).await
    }

    /// Stop the background reconciler, letting it finish queued events.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(Background { events, task }) = self.background.take() {
            drop(events);
            task.await.map_err(|e| anyhow::anyhow!("reconciler task failed: {}", e))?;
        }
        Ok(())
    }

    async fn dispatch(&self, event_id: i64) -> Result<()> {
        match &self.background {
            None => {
                let reconciler = self.reconciler.clone();
                self.db
                    .call(move |db| reconciler.process_event(db, event_id))
                    .await?;
            }
            Some(background) => {
                if background.events.send(event_id).await.is_err() {
                    // The outbox row stays unprocessed until the next drain.
                    tracing::warn!(event_id, "background reconciler gone, event left for drain");
                }
            }
        }
        Ok(())
    }
}
