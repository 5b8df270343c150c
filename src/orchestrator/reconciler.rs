//! Outbox reconciler.
//!
//! Consumes `job_events` rows written by terminal transitions. One event is
//! processed in one write transaction: resolve dependents, advance every
//! scope the cascade touched, mark the event processed. A crash before
//! commit leaves the event unprocessed for `drain_pending` to pick up.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::advancer::{AdvanceOutcome, StageAdvancer};
use super::resolver::{self, Resolution};
use crate::db::{DbHandle, OrchestratorDb, events};
use crate::errors::{OrchestratorError, Result};
use crate::jobs::StageScope;

/// Batch size for `drain_pending`.
const DRAIN_BATCH: usize = 100;

/// How terminal events get processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerMode {
    /// The terminal call processes its own event before returning.
    #[default]
    Inline,
    /// Events are queued to a background task.
    Background,
}

impl std::fmt::Display for ReconcilerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline => f.write_str("inline"),
            Self::Background => f.write_str("background"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeAdvance {
    pub scope: StageScope,
    pub outcome: AdvanceOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub event_id: i64,
    pub job_id: String,
    /// True when the event had been processed before; nothing was done.
    pub already_processed: bool,
    pub resolution: Resolution,
    pub advances: Vec<ScopeAdvance>,
}

pub struct Reconciler {
    advancer: StageAdvancer,
}

impl Reconciler {
    pub fn new(advancer: StageAdvancer) -> Self {
        Self { advancer }
    }

    pub fn advancer(&self) -> &StageAdvancer {
        &self.advancer
    }

    pub fn process_event(&self, db: &OrchestratorDb, event_id: i64) -> Result<ReconcileReport> {
        let tx = db.write_tx()?;
        let event = events::find_event(&tx, event_id)?.ok_or_else(|| {
            OrchestratorError::Other(anyhow::anyhow!("job event {} not found", event_id))
        })?;

        if event.is_processed() {
            tracing::debug!(event_id, job_id = %event.job_id, "event already processed");
            return Ok(ReconcileReport {
                event_id,
                job_id: event.job_id,
                already_processed: true,
                resolution: Resolution::default(),
                advances: Vec::new(),
            });
        }

        let resolution = resolver::on_job_terminal(&tx, &event.job_id, event.status)?;
        let mut advances = Vec::with_capacity(resolution.scopes.len());
        for scope in &resolution.scopes {
            let outcome = self.advancer.advance(&tx, scope)?;
            advances.push(ScopeAdvance {
                scope: scope.clone(),
                outcome,
            });
        }
        events::mark_processed(&tx, event_id)?;
        tx.commit()?;

        tracing::info!(
            event_id,
            job_id = %event.job_id,
            status = %event.status,
            unlocked = resolution.unlocked.len(),
            cascaded = resolution.failed.len(),
            "event reconciled"
        );
        Ok(ReconcileReport {
            event_id,
            job_id: event.job_id,
            already_processed: false,
            resolution,
            advances,
        })
    }

    /// Process every unprocessed event, oldest first.
    pub fn drain_pending(&self, db: &OrchestratorDb) -> Result<Vec<ReconcileReport>> {
        let mut reports = Vec::new();
        loop {
            let batch = events::unprocessed_events(db.conn(), DRAIN_BATCH)?;
            if batch.is_empty() {
                break;
            }
            for event in batch {
                reports.push(self.process_event(db, event.id)?);
            }
        }
        if !reports.is_empty() {
            tracing::info!(count = reports.len(), "drained pending events");
        }
        Ok(reports)
    }

    /// Spawn a task that processes event ids sent on the returned channel.
    /// The task drains any backlog first and exits when every sender is
    /// dropped.
    pub fn spawn_background(self: Arc<Self>, db: DbHandle) -> (mpsc::Sender<i64>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<i64>(100);
        let handle = tokio::spawn(async move {
            let reconciler = self.clone();
            if let Err(e) = db.call(move |db| reconciler.drain_pending(db)).await {
                tracing::error!(error = %e, "background reconciler failed to drain backlog");
            }
            while let Some(event_id) = rx.recv().await {
                let reconciler = self.clone();
                if let Err(e) = db
                    .call(move |db| reconciler.process_event(db, event_id))
                    .await
                {
                    tracing::error!(event_id, error = %e, "background reconcile failed");
                }
            }
            tracing::debug!("background reconciler stopped");
        });
        (tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{ErrorDetails, JobStatus, JobType, NewJob};
    use crate::orchestrator::advancer::AdvancePolicy;
    use crate::orchestrator::progress::ProgressAggregator;
    use crate::recipe::{Pipeline, RecipeResolver};
    use crate::session::SessionStatus;
    use serde_json::json;

    fn reconciler() -> Reconciler {
        let pipeline = Arc::new(Pipeline::default());
        let progress = Arc::new(ProgressAggregator::new(Arc::new(RecipeResolver::for_pipeline(
            pipeline.clone(),
        ))));
        Reconciler::new(StageAdvancer::new(pipeline, progress, AdvancePolicy::Auto))
    }

    #[test]
    fn test_event_processed_exactly_once() -> anyhow::Result<()> {
        let db = OrchestratorDb::new_in_memory()?;
        let session = db.create_session(&Pipeline::default(), &[])?;
        let scope = StageScope::new(&session.id, "thesis", 1);
        let a = db.create_job(&NewJob::new(&scope, JobType::Plan))?;
        let b = db.create_job(&NewJob::new(&scope, JobType::Execute).with_prerequisite(&a.id))?;
        db.claim_job(&a.id)?;
        let event_id = db.complete_job(&a.id, json!({}))?.event_id().unwrap();

        let reconciler = reconciler();
        let first = reconciler.process_event(&db, event_id)?;
        assert!(!first.already_processed);
        assert_eq!(first.resolution.unlocked, vec![b.id.clone()]);
        assert_eq!(first.advances.len(), 1);
        assert!(db.find_event(event_id)?.unwrap().is_processed());

        let second = reconciler.process_event(&db, event_id)?;
        assert!(second.already_processed);
        assert!(second.resolution.is_empty());
        assert_eq!(db.get_job(&b.id)?.status, JobStatus::Pending);
        Ok(())
    }

    #[test]
    fn test_failure_event_fails_session_stage() -> anyhow::Result<()> {
        let db = OrchestratorDb::new_in_memory()?;
        let session = db.create_session(&Pipeline::default(), &[])?;
        let scope = StageScope::new(&session.id, "thesis", 1);
        let plan = db.create_job(&NewJob::new(&scope, JobType::Plan).with_step("thesis_build_stage_header"))?;
        let child = db.create_job(&NewJob::new(&scope, JobType::Execute).with_prerequisite(&plan.id))?;
        db.claim_job(&plan.id)?;
        db.fail_job(&plan.id, ErrorDetails::execution("timeout"))?;

        let reports = reconciler().drain_pending(&db)?;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].resolution.failed, vec![child.id]);
        assert_eq!(
            reports[0].advances[0].outcome,
            AdvanceOutcome::StageFailed { stage: "thesis".into() }
        );
        assert_eq!(db.get_session(&session.id)?.status, SessionStatus::Failed("thesis".into()));
        assert!(db.unprocessed_events(10)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_unknown_event_is_an_error() -> anyhow::Result<()> {
        let db = OrchestratorDb::new_in_memory()?;
        assert!(reconciler().process_event(&db, 42).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_background_task_drains_backlog_and_channel() -> anyhow::Result<()> {
        let handle = DbHandle::new(OrchestratorDb::new_in_memory()?);
        let (scope, backlog_job, queued_job, backlog_event) = {
            let db = handle.lock_sync()?;
            let session = db.create_session(&Pipeline::default(), &[])?;
            let scope = StageScope::new(&session.id, "thesis", 1);
            let a = db.create_job(&NewJob::new(&scope, JobType::Plan))?;
            let a_child = db.create_job(&NewJob::new(&scope, JobType::Execute).with_prerequisite(&a.id))?;
            db.claim_job(&a.id)?;
            let event = db.complete_job(&a.id, json!({}))?.event_id().unwrap();
            let b = db.create_job(&NewJob::new(&scope, JobType::Plan))?;
            (scope, a_child, b, event)
        };
        let queued_child = handle
            .call({
                let scope = scope.clone();
                let prereq = queued_job.id.clone();
                move |db| db.create_job(&NewJob::new(&scope, JobType::Execute).with_prerequisite(&prereq))
            })
            .await?;

        let (tx, task) = Arc::new(reconciler()).spawn_background(handle.clone());
        let queued_event = handle
            .call({
                let id = queued_job.id.clone();
                move |db| {
                    db.claim_job(&id)?;
                    Ok(db.complete_job(&id, json!({}))?.event_id())
                }
            })
            .await?
            .unwrap();
        tx.send(queued_event).await?;
        drop(tx);
        task.await?;

        let db = handle.lock_sync()?;
        assert!(db.find_event(backlog_event)?.unwrap().is_processed());
        assert!(db.find_event(queued_event)?.unwrap().is_processed());
        assert_eq!(db.get_job(&backlog_job.id)?.status, JobStatus::Pending);
        assert_eq!(db.get_job(&queued_child.id)?.status, JobStatus::Pending);
        Ok(())
    }
}
