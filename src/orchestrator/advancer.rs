//! Stage and session advancement.
//!
//! After a terminal transition the advancer re-reads the stage's progress
//! and moves the session forward when the stage's recipe is satisfied, or
//! into `<stage>_failed` when any step failed. Every session write is
//! conditioned on the status it read, and a session that has already left
//! the stage is never touched again, so re-running is free.
//!
//! Jobs of a later stage may run early, gated only by their prerequisites.
//! Entering a stage therefore re-checks it at once: a stage that already
//! started, finished or failed is caught up in the same transaction.

use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::progress::ProgressAggregator;
use crate::db::{jobs, sessions};
use crate::errors::{OrchestratorError, Result};
use crate::jobs::StageScope;
use crate::recipe::Pipeline;
use crate::session::{Session, SessionStatus};

/// What happens after a stage's generation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvancePolicy {
    /// Move straight on to `pending_<next>`.
    #[default]
    Auto,
    /// Stop at `<stage>_generation_complete` until the stage is submitted.
    AwaitSubmission,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// Stage still in progress, or the session is not on this stage.
    NoChange,
    StageFailed { stage: String },
    /// The stage completed; `next` is where the session now waits, if it
    /// moved on.
    StageCompleted {
        stage: String,
        next: Option<SessionStatus>,
    },
    /// The session left a completed stage because it was submitted.
    Submitted { stage: String, next: SessionStatus },
}

pub struct StageAdvancer {
    pipeline: Arc<Pipeline>,
    progress: Arc<ProgressAggregator>,
    policy: AdvancePolicy,
}

impl StageAdvancer {
    pub fn new(pipeline: Arc<Pipeline>, progress: Arc<ProgressAggregator>, policy: AdvancePolicy) -> Self {
        Self {
            pipeline,
            progress,
            policy,
        }
    }

    /// Re-evaluate the session owning `scope` after one of its jobs reached
    /// a terminal state.
    pub fn advance(&self, conn: &Connection, scope: &StageScope) -> Result<AdvanceOutcome> {
        let session = sessions::get_session(conn, &scope.session_id)?;
        if session.current_stage_id != scope.stage_slug
            || session.iteration_count != scope.iteration_number
            || !session.status.is_active_for(&scope.stage_slug)
        {
            tracing::debug!(
                scope = %scope,
                status = %session.status,
                current_stage = %session.current_stage_id,
                "session not active for scope"
            );
            return Ok(AdvanceOutcome::NoChange);
        }

        let progress = self.progress.stage_progress(conn, scope)?;
        let stage = scope.stage_slug.clone();

        if progress.any_failed() {
            let failed = SessionStatus::Failed(stage.clone());
            if sessions::transition_status(conn, &session.id, &session.status, &failed, None)? {
                tracing::warn!(session_id = %session.id, stage = %stage, "stage failed");
                return Ok(AdvanceOutcome::StageFailed { stage });
            }
            return Ok(AdvanceOutcome::NoChange);
        }

        if !progress.all_required_completed() {
            return Ok(AdvanceOutcome::NoChange);
        }

        let complete = SessionStatus::GenerationComplete(stage.clone());
        if !sessions::transition_status(conn, &session.id, &session.status, &complete, None)? {
            return Ok(AdvanceOutcome::NoChange);
        }
        tracing::info!(session_id = %session.id, stage = %stage, "stage generation complete");

        let next = match self.policy {
            AdvancePolicy::Auto => Some(self.move_to_next(
                conn,
                &session.id,
                &stage,
                scope.iteration_number,
            )?),
            AdvancePolicy::AwaitSubmission => None,
        };
        Ok(AdvanceOutcome::StageCompleted { stage, next })
    }

    /// Move a session parked at `<stage>_generation_complete` on to the next
    /// stage. Submitting a stage the session has already left is a no-op.
    pub fn submit_stage(&self, conn: &Connection, session_id: &str, stage: &str) -> Result<AdvanceOutcome> {
        let session = sessions::get_session(conn, session_id)?;
        if self.pipeline.stage(stage).is_none() {
            return Err(OrchestratorError::stage_not_found(stage));
        }

        if session.status == SessionStatus::GenerationComplete(stage.to_string()) {
            let next = self.move_to_next(conn, session_id, stage, session.iteration_count)?;
            return Ok(AdvanceOutcome::Submitted {
                stage: stage.to_string(),
                next,
            });
        }
        if self.has_left_stage(&session, stage)? {
            tracing::debug!(session_id, stage, status = %session.status, "stage already submitted");
            return Ok(AdvanceOutcome::NoChange);
        }
        Err(OrchestratorError::StageNotSubmittable {
            id: session.id,
            status: session.status.to_string(),
            stage: stage.to_string(),
        })
    }

    fn move_to_next(
        &self,
        conn: &Connection,
        session_id: &str,
        stage: &str,
        iteration: u32,
    ) -> Result<SessionStatus> {
        let complete = SessionStatus::GenerationComplete(stage.to_string());
        let (next, next_stage) = match self.pipeline.next_stage(stage)? {
            Some(next) => (SessionStatus::Pending(next.slug.clone()), Some(next.slug.as_str())),
            None => (SessionStatus::IterationCompletePendingReview, None),
        };
        if sessions::transition_status(conn, session_id, &complete, &next, next_stage)? {
            tracing::info!(session_id, from = stage, to = %next, "session advanced");
            if let Some(next_stage) = next_stage {
                self.enter_stage(conn, &StageScope::new(session_id, next_stage, iteration))?;
            }
        }
        Ok(next)
    }

    /// Catch up on a stage the session just moved into. No later event may
    /// target it if its jobs already ran while the session was behind.
    fn enter_stage(&self, conn: &Connection, scope: &StageScope) -> Result<()> {
        let started = jobs::scope_jobs(conn, scope)?
            .iter()
            .any(|j| j.started_at.is_some() || j.status.is_terminal());
        if started && sessions::mark_generating(conn, scope)? {
            tracing::info!(scope = %scope, "entered stage with work already started");
        }
        let outcome = self.advance(conn, scope)?;
        if outcome != AdvanceOutcome::NoChange {
            tracing::info!(scope = %scope, outcome = ?outcome, "entered stage already settled");
        }
        Ok(())
    }

    fn has_left_stage(&self, session: &Session, stage: &str) -> Result<bool> {
        if session.status == SessionStatus::IterationCompletePendingReview {
            return Ok(true);
        }
        let position = |slug: &str| {
            self.pipeline
                .stages
                .iter()
                .position(|s| s.slug == slug)
                .ok_or_else(|| OrchestratorError::stage_not_found(slug))
        };
        Ok(position(&session.current_stage_id)? > position(stage)?)
    }
}
