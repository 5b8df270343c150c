//! Job rows and their conditional status transitions.

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{OrchestratorDb, events, format_ts, now, parse_opt_ts, parse_ts, sessions};
use crate::errors::{OrchestratorError, Result};
use crate::jobs::{ErrorDetails, Job, JobStatus, JobType, NewJob, StageScope, TerminalOutcome};

const JOB_COLUMNS: &str = "id, session_id, stage_slug, iteration_number, step_key, job_type, status, \
     parent_job_id, prerequisite_job_id, attempt_count, max_retries, payload, results, \
     error_details, created_at, started_at, completed_at";

struct JobRow {
    id: String,
    session_id: String,
    stage_slug: String,
    iteration_number: u32,
    step_key: Option<String>,
    job_type: String,
    status: String,
    parent_job_id: Option<String>,
    prerequisite_job_id: Option<String>,
    attempt_count: u32,
    max_retries: u32,
    payload: String,
    results: Option<String>,
    error_details: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl JobRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            stage_slug: row.get(2)?,
            iteration_number: row.get(3)?,
            step_key: row.get(4)?,
            job_type: row.get(5)?,
            status: row.get(6)?,
            parent_job_id: row.get(7)?,
            prerequisite_job_id: row.get(8)?,
            attempt_count: row.get(9)?,
            max_retries: row.get(10)?,
            payload: row.get(11)?,
            results: row.get(12)?,
            error_details: row.get(13)?,
            created_at: row.get(14)?,
            started_at: row.get(15)?,
            completed_at: row.get(16)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let invalid = |e: String| anyhow::anyhow!("{} (job {})", e, self.id);
        Ok(Job {
            job_type: self.job_type.parse().map_err(invalid)?,
            status: self.status.parse().map_err(invalid)?,
            payload: serde_json::from_str(&self.payload)?,
            results: self
                .results
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error_details: self
                .error_details
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            id: self.id,
            session_id: self.session_id,
            stage_slug: self.stage_slug,
            iteration_number: self.iteration_number,
            step_key: self.step_key,
            parent_job_id: self.parent_job_id,
            prerequisite_job_id: self.prerequisite_job_id,
            attempt_count: self.attempt_count,
            max_retries: self.max_retries,
        })
    }
}

fn query_jobs(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare(sql).context("Failed to prepare job query")?;
    let rows = stmt.query_map(params, JobRow::read)?;
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row.context("Failed to read job row")?.into_job()?);
    }
    Ok(jobs)
}

fn status_list(statuses: &[JobStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn find_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
    let row = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id],
            JobRow::read,
        )
        .optional()?;
    row.map(JobRow::into_job).transpose()
}

pub fn get_job(conn: &Connection, id: &str) -> Result<Job> {
    find_job(conn, id)?.ok_or_else(|| OrchestratorError::job_not_found(id))
}

/// All jobs of one `(session, stage, iteration)`, in creation order.
pub fn scope_jobs(conn: &Connection, scope: &StageScope) -> Result<Vec<Job>> {
    query_jobs(
        conn,
        &format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE session_id = ?1 AND stage_slug = ?2 AND iteration_number = ?3
             ORDER BY rowid ASC"
        ),
        params![scope.session_id, scope.stage_slug, scope.iteration_number],
    )
}

/// All jobs of one session iteration across stages, in creation order.
pub fn iteration_jobs(conn: &Connection, session_id: &str, iteration: u32) -> Result<Vec<Job>> {
    query_jobs(
        conn,
        &format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE session_id = ?1 AND iteration_number = ?2
             ORDER BY rowid ASC"
        ),
        params![session_id, iteration],
    )
}

/// Jobs whose single prerequisite is `job_id`, optionally filtered by status.
pub fn dependents(conn: &Connection, job_id: &str, status: Option<JobStatus>) -> Result<Vec<Job>> {
    match status {
        Some(status) => query_jobs(
            conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE prerequisite_job_id = ?1 AND status = ?2 ORDER BY rowid ASC"
            ),
            params![job_id, status.as_str()],
        ),
        None => query_jobs(
            conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE prerequisite_job_id = ?1 ORDER BY rowid ASC"
            ),
            params![job_id],
        ),
    }
}

/// Insert a job, choosing its initial status from its prerequisite.
///
/// Returns the outbox event id when the job is born failed (its prerequisite
/// had already failed), since that is a terminal transition in its own right.
pub fn insert_job(conn: &Connection, new: &NewJob) -> Result<(Job, Option<i64>)> {
    if new.stage_slug.trim().is_empty() {
        return Err(OrchestratorError::InvalidJob("stage_slug must not be empty".into()));
    }
    if new.iteration_number == 0 {
        return Err(OrchestratorError::InvalidJob("iteration_number starts at 1".into()));
    }
    if new.step_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
        return Err(OrchestratorError::InvalidJob("step_key must not be blank".into()));
    }
    sessions::get_session(conn, &new.session_id)?;

    if let Some(parent_id) = &new.parent_job_id {
        get_job(conn, parent_id)?;
    }

    let ts = now();
    let mut status = JobStatus::Pending;
    let mut error_details = None;
    let mut completed_at = None;
    if let Some(prereq_id) = &new.prerequisite_job_id {
        let prereq = get_job(conn, prereq_id)?;
        if prereq.session_id != new.session_id {
            return Err(OrchestratorError::InvalidJob(format!(
                "prerequisite {} belongs to another session",
                prereq_id
            )));
        }
        match prereq.status {
            JobStatus::Completed => {}
            JobStatus::Failed => {
                let root = prereq
                    .error_details
                    .as_ref()
                    .and_then(|d| d.root_job_id.clone())
                    .unwrap_or_else(|| prereq.id.clone());
                status = JobStatus::Failed;
                error_details = Some(ErrorDetails::upstream_failed(&prereq.id, &root));
                completed_at = Some(ts);
            }
            _ => status = JobStatus::WaitingForPrerequisite,
        }
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO jobs (id, session_id, stage_slug, iteration_number, step_key, job_type, status,
                           parent_job_id, prerequisite_job_id, max_retries, payload, error_details,
                           created_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            id,
            new.session_id,
            new.stage_slug,
            new.iteration_number,
            new.step_key,
            new.job_type.as_str(),
            status.as_str(),
            new.parent_job_id,
            new.prerequisite_job_id,
            new.max_retries,
            serde_json::to_string(&new.payload)?,
            error_details.as_ref().map(serde_json::to_string).transpose()?,
            format_ts(&ts),
            completed_at.as_ref().map(format_ts),
        ],
    )
    .context("Failed to insert job")?;

    let job = get_job(conn, &id)?;
    let event_id = if job.status.is_terminal() {
        Some(events::insert_event(conn, &job)?)
    } else {
        None
    };
    Ok((job, event_id))
}

/// CAS `waiting_for_prerequisite → pending`.
pub fn unlock(conn: &Connection, id: &str) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE jobs SET status = 'pending' WHERE id = ?1 AND status = 'waiting_for_prerequisite'",
            params![id],
        )
        .context("Failed to unlock job")?;
    Ok(changed > 0)
}

/// CAS `pending → processing`, counting the attempt.
pub fn claim(conn: &Connection, id: &str) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE jobs SET status = 'processing', attempt_count = attempt_count + 1, started_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![format_ts(&now()), id],
        )
        .context("Failed to claim job")?;
    Ok(changed > 0)
}

/// CAS from any of `from` into a terminal status, stamping `completed_at`.
pub fn finish(
    conn: &Connection,
    id: &str,
    from: &[JobStatus],
    to: JobStatus,
    results: Option<&Value>,
    error_details: Option<&ErrorDetails>,
) -> Result<bool> {
    debug_assert!(to.is_terminal() && from.iter().all(|s| s.can_transition_to(to)));
    let changed = conn
        .execute(
            &format!(
                "UPDATE jobs SET status = ?1, results = ?2, error_details = ?3, completed_at = ?4
                 WHERE id = ?5 AND status IN ({})",
                status_list(from)
            ),
            params![
                to.as_str(),
                results.map(serde_json::to_string).transpose()?,
                error_details.map(serde_json::to_string).transpose()?,
                format_ts(&now()),
                id
            ],
        )
        .context("Failed to write terminal job status")?;
    Ok(changed > 0)
}

/// Statuses a job may be failed from: every status that can transition to
/// `failed`.
pub const FAILABLE: [JobStatus; 3] = [
    JobStatus::WaitingForPrerequisite,
    JobStatus::Pending,
    JobStatus::Processing,
];

fn complete_in(conn: &Connection, job: Job, results: Value) -> Result<TerminalOutcome> {
    if job.status.is_terminal() {
        return Ok(TerminalOutcome::AlreadyTerminal { job });
    }
    if !job.status.can_transition_to(JobStatus::Completed) {
        return Err(OrchestratorError::InvalidTransition {
            id: job.id,
            from: job.status,
            to: JobStatus::Completed,
        });
    }
    if !finish(conn, &job.id, &[JobStatus::Processing], JobStatus::Completed, Some(&results), None)? {
        return Ok(TerminalOutcome::AlreadyTerminal {
            job: get_job(conn, &job.id)?,
        });
    }
    let job = get_job(conn, &job.id)?;
    let event_id = events::insert_event(conn, &job)?;
    Ok(TerminalOutcome::Applied { job, event_id })
}

/// The result of completing a PLAN job together with its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCompletion {
    pub outcome: TerminalOutcome,
    pub children: Vec<Job>,
}

impl OrchestratorDb {
    pub fn get_job(&self, id: &str) -> Result<Job> {
        get_job(self.conn(), id)
    }

    /// Jobs of a session iteration, optionally narrowed to one stage.
    pub fn list_jobs(&self, session_id: &str, iteration: u32, stage: Option<&str>) -> Result<Vec<Job>> {
        let tx = self.read_tx()?;
        sessions::get_session(&tx, session_id)?;
        let jobs = match stage {
            Some(stage) => scope_jobs(&tx, &StageScope::new(session_id, stage, iteration))?,
            None => iteration_jobs(&tx, session_id, iteration)?,
        };
        tx.commit()?;
        Ok(jobs)
    }

    pub fn list_dependents(&self, job_id: &str) -> Result<Vec<Job>> {
        get_job(self.conn(), job_id)?;
        dependents(self.conn(), job_id, None)
    }

    pub fn create_job(&self, new: &NewJob) -> Result<Job> {
        Ok(self.create_job_with_event(new)?.0)
    }

    pub fn create_job_with_event(&self, new: &NewJob) -> Result<(Job, Option<i64>)> {
        let tx = self.write_tx()?;
        let created = insert_job(&tx, new)?;
        tx.commit()?;
        let job = &created.0;
        tracing::info!(
            job_id = %job.id,
            scope = %job.scope(),
            job_type = %job.job_type,
            status = %job.status,
            "job created"
        );
        Ok(created)
    }

    /// Claim a pending job for execution. `None` means the job was not
    /// claimable (still waiting, or another executor got it first).
    pub fn claim_job(&self, id: &str) -> Result<Option<Job>> {
        let tx = self.write_tx()?;
        let job = get_job(&tx, id)?;
        if !claim(&tx, id)? {
            tracing::debug!(job_id = id, status = %job.status, "claim skipped");
            return Ok(None);
        }
        if sessions::mark_generating(&tx, &job.scope())? {
            tracing::info!(session_id = %job.session_id, stage = %job.stage_slug, "stage generating");
        }
        let job = get_job(&tx, id)?;
        tx.commit()?;
        tracing::info!(job_id = id, attempt = job.attempt_count, "job claimed");
        Ok(Some(job))
    }

    pub fn complete_job(&self, id: &str, results: Value) -> Result<TerminalOutcome> {
        let tx = self.write_tx()?;
        let job = get_job(&tx, id)?;
        let outcome = complete_in(&tx, job, results)?;
        tx.commit()?;
        log_outcome(&outcome);
        Ok(outcome)
    }

    /// Insert a PLAN job's children, bound to it as parent and prerequisite,
    /// and complete the plan, in one transaction.
    pub fn complete_plan_job(
        &self,
        id: &str,
        results: Value,
        children: Vec<NewJob>,
    ) -> Result<PlanCompletion> {
        let tx = self.write_tx()?;
        let plan = get_job(&tx, id)?;
        if plan.job_type != JobType::Plan {
            return Err(OrchestratorError::InvalidJob(format!(
                "job {} is {}, not PLAN",
                id, plan.job_type
            )));
        }
        if plan.status.is_terminal() {
            let outcome = TerminalOutcome::AlreadyTerminal { job: plan };
            log_outcome(&outcome);
            return Ok(PlanCompletion {
                outcome,
                children: Vec::new(),
            });
        }
        let mut inserted = Vec::with_capacity(children.len());
        for child in children {
            let child = NewJob {
                parent_job_id: Some(plan.id.clone()),
                prerequisite_job_id: Some(plan.id.clone()),
                ..child
            };
            inserted.push(insert_job(&tx, &child)?.0);
        }
        let outcome = complete_in(&tx, plan, results)?;
        tx.commit()?;
        tracing::info!(job_id = id, children = inserted.len(), "plan children inserted");
        log_outcome(&outcome);
        Ok(PlanCompletion {
            outcome,
            children: inserted,
        })
    }

    /// Fail a job from any non-terminal status. This is also how a caller
    /// aborts a pipeline.
    pub fn fail_job(&self, id: &str, details: ErrorDetails) -> Result<TerminalOutcome> {
        let tx = self.write_tx()?;
        let job = get_job(&tx, id)?;
        if !job.status.can_transition_to(JobStatus::Failed)
            || !finish(&tx, id, &FAILABLE, JobStatus::Failed, None, Some(&details))?
        {
            let outcome = TerminalOutcome::AlreadyTerminal {
                job: get_job(&tx, id)?,
            };
            log_outcome(&outcome);
            return Ok(outcome);
        }
        let job = get_job(&tx, id)?;
        let event_id = events::insert_event(&tx, &job)?;
        tx.commit()?;
        let outcome = TerminalOutcome::Applied { job, event_id };
        log_outcome(&outcome);
        Ok(outcome)
    }
}

fn log_outcome(outcome: &TerminalOutcome) {
    match outcome {
        TerminalOutcome::Applied { job, event_id } => {
            tracing::info!(job_id = %job.id, status = %job.status, event_id, "job reached terminal state");
        }
        TerminalOutcome::AlreadyTerminal { job } => {
            tracing::debug!(job_id = %job.id, status = %job.status, "terminal write discarded, job already terminal");
        }
    }
}
