//! Dependency resolution on terminal transitions.
//!
//! When a job completes, every job waiting on it becomes `pending`. When a
//! job fails, every job waiting on it fails with an upstream reason, and so
//! on down the prerequisite chain. The cascade is walked with an explicit
//! worklist so arbitrarily long chains never grow the stack.

use std::collections::BTreeSet;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::jobs;
use crate::errors::{OrchestratorError, Result};
use crate::jobs::{ErrorDetails, JobStatus, StageScope};

/// What one resolution pass changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Jobs moved `waiting_for_prerequisite → pending`.
    pub unlocked: Vec<String>,
    /// Jobs failed because something upstream failed.
    pub failed: Vec<String>,
    /// Every scope whose jobs changed, including the triggering job's.
    pub scopes: BTreeSet<StageScope>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.unlocked.is_empty() && self.failed.is_empty()
    }
}

/// React to `job_id` having reached `final_status`.
///
/// Safe to re-run: every write is conditioned on the dependent still waiting,
/// so a second pass over the same job finds nothing to do.
pub fn on_job_terminal(
    conn: &Connection,
    job_id: &str,
    final_status: JobStatus,
) -> Result<Resolution> {
    let job = jobs::get_job(conn, job_id)?;
    if !final_status.is_terminal() || job.status != final_status {
        return Err(OrchestratorError::InvalidJob(format!(
            "job {} is {}, cannot resolve dependents as {}",
            job_id, job.status, final_status
        )));
    }

    let mut resolution = Resolution::default();
    resolution.scopes.insert(job.scope());

    match final_status {
        JobStatus::Completed => {
            for dependent in jobs::dependents(conn, job_id, Some(JobStatus::WaitingForPrerequisite))? {
                if jobs::unlock(conn, &dependent.id)? {
                    tracing::info!(job_id = %dependent.id, prerequisite = job_id, "job unlocked");
                    resolution.scopes.insert(dependent.scope());
                    resolution.unlocked.push(dependent.id);
                } else {
                    tracing::debug!(job_id = %dependent.id, "unlock lost race");
                }
            }
        }
        _ => {
            let root = job
                .error_details
                .as_ref()
                .and_then(|d| d.root_job_id.clone())
                .unwrap_or_else(|| job.id.clone());
            let mut worklist = vec![job.id.clone()];
            while let Some(upstream) = worklist.pop() {
                for dependent in
                    jobs::dependents(conn, &upstream, Some(JobStatus::WaitingForPrerequisite))?
                {
                    let details = ErrorDetails::upstream_failed(&upstream, &root);
                    let applied = jobs::finish(
                        conn,
                        &dependent.id,
                        &[JobStatus::WaitingForPrerequisite],
                        JobStatus::Failed,
                        None,
                        Some(&details),
                    )?;
                    if !applied {
                        tracing::debug!(job_id = %dependent.id, "cascade lost race");
                        continue;
                    }
                    tracing::info!(
                        job_id = %dependent.id,
                        upstream = %upstream,
                        root = %root,
                        "job failed by upstream"
                    );
                    resolution.scopes.insert(dependent.scope());
                    worklist.push(dependent.id.clone());
                    resolution.failed.push(dependent.id);
                }
            }
        }
    }

    Ok(resolution)
}
