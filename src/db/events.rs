//! Terminal-transition outbox.
//!
//! Every terminal job write inserts a `job_events` row in the same
//! transaction. The reconciler marks a row processed in the transaction that
//! applies its side effects, so an event is handled at most once and an
//! unprocessed event survives a crash.

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use super::{OrchestratorDb, format_ts, now, parse_opt_ts, parse_ts};
use crate::errors::Result;
use crate::jobs::{Job, JobStatus, StageScope};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: String,
    pub scope: StageScope,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl JobEvent {
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

pub fn insert_event(conn: &Connection, job: &Job) -> Result<i64> {
    conn.execute(
        "INSERT INTO job_events (job_id, session_id, stage_slug, iteration_number, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            job.id,
            job.session_id,
            job.stage_slug,
            job.iteration_number,
            job.status.as_str(),
            format_ts(&now())
        ],
    )
    .context("Failed to insert job event")?;
    Ok(conn.last_insert_rowid())
}

const EVENT_COLUMNS: &str =
    "id, job_id, session_id, stage_slug, iteration_number, status, created_at, processed_at";

type EventRow = (i64, String, String, String, u32, String, String, Option<String>);

fn read_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_event(row: EventRow) -> Result<JobEvent> {
    let (id, job_id, session_id, stage_slug, iteration, status, created_at, processed_at) = row;
    Ok(JobEvent {
        id,
        job_id,
        scope: StageScope::new(&session_id, &stage_slug, iteration),
        status: status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
        created_at: parse_ts(&created_at)?,
        processed_at: parse_opt_ts(processed_at)?,
    })
}

pub fn find_event(conn: &Connection, id: i64) -> Result<Option<JobEvent>> {
    let row = conn
        .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM job_events WHERE id = ?1"),
            params![id],
            read_event_row,
        )
        .optional()?;
    row.map(into_event).transpose()
}

pub fn unprocessed_events(conn: &Connection, limit: usize) -> Result<Vec<JobEvent>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM job_events WHERE processed_at IS NULL ORDER BY id ASC LIMIT ?1"
        ))
        .context("Failed to prepare unprocessed_events")?;
    let rows = stmt.query_map(params![limit as i64], read_event_row)?;
    let mut events = Vec::new();
    for row in rows {
        events.push(into_event(row?)?);
    }
    Ok(events)
}

/// Returns `false` if the event was already processed.
pub fn mark_processed(conn: &Connection, id: i64) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE job_events SET processed_at = ?1 WHERE id = ?2 AND processed_at IS NULL",
            params![format_ts(&now()), id],
        )
        .context("Failed to mark job event processed")?;
    Ok(changed > 0)
}

impl OrchestratorDb {
    pub fn find_event(&self, id: i64) -> Result<Option<JobEvent>> {
        find_event(self.conn(), id)
    }

    pub fn unprocessed_events(&self, limit: usize) -> Result<Vec<JobEvent>> {
        unprocessed_events(self.conn(), limit)
    }
}
