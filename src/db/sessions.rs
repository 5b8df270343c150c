//! Session rows and their status history.

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::{OrchestratorDb, format_ts, now, parse_ts};
use crate::errors::{OrchestratorError, Result};
use crate::jobs::StageScope;
use crate::recipe::Pipeline;
use crate::session::{Session, SessionStatus, SessionStatusChange};

struct SessionRow {
    id: String,
    status: String,
    current_stage_id: String,
    iteration_count: u32,
    selected_model_ids: String,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        Ok(Session {
            status: self.status.parse().map_err(|e: String| {
                OrchestratorError::Other(anyhow::anyhow!("{} (session {})", e, self.id))
            })?,
            selected_model_ids: serde_json::from_str(&self.selected_model_ids)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            current_stage_id: self.current_stage_id,
            iteration_count: self.iteration_count,
        })
    }
}

pub fn insert_session(conn: &Connection, pipeline: &Pipeline, models: &[String]) -> Result<Session> {
    let first = pipeline
        .first_stage()
        .ok_or_else(|| OrchestratorError::Config("pipeline has no stages".to_string()))?;
    let id = Uuid::new_v4().to_string();
    let ts = format_ts(&now());
    let status = SessionStatus::Pending(first.slug.clone());
    conn.execute(
        "INSERT INTO sessions (id, status, current_stage_id, iteration_count, selected_model_ids, created_at, updated_at)
         VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)",
        params![
            id,
            status.to_string(),
            first.slug,
            serde_json::to_string(models)?,
            ts
        ],
    )
    .context("Failed to insert session")?;
    get_session(conn, &id)
}

pub fn find_session(conn: &Connection, id: &str) -> Result<Option<Session>> {
    let row = conn
        .query_row(
            "SELECT id, status, current_stage_id, iteration_count, selected_model_ids, created_at, updated_at
             FROM sessions WHERE id = ?1",
            params![id],
            |row| {
                Ok(SessionRow {
                    id: row.get(0)?,
                    status: row.get(1)?,
                    current_stage_id: row.get(2)?,
                    iteration_count: row.get(3)?,
                    selected_model_ids: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            },
        )
        .optional()?;
    row.map(SessionRow::into_session).transpose()
}

pub fn get_session(conn: &Connection, id: &str) -> Result<Session> {
    find_session(conn, id)?.ok_or_else(|| OrchestratorError::session_not_found(id))
}

/// Conditionally move a session from `from` to `to`, optionally pointing it
/// at a new current stage. Returns `false` if the session was no longer in
/// `from`. Successful moves are appended to the status history.
pub fn transition_status(
    conn: &Connection,
    session_id: &str,
    from: &SessionStatus,
    to: &SessionStatus,
    new_current_stage: Option<&str>,
) -> Result<bool> {
    let ts = format_ts(&now());
    let changed = conn
        .execute(
            "UPDATE sessions
             SET status = ?1, current_stage_id = COALESCE(?2, current_stage_id), updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                to.to_string(),
                new_current_stage,
                ts,
                session_id,
                from.to_string()
            ],
        )
        .context("Failed to update session status")?;
    if changed == 0 {
        return Ok(false);
    }
    let stage = to.stage().or(from.stage()).unwrap_or_default();
    conn.execute(
        "INSERT INTO session_status_history (session_id, from_status, to_status, stage_slug, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![session_id, from.to_string(), to.to_string(), stage, ts],
    )
    .context("Failed to record session status change")?;
    Ok(true)
}

/// Move the session owning `scope` from `pending_<stage>` to
/// `generating_<stage>`, if it is on that stage and iteration.
pub fn mark_generating(conn: &Connection, scope: &StageScope) -> Result<bool> {
    let Some(session) = find_session(conn, &scope.session_id)? else {
        return Ok(false);
    };
    if session.current_stage_id != scope.stage_slug
        || session.iteration_count != scope.iteration_number
    {
        return Ok(false);
    }
    transition_status(
        conn,
        &scope.session_id,
        &SessionStatus::Pending(scope.stage_slug.clone()),
        &SessionStatus::Generating(scope.stage_slug.clone()),
        None,
    )
}

pub fn status_history(conn: &Connection, session_id: &str) -> Result<Vec<SessionStatusChange>> {
    let mut stmt = conn
        .prepare(
            "SELECT session_id, from_status, to_status, stage_slug, changed_at
             FROM session_status_history WHERE session_id = ?1 ORDER BY id ASC",
        )
        .context("Failed to prepare status_history")?;
    let rows = stmt.query_map(params![session_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut history = Vec::new();
    for row in rows {
        let (session_id, from, to, stage_slug, changed_at) = row?;
        history.push(SessionStatusChange {
            session_id,
            from_status: from.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            to_status: to.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            stage_slug,
            changed_at: parse_ts(&changed_at)?,
        });
    }
    Ok(history)
}

impl OrchestratorDb {
    /// Start a session at iteration 1 on the pipeline's first stage.
    pub fn create_session(&self, pipeline: &Pipeline, models: &[String]) -> Result<Session> {
        let tx = self.write_tx()?;
        let session = insert_session(&tx, pipeline, models)?;
        tx.commit()?;
        tracing::info!(session_id = %session.id, status = %session.status, "session created");
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Session> {
        get_session(self.conn(), id)
    }

    pub fn session_history(&self, id: &str) -> Result<Vec<SessionStatusChange>> {
        get_session(self.conn(), id)?;
        status_history(self.conn(), id)
    }
}
