//! Per-session cloned recipe instances.

use anyhow::Context;
use rusqlite::{Connection, params};

use super::{OrchestratorDb, sessions};
use crate::errors::{OrchestratorError, Result};
use crate::recipe::{Pipeline, RecipeStep};

pub fn load_cloned_steps(
    conn: &Connection,
    session_id: &str,
    stage_slug: &str,
) -> Result<Vec<RecipeStep>> {
    let mut stmt = conn
        .prepare(
            "SELECT step_key, job_type, cardinality, document_key
             FROM session_recipe_steps
             WHERE session_id = ?1 AND stage_slug = ?2
             ORDER BY position ASC",
        )
        .context("Failed to prepare load_cloned_steps")?;
    let rows = stmt.query_map(params![session_id, stage_slug], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut steps = Vec::new();
    for row in rows {
        let (step_key, job_type, cardinality, document_key) = row?;
        steps.push(RecipeStep {
            job_type: job_type.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            cardinality: cardinality.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            step_key,
            document_key,
        });
    }
    Ok(steps)
}

/// Replace the cloned steps for `(session, stage)`.
pub fn store_cloned_steps(
    conn: &Connection,
    session_id: &str,
    stage_slug: &str,
    steps: &[RecipeStep],
) -> Result<()> {
    conn.execute(
        "DELETE FROM session_recipe_steps WHERE session_id = ?1 AND stage_slug = ?2",
        params![session_id, stage_slug],
    )
    .context("Failed to clear cloned recipe steps")?;
    for (position, step) in steps.iter().enumerate() {
        conn.execute(
            "INSERT INTO session_recipe_steps
                (session_id, stage_slug, position, step_key, job_type, cardinality, document_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                stage_slug,
                position as i64,
                step.step_key,
                step.job_type.as_str(),
                step.cardinality.as_str(),
                step.document_key
            ],
        )
        .context("Failed to insert cloned recipe step")?;
    }
    Ok(())
}

impl OrchestratorDb {
    /// Copy the pipeline's template steps for `stage_slug` into a
    /// session-owned instance, so later template edits do not affect it.
    pub fn clone_recipe_for_session(
        &self,
        pipeline: &Pipeline,
        session_id: &str,
        stage_slug: &str,
    ) -> Result<Vec<RecipeStep>> {
        let stage = pipeline
            .stage(stage_slug)
            .ok_or_else(|| OrchestratorError::stage_not_found(stage_slug))?;
        let tx = self.write_tx()?;
        sessions::get_session(&tx, session_id)?;
        store_cloned_steps(&tx, session_id, stage_slug, &stage.steps)?;
        tx.commit()?;
        tracing::info!(
            session_id,
            stage_slug,
            steps = stage.steps.len(),
            "recipe cloned for session"
        );
        Ok(stage.steps.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobType;
    use crate::recipe::Cardinality;

    #[test]
    fn test_clone_copies_template_in_order() -> anyhow::Result<()> {
        let db = OrchestratorDb::new_in_memory()?;
        let pipeline = Pipeline::default();
        let session = db.create_session(&pipeline, &[])?;

        let cloned = db.clone_recipe_for_session(&pipeline, &session.id, "synthesis")?;
        let loaded = load_cloned_steps(db.conn(), &session.id, "synthesis")?;
        assert_eq!(loaded, cloned);
        assert_eq!(loaded, pipeline.stage("synthesis").unwrap().steps);
        assert!(load_cloned_steps(db.conn(), &session.id, "thesis")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_store_replaces_previous_clone() -> anyhow::Result<()> {
        let db = OrchestratorDb::new_in_memory()?;
        let session = db.create_session(&Pipeline::default(), &[])?;
        let first = vec![RecipeStep::new("a", JobType::Plan)];
        let second = vec![
            RecipeStep::new("b", JobType::Execute).fan_out(Cardinality::PerModelPair),
            RecipeStep::new("c", JobType::Render).with_document("doc"),
        ];
        store_cloned_steps(db.conn(), &session.id, "thesis", &first)?;
        store_cloned_steps(db.conn(), &session.id, "thesis", &second)?;
        assert_eq!(load_cloned_steps(db.conn(), &session.id, "thesis")?, second);
        Ok(())
    }

    #[test]
    fn test_clone_unknown_stage_or_session() -> anyhow::Result<()> {
        let db = OrchestratorDb::new_in_memory()?;
        let pipeline = Pipeline::default();
        let session = db.create_session(&pipeline, &[])?;
        assert!(matches!(
            db.clone_recipe_for_session(&pipeline, &session.id, "epilogue"),
            Err(OrchestratorError::StageNotFound { .. })
        ));
        assert!(matches!(
            db.clone_recipe_for_session(&pipeline, "ghost", "thesis"),
            Err(OrchestratorError::SessionNotFound { .. })
        ));
        Ok(())
    }
}
