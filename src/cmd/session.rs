//! Session commands: `start-session`, `session`, `progress`, `clone-recipe`,
//! `submit-stage`, `drain`.

use anyhow::Result;
use serde_json::json;

use dialectic_orchestrator::Orchestrator;

use super::print_json;

pub async fn cmd_start_session(orch: &Orchestrator, models: &[String]) -> Result<()> {
    let session = orch.start_session(models.to_vec()).await?;
    print_json(&session)
}

pub async fn cmd_session(orch: &Orchestrator, session_id: &str, history: bool) -> Result<()> {
    let session = orch.get_session(session_id).await?;
    if history {
        let history = orch.session_history(session_id).await?;
        print_json(&json!({ "session": session, "history": history }))
    } else {
        print_json(&session)
    }
}

pub async fn cmd_progress(orch: &Orchestrator, session_id: &str, iteration: u32) -> Result<()> {
    let entries = orch.get_stage_progress(session_id, iteration).await?;
    let stages: Vec<_> = entries
        .into_iter()
        .map(|entry| {
            json!({
                "stageStatus": entry.stage_status(),
                "entry": entry,
            })
        })
        .collect();
    print_json(&stages)
}

pub async fn cmd_clone_recipe(orch: &Orchestrator, session_id: &str, stage: &str) -> Result<()> {
    let steps = orch.clone_recipe(session_id, stage).await?;
    print_json(&json!({ "session_id": session_id, "stage": stage, "steps": steps }))
}

pub async fn cmd_submit_stage(orch: &Orchestrator, session_id: &str, stage: &str) -> Result<()> {
    let outcome = orch.submit_stage(session_id, stage).await?;
    print_json(&outcome)
}

pub async fn cmd_drain(orch: &Orchestrator) -> Result<()> {
    let reports = orch.drain_pending().await?;
    print_json(&json!({ "processed": reports.len(), "reports": reports }))
}
