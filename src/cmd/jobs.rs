//! Job commands: `submit-job`, `claim`, `complete`, `fail`, `jobs`.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};

use dialectic_orchestrator::Orchestrator;
use dialectic_orchestrator::jobs::{ErrorDetails, FailureCode, JobType, NewJob, StageScope};

use super::{parse_json_arg, print_json};

pub struct SubmitArgs<'a> {
    pub session: &'a str,
    pub stage: &'a str,
    pub iteration: u32,
    pub job_type: JobType,
    pub step: Option<&'a str>,
    pub prerequisite: Option<&'a str>,
    pub parent: Option<&'a str>,
    pub payload: Option<&'a str>,
    pub max_retries: Option<u32>,
}

pub async fn cmd_submit_job(orch: &Orchestrator, args: SubmitArgs<'_>) -> Result<()> {
    let scope = StageScope::new(args.session, args.stage, args.iteration);
    let mut new = NewJob::new(&scope, args.job_type);
    if let Some(step) = args.step {
        new = new.with_step(step);
    }
    if let Some(prerequisite) = args.prerequisite {
        new = new.with_prerequisite(prerequisite);
    }
    if let Some(parent) = args.parent {
        new = new.with_parent(parent);
    }
    if let Some(payload) = args.payload {
        new = new.with_payload(parse_json_arg("payload", payload)?);
    }
    if let Some(max_retries) = args.max_retries {
        new = new.with_max_retries(max_retries);
    }
    let job = orch.submit_job(new).await?;
    print_json(&job)
}

pub async fn cmd_claim(orch: &Orchestrator, job_id: &str) -> Result<()> {
    match orch.claim_job(job_id).await? {
        Some(job) => print_json(&json!({ "claimed": true, "job": job })),
        None => {
            let job = orch.get_job(job_id).await?;
            print_json(&json!({ "claimed": false, "job": job }))
        }
    }
}

/// A child job as given on the command line. Scope fields default to the
/// plan's own scope.
#[derive(Debug, Deserialize)]
struct ChildArg {
    job_type: JobType,
    #[serde(default)]
    step_key: Option<String>,
    #[serde(default)]
    stage_slug: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    max_retries: Option<u32>,
}

impl ChildArg {
    fn into_new_job(self, plan_scope: &StageScope) -> NewJob {
        let scope = match &self.stage_slug {
            Some(stage) => StageScope::new(&plan_scope.session_id, stage, plan_scope.iteration_number),
            None => plan_scope.clone(),
        };
        let mut new = NewJob::new(&scope, self.job_type);
        new.step_key = self.step_key;
        if let Some(payload) = self.payload {
            new.payload = payload;
        }
        if let Some(max_retries) = self.max_retries {
            new.max_retries = max_retries;
        }
        new
    }
}

pub async fn cmd_complete(
    orch: &Orchestrator,
    job_id: &str,
    results: &str,
    children: Option<&str>,
) -> Result<()> {
    let results = parse_json_arg("results", results)?;
    match children {
        None => {
            let outcome = orch.complete_job(job_id, results).await?;
            print_json(&outcome)
        }
        Some(raw) => {
            let args: Vec<ChildArg> =
                serde_json::from_str(raw).context("--children must be a JSON array of jobs")?;
            let plan_scope = orch.get_job(job_id).await?.scope();
            let children = args
                .into_iter()
                .map(|arg| arg.into_new_job(&plan_scope))
                .collect();
            let done = orch.complete_plan_job(job_id, results, children).await?;
            print_json(&done)
        }
    }
}

pub fn parse_failure_code(code: &str) -> Result<FailureCode> {
    serde_json::from_value(Value::String(code.to_string()))
        .with_context(|| format!("Unknown failure code '{}'", code))
}

pub async fn cmd_fail(orch: &Orchestrator, job_id: &str, code: &str, message: &str) -> Result<()> {
    let details = ErrorDetails::new(parse_failure_code(code)?, message);
    let outcome = orch.fail_job(job_id, details).await?;
    print_json(&outcome)
}

pub async fn cmd_jobs(
    orch: &Orchestrator,
    session: &str,
    iteration: u32,
    stage: Option<&str>,
) -> Result<()> {
    let jobs = orch.list_jobs(session, iteration, stage).await?;
    print_json(&jobs)
}
