use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobType {
    /// Produces child jobs.
    Plan,
    /// Performs generation work against a model.
    Execute,
    /// Turns a completed contribution into a final document.
    Render,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "PLAN",
            Self::Execute => "EXECUTE",
            Self::Render => "RENDER",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PLAN" => Ok(Self::Plan),
            "EXECUTE" => Ok(Self::Execute),
            "RENDER" => Ok(Self::Render),
            _ => Err(format!("Invalid job type: {}", s)),
        }
    }
}

/// Lifecycle status of a job.
///
/// Status only ever moves forward:
/// `waiting_for_prerequisite → pending → processing → {completed | failed}`.
/// A waiting or pending job may also jump straight to `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    WaitingForPrerequisite,
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingForPrerequisite => "waiting_for_prerequisite",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position in the forward-only lifecycle. Terminal states share a rank.
    fn rank(&self) -> u8 {
        match self {
            Self::WaitingForPrerequisite => 0,
            Self::Pending => 1,
            Self::Processing => 2,
            Self::Completed | Self::Failed => 3,
        }
    }

    /// Whether moving from `self` to `next` respects the lifecycle.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed => true,
            Self::Completed => *self == Self::Processing,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting_for_prerequisite" => Ok(Self::WaitingForPrerequisite),
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Machine-readable reason attached to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// The job's prerequisite (directly or transitively) failed.
    UpstreamPrerequisiteFailed,
    /// The billing ledger refused to fund the job before it was claimed.
    InsufficientFunds,
    /// The executor reported a failure while doing the work.
    ExecutionError,
    /// A caller failed the job on purpose to stop the pipeline.
    Aborted,
}

/// Structured `error_details` written on a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: FailureCode,
    pub message: String,
    /// Immediate upstream job, for cascaded failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_job_id: Option<String>,
    /// The job whose failure started the cascade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorDetails {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            upstream_job_id: None,
            root_job_id: None,
            details: None,
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(FailureCode::ExecutionError, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(FailureCode::Aborted, message)
    }

    pub fn insufficient_funds(message: impl Into<String>) -> Self {
        Self::new(FailureCode::InsufficientFunds, message)
    }

    pub fn upstream_failed(upstream_job_id: &str, root_job_id: &str) -> Self {
        Self {
            code: FailureCode::UpstreamPrerequisiteFailed,
            message: "upstream prerequisite failed".to_string(),
            upstream_job_id: Some(upstream_job_id.to_string()),
            root_job_id: Some(root_job_id.to_string()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// One pass of one stage within one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageScope {
    pub session_id: String,
    pub stage_slug: String,
    pub iteration_number: u32,
}

impl StageScope {
    pub fn new(session_id: &str, stage_slug: &str, iteration_number: u32) -> Self {
        Self {
            session_id: session_id.to_string(),
            stage_slug: stage_slug.to_string(),
            iteration_number,
        }
    }
}

impl fmt::Display for StageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}#{}",
            self.session_id, self.stage_slug, self.iteration_number
        )
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub session_id: String,
    pub stage_slug: String,
    pub iteration_number: u32,
    /// Recipe step this job instantiates; `None` for skeleton jobs.
    pub step_key: Option<String>,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Provenance only, never used for gating.
    pub parent_job_id: Option<String>,
    pub prerequisite_job_id: Option<String>,
    pub attempt_count: u32,
    pub max_retries: u32,
    pub payload: Value,
    pub results: Option<Value>,
    pub error_details: Option<ErrorDetails>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn scope(&self) -> StageScope {
        StageScope::new(&self.session_id, &self.stage_slug, self.iteration_number)
    }

    /// `model_id` from the payload, if the executor tagged one.
    pub fn model_id(&self) -> Option<&str> {
        payload_str(&self.payload, "model_id")
    }

    /// `document_key` from the payload, if any.
    pub fn document_key(&self) -> Option<&str> {
        payload_str(&self.payload, "document_key")
    }
}

fn payload_str<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Input for creating a job. The store decides the initial status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub session_id: String,
    pub stage_slug: String,
    pub iteration_number: u32,
    #[serde(default)]
    pub step_key: Option<String>,
    pub job_type: JobType,
    #[serde(default)]
    pub parent_job_id: Option<String>,
    #[serde(default)]
    pub prerequisite_job_id: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub payload: Value,
}

fn default_max_retries() -> u32 {
    3
}

impl NewJob {
    pub fn new(scope: &StageScope, job_type: JobType) -> Self {
        Self {
            session_id: scope.session_id.clone(),
            stage_slug: scope.stage_slug.clone(),
            iteration_number: scope.iteration_number,
            step_key: None,
            job_type,
            parent_job_id: None,
            prerequisite_job_id: None,
            max_retries: default_max_retries(),
            payload: Value::Object(Default::default()),
        }
    }

    pub fn with_step(mut self, step_key: &str) -> Self {
        self.step_key = Some(step_key.to_string());
        self
    }

    pub fn with_parent(mut self, parent_job_id: &str) -> Self {
        self.parent_job_id = Some(parent_job_id.to_string());
        self
    }

    pub fn with_prerequisite(mut self, prerequisite_job_id: &str) -> Self {
        self.prerequisite_job_id = Some(prerequisite_job_id.to_string());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn scope(&self) -> StageScope {
        StageScope::new(&self.session_id, &self.stage_slug, self.iteration_number)
    }
}

/// Result of asking the store to move a job into a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TerminalOutcome {
    /// The transition was written; `event_id` is the outbox row for it.
    Applied { job: Job, event_id: i64 },
    /// Something else already moved the job to a terminal state.
    AlreadyTerminal { job: Job },
}

impl TerminalOutcome {
    pub fn job(&self) -> &Job {
        match self {
            Self::Applied { job, .. } | Self::AlreadyTerminal { job } => job,
        }
    }

    pub fn event_id(&self) -> Option<i64> {
        match self {
            Self::Applied { event_id, .. } => Some(*event_id),
            Self::AlreadyTerminal { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_roundtrips_through_str() {
        for status in [
            JobStatus::WaitingForPrerequisite,
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("retrying".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_lifecycle_only_moves_forward() {
        use JobStatus::*;
        assert!(WaitingForPrerequisite.can_transition_to(Pending));
        assert!(WaitingForPrerequisite.can_transition_to(Failed));
        assert!(!WaitingForPrerequisite.can_transition_to(Processing));
        assert!(!WaitingForPrerequisite.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
    }

    #[test]
    fn test_job_type_parse_is_case_insensitive() {
        assert_eq!("plan".parse::<JobType>().unwrap(), JobType::Plan);
        assert_eq!("RENDER".parse::<JobType>().unwrap(), JobType::Render);
        assert!("review".parse::<JobType>().is_err());
    }

    #[test]
    fn test_upstream_failure_details_serialize_with_ids() {
        let details = ErrorDetails::upstream_failed("job-b", "job-a");
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["code"], "upstream_prerequisite_failed");
        assert_eq!(value["upstream_job_id"], "job-b");
        assert_eq!(value["root_job_id"], "job-a");
        assert!(value.get("details").is_none());
    }

    #[test]
    fn test_new_job_builder() {
        let scope = StageScope::new("s1", "thesis", 1);
        let job = NewJob::new(&scope, JobType::Execute)
            .with_step("generate")
            .with_prerequisite("plan-1")
            .with_payload(json!({"model_id": "m1"}));
        assert_eq!(job.scope(), scope);
        assert_eq!(job.step_key.as_deref(), Some("generate"));
        assert_eq!(job.prerequisite_job_id.as_deref(), Some("plan-1"));
        assert_eq!(job.max_retries, 3);
    }
}
