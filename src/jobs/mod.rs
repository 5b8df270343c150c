//! Job data model.
//!
//! A job is one schedulable unit of work within a `(session, stage,
//! iteration)` scope. Jobs form a forest through `prerequisite_job_id`: each
//! job has at most one direct prerequisite, and the prerequisite always
//! exists before the dependent is created, so the graph cannot contain a
//! cycle.

mod models;

pub use models::{
    ErrorDetails, FailureCode, Job, JobStatus, JobType, NewJob, StageScope, TerminalOutcome,
};
