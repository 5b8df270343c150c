//! Session lifecycle types.
//!
//! A session's status is derived from job completion. Per stage it moves
//! `pending_<stage> → generating_<stage> → {<stage>_generation_complete |
//! <stage>_failed} → pending_<next>`, and the last stage ends in
//! `iteration_complete_pending_review`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const PENDING_PREFIX: &str = "pending_";
const GENERATING_PREFIX: &str = "generating_";
const COMPLETE_SUFFIX: &str = "_generation_complete";
const FAILED_SUFFIX: &str = "_failed";
const PIPELINE_COMPLETE: &str = "iteration_complete_pending_review";

/// Whether a stage slug would make its status strings parse back as a
/// different stage.
pub fn is_ambiguous_stage_slug(slug: &str) -> bool {
    slug.starts_with(PENDING_PREFIX)
        || slug.starts_with(GENERATING_PREFIX)
        || slug.ends_with(COMPLETE_SUFFIX)
        || slug.ends_with(FAILED_SUFFIX)
}

/// Session status, parameterized by stage slug.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Pending(String),
    Generating(String),
    GenerationComplete(String),
    Failed(String),
    IterationCompletePendingReview,
}

impl SessionStatus {
    /// The stage this status refers to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Pending(s)
            | Self::Generating(s)
            | Self::GenerationComplete(s)
            | Self::Failed(s) => Some(s),
            Self::IterationCompletePendingReview => None,
        }
    }

    /// Whether jobs of `stage` can still move the session: the stage is
    /// waiting to start or generating.
    pub fn is_active_for(&self, stage: &str) -> bool {
        match self {
            Self::Pending(s) | Self::Generating(s) => s == stage,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(s) => write!(f, "{PENDING_PREFIX}{s}"),
            Self::Generating(s) => write!(f, "{GENERATING_PREFIX}{s}"),
            Self::GenerationComplete(s) => write!(f, "{s}{COMPLETE_SUFFIX}"),
            Self::Failed(s) => write!(f, "{s}{FAILED_SUFFIX}"),
            Self::IterationCompletePendingReview => f.write_str(PIPELINE_COMPLETE),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stage = |rest: &str| {
            if rest.is_empty() {
                Err(format!("Invalid session status: {}", s))
            } else {
                Ok(rest.to_string())
            }
        };
        if s == PIPELINE_COMPLETE {
            Ok(Self::IterationCompletePendingReview)
        } else if let Some(rest) = s.strip_suffix(COMPLETE_SUFFIX) {
            stage(rest).map(Self::GenerationComplete)
        } else if let Some(rest) = s.strip_prefix(PENDING_PREFIX) {
            stage(rest).map(Self::Pending)
        } else if let Some(rest) = s.strip_prefix(GENERATING_PREFIX) {
            stage(rest).map(Self::Generating)
        } else if let Some(rest) = s.strip_suffix(FAILED_SUFFIX) {
            stage(rest).map(Self::Failed)
        } else {
            Err(format!("Invalid session status: {}", s))
        }
    }
}

impl Serialize for SessionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    /// Slug of the stage the session is currently on.
    pub current_stage_id: String,
    pub iteration_count: u32,
    pub selected_model_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of `session_status_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatusChange {
    pub session_id: String,
    pub from_status: SessionStatus,
    pub to_status: SessionStatus,
    pub stage_slug: String,
    pub changed_at: DateTime<Utc>,
}
