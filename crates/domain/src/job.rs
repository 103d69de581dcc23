//! Aggregate job records
//!
//! Jobs are at-most-once per scheduled instant; the scheduler persists every
//! state transition so a crashed run is visible and the next instant simply
//! picks up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three compaction job kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Daily,
    Weekly,
    Monthly,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Daily => "daily",
            JobKind::Weekly => "weekly",
            JobKind::Monthly => "monthly",
        }
    }
}

/// Job state machine: `Scheduled -> Running -> {Complete | Failed(reason)}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Running,
    Complete,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        }
    }
}

/// One persisted job run
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRun {
    pub id: String,
    pub job_name: String,
    /// The scheduled instant this run belongs to
    pub scheduled_for: DateTime<Utc>,
    pub state: String,
    pub reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
