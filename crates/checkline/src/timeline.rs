//! Append-only audit timeline for submissions.
//!
//! Every lifecycle transition of a submission is written as a
//! [`TimelineEvent`] in the same transaction as the transition itself. The
//! timeline is the failure history of record; log lines are derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checklist::Principal;
use crate::submission::SubmissionId;

/// Owner kind under which the remote service files submission timelines.
pub const OWNER_KIND: &str = "checklist_submission";

/// Kind of lifecycle transition an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineOperation {
    /// The checklist was finalized and queued.
    Created,
    /// A delivery attempt started, or the submission was requeued.
    SyncAttempt,
    /// The remote service accepted the submission.
    Synced,
    /// A delivery attempt failed.
    SyncFailed,
    /// The operator deleted the submission.
    Deleted,
}

impl TimelineOperation {
    /// The name stored in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::SyncAttempt => "sync_attempt",
            Self::Synced => "synced",
            Self::SyncFailed => "sync_failed",
            Self::Deleted => "deleted",
        }
    }

    /// Parse a stored operation name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "sync_attempt" => Some(Self::SyncAttempt),
            "synced" => Some(Self::Synced),
            "sync_failed" => Some(Self::SyncFailed),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for TimelineOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable entry in a submission's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Event identifier, used by the remote service to drop re-deliveries.
    pub id: Uuid,
    /// Owning submission.
    pub submission_id: SubmissionId,
    /// What happened.
    pub operation: TimelineOperation,
    /// Human-readable description.
    pub description: String,
    /// Acting principal.
    pub actor: Principal,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
}

impl TimelineEvent {
    /// Create an event stamped now.
    #[must_use]
    pub fn new(
        submission_id: SubmissionId,
        operation: TimelineOperation,
        description: impl Into<String>,
        actor: &Principal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            submission_id,
            operation,
            description: description.into(),
            actor: actor.clone(),
            occurred_at: Utc::now(),
        }
    }
}
