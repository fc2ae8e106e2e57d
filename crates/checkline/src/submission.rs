//! Queued checklist submissions and their lifecycle.
//!
//! A [`Submission`] is the durable unit between finalize and acknowledged
//! delivery. Its identifier doubles as the idempotency key presented to the
//! remote service, so it is generated once and never reused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checklist::{CapturedImage, ChecklistItem, Principal};

/// Client-generated submission identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(Uuid);

impl SubmissionId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an identifier from its hyphenated form.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a UUID.
    pub fn parse(value: &str) -> std::result::Result<Self, uuid::Error> {
        Uuid::parse_str(value).map(Self)
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl std::str::FromStr for SubmissionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Lifecycle status of a queued submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Waiting for the first delivery attempt.
    Pending,
    /// A delivery attempt is in progress.
    Syncing,
    /// Accepted by the remote service.
    Synced,
    /// The last delivery attempt failed.
    Error,
}

impl SubmissionStatus {
    /// The name stored in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }

    /// Parse a stored status name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "syncing" => Some(Self::Syncing),
            "synced" => Some(Self::Synced),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Check if a drain pass may pick this submission up.
    #[must_use]
    pub fn is_deliverable(&self) -> bool {
        matches!(self, Self::Pending | Self::Error)
    }

    /// Check if the lifecycle allows moving from `self` to `next`.
    ///
    /// An attempt starts from `pending` or `error` and ends in `synced` or
    /// `error`. Requeueing returns an `error` submission to `pending`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match next {
            Self::Syncing => self.is_deliverable(),
            Self::Synced | Self::Error => self == Self::Syncing,
            Self::Pending => matches!(self, Self::Pending | Self::Error),
        }
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the operator should be shown for a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmissionState {
    /// Queued, never attempted.
    Queued,
    /// Being delivered right now.
    Syncing,
    /// Failed, will be retried automatically.
    Retrying {
        /// Failed attempts so far.
        attempts: u32,
        /// Message from the last failure.
        last_error: Option<String>,
    },
    /// Retry ceiling reached; needs a manual retry or delete.
    NeedsAttention {
        /// Failed attempts so far.
        attempts: u32,
        /// Message from the last failure.
        last_error: Option<String>,
    },
    /// Delivered; about to leave the queue.
    Synced,
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Syncing => write!(f, "syncing"),
            Self::Retrying { attempts, .. } => write!(f, "retrying ({attempts} failed)"),
            Self::NeedsAttention { attempts, .. } => {
                write!(f, "needs attention ({attempts} failed)")
            }
            Self::Synced => write!(f, "synced"),
        }
    }
}

/// A photo queued with a submission, without its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    /// Local row identifier.
    pub id: i64,
    /// Owning item.
    pub item_id: String,
    /// Position within the item's photos.
    pub position: u32,
    /// File name reported at capture.
    pub file_name: String,
    /// MIME type.
    pub content_type: String,
    /// BLAKE3 hash of the bytes.
    pub content_hash: String,
    /// Size of the bytes.
    pub size_bytes: u64,
    /// Resolvable reference once uploaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ref: Option<String>,
}

/// A photo captured for a finalized item, ready to be queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    /// Owning item.
    pub item_id: String,
    /// The captured photo.
    pub image: CapturedImage,
}

/// A finalized checklist that has not been queued yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubmission {
    /// Identifier assigned at finalize.
    pub id: SubmissionId,
    /// Inspected asset.
    pub target_asset_id: String,
    /// Template the checklist was built from.
    pub template_id: String,
    /// Operator who completed the checklist.
    pub operator: Principal,
    /// When the checklist was finalized.
    pub finalized_at: DateTime<Utc>,
    /// Finalized items in template order.
    pub items: Vec<ChecklistItem>,
    /// Photos, grouped by item in capture order.
    pub attachments: Vec<NewAttachment>,
}

/// A queued checklist submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    /// Identifier and idempotency key.
    pub id: SubmissionId,
    /// Inspected asset.
    pub target_asset_id: String,
    /// Template the checklist was built from.
    pub template_id: String,
    /// Operator who completed the checklist.
    pub operator: Principal,
    /// When the checklist was finalized.
    pub finalized_at: DateTime<Utc>,
    /// Finalized items in template order.
    pub items: Vec<ChecklistItem>,
    /// Lifecycle status.
    pub status: SubmissionStatus,
    /// Failed delivery attempts.
    pub sync_attempts: u32,
    /// Message from the last failure.
    pub last_error: Option<String>,
    /// Photo metadata.
    pub attachments: Vec<AttachmentRecord>,
}

impl Submission {
    /// Check if automatic retries are used up.
    #[must_use]
    pub fn is_retry_exhausted(&self, max_attempts: u32) -> bool {
        self.sync_attempts >= max_attempts
    }

    /// The display state for this submission under the given retry ceiling.
    #[must_use]
    pub fn state(&self, max_attempts: u32) -> SubmissionState {
        match self.status {
            SubmissionStatus::Pending => SubmissionState::Queued,
            SubmissionStatus::Syncing => SubmissionState::Syncing,
            SubmissionStatus::Synced => SubmissionState::Synced,
            SubmissionStatus::Error if self.is_retry_exhausted(max_attempts) => {
                SubmissionState::NeedsAttention {
                    attempts: self.sync_attempts,
                    last_error: self.last_error.clone(),
                }
            }
            SubmissionStatus::Error => SubmissionState::Retrying {
                attempts: self.sync_attempts,
                last_error: self.last_error.clone(),
            },
        }
    }

    /// Attachments that have not been uploaded yet.
    pub fn unresolved_attachments(&self) -> impl Iterator<Item = &AttachmentRecord> {
        self.attachments.iter().filter(|a| a.remote_ref.is_none())
    }

    /// Attachments belonging to one item, in position order.
    pub fn attachments_for<'a>(
        &'a self,
        item_id: &'a str,
    ) -> impl Iterator<Item = &'a AttachmentRecord> + 'a {
        self.attachments.iter().filter(move |a| a.item_id == item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checklist::Verdict;

    fn sample(status: SubmissionStatus, attempts: u32) -> Submission {
        Submission {
            id: SubmissionId::generate(),
            target_asset_id: "engine-12".to_string(),
            template_id: "engine-daily-v2".to_string(),
            operator: Principal::new("ff-7"),
            finalized_at: Utc::now(),
            items: vec![ChecklistItem {
                id: "pump".to_string(),
                name: "Pump".to_string(),
                category: "Pump".to_string(),
                verdict: Verdict::Conformant,
                note: String::new(),
                extra: None,
            }],
            status,
            sync_attempts: attempts,
            last_error: (attempts > 0).then(|| "timeout".to_string()),
            attachments: vec![
                AttachmentRecord {
                    id: 1,
                    item_id: "pump".to_string(),
                    position: 0,
                    file_name: "a.jpg".to_string(),
                    content_type: "image/jpeg".to_string(),
                    content_hash: "aa".to_string(),
                    size_bytes: 3,
                    remote_ref: Some("https://objects/a".to_string()),
                },
                AttachmentRecord {
                    id: 2,
                    item_id: "hose".to_string(),
                    position: 0,
                    file_name: "b.jpg".to_string(),
                    content_type: "image/jpeg".to_string(),
                    content_hash: "bb".to_string(),
                    size_bytes: 3,
                    remote_ref: None,
                },
            ],
        }
    }

    #[test]
    fn test_submission_id_round_trip() {
        let id = SubmissionId::generate();
        let parsed: SubmissionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(SubmissionId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_submission_ids_are_unique() {
        let a = SubmissionId::generate();
        let b = SubmissionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_status_parse() {
        for status in [
            SubmissionStatus::Pending,
            SubmissionStatus::Syncing,
            SubmissionStatus::Synced,
            SubmissionStatus::Error,
        ] {
            assert_eq!(SubmissionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SubmissionStatus::parse("cancelled"), None);
    }

    #[test]
    fn test_status_is_deliverable() {
        assert!(SubmissionStatus::Pending.is_deliverable());
        assert!(SubmissionStatus::Error.is_deliverable());
        assert!(!SubmissionStatus::Syncing.is_deliverable());
        assert!(!SubmissionStatus::Synced.is_deliverable());
    }

    #[test]
    fn test_status_transitions() {
        use SubmissionStatus::{Error, Pending, Synced, Syncing};

        assert!(Pending.can_transition_to(Syncing));
        assert!(Error.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Synced));
        assert!(Syncing.can_transition_to(Error));
        assert!(Error.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Synced));
        assert!(!Pending.can_transition_to(Error));
        assert!(!Error.can_transition_to(Synced));
        assert!(!Syncing.can_transition_to(Syncing));
        assert!(!Syncing.can_transition_to(Pending));
        for next in [Pending, Syncing, Synced, Error] {
            assert!(!Synced.can_transition_to(next));
        }
    }

    #[test]
    fn test_state_retrying_below_ceiling() {
        let submission = sample(SubmissionStatus::Error, 2);
        assert_eq!(
            submission.state(3),
            SubmissionState::Retrying {
                attempts: 2,
                last_error: Some("timeout".to_string()),
            }
        );
    }

    #[test]
    fn test_state_needs_attention_at_ceiling() {
        let submission = sample(SubmissionStatus::Error, 3);
        assert!(submission.is_retry_exhausted(3));
        assert!(matches!(
            submission.state(3),
            SubmissionState::NeedsAttention { attempts: 3, .. }
        ));
        assert_eq!(submission.state(3).to_string(), "needs attention (3 failed)");
    }

    #[test]
    fn test_state_queued() {
        assert_eq!(
            sample(SubmissionStatus::Pending, 0).state(3),
            SubmissionState::Queued
        );
    }

    #[test]
    fn test_unresolved_attachments() {
        let submission = sample(SubmissionStatus::Syncing, 0);
        let unresolved: Vec<_> = submission.unresolved_attachments().collect();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].item_id, "hose");
    }

    #[test]
    fn test_attachments_for_item() {
        let submission = sample(SubmissionStatus::Pending, 0);
        assert_eq!(submission.attachments_for("pump").count(), 1);
        assert_eq!(submission.attachments_for("ladder").count(), 0);
    }
}
