//! The remote data service boundary.
//!
//! The engine talks to the authoritative service through the
//! [`RemoteService`] trait: attachment uploads, idempotent checklist commits
//! keyed by the submission identifier, secondary non-conformance records and
//! timeline continuation. [`HttpRemoteService`] speaks JSON over HTTP;
//! [`MemoryRemote`] keeps everything in process.

mod http;
mod memory;

pub use http::HttpRemoteService;
pub use memory::MemoryRemote;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checklist::{Principal, Verdict, RECORD_SCHEMA_VERSION};
use crate::error::{Error, Result};
use crate::submission::{Submission, SubmissionId};
use crate::timeline::{TimelineEvent, OWNER_KIND};

/// Failure reported by a remote collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The service could not be reached or the exchange broke off.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The service answered with a refusal.
    #[error("rejected with status {status}: {message}")]
    Rejected {
        /// HTTP-style status code.
        status: u16,
        /// Message returned by the service.
        message: String,
    },

    /// The object store is out of space for this tenant.
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),
}

impl RemoteError {
    /// Create a transport failure.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a refusal with the given status.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }
}

/// Result of a remote call.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// How the service accepted a checklist commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A new record was created.
    Created,
    /// A record with this identifier already existed and was left untouched.
    AlreadyCommitted,
}

/// A finalized item as committed, with resolved attachment references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordItem {
    /// Item identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Grouping category.
    pub category: String,
    /// Recorded verdict.
    pub verdict: Verdict,
    /// Note text.
    pub note: String,
    /// Remote references of the item's photos, in capture order.
    pub attachments: Vec<String>,
    /// Template-specific fields, passed through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// The checklist record committed to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistRecord {
    /// Version of the record shape.
    pub schema_version: u32,
    /// Idempotency key.
    pub submission_id: SubmissionId,
    /// Inspected asset.
    pub target_asset_id: String,
    /// Template the checklist was built from.
    pub template_id: String,
    /// Operator who completed the checklist.
    pub operator: Principal,
    /// When the checklist was finalized.
    pub finalized_at: DateTime<Utc>,
    /// Items in template order.
    pub items: Vec<RecordItem>,
}

impl ChecklistRecord {
    /// Build the record for a submission whose attachments are all uploaded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UploadFailed`] naming the first item with an
    /// attachment that has no remote reference.
    pub fn build(submission: &Submission) -> Result<Self> {
        if let Some(unresolved) = submission.unresolved_attachments().next() {
            return Err(Error::upload_failed(
                unresolved.item_id.clone(),
                format!("attachment {} has not been uploaded", unresolved.file_name),
            ));
        }

        let items = submission
            .items
            .iter()
            .map(|item| RecordItem {
                id: item.id.clone(),
                name: item.name.clone(),
                category: item.category.clone(),
                verdict: item.verdict,
                note: item.note.clone(),
                attachments: submission
                    .attachments_for(&item.id)
                    .filter_map(|a| a.remote_ref.clone())
                    .collect(),
                extra: item.extra.clone(),
            })
            .collect();

        Ok(Self {
            schema_version: RECORD_SCHEMA_VERSION,
            submission_id: submission.id,
            target_asset_id: submission.target_asset_id.clone(),
            template_id: submission.template_id.clone(),
            operator: submission.operator.clone(),
            finalized_at: submission.finalized_at,
            items,
        })
    }

    /// The non-conformance entries this record implies, one per failed item.
    #[must_use]
    pub fn non_conformances(&self) -> Vec<NonConformance> {
        self.items
            .iter()
            .filter(|item| item.verdict == Verdict::NonConformant)
            .map(|item| NonConformance {
                submission_id: self.submission_id,
                target_asset_id: self.target_asset_id.clone(),
                item_id: item.id.clone(),
                item_name: item.name.clone(),
                category: item.category.clone(),
                note: item.note.clone(),
                attachments: item.attachments.clone(),
                reported_by: self.operator.clone(),
                reported_at: self.finalized_at,
            })
            .collect()
    }
}

/// A secondary record filed for each non-conformant item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonConformance {
    /// Owning submission.
    pub submission_id: SubmissionId,
    /// Inspected asset.
    pub target_asset_id: String,
    /// Failed item.
    pub item_id: String,
    /// Display name of the failed item.
    pub item_name: String,
    /// Grouping category.
    pub category: String,
    /// Operator's note.
    pub note: String,
    /// Photo references.
    pub attachments: Vec<String>,
    /// Operator who reported it.
    pub reported_by: Principal,
    /// When it was reported.
    pub reported_at: DateTime<Utc>,
}

/// Timeline events forwarded to the remote service for one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineBatch {
    /// Owning submission.
    pub owner_id: SubmissionId,
    /// Kind of owner.
    pub owner_kind: String,
    /// Events in the order they were written.
    pub events: Vec<TimelineEvent>,
}

impl TimelineBatch {
    /// Create a batch for a submission.
    #[must_use]
    pub fn new(owner_id: SubmissionId, events: Vec<TimelineEvent>) -> Self {
        Self {
            owner_id,
            owner_kind: OWNER_KIND.to_string(),
            events,
        }
    }
}

/// The authoritative remote data service.
///
/// Every call is a single request; implementations never retry internally.
#[async_trait::async_trait]
pub trait RemoteService: Send + Sync + std::fmt::Debug {
    /// Store an object at `path` (`{submission_id}/{file_name}`) and return
    /// a resolvable reference to it. Re-uploading the same path overwrites.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, refusal or quota exhaustion.
    async fn upload_object(
        &self,
        path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> RemoteResult<String>;

    /// Commit a checklist record keyed by its submission identifier.
    ///
    /// Committing an identifier that already exists must not create a
    /// second record.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or refusal.
    async fn commit_checklist(&self, record: &ChecklistRecord) -> RemoteResult<CommitOutcome>;

    /// File the non-conformance entries of a committed checklist,
    /// replacing any filed earlier for the same submission.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or refusal.
    async fn record_non_conformances(
        &self,
        submission_id: &SubmissionId,
        entries: &[NonConformance],
    ) -> RemoteResult<()>;

    /// Append timeline events; events already known by id are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or refusal.
    async fn append_timeline(&self, batch: &TimelineBatch) -> RemoteResult<()>;

    /// Check that the service is reachable.
    ///
    /// # Errors
    ///
    /// Returns an error if the service cannot be reached or reports itself unhealthy.
    async fn health(&self) -> RemoteResult<()>;
}
