//! Error types for checkline.
//!
//! This module defines all error types used throughout the checkline crate,
//! from local checklist validation through queue storage to remote delivery.

use std::path::PathBuf;
use thiserror::Error;

use crate::remote::RemoteError;

/// The main error type for checkline operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Session Errors ===
    /// One or more checklist items have no verdict.
    #[error("checklist incomplete: {} item(s) without a verdict ({})", missing.len(), missing.join(", "))]
    IncompleteChecklist {
        /// Identifiers of the items still lacking a verdict.
        missing: Vec<String>,
    },

    /// One or more non-conformant items carry neither a note nor a photo.
    #[error("non-conformant item(s) missing evidence: {}", items.join(", "))]
    MissingEvidence {
        /// Identifiers of the items lacking evidence.
        items: Vec<String>,
    },

    /// The item does not belong to the session's template.
    #[error("unknown checklist item '{item_id}'")]
    UnknownItem {
        /// The unknown item identifier.
        item_id: String,
    },

    /// The template lists the same item twice.
    #[error("duplicate checklist item '{item_id}' in template")]
    DuplicateItem {
        /// The repeated item identifier.
        item_id: String,
    },

    /// Adding the attachments would exceed the per-item cap.
    #[error("item '{item_id}' can hold at most {limit} attachment(s)")]
    AttachmentLimit {
        /// The item the attachments were added to.
        item_id: String,
        /// The configured cap.
        limit: usize,
    },

    /// No attachment exists at the given position.
    #[error("item '{item_id}' has no attachment at index {index}")]
    AttachmentIndex {
        /// The item addressed.
        item_id: String,
        /// The out-of-range index.
        index: usize,
    },

    /// The catalog has no template for the asset type.
    #[error("no checklist template for asset type '{asset_type}'")]
    TemplateNotFound {
        /// The asset type requested.
        asset_type: String,
    },

    // === Queue Errors ===
    /// A submission with this identifier is already queued.
    #[error("submission {id} is already queued")]
    DuplicateSubmission {
        /// The repeated identifier.
        id: String,
    },

    /// No queued submission has this identifier.
    #[error("submission {id} not found")]
    SubmissionNotFound {
        /// The missing identifier.
        id: String,
    },

    /// The submission is being synced and cannot be changed.
    #[error("submission {id} is syncing; try again once the current attempt finishes")]
    SubmissionBusy {
        /// The busy identifier.
        id: String,
    },

    /// The submission's current status does not allow the requested move.
    #[error("submission {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The submission.
        id: String,
        /// Status it is in.
        from: String,
        /// Status requested.
        to: String,
    },

    /// The submission still has photos without a remote reference.
    #[error("submission {id} has {count} photo(s) not yet uploaded")]
    UnresolvedAttachments {
        /// The submission.
        id: String,
        /// Attachments without a remote reference.
        count: u32,
    },

    /// The caller does not hold the drain lease for this queue.
    #[error("drain lease is not held by {owner}")]
    LeaseNotHeld {
        /// The owner that expected to hold it.
        owner: String,
    },

    // === Delivery Errors ===
    /// An attachment could not be uploaded.
    #[error("upload failed for item '{item_id}': {message}")]
    UploadFailed {
        /// The item owning the attachment.
        item_id: String,
        /// Description of what went wrong.
        message: String,
    },

    /// The remote service refused or failed the checklist commit.
    #[error("commit rejected: {message}")]
    CommitRejected {
        /// Description of what went wrong.
        message: String,
    },

    /// The remote service could not be reached.
    #[error("remote service error: {0}")]
    Remote(#[from] RemoteError),

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for checkline operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create an upload failure for the given item.
    #[must_use]
    pub fn upload_failed(item_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UploadFailed {
            item_id: item_id.into(),
            message: message.into(),
        }
    }

    /// Create a commit rejection.
    #[must_use]
    pub fn commit_rejected(message: impl Into<String>) -> Self {
        Self::CommitRejected {
            message: message.into(),
        }
    }

    /// Create a not-found error for a submission identifier.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::SubmissionNotFound { id: id.into() }
    }

    /// Check if this error is a local validation failure that must never reach the queue.
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::IncompleteChecklist { .. } | Self::MissingEvidence { .. }
        )
    }

    /// Check if this error is a recoverable delivery failure.
    ///
    /// Transient errors move a submission to `error` and count against its
    /// retry ceiling; they never abort a drain pass.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::UploadFailed { .. } | Self::CommitRejected { .. } | Self::Remote(_)
        )
    }
}
