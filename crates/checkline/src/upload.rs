//! Attachment upload pipeline.
//!
//! Turns locally queued photos into remote objects before the owning
//! submission is committed. Object names are derived from the item and the
//! content hash, so a re-upload after a crash lands on the same path.
//! Nothing here retries; a failed upload fails the whole attempt and the
//! sync orchestrator decides what happens next.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::remote::RemoteService;
use crate::storage::{self, Storage};
use crate::submission::{AttachmentRecord, Submission, SubmissionId, SubmissionStatus};

/// Length of the content-hash prefix used in generated file names.
const HASH_PREFIX_LEN: usize = 16;

/// Characters kept verbatim in generated file names.
fn unsafe_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("Invalid regex pattern"))
}

fn sanitize(value: &str) -> String {
    unsafe_chars().replace_all(value, "_").into_owned()
}

/// Generate the remote file name for an attachment.
///
/// Format: `<item-id>-<hash prefix>.<ext>`, where the item id and extension
/// are reduced to `[A-Za-z0-9_-]`.
#[must_use]
pub fn generated_file_name(attachment: &AttachmentRecord) -> String {
    let ext = attachment
        .file_name
        .rsplit_once('.')
        .map(|(_, ext)| sanitize(&ext.to_ascii_lowercase()))
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "bin".to_string());
    let hash: String = attachment.content_hash.chars().take(HASH_PREFIX_LEN).collect();

    format!("{}-{}.{}", sanitize(&attachment.item_id), sanitize(&hash), ext)
}

/// The object path an attachment is stored under.
#[must_use]
pub fn object_path(submission_id: &SubmissionId, file_name: &str) -> String {
    format!("{submission_id}/{file_name}")
}

/// Uploads a submission's attachments and records their references.
#[derive(Debug, Clone)]
pub struct UploadPipeline {
    remote: Arc<dyn RemoteService>,
    storage: Arc<Storage>,
}

impl UploadPipeline {
    /// Create a pipeline over a remote service and the local store.
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteService>, storage: Arc<Storage>) -> Self {
        Self { remote, storage }
    }

    /// Upload one attachment and return its remote reference.
    ///
    /// The reference is not persisted; see [`UploadPipeline::resolve_all`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::UploadFailed`] if the blob is missing locally or the
    /// remote service refuses or cannot be reached.
    pub async fn upload(
        &self,
        attachment: &AttachmentRecord,
        submission_id: &SubmissionId,
    ) -> Result<String> {
        let attachment_id = attachment.id;
        let bytes = storage::blocking(&self.storage, move |s| s.attachment_blob(attachment_id))
            .await?
            .ok_or_else(|| {
                Error::upload_failed(
                    attachment.item_id.clone(),
                    format!("attachment {attachment_id} is missing from the local store"),
                )
            })?;

        let path = object_path(submission_id, &generated_file_name(attachment));
        debug!("Uploading {} ({} bytes)", path, bytes.len());
        self.remote
            .upload_object(&path, &attachment.content_type, bytes)
            .await
            .map_err(|e| Error::upload_failed(attachment.item_id.clone(), e.to_string()))
    }

    /// Upload every unresolved attachment of a submission that is `syncing`.
    ///
    /// Attachments that already carry a reference are skipped. Each new
    /// reference is persisted as soon as it is known and mirrored into
    /// `submission`. Stops at the first failure; references recorded before
    /// it stay, so the next attempt only uploads what is left. Returns the
    /// number of attachments uploaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the submission is not `syncing`, an upload fails,
    /// or a reference cannot be persisted.
    pub async fn resolve_all(&self, submission: &mut Submission) -> Result<usize> {
        if submission.status != SubmissionStatus::Syncing {
            return Err(Error::internal(format!(
                "submission {} is {}; attachments upload only while syncing",
                submission.id, submission.status
            )));
        }

        let mut uploaded = 0;
        for index in 0..submission.attachments.len() {
            if submission.attachments[index].remote_ref.is_some() {
                continue;
            }

            let reference = self
                .upload(&submission.attachments[index], &submission.id)
                .await?;
            let attachment_id = submission.attachments[index].id;
            let persisted = reference.clone();
            storage::blocking(&self.storage, move |s| {
                s.set_remote_ref(attachment_id, &persisted)
            })
            .await?;

            submission.attachments[index].remote_ref = Some(reference);
            uploaded += 1;
        }

        if uploaded > 0 {
            info!(
                "Uploaded {} attachment(s) for submission {}",
                uploaded, submission.id
            );
        }
        Ok(uploaded)
    }
}
