//! In-progress checklist execution.
//!
//! A [`ChecklistSession`] holds the operator's verdicts, notes and photos
//! for one template until the checklist is finalized into a
//! [`NewSubmission`]. Every mutation is mirrored to a crash-recovery
//! snapshot keyed by the target asset, so an interrupted session can be
//! resumed. Photos are not part of the snapshot; a resumed session reports
//! how many were lost per item so the operator can re-capture them.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checklist::{CapturedImage, ChecklistItem, Principal, Template, TemplateItem, Verdict};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::submission::{NewAttachment, NewSubmission, SubmissionId};

/// Durable home for crash-recovery snapshots, keyed by target asset.
pub trait SnapshotStore: Send + Sync + std::fmt::Debug {
    /// Write the snapshot, replacing any previous one for the asset.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<()>;

    /// Read the snapshot for an asset, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn load_snapshot(&self, asset_id: &str) -> Result<Option<SessionSnapshot>>;

    /// Remove the snapshot for an asset. Absent snapshots are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    fn clear_snapshot(&self, asset_id: &str) -> Result<()>;
}

/// The recoverable part of an in-progress session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Inspected asset.
    pub asset_id: String,
    /// Template the session was started from.
    pub template_id: String,
    /// Operator running the session.
    pub operator: Principal,
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// Per-item state.
    pub items: Vec<SnapshotItem>,
    /// When the snapshot was written.
    pub saved_at: DateTime<Utc>,
}

/// Recoverable state of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotItem {
    /// Item identifier.
    pub id: String,
    /// Verdict, if set.
    pub verdict: Option<Verdict>,
    /// Note text.
    #[serde(default)]
    pub note: String,
    /// Photos attached when the snapshot was written.
    #[serde(default)]
    pub attachment_count: usize,
}

/// Who is inspecting what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Inspected asset.
    pub asset_id: String,
    /// Operator running the session.
    pub operator: Principal,
}

impl SessionContext {
    /// Create a session context.
    #[must_use]
    pub fn new(asset_id: impl Into<String>, operator: Principal) -> Self {
        Self {
            asset_id: asset_id.into(),
            operator,
        }
    }
}

/// Tunable session limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Maximum photos per item.
    pub max_attachments_per_item: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_attachments_per_item: 3,
        }
    }
}

impl From<&SessionConfig> for SessionLimits {
    fn from(config: &SessionConfig) -> Self {
        Self {
            max_attachments_per_item: config.max_attachments_per_item,
        }
    }
}

/// Completion progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Number of items in the template.
    pub total: usize,
    /// Items with any verdict set.
    pub completed: usize,
    /// Completed share, rounded to the nearest whole percent.
    pub percentage: u8,
}

impl Progress {
    fn new(total: usize, completed: usize) -> Self {
        let percentage = if total == 0 {
            100
        } else {
            u8::try_from((completed * 100 + total / 2) / total).unwrap_or(100)
        };
        Self {
            total,
            completed,
            percentage,
        }
    }
}

/// One item of an in-progress session.
#[derive(Debug, Clone)]
pub struct SessionItem {
    template: TemplateItem,
    verdict: Option<Verdict>,
    note: String,
    attachments: Vec<CapturedImage>,
    lost_attachments: usize,
}

impl SessionItem {
    fn new(template: TemplateItem) -> Self {
        Self {
            template,
            verdict: None,
            note: String::new(),
            attachments: Vec::new(),
            lost_attachments: 0,
        }
    }

    /// Item identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.template.id
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.template.name
    }

    /// Grouping category.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.template.category
    }

    /// The verdict, if set.
    #[must_use]
    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    /// The note text.
    #[must_use]
    pub fn note(&self) -> &str {
        &self.note
    }

    /// Captured photos in capture order.
    #[must_use]
    pub fn attachments(&self) -> &[CapturedImage] {
        &self.attachments
    }

    /// Photos that were attached before a restart and must be re-captured.
    #[must_use]
    pub fn lost_attachments(&self) -> usize {
        self.lost_attachments
    }

    /// Check if the item needs a note or photo before finalize.
    #[must_use]
    pub fn requires_evidence(&self) -> bool {
        self.verdict == Some(Verdict::NonConformant)
    }

    /// Check if the item carries a non-blank note or at least one photo.
    #[must_use]
    pub fn has_evidence(&self) -> bool {
        !self.note.trim().is_empty() || !self.attachments.is_empty()
    }

    fn snapshot(&self) -> SnapshotItem {
        SnapshotItem {
            id: self.template.id.clone(),
            verdict: self.verdict,
            note: self.note.clone(),
            attachment_count: self.attachments.len(),
        }
    }
}

/// In-memory state of one checklist being filled in.
#[derive(Debug)]
pub struct ChecklistSession {
    context: SessionContext,
    template_id: String,
    started_at: DateTime<Utc>,
    items: Vec<SessionItem>,
    limits: SessionLimits,
    snapshots: Arc<dyn SnapshotStore>,
    restored: bool,
}

impl ChecklistSession {
    /// Start a session for an asset, resuming a crash-recovery snapshot if
    /// one exists for the same asset and template.
    ///
    /// A snapshot taken against a different template is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateItem`] if the template repeats an item id,
    /// or an error if the snapshot store fails.
    pub fn start(
        context: SessionContext,
        template: &Template,
        snapshots: Arc<dyn SnapshotStore>,
        limits: SessionLimits,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for item in &template.items {
            if !seen.insert(item.id.as_str()) {
                return Err(Error::DuplicateItem {
                    item_id: item.id.clone(),
                });
            }
        }

        let mut session = Self {
            context,
            template_id: template.id.clone(),
            started_at: Utc::now(),
            items: template.items.iter().cloned().map(SessionItem::new).collect(),
            limits,
            snapshots,
            restored: false,
        };

        match session.snapshots.load_snapshot(&session.context.asset_id)? {
            Some(snapshot) if snapshot.template_id == session.template_id => {
                session.restore(snapshot);
            }
            Some(snapshot) => {
                warn!(
                    "Discarding snapshot for asset {} taken against template {}",
                    snapshot.asset_id, snapshot.template_id
                );
                session.snapshots.clear_snapshot(&session.context.asset_id)?;
            }
            None => {}
        }

        session.persist()?;
        debug!(
            "Started checklist session for asset {} ({} item(s))",
            session.context.asset_id,
            session.items.len()
        );
        Ok(session)
    }

    fn restore(&mut self, snapshot: SessionSnapshot) {
        self.started_at = snapshot.started_at;
        for saved in snapshot.items {
            if let Some(item) = self.items.iter_mut().find(|i| i.template.id == saved.id) {
                item.verdict = saved.verdict;
                item.note = saved.note;
                item.lost_attachments = saved.attachment_count;
            }
        }
        self.restored = true;

        let lost: usize = self.items.iter().map(|i| i.lost_attachments).sum();
        info!(
            "Resumed checklist session for asset {} ({} photo(s) to re-capture)",
            self.context.asset_id, lost
        );
    }

    /// Who is inspecting what.
    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Template the session was started from.
    #[must_use]
    pub fn template_id(&self) -> &str {
        &self.template_id
    }

    /// When the session started, carried over from a resumed snapshot.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Check if the session was resumed from a crash-recovery snapshot.
    #[must_use]
    pub fn is_restored(&self) -> bool {
        self.restored
    }

    /// Items in template order.
    #[must_use]
    pub fn items(&self) -> &[SessionItem] {
        &self.items
    }

    /// Look up an item by id.
    #[must_use]
    pub fn item(&self, item_id: &str) -> Option<&SessionItem> {
        self.items.iter().find(|i| i.template.id == item_id)
    }

    fn item_mut(&mut self, item_id: &str) -> Result<&mut SessionItem> {
        self.items
            .iter_mut()
            .find(|i| i.template.id == item_id)
            .ok_or_else(|| Error::UnknownItem {
                item_id: item_id.to_string(),
            })
    }

    fn require_item(&self, item_id: &str) -> Result<&SessionItem> {
        self.item(item_id).ok_or_else(|| Error::UnknownItem {
            item_id: item_id.to_string(),
        })
    }

    /// Record a verdict for an item.
    ///
    /// A `non_conformant` verdict makes a note or photo mandatory before
    /// finalize; any other verdict lifts that requirement but keeps photos.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownItem`] for an item outside the template, or
    /// an error if the snapshot cannot be written. The session is unchanged
    /// on error.
    pub fn set_verdict(&mut self, item_id: &str, verdict: Verdict) -> Result<()> {
        self.require_item(item_id)?;
        self.persist_with(item_id, |saved| saved.verdict = Some(verdict))?;
        self.item_mut(item_id)?.verdict = Some(verdict);
        Ok(())
    }

    /// Replace the note of an item.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownItem`] for an item outside the template, or
    /// an error if the snapshot cannot be written. The session is unchanged
    /// on error.
    pub fn set_note(&mut self, item_id: &str, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.require_item(item_id)?;
        self.persist_with(item_id, |saved| saved.note.clone_from(&text))?;
        self.item_mut(item_id)?.note = text;
        Ok(())
    }

    /// Attach photos to an item.
    ///
    /// The call is rejected whole if it would take the item past the
    /// per-item limit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AttachmentLimit`] on overflow, [`Error::UnknownItem`]
    /// for an item outside the template, or an error if the snapshot cannot
    /// be written. The session is unchanged on error.
    pub fn add_attachments(&mut self, item_id: &str, files: Vec<CapturedImage>) -> Result<()> {
        let limit = self.limits.max_attachments_per_item;
        let count = self.require_item(item_id)?.attachments.len() + files.len();
        if count > limit {
            return Err(Error::AttachmentLimit {
                item_id: item_id.to_string(),
                limit,
            });
        }
        self.persist_with(item_id, |saved| saved.attachment_count = count)?;

        let item = self.item_mut(item_id)?;
        item.lost_attachments = item.lost_attachments.saturating_sub(files.len());
        item.attachments.extend(files);
        Ok(())
    }

    /// Remove the photo at `index` from an item, returning it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AttachmentIndex`] if there is no photo at `index`,
    /// [`Error::UnknownItem`] for an item outside the template, or an error
    /// if the snapshot cannot be written. The session is unchanged on error.
    pub fn remove_attachment(&mut self, item_id: &str, index: usize) -> Result<CapturedImage> {
        let count = self.require_item(item_id)?.attachments.len();
        if index >= count {
            return Err(Error::AttachmentIndex {
                item_id: item_id.to_string(),
                index,
            });
        }
        self.persist_with(item_id, |saved| saved.attachment_count = count - 1)?;

        Ok(self.item_mut(item_id)?.attachments.remove(index))
    }

    /// Completion progress.
    #[must_use]
    pub fn progress(&self) -> Progress {
        let completed = self.items.iter().filter(|i| i.verdict.is_some()).count();
        Progress::new(self.items.len(), completed)
    }

    /// Check that the session may be finalized.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompleteChecklist`] if any item has no verdict,
    /// otherwise [`Error::MissingEvidence`] if any `non_conformant` item has
    /// neither a non-blank note nor a photo.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<String> = self
            .items
            .iter()
            .filter(|i| i.verdict.is_none())
            .map(|i| i.template.id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(Error::IncompleteChecklist { missing });
        }

        let unsupported: Vec<String> = self
            .items
            .iter()
            .filter(|i| i.requires_evidence() && !i.has_evidence())
            .map(|i| i.template.id.clone())
            .collect();
        if !unsupported.is_empty() {
            return Err(Error::MissingEvidence { items: unsupported });
        }

        Ok(())
    }

    /// Turn the session into a submission ready to be queued.
    ///
    /// Assigns a fresh identifier and the finalize timestamp. The snapshot
    /// stays in place until the submission is queued, which removes it in
    /// the same transaction. On validation failure the session is handed
    /// back inside the error.
    ///
    /// # Errors
    ///
    /// Returns a [`FinalizeError`] wrapping the validation error.
    pub fn finalize(self) -> std::result::Result<NewSubmission, FinalizeError> {
        if let Err(error) = self.validate() {
            return Err(FinalizeError {
                session: Box::new(self),
                error,
            });
        }

        let mut items = Vec::with_capacity(self.items.len());
        let mut attachments = Vec::new();
        for item in self.items {
            let Some(verdict) = item.verdict else {
                continue;
            };
            for image in item.attachments {
                attachments.push(NewAttachment {
                    item_id: item.template.id.clone(),
                    image,
                });
            }
            items.push(ChecklistItem {
                id: item.template.id,
                name: item.template.name,
                category: item.template.category,
                verdict,
                note: item.note.trim().to_string(),
                extra: item.template.extra,
            });
        }

        let submission = NewSubmission {
            id: SubmissionId::generate(),
            target_asset_id: self.context.asset_id,
            template_id: self.template_id,
            operator: self.context.operator,
            finalized_at: Utc::now(),
            items,
            attachments,
        };
        info!(
            "Finalized checklist {} for asset {}",
            submission.id, submission.target_asset_id
        );
        Ok(submission)
    }

    /// Discard the session and its crash-recovery snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be removed.
    pub fn abandon(self) -> Result<()> {
        self.snapshots.clear_snapshot(&self.context.asset_id)?;
        info!("Abandoned checklist session for asset {}", self.context.asset_id);
        Ok(())
    }

    /// Build the crash-recovery snapshot of the current state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            asset_id: self.context.asset_id.clone(),
            template_id: self.template_id.clone(),
            operator: self.context.operator.clone(),
            started_at: self.started_at,
            items: self.items.iter().map(SessionItem::snapshot).collect(),
            saved_at: Utc::now(),
        }
    }

    fn persist(&self) -> Result<()> {
        self.snapshots.save_snapshot(&self.snapshot())
    }

    /// Save the snapshot as it will be once `edit` is applied to one item.
    /// Memory is only changed after this succeeds.
    fn persist_with(&self, item_id: &str, edit: impl FnOnce(&mut SnapshotItem)) -> Result<()> {
        let mut snapshot = self.snapshot();
        if let Some(saved) = snapshot.items.iter_mut().find(|i| i.id == item_id) {
            edit(saved);
        }
        self.snapshots.save_snapshot(&snapshot)
    }
}

/// A failed finalize, carrying the session back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct FinalizeError {
    /// The session, unchanged.
    pub session: Box<ChecklistSession>,
    /// Why finalize failed.
    #[source]
    pub error: Error,
}

impl From<FinalizeError> for Error {
    fn from(err: FinalizeError) -> Self {
        err.error
    }
}
