//! Submission queue operations on the local store.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::lease::ensure_held;
use super::timeline::insert_event;
use super::{format_timestamp, invalid_column, parse_timestamp, write_tx, Storage};
use crate::checklist::Principal;
use crate::error::{Error, Result};
use crate::submission::{
    AttachmentRecord, NewSubmission, Submission, SubmissionId, SubmissionStatus,
};
use crate::timeline::{TimelineEvent, TimelineOperation};

const SUBMISSION_COLUMNS: &str = "id, target_asset_id, template_id, operator_id, finalized_at, \
     items_json, status, sync_attempts, last_error";

const ATTACHMENT_COLUMNS: &str =
    "id, item_id, position, file_name, content_type, content_hash, size_bytes, remote_ref";

/// Message recorded for submissions found mid-attempt after a restart.
pub const INTERRUPTED_MESSAGE: &str = "interrupted while syncing";

impl Storage {
    /// Queue a finalized submission.
    ///
    /// The submission row, every attachment blob, the `created` timeline
    /// event and the removal of the asset's crash-recovery snapshot are
    /// written in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateSubmission`] if the identifier was ever
    /// queued before, or an error if the database operation fails.
    pub fn enqueue(&self, submission: &NewSubmission) -> Result<SubmissionId> {
        let key = submission.id.to_string();
        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;

        // Identifiers are never reused, even after the submission left the queue.
        let seen: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM submissions WHERE id = ?1)
                 OR EXISTS(SELECT 1 FROM timeline_events WHERE submission_id = ?1)",
            [&key],
            |row| row.get(0),
        )?;
        if seen {
            return Err(Error::DuplicateSubmission { id: key });
        }

        let now = format_timestamp(&Utc::now());
        tx.execute(
            "INSERT INTO submissions (id, target_asset_id, template_id, operator_id, finalized_at,
                 items_json, status, sync_attempts, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, NULL, ?7)",
            params![
                key,
                submission.target_asset_id,
                submission.template_id,
                submission.operator.as_str(),
                format_timestamp(&submission.finalized_at),
                serde_json::to_string(&submission.items)?,
                now,
            ],
        )?;

        let mut positions: HashMap<&str, u32> = HashMap::new();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO attachments (submission_id, item_id, position, file_name,
                     content_type, content_hash, size_bytes, blob)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for attachment in &submission.attachments {
                let position = positions.entry(attachment.item_id.as_str()).or_insert(0);
                let image = &attachment.image;
                stmt.execute(params![
                    key,
                    attachment.item_id,
                    *position,
                    image.file_name,
                    image.content_type,
                    image.content_hash(),
                    i64::try_from(image.len()).unwrap_or(i64::MAX),
                    image.bytes,
                ])?;
                *position += 1;
            }
        }

        let event = TimelineEvent::new(
            submission.id,
            TimelineOperation::Created,
            format!(
                "checklist finalized with {} item(s), {} photo(s)",
                submission.items.len(),
                submission.attachments.len()
            ),
            &submission.operator,
        );
        insert_event(&tx, &event)?;

        tx.execute(
            "DELETE FROM session_snapshots WHERE asset_id = ?1",
            [&submission.target_asset_id],
        )?;
        tx.commit()?;

        info!(
            "Queued submission {} for asset {} ({} photo(s))",
            key,
            submission.target_asset_id,
            submission.attachments.len()
        );
        Ok(submission.id)
    }

    /// Get a queued submission by identifier, with attachment metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get(&self, id: &SubmissionId) -> Result<Option<Submission>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE id = ?1");
        let submission = conn
            .query_row(&sql, [id.to_string()], row_to_submission)
            .optional()?;

        match submission {
            Some(mut submission) => {
                submission.attachments = load_attachments(&conn, &submission.id)?;
                Ok(Some(submission))
            }
            None => Ok(None),
        }
    }

    /// List submissions a drain pass may deliver, oldest finalize first.
    ///
    /// Returns every submission in `pending` or `error`, including those
    /// past the retry ceiling. Attachment blobs are not loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn list_pending(&self) -> Result<Vec<Submission>> {
        self.list_where("status IN ('pending', 'error')")
    }

    /// List every queued submission, oldest finalize first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn list_all(&self) -> Result<Vec<Submission>> {
        self.list_where("1 = 1")
    }

    fn list_where(&self, filter: &str) -> Result<Vec<Submission>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE {filter}
             ORDER BY finalized_at ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut submissions = stmt
            .query_map([], row_to_submission)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for submission in &mut submissions {
            submission.attachments = load_attachments(&conn, &submission.id)?;
        }
        Ok(submissions)
    }

    /// Count submissions not yet acknowledged by the remote service.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn count_pending(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM submissions WHERE status != 'synced'",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Move a submission to a new status, recording a timeline event.
    ///
    /// - `pending`: requeue; the attempt counter and last error are cleared.
    /// - `syncing`: an attempt starts from `pending` or `error`; the counter
    ///   is unchanged.
    /// - `error`: an attempt failed; the counter is incremented and
    ///   `error_message` recorded.
    /// - `synced`: an attempt was acknowledged; the last error is cleared.
    ///   Every attachment must carry its remote reference by then.
    ///
    /// Status, counter and event are written in one transaction, so a failed
    /// timeline write fails the transition. Returns the resulting attempt count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubmissionNotFound`] if the submission is not queued,
    /// [`Error::InvalidTransition`] if its status does not allow the move,
    /// [`Error::UnresolvedAttachments`] for a premature `synced`, or an
    /// error if the database operation fails.
    pub fn update_status(
        &self,
        id: &SubmissionId,
        status: SubmissionStatus,
        error_message: Option<&str>,
        actor: &Principal,
    ) -> Result<u32> {
        self.apply_transition(id, status, error_message, |_, attempts| {
            let (operation, description) = match status {
                SubmissionStatus::Pending => {
                    (TimelineOperation::SyncAttempt, "requeued for delivery".to_string())
                }
                SubmissionStatus::Syncing => (
                    TimelineOperation::SyncAttempt,
                    format!("sync attempt {} started", attempts + 1),
                ),
                SubmissionStatus::Error => (
                    TimelineOperation::SyncFailed,
                    format!(
                        "sync attempt {} failed: {}",
                        attempts + 1,
                        error_message.unwrap_or("unknown error")
                    ),
                ),
                SubmissionStatus::Synced => {
                    (TimelineOperation::Synced, "accepted by remote service".to_string())
                }
            };
            Ok(TimelineEvent::new(*id, operation, description, actor))
        })
    }

    /// Move a submission to a new status, recording a prepared timeline event.
    ///
    /// Same rules as [`Storage::update_status`]. Used when the event must be
    /// known before it is written, for example to forward it to the remote
    /// timeline ahead of the local commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the submission is not queued, is already synced,
    /// or the database operation fails.
    pub fn transition(
        &self,
        id: &SubmissionId,
        status: SubmissionStatus,
        error_message: Option<&str>,
        event: &TimelineEvent,
    ) -> Result<u32> {
        if event.submission_id != *id {
            return Err(Error::internal(format!(
                "timeline event for {} applied to submission {id}",
                event.submission_id
            )));
        }
        self.apply_transition(id, status, error_message, |_, _| Ok(event.clone()))
    }

    /// Reset a submission for another round of automatic delivery.
    ///
    /// Used for manual retry once the retry ceiling is reached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubmissionNotFound`] if the submission is not queued,
    /// or [`Error::SubmissionBusy`] while an attempt is in progress.
    pub fn requeue(&self, id: &SubmissionId, actor: &Principal) -> Result<()> {
        self.apply_transition(id, SubmissionStatus::Pending, None, |current, attempts| {
            if current == SubmissionStatus::Syncing {
                return Err(Error::SubmissionBusy { id: id.to_string() });
            }
            Ok(TimelineEvent::new(
                *id,
                TimelineOperation::SyncAttempt,
                format!("requeued for delivery after {attempts} failed attempt(s)"),
                actor,
            ))
        })?;
        Ok(())
    }

    fn apply_transition<F>(
        &self,
        id: &SubmissionId,
        status: SubmissionStatus,
        error_message: Option<&str>,
        event_for: F,
    ) -> Result<u32>
    where
        F: FnOnce(SubmissionStatus, u32) -> Result<TimelineEvent>,
    {
        let key = id.to_string();
        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;

        let (current, attempts, last_error) = current_state(&tx, &key)?
            .ok_or_else(|| Error::not_found(key.clone()))?;
        let event = event_for(current, attempts)?;
        if !current.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                id: key,
                from: current.to_string(),
                to: status.to_string(),
            });
        }
        if status == SubmissionStatus::Synced {
            let unresolved: u32 = tx.query_row(
                "SELECT COUNT(*) FROM attachments WHERE submission_id = ?1 AND remote_ref IS NULL",
                [&key],
                |row| row.get(0),
            )?;
            if unresolved > 0 {
                return Err(Error::UnresolvedAttachments {
                    id: key,
                    count: unresolved,
                });
            }
        }

        let (attempts, last_error) = match status {
            SubmissionStatus::Pending => (0, None),
            SubmissionStatus::Syncing => (attempts, last_error),
            SubmissionStatus::Error => (
                attempts + 1,
                Some(error_message.unwrap_or("unknown error").to_string()),
            ),
            SubmissionStatus::Synced => (attempts, None),
        };

        tx.execute(
            "UPDATE submissions SET status = ?1, sync_attempts = ?2, last_error = ?3,
                 updated_at = ?4
             WHERE id = ?5",
            params![
                status.as_str(),
                attempts,
                last_error,
                format_timestamp(&Utc::now()),
                key,
            ],
        )?;
        insert_event(&tx, &event)?;
        tx.commit()?;

        debug!(
            "Submission {} {} -> {} (attempts: {})",
            key, current, status, attempts
        );
        Ok(attempts)
    }

    /// Delete a synced submission and its attachments.
    ///
    /// Returns `Ok(false)` without error if the submission is already gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the submission is still awaiting delivery or the
    /// database operation fails.
    pub fn remove(&self, id: &SubmissionId) -> Result<bool> {
        let key = id.to_string();
        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;

        match current_state(&tx, &key)? {
            None => {
                debug!("Submission {} already removed", key);
                Ok(false)
            }
            Some((SubmissionStatus::Synced, _, _)) => {
                tx.execute("DELETE FROM submissions WHERE id = ?1", [&key])?;
                tx.commit()?;
                debug!("Removed synced submission {}", key);
                Ok(true)
            }
            Some((status, _, _)) => Err(Error::internal(format!(
                "submission {key} is {status}; only synced submissions leave the queue"
            ))),
        }
    }

    /// Delete a submission on the operator's request.
    ///
    /// Appends a `deleted` event before the row and its attachments go.
    /// Returns `Ok(false)` if the submission is already gone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubmissionBusy`] while an attempt is in progress, or
    /// an error if the database operation fails.
    pub fn delete_submission(&self, id: &SubmissionId, actor: &Principal) -> Result<bool> {
        let key = id.to_string();
        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;

        let Some((status, attempts, _)) = current_state(&tx, &key)? else {
            debug!("Submission {} already deleted", key);
            return Ok(false);
        };
        if status == SubmissionStatus::Syncing {
            return Err(Error::SubmissionBusy { id: key });
        }

        let event = TimelineEvent::new(
            *id,
            TimelineOperation::Deleted,
            format!("deleted by operator while {status} after {attempts} failed attempt(s)"),
            actor,
        );
        insert_event(&tx, &event)?;
        tx.execute("DELETE FROM submissions WHERE id = ?1", [&key])?;
        tx.commit()?;

        info!("Deleted submission {} ({})", key, status);
        Ok(true)
    }

    /// Repair the queue after an unclean shutdown.
    ///
    /// Every submission left in `syncing` moves to `error` with its attempt
    /// counter incremented and exactly one `sync_failed` event. Submissions
    /// left in `synced` (acknowledged but not yet removed) are removed.
    /// Returns the identifiers moved to `error`.
    ///
    /// Only attempts started by the lease holder can be in flight, so the
    /// caller must hold the drain lease as `owner` and have no attempt of
    /// its own running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeaseNotHeld`] if `owner` does not hold the drain
    /// lease, or an error if the database operation fails.
    pub fn recover_interrupted(
        &self,
        owner: &str,
        actor: &Principal,
    ) -> Result<Vec<SubmissionId>> {
        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;
        ensure_held(&tx, owner)?;

        let interrupted: Vec<(String, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, sync_attempts FROM submissions WHERE status = 'syncing'
                 ORDER BY finalized_at ASC, id ASC",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let now = format_timestamp(&Utc::now());
        let mut recovered = Vec::with_capacity(interrupted.len());
        for (key, attempts) in interrupted {
            let id = SubmissionId::parse(&key)
                .map_err(|e| Error::internal(format!("corrupt submission id {key}: {e}")))?;
            let attempts = attempts + 1;
            tx.execute(
                "UPDATE submissions SET status = 'error', sync_attempts = ?1, last_error = ?2,
                     updated_at = ?3
                 WHERE id = ?4",
                params![attempts, INTERRUPTED_MESSAGE, now, key],
            )?;
            let event = TimelineEvent::new(
                id,
                TimelineOperation::SyncFailed,
                format!("sync attempt {attempts} {INTERRUPTED_MESSAGE}; the process stopped mid-attempt"),
                actor,
            );
            insert_event(&tx, &event)?;
            recovered.push(id);
        }

        let purged = tx.execute("DELETE FROM submissions WHERE status = 'synced'", [])?;
        tx.commit()?;

        for id in &recovered {
            warn!("Submission {} was {}; marked as error", id, INTERRUPTED_MESSAGE);
        }
        if purged > 0 {
            info!("Removed {} submission(s) synced before shutdown", purged);
        }
        Ok(recovered)
    }

    /// Read the bytes of one attachment.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn attachment_blob(&self, attachment_id: i64) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let blob = conn
            .query_row(
                "SELECT blob FROM attachments WHERE id = ?1",
                [attachment_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob)
    }

    /// Record the remote reference of an uploaded attachment.
    ///
    /// # Errors
    ///
    /// Returns an error if the attachment does not exist or the database
    /// operation fails.
    pub fn set_remote_ref(&self, attachment_id: i64, remote_ref: &str) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE attachments SET remote_ref = ?1 WHERE id = ?2",
            params![remote_ref, attachment_id],
        )?;
        if updated == 0 {
            return Err(Error::internal(format!(
                "attachment {attachment_id} not found"
            )));
        }
        Ok(())
    }
}

fn current_state(
    conn: &Connection,
    key: &str,
) -> Result<Option<(SubmissionStatus, u32, Option<String>)>> {
    let row: Option<(String, u32, Option<String>)> = conn
        .query_row(
            "SELECT status, sync_attempts, last_error FROM submissions WHERE id = ?1",
            [key],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    row.map(|(status, attempts, last_error)| {
        SubmissionStatus::parse(&status)
            .map(|status| (status, attempts, last_error))
            .ok_or_else(|| Error::internal(format!("unknown status '{status}' for {key}")))
    })
    .transpose()
}

fn load_attachments(conn: &Connection, id: &SubmissionId) -> Result<Vec<AttachmentRecord>> {
    let sql = format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE submission_id = ?1 ORDER BY id ASC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let attachments = stmt
        .query_map([id.to_string()], row_to_attachment)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(attachments)
}

fn row_to_submission(row: &Row) -> rusqlite::Result<Submission> {
    let id: String = row.get(0)?;
    let finalized_at: String = row.get(4)?;
    let items_json: String = row.get(5)?;
    let status: String = row.get(6)?;

    let id = SubmissionId::parse(&id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let items = serde_json::from_str(&items_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status =
        SubmissionStatus::parse(&status).ok_or_else(|| invalid_column(6, "status", &status))?;

    Ok(Submission {
        id,
        target_asset_id: row.get(1)?,
        template_id: row.get(2)?,
        operator: Principal::new(row.get::<_, String>(3)?),
        finalized_at: parse_timestamp(4, &finalized_at)?,
        items,
        status,
        sync_attempts: row.get(7)?,
        last_error: row.get(8)?,
        attachments: Vec::new(),
    })
}

fn row_to_attachment(row: &Row) -> rusqlite::Result<AttachmentRecord> {
    let size_bytes: i64 = row.get(6)?;
    Ok(AttachmentRecord {
        id: row.get(0)?,
        item_id: row.get(1)?,
        position: row.get(2)?,
        file_name: row.get(3)?,
        content_type: row.get(4)?,
        content_hash: row.get(5)?,
        size_bytes: u64::try_from(size_bytes).unwrap_or(0),
        remote_ref: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checklist::{CapturedImage, ChecklistItem, Verdict};
    use crate::submission::NewAttachment;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn create_test_storage() -> Storage {
        Storage::open_in_memory().expect("failed to create test storage")
    }

    fn item(id: &str, verdict: Verdict) -> ChecklistItem {
        ChecklistItem {
            id: id.to_string(),
            name: id.to_uppercase(),
            category: "Apparatus".to_string(),
            verdict,
            note: String::new(),
            extra: None,
        }
    }

    fn create_test_submission(minutes: i64) -> NewSubmission {
        NewSubmission {
            id: SubmissionId::generate(),
            target_asset_id: "engine-12".to_string(),
            template_id: "engine-daily-v2".to_string(),
            operator: Principal::new("ff-7"),
            finalized_at: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
                + Duration::minutes(minutes),
            items: vec![
                item("pump", Verdict::Conformant),
                item("hose", Verdict::NonConformant),
            ],
            attachments: vec![
                NewAttachment {
                    item_id: "hose".to_string(),
                    image: CapturedImage::new("split.jpg", "image/jpeg", vec![1, 2, 3]),
                },
                NewAttachment {
                    item_id: "hose".to_string(),
                    image: CapturedImage::new("coupling.jpg", "image/jpeg", vec![4, 5]),
                },
            ],
        }
    }

    fn actor() -> Principal {
        Principal::new("ff-7")
    }

    /// Run one failed attempt.
    fn fail(storage: &Storage, id: &SubmissionId, message: &str) -> u32 {
        storage
            .update_status(id, SubmissionStatus::Syncing, None, &actor())
            .unwrap();
        storage
            .update_status(id, SubmissionStatus::Error, Some(message), &actor())
            .unwrap()
    }

    /// Run one successful attempt, uploading every photo first.
    fn deliver(storage: &Storage, id: &SubmissionId) {
        storage
            .update_status(id, SubmissionStatus::Syncing, None, &actor())
            .unwrap();
        for attachment in storage.get(id).unwrap().unwrap().attachments {
            storage
                .set_remote_ref(attachment.id, &format!("https://objects/{}", attachment.id))
                .unwrap();
        }
        storage
            .update_status(id, SubmissionStatus::Synced, None, &actor())
            .unwrap();
    }

    #[test]
    fn test_enqueue_and_get() {
        let storage = create_test_storage();
        let new = create_test_submission(0);

        let id = storage.enqueue(&new).unwrap();
        let submission = storage.get(&id).unwrap().unwrap();

        assert_eq!(submission.status, SubmissionStatus::Pending);
        assert_eq!(submission.sync_attempts, 0);
        assert_eq!(submission.items, new.items);
        assert_eq!(submission.finalized_at, new.finalized_at);
        assert_eq!(submission.attachments.len(), 2);
        assert_eq!(submission.attachments[0].position, 0);
        assert_eq!(submission.attachments[1].position, 1);
        assert_eq!(submission.attachments[1].size_bytes, 2);
        assert!(submission.attachments[0].remote_ref.is_none());
    }

    #[test]
    fn test_enqueue_writes_created_event() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();

        let events = storage.timeline(&id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, TimelineOperation::Created);
        assert!(events[0].description.contains("2 photo(s)"));
    }

    #[test]
    fn test_enqueue_duplicate_rejected() {
        let storage = create_test_storage();
        let new = create_test_submission(0);
        storage.enqueue(&new).unwrap();

        let err = storage.enqueue(&new).unwrap_err();
        assert!(matches!(err, Error::DuplicateSubmission { .. }));
        assert_eq!(storage.count_pending().unwrap(), 1);
    }

    #[test]
    fn test_enqueue_duplicate_after_removal_rejected() {
        let storage = create_test_storage();
        let new = create_test_submission(0);
        let id = storage.enqueue(&new).unwrap();
        deliver(&storage, &id);
        storage.remove(&id).unwrap();

        assert!(matches!(
            storage.enqueue(&new),
            Err(Error::DuplicateSubmission { .. })
        ));
    }

    #[test]
    fn test_enqueue_clears_snapshot() {
        use crate::session::{SessionSnapshot, SnapshotStore};

        let storage = create_test_storage();
        let snapshot = SessionSnapshot {
            asset_id: "engine-12".to_string(),
            template_id: "engine-daily-v2".to_string(),
            operator: actor(),
            started_at: Utc::now(),
            items: Vec::new(),
            saved_at: Utc::now(),
        };
        storage.save_snapshot(&snapshot).unwrap();

        storage.enqueue(&create_test_submission(0)).unwrap();
        assert!(storage.load_snapshot("engine-12").unwrap().is_none());
    }

    #[test]
    fn test_get_nonexistent() {
        let storage = create_test_storage();
        assert!(storage.get(&SubmissionId::generate()).unwrap().is_none());
    }

    #[test]
    fn test_list_pending_fifo() {
        let storage = create_test_storage();
        let later = storage.enqueue(&create_test_submission(10)).unwrap();
        let earlier = storage.enqueue(&create_test_submission(1)).unwrap();

        let pending = storage.list_pending().unwrap();
        let ids: Vec<_> = pending.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![earlier, later]);
    }

    #[test]
    fn test_list_pending_includes_error_excludes_syncing() {
        let storage = create_test_storage();
        let failed = storage.enqueue(&create_test_submission(1)).unwrap();
        let busy = storage.enqueue(&create_test_submission(2)).unwrap();

        fail(&storage, &failed, "timeout");
        storage
            .update_status(&busy, SubmissionStatus::Syncing, None, &actor())
            .unwrap();

        let pending = storage.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, failed);
        assert_eq!(storage.list_all().unwrap().len(), 2);
    }

    #[test]
    fn test_count_pending_counts_unacknowledged() {
        let storage = create_test_storage();
        assert_eq!(storage.count_pending().unwrap(), 0);

        let a = storage.enqueue(&create_test_submission(1)).unwrap();
        storage.enqueue(&create_test_submission(2)).unwrap();
        storage
            .update_status(&a, SubmissionStatus::Syncing, None, &actor())
            .unwrap();
        assert_eq!(storage.count_pending().unwrap(), 2);

        storage
            .update_status(&a, SubmissionStatus::Error, Some("503"), &actor())
            .unwrap();
        deliver(&storage, &a);
        assert_eq!(storage.count_pending().unwrap(), 1);
    }

    #[test]
    fn test_update_status_error_increments_attempts() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();

        storage
            .update_status(&id, SubmissionStatus::Syncing, None, &actor())
            .unwrap();
        let attempts = storage
            .update_status(&id, SubmissionStatus::Error, Some("503"), &actor())
            .unwrap();
        assert_eq!(attempts, 1);

        storage
            .update_status(&id, SubmissionStatus::Syncing, None, &actor())
            .unwrap();
        let attempts = storage
            .update_status(&id, SubmissionStatus::Error, Some("timeout"), &actor())
            .unwrap();
        assert_eq!(attempts, 2);

        let submission = storage.get(&id).unwrap().unwrap();
        assert_eq!(submission.status, SubmissionStatus::Error);
        assert_eq!(submission.last_error.as_deref(), Some("timeout"));

        let ops: Vec<_> = storage
            .timeline(&id)
            .unwrap()
            .into_iter()
            .map(|e| e.operation)
            .collect();
        assert_eq!(
            ops,
            vec![
                TimelineOperation::Created,
                TimelineOperation::SyncAttempt,
                TimelineOperation::SyncFailed,
                TimelineOperation::SyncAttempt,
                TimelineOperation::SyncFailed,
            ]
        );
    }

    #[test]
    fn test_update_status_event_descriptions() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();
        storage
            .update_status(&id, SubmissionStatus::Syncing, None, &actor())
            .unwrap();
        storage
            .update_status(&id, SubmissionStatus::Error, Some("503"), &actor())
            .unwrap();

        let events = storage.timeline(&id).unwrap();
        assert_eq!(events[1].description, "sync attempt 1 started");
        assert_eq!(events[2].description, "sync attempt 1 failed: 503");
    }

    #[test]
    fn test_update_status_missing_submission() {
        let storage = create_test_storage();
        let err = storage
            .update_status(
                &SubmissionId::generate(),
                SubmissionStatus::Syncing,
                None,
                &actor(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::SubmissionNotFound { .. }));
    }

    #[test]
    fn test_synced_is_terminal() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();
        deliver(&storage, &id);

        assert!(matches!(
            storage.update_status(&id, SubmissionStatus::Error, Some("late"), &actor()),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_outcome_requires_an_attempt() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();

        for status in [SubmissionStatus::Synced, SubmissionStatus::Error] {
            let err = storage
                .update_status(&id, status, Some("skipped"), &actor())
                .unwrap_err();
            assert!(matches!(err, Error::InvalidTransition { .. }), "{err}");
        }
        fail(&storage, &id, "503");
        assert!(matches!(
            storage.update_status(&id, SubmissionStatus::Synced, None, &actor()),
            Err(Error::InvalidTransition { .. })
        ));

        // Refused moves leave no trace.
        let submission = storage.get(&id).unwrap().unwrap();
        assert_eq!(submission.status, SubmissionStatus::Error);
        assert_eq!(submission.sync_attempts, 1);
        assert_eq!(storage.timeline(&id).unwrap().len(), 3);
    }

    #[test]
    fn test_synced_refused_with_photos_not_uploaded() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();
        storage
            .update_status(&id, SubmissionStatus::Syncing, None, &actor())
            .unwrap();
        let first = storage.get(&id).unwrap().unwrap().attachments[0].id;
        storage.set_remote_ref(first, "https://objects/first").unwrap();

        let err = storage
            .update_status(&id, SubmissionStatus::Synced, None, &actor())
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedAttachments { count: 1, .. }));
        assert_eq!(
            storage.get(&id).unwrap().unwrap().status,
            SubmissionStatus::Syncing
        );
        assert!(storage.remove(&id).is_err());
    }

    #[test]
    fn test_syncing_is_not_reentered() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();
        storage
            .update_status(&id, SubmissionStatus::Syncing, None, &actor())
            .unwrap();

        assert!(matches!(
            storage.update_status(&id, SubmissionStatus::Syncing, None, &actor()),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_transition_with_prepared_event() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();
        storage
            .update_status(&id, SubmissionStatus::Syncing, None, &actor())
            .unwrap();
        for attachment in storage.get(&id).unwrap().unwrap().attachments {
            storage.set_remote_ref(attachment.id, "https://objects/x").unwrap();
        }
        let event = TimelineEvent::new(id, TimelineOperation::Synced, "accepted", &actor());

        storage
            .transition(&id, SubmissionStatus::Synced, None, &event)
            .unwrap();

        let events = storage.timeline(&id).unwrap();
        assert_eq!(events.last().unwrap().id, event.id);
    }

    #[test]
    fn test_transition_rejects_foreign_event() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();
        let event = TimelineEvent::new(
            SubmissionId::generate(),
            TimelineOperation::Synced,
            "accepted",
            &actor(),
        );

        assert!(storage
            .transition(&id, SubmissionStatus::Synced, None, &event)
            .is_err());
    }

    #[test]
    fn test_requeue_resets_attempts() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();
        for _ in 0..3 {
            fail(&storage, &id, "503");
        }

        storage.requeue(&id, &actor()).unwrap();
        let submission = storage.get(&id).unwrap().unwrap();
        assert_eq!(submission.status, SubmissionStatus::Pending);
        assert_eq!(submission.sync_attempts, 0);
        assert!(submission.last_error.is_none());
        let last = storage.timeline(&id).unwrap().pop().unwrap();
        assert!(last.description.contains("after 3 failed attempt(s)"));
    }

    #[test]
    fn test_requeue_refused_while_syncing() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();
        storage
            .update_status(&id, SubmissionStatus::Syncing, None, &actor())
            .unwrap();

        let err = storage.requeue(&id, &actor()).unwrap_err();
        assert!(matches!(err, Error::SubmissionBusy { .. }));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();
        deliver(&storage, &id);

        assert!(storage.remove(&id).unwrap());
        assert!(!storage.remove(&id).unwrap());
        assert!(storage.get(&id).unwrap().is_none());
        assert_eq!(storage.stats().unwrap().attachments, 0);
    }

    #[test]
    fn test_remove_refuses_undelivered() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();

        assert!(storage.remove(&id).is_err());
        assert!(storage.get(&id).unwrap().is_some());
    }

    #[test]
    fn test_delete_submission_records_event() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();

        assert!(storage.delete_submission(&id, &actor()).unwrap());
        assert!(!storage.delete_submission(&id, &actor()).unwrap());

        assert!(storage.get(&id).unwrap().is_none());
        let events = storage.timeline(&id).unwrap();
        assert_eq!(events.last().unwrap().operation, TimelineOperation::Deleted);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_delete_submission_refused_while_syncing() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();
        storage
            .update_status(&id, SubmissionStatus::Syncing, None, &actor())
            .unwrap();

        let err = storage.delete_submission(&id, &actor()).unwrap_err();
        assert!(matches!(err, Error::SubmissionBusy { .. }));
        assert!(storage.get(&id).unwrap().is_some());
    }

    #[test]
    fn test_recover_interrupted() {
        let storage = create_test_storage();
        let stuck = storage.enqueue(&create_test_submission(0)).unwrap();
        let waiting = storage.enqueue(&create_test_submission(1)).unwrap();
        let acked = storage.enqueue(&create_test_submission(2)).unwrap();
        deliver(&storage, &acked);
        storage
            .update_status(&stuck, SubmissionStatus::Syncing, None, &actor())
            .unwrap();
        storage
            .acquire_drain_lease("recovery", std::time::Duration::from_secs(60))
            .unwrap();

        let recovered = storage
            .recover_interrupted("recovery", &Principal::system())
            .unwrap();
        assert_eq!(recovered, vec![stuck]);

        let submission = storage.get(&stuck).unwrap().unwrap();
        assert_eq!(submission.status, SubmissionStatus::Error);
        assert_eq!(submission.sync_attempts, 1);
        assert_eq!(submission.last_error.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert!(storage.get(&acked).unwrap().is_none());
        assert_eq!(
            storage.get(&waiting).unwrap().unwrap().status,
            SubmissionStatus::Pending
        );

        let failures = storage
            .timeline(&stuck)
            .unwrap()
            .into_iter()
            .filter(|e| e.operation == TimelineOperation::SyncFailed)
            .count();
        assert_eq!(failures, 1);

        // Nothing left to recover on a second pass.
        assert!(storage
            .recover_interrupted("recovery", &Principal::system())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_recover_interrupted_requires_lease() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();
        storage
            .update_status(&id, SubmissionStatus::Syncing, None, &actor())
            .unwrap();
        storage
            .acquire_drain_lease("watch", std::time::Duration::from_secs(60))
            .unwrap();

        let err = storage
            .recover_interrupted("sync", &Principal::system())
            .unwrap_err();
        assert!(matches!(err, Error::LeaseNotHeld { .. }));
        assert_eq!(
            storage.get(&id).unwrap().unwrap().status,
            SubmissionStatus::Syncing
        );
        assert_eq!(storage.timeline(&id).unwrap().len(), 2);
    }

    #[test]
    fn test_attachment_blob_and_remote_ref() {
        let storage = create_test_storage();
        let id = storage.enqueue(&create_test_submission(0)).unwrap();
        let attachment = storage.get(&id).unwrap().unwrap().attachments[0].clone();

        let blob = storage.attachment_blob(attachment.id).unwrap().unwrap();
        assert_eq!(blob, vec![1, 2, 3]);
        assert!(storage.attachment_blob(9999).unwrap().is_none());

        storage
            .set_remote_ref(attachment.id, "https://objects/hose-0")
            .unwrap();
        let reloaded = storage.get(&id).unwrap().unwrap();
        assert_eq!(
            reloaded.attachments[0].remote_ref.as_deref(),
            Some("https://objects/hose-0")
        );
        assert!(storage.set_remote_ref(9999, "x").is_err());
    }

    #[test]
    fn test_stats_with_data() {
        let storage = create_test_storage();
        let a = storage.enqueue(&create_test_submission(0)).unwrap();
        storage.enqueue(&create_test_submission(1)).unwrap();
        fail(&storage, &a, "503");

        let stats = storage.stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.attachments, 4);
        assert_eq!(stats.attachment_bytes, 10);
        assert_eq!(stats.timeline_events, 4);
        assert_eq!(
            stats.oldest_finalized,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap())
        );
    }
}
