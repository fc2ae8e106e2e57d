//! Audit timeline persistence.

use rusqlite::{params, Connection, Row};
use tracing::debug;
use uuid::Uuid;

use super::{format_timestamp, invalid_column, parse_timestamp, Storage};
use crate::checklist::Principal;
use crate::error::Result;
use crate::submission::SubmissionId;
use crate::timeline::{TimelineEvent, TimelineOperation};

/// Write one event on an open connection or transaction.
pub(super) fn insert_event(conn: &Connection, event: &TimelineEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO timeline_events (event_id, submission_id, operation, description, actor, occurred_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.id.to_string(),
            event.submission_id.to_string(),
            event.operation.as_str(),
            event.description,
            event.actor.as_str(),
            format_timestamp(&event.occurred_at),
        ],
    )?;
    debug!(
        "Timeline {} {}: {}",
        event.submission_id, event.operation, event.description
    );
    Ok(())
}

impl Storage {
    /// Append an event to a submission's timeline.
    ///
    /// The write is durable before this returns; callers must treat an
    /// error as a failure of the operation the event describes.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn append_timeline(
        &self,
        submission_id: SubmissionId,
        operation: TimelineOperation,
        description: impl Into<String>,
        actor: &Principal,
    ) -> Result<TimelineEvent> {
        let event = TimelineEvent::new(submission_id, operation, description, actor);
        let conn = self.conn()?;
        insert_event(&conn, &event)?;
        Ok(event)
    }

    /// Get a submission's timeline in the order it was written.
    ///
    /// Events outlive the submission, so this works after delivery or deletion.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn timeline(&self, submission_id: &SubmissionId) -> Result<Vec<TimelineEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, submission_id, operation, description, actor, occurred_at
             FROM timeline_events WHERE submission_id = ?1 ORDER BY seq ASC",
        )?;
        let events = stmt
            .query_map([submission_id.to_string()], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}

fn row_to_event(row: &Row) -> rusqlite::Result<TimelineEvent> {
    let event_id: String = row.get(0)?;
    let submission_id: String = row.get(1)?;
    let operation: String = row.get(2)?;
    let occurred_at: String = row.get(5)?;

    let conversion = |idx: usize, e: uuid::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };

    Ok(TimelineEvent {
        id: Uuid::parse_str(&event_id).map_err(|e| conversion(0, e))?,
        submission_id: SubmissionId::parse(&submission_id).map_err(|e| conversion(1, e))?,
        operation: TimelineOperation::parse(&operation)
            .ok_or_else(|| invalid_column(2, "timeline operation", &operation))?,
        description: row.get(3)?,
        actor: Principal::new(row.get::<_, String>(4)?),
        occurred_at: parse_timestamp(5, &occurred_at)?,
    })
}
