//! `SQLite` schema definitions for checkline.
//!
//! This module contains the SQL statements for creating and managing
//! the database schema.

/// SQL statement to create the submissions table.
pub const CREATE_SUBMISSIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS submissions (
    id TEXT PRIMARY KEY,
    target_asset_id TEXT NOT NULL,
    template_id TEXT NOT NULL,
    operator_id TEXT NOT NULL,
    finalized_at TEXT NOT NULL,
    items_json TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'syncing', 'synced', 'error')),
    sync_attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    updated_at TEXT NOT NULL
)
";

/// SQL statement to create an index serving the FIFO pending scan.
pub const CREATE_STATUS_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_submissions_status_finalized
ON submissions(status, finalized_at)
";

/// SQL statement to create the attachments table.
pub const CREATE_ATTACHMENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS attachments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    submission_id TEXT NOT NULL REFERENCES submissions(id) ON DELETE CASCADE,
    item_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    file_name TEXT NOT NULL,
    content_type TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    blob BLOB NOT NULL,
    remote_ref TEXT,
    UNIQUE (submission_id, item_id, position)
)
";

/// SQL statement to create an index on the owning submission.
pub const CREATE_ATTACHMENT_SUBMISSION_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_attachments_submission ON attachments(submission_id)
";

/// SQL statement to create the timeline table.
///
/// No foreign key: the timeline outlives the submission it describes.
pub const CREATE_TIMELINE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS timeline_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE,
    submission_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    description TEXT NOT NULL,
    actor TEXT NOT NULL,
    occurred_at TEXT NOT NULL
)
";

/// SQL statement to create an index on the timeline owner.
pub const CREATE_TIMELINE_SUBMISSION_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_timeline_submission ON timeline_events(submission_id, seq)
";

/// Trigger rejecting edits to written timeline events.
pub const CREATE_TIMELINE_NO_UPDATE_TRIGGER: &str = r"
CREATE TRIGGER IF NOT EXISTS timeline_events_no_update
BEFORE UPDATE ON timeline_events
BEGIN
    SELECT RAISE(ABORT, 'timeline events are append-only');
END
";

/// Trigger rejecting deletion of written timeline events.
pub const CREATE_TIMELINE_NO_DELETE_TRIGGER: &str = r"
CREATE TRIGGER IF NOT EXISTS timeline_events_no_delete
BEFORE DELETE ON timeline_events
BEGIN
    SELECT RAISE(ABORT, 'timeline events are append-only');
END
";

/// SQL statement to create the crash-recovery snapshot table.
pub const CREATE_SNAPSHOTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS session_snapshots (
    asset_id TEXT PRIMARY KEY,
    snapshot_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// SQL statement to create the drain lease table.
///
/// At most one row: the process currently allowed to deliver the queue.
pub const CREATE_DRAIN_LEASE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS drain_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    owner TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_SUBMISSIONS_TABLE,
    CREATE_STATUS_INDEX,
    CREATE_ATTACHMENTS_TABLE,
    CREATE_ATTACHMENT_SUBMISSION_INDEX,
    CREATE_TIMELINE_TABLE,
    CREATE_TIMELINE_SUBMISSION_INDEX,
    CREATE_TIMELINE_NO_UPDATE_TRIGGER,
    CREATE_TIMELINE_NO_DELETE_TRIGGER,
    CREATE_SNAPSHOTS_TABLE,
    CREATE_METADATA_TABLE,
    CREATE_DRAIN_LEASE_TABLE,
];
