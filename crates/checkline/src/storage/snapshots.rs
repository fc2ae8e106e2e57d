//! Crash-recovery snapshots of in-progress sessions.

use rusqlite::{params, OptionalExtension};
use tracing::warn;

use super::{format_timestamp, Storage};
use crate::error::Result;
use crate::session::{SessionSnapshot, SnapshotStore};

impl SnapshotStore for Storage {
    fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO session_snapshots (asset_id, snapshot_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(asset_id) DO UPDATE SET
                 snapshot_json = excluded.snapshot_json,
                 updated_at = excluded.updated_at",
            params![
                snapshot.asset_id,
                json,
                format_timestamp(&snapshot.saved_at)
            ],
        )?;
        Ok(())
    }

    fn load_snapshot(&self, asset_id: &str) -> Result<Option<SessionSnapshot>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM session_snapshots WHERE asset_id = ?1",
                [asset_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(json) = json else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                // An unreadable snapshot cannot be resumed; start fresh.
                warn!("Discarding unreadable snapshot for asset {}: {}", asset_id, e);
                conn.execute(
                    "DELETE FROM session_snapshots WHERE asset_id = ?1",
                    [asset_id],
                )?;
                Ok(None)
            }
        }
    }

    fn clear_snapshot(&self, asset_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM session_snapshots WHERE asset_id = ?1",
            [asset_id],
        )?;
        Ok(())
    }
}
