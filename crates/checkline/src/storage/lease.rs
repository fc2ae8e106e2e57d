//! Cross-process drain lease.
//!
//! Several processes may open the same queue (a background `watch` and a
//! one-off `sync`, say). Only the holder of the lease may repair interrupted
//! attempts or start new ones. A holder that dies stops renewing, and its
//! lease can be taken over once it expires.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::{format_timestamp, parse_timestamp, write_tx, Storage};
use crate::error::{Error, Result};

/// The current holder of the drain lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainLease {
    /// Who holds it.
    pub owner: String,
    /// When it was taken.
    pub acquired_at: DateTime<Utc>,
    /// When it lapses unless renewed.
    pub expires_at: DateTime<Utc>,
}

impl DrainLease {
    /// Check if the lease has lapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| Error::internal(format!("drain lease duration {ttl:?} out of range")))
}

pub(super) fn current_lease(conn: &Connection) -> Result<Option<DrainLease>> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT owner, acquired_at, expires_at FROM drain_lease WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    row.map(|(owner, acquired_at, expires_at)| -> Result<DrainLease> {
        Ok(DrainLease {
            owner,
            acquired_at: parse_timestamp(1, &acquired_at)?,
            expires_at: parse_timestamp(2, &expires_at)?,
        })
    })
    .transpose()
}

/// Fail unless `owner` holds an unexpired lease.
pub(super) fn ensure_held(conn: &Connection, owner: &str) -> Result<()> {
    match current_lease(conn)? {
        Some(lease) if lease.owner == owner && !lease.is_expired(Utc::now()) => Ok(()),
        _ => Err(Error::LeaseNotHeld {
            owner: owner.to_string(),
        }),
    }
}

impl Storage {
    /// Take the drain lease for `ttl`.
    ///
    /// Succeeds if nobody holds it, if `owner` already does, or if the
    /// current holder let it expire. Returns `false` while another owner
    /// holds a live lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn acquire_drain_lease(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = write_tx(&mut conn)?;
        let now = Utc::now();

        if let Some(lease) = current_lease(&tx)? {
            if lease.owner != owner {
                if !lease.is_expired(now) {
                    debug!("Drain lease held by {} until {}", lease.owner, lease.expires_at);
                    return Ok(false);
                }
                warn!(
                    "Taking over drain lease from {}; it expired at {}",
                    lease.owner, lease.expires_at
                );
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO drain_lease (id, owner, acquired_at, expires_at)
             VALUES (1, ?1, ?2, ?3)",
            params![
                owner,
                format_timestamp(&now),
                format_timestamp(&expiry(now, ttl)?),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Extend a lease `owner` still holds.
    ///
    /// Returns `false` if the lease was lost, for example because it
    /// expired and another process took it over.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn renew_drain_lease(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let conn = self.conn()?;
        let expires_at = expiry(Utc::now(), ttl)?;
        let updated = conn.execute(
            "UPDATE drain_lease SET expires_at = ?1 WHERE id = 1 AND owner = ?2",
            params![format_timestamp(&expires_at), owner],
        )?;
        Ok(updated == 1)
    }

    /// Give the lease up. Does nothing if `owner` no longer holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn release_drain_lease(&self, owner: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM drain_lease WHERE id = 1 AND owner = ?1",
            [owner],
        )?;
        Ok(())
    }

    /// The current lease, live or expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn drain_lease(&self) -> Result<Option<DrainLease>> {
        let conn = self.conn()?;
        current_lease(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_lease_is_exclusive() {
        let storage = Storage::open_in_memory().unwrap();

        assert!(storage.acquire_drain_lease("watch", TTL).unwrap());
        assert!(!storage.acquire_drain_lease("sync", TTL).unwrap());
        // Re-entrant for the holder.
        assert!(storage.acquire_drain_lease("watch", TTL).unwrap());

        let lease = storage.drain_lease().unwrap().unwrap();
        assert_eq!(lease.owner, "watch");
        assert!(lease.expires_at > lease.acquired_at);
    }

    #[test]
    fn test_release_lets_another_owner_in() {
        let storage = Storage::open_in_memory().unwrap();
        storage.acquire_drain_lease("watch", TTL).unwrap();

        // Releasing someone else's lease is a no-op.
        storage.release_drain_lease("sync").unwrap();
        assert!(!storage.acquire_drain_lease("sync", TTL).unwrap());

        storage.release_drain_lease("watch").unwrap();
        assert!(storage.drain_lease().unwrap().is_none());
        assert!(storage.acquire_drain_lease("sync", TTL).unwrap());
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .acquire_drain_lease("crashed", Duration::ZERO)
            .unwrap();

        assert!(storage.acquire_drain_lease("watch", TTL).unwrap());
        assert!(!storage.renew_drain_lease("crashed", TTL).unwrap());
        assert!(storage.renew_drain_lease("watch", TTL).unwrap());
    }

    #[test]
    fn test_ensure_held() {
        let storage = Storage::open_in_memory().unwrap();
        storage.acquire_drain_lease("watch", TTL).unwrap();

        let conn = storage.conn().unwrap();
        assert!(ensure_held(&conn, "watch").is_ok());
        assert!(matches!(
            ensure_held(&conn, "sync"),
            Err(Error::LeaseNotHeld { .. })
        ));
    }

    #[test]
    fn test_lease_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let first = Storage::open(&path).unwrap();
        let second = Storage::open(&path).unwrap();

        assert!(first.acquire_drain_lease("watch", TTL).unwrap());
        assert!(!second.acquire_drain_lease("sync", TTL).unwrap());
        first.release_drain_lease("watch").unwrap();
        assert!(second.acquire_drain_lease("sync", TTL).unwrap());
    }
}
