//! Sync orchestrator.
//!
//! Drains the submission queue against the remote service, one submission
//! at a time and oldest first. Each attempt marks the submission `syncing`,
//! uploads its attachments, commits the record under the submission id,
//! files non-conformance entries, continues the remote timeline and only
//! then marks it `synced` and removes it. Any failure along the way moves
//! the submission to `error` and the pass continues with the next one.
//!
//! Processes sharing one queue database coordinate through the store's
//! drain lease: only its holder repairs interrupted attempts or starts new
//! ones, so at most one write is in flight per device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checklist::Principal;
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::error::{Error, Result};
use crate::remote::{ChecklistRecord, CommitOutcome, RemoteService, TimelineBatch};
use crate::storage::{self, Storage};
use crate::submission::{Submission, SubmissionId, SubmissionStatus};
use crate::timeline::{TimelineEvent, TimelineOperation};
use crate::upload::UploadPipeline;

/// Tunables for the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Failed attempts after which a submission is left for the operator.
    pub max_attempts: u32,
    /// Interval between background drains while online; `None` disables polling.
    pub poll_interval: Option<Duration>,
    /// Lifetime of the drain lease between renewals.
    pub lease_ttl: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            poll_interval: None,
            lease_ttl: Duration::from_secs(300),
        }
    }
}

impl From<&Config> for SyncOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.sync.max_attempts,
            poll_interval: config.poll_interval(),
            lease_ttl: config.lease_duration(),
        }
    }
}

/// Why a drain request did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The device is offline.
    Offline,
    /// Another drain pass is running, in this process or another one.
    AlreadyDraining,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::AlreadyDraining => write!(f, "a drain is already in progress"),
        }
    }
}

/// A failed delivery attempt within a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainFailure {
    /// The submission that failed.
    pub submission_id: SubmissionId,
    /// Failed attempts after this one.
    pub attempts: u32,
    /// What went wrong.
    pub message: String,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Interrupted attempts repaired before the pass started.
    pub recovered: usize,
    /// Submissions an attempt was made for.
    pub attempted: usize,
    /// Submissions delivered and removed.
    pub synced: usize,
    /// Of those, commits the service had already seen.
    pub already_committed: usize,
    /// Attempts that failed.
    pub failures: Vec<DrainFailure>,
    /// Submissions left alone because their retries are used up.
    pub needs_attention: usize,
    /// Whether the pass stopped early on request.
    pub cancelled: bool,
    /// Unacknowledged submissions after the pass.
    pub pending_after: u64,
}

impl DrainReport {
    /// Number of failed attempts.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Result of a drain request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrainOutcome {
    /// Nothing was done.
    Skipped {
        /// Why.
        reason: SkipReason,
    },
    /// A pass ran to the end or to a cancellation point.
    Completed(DrainReport),
}

impl DrainOutcome {
    /// The report, if a pass ran.
    #[must_use]
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Skipped { .. } => None,
        }
    }
}

/// A handle to stop a running drain pass between submissions.
///
/// The submission being attempted when the request arrives is finished;
/// only the following ones are skipped. Each new pass starts uncancelled.
#[derive(Debug, Clone, Default)]
pub struct SyncHandle {
    cancel: Arc<AtomicBool>,
}

impl SyncHandle {
    /// Create a new handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running pass to stop after its current submission.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Check if a stop was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }
}

/// Clears the in-progress flag when a pass ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Network-aware controller that drains the submission queue.
#[derive(Debug)]
pub struct SyncOrchestrator {
    storage: Arc<Storage>,
    remote: Arc<dyn RemoteService>,
    pipeline: UploadPipeline,
    connectivity: Connectivity,
    options: SyncOptions,
    actor: Principal,
    lease_owner: String,
    draining: AtomicBool,
    handle: SyncHandle,
    pending_tx: watch::Sender<u64>,
}

impl SyncOrchestrator {
    /// Create an orchestrator.
    ///
    /// `actor` is recorded on the timeline events of automatic transitions.
    #[must_use]
    pub fn new(
        storage: Arc<Storage>,
        remote: Arc<dyn RemoteService>,
        connectivity: Connectivity,
        options: SyncOptions,
        actor: Principal,
    ) -> Self {
        let pipeline = UploadPipeline::new(Arc::clone(&remote), Arc::clone(&storage));
        let (pending_tx, _rx) = watch::channel(0);
        let lease_owner = format!("{}:{}", std::process::id(), Uuid::new_v4());
        Self {
            storage,
            remote,
            pipeline,
            connectivity,
            options,
            actor,
            lease_owner,
            draining: AtomicBool::new(false),
            handle: SyncHandle::new(),
            pending_tx,
        }
    }

    /// The options in effect.
    #[must_use]
    pub fn options(&self) -> SyncOptions {
        self.options
    }

    /// A handle to cancel running passes.
    #[must_use]
    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// The name this orchestrator holds the drain lease under.
    #[must_use]
    pub fn lease_owner(&self) -> &str {
        &self.lease_owner
    }

    /// Check if a pass is running.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Subscribe to the published pending count.
    #[must_use]
    pub fn subscribe_pending(&self) -> watch::Receiver<u64> {
        self.pending_tx.subscribe()
    }

    /// The last published pending count.
    #[must_use]
    pub fn pending_count(&self) -> u64 {
        *self.pending_tx.borrow()
    }

    async fn store<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Storage) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        storage::blocking(&self.storage, op).await
    }

    /// Recount unacknowledged submissions and publish the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn refresh_pending(&self) -> Result<u64> {
        let count = self.store(Storage::count_pending).await?;
        self.pending_tx.send_replace(count);
        Ok(count)
    }

    /// Claim the in-process flag, then the drain lease.
    ///
    /// Returns `None` if either is already taken; the flag is released when
    /// the returned guard drops, the lease by [`Self::release_lease`].
    async fn claim(&self) -> Result<Option<DrainGuard<'_>>> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain skipped: already draining");
            return Ok(None);
        }
        let guard = DrainGuard(&self.draining);

        let owner = self.lease_owner.clone();
        let ttl = self.options.lease_ttl;
        if self
            .store(move |s| s.acquire_drain_lease(&owner, ttl))
            .await?
        {
            Ok(Some(guard))
        } else {
            debug!("Drain skipped: queue is being delivered by another process");
            Ok(None)
        }
    }

    async fn release_lease(&self) {
        let owner = self.lease_owner.clone();
        if let Err(e) = self.store(move |s| s.release_drain_lease(&owner)).await {
            warn!("Failed to release drain lease: {}", e);
        }
    }

    async fn recover_locked(&self) -> Result<Vec<SubmissionId>> {
        let owner = self.lease_owner.clone();
        let actor = self.actor.clone();
        self.store(move |s| s.recover_interrupted(&owner, &actor))
            .await
    }

    /// Repair submissions interrupted by an unclean shutdown.
    ///
    /// Call once at startup, before the first drain. Every pass repeats the
    /// repair, so an attempt orphaned by a process that died while holding
    /// the lease is picked up once the lease expires. Returns nothing while
    /// another pass holds the queue: its `syncing` submissions are live.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be updated.
    pub async fn recover(&self) -> Result<Vec<SubmissionId>> {
        let Some(_guard) = self.claim().await? else {
            info!("Recovery skipped: the queue is being delivered");
            return Ok(Vec::new());
        };
        let recovered = self.recover_locked().await;
        self.release_lease().await;

        let recovered = recovered?;
        self.refresh_pending().await?;
        Ok(recovered)
    }

    /// Run one drain pass.
    ///
    /// Does nothing when offline or when a pass is already running in this
    /// or another process; the request is dropped, not queued.
    ///
    /// # Errors
    ///
    /// Returns an error only if the local store fails. Delivery failures
    /// are recorded on the submission and reported in the [`DrainReport`].
    pub async fn drain(&self) -> Result<DrainOutcome> {
        if !self.connectivity.is_online() {
            debug!("Drain skipped: offline");
            return Ok(DrainOutcome::Skipped {
                reason: SkipReason::Offline,
            });
        }
        let Some(_guard) = self.claim().await? else {
            return Ok(DrainOutcome::Skipped {
                reason: SkipReason::AlreadyDraining,
            });
        };
        self.handle.reset();

        let report = self.drain_locked().await;
        self.release_lease().await;
        Ok(DrainOutcome::Completed(report?))
    }

    async fn drain_locked(&self) -> Result<DrainReport> {
        let mut report = DrainReport {
            recovered: self.recover_locked().await?.len(),
            ..DrainReport::default()
        };

        let pending = self.store(Storage::list_pending).await?;
        info!("Drain started: {} submission(s) queued", pending.len());

        for submission in pending {
            if self.handle.is_cancelled() {
                info!("Drain cancelled; remaining submissions left for the next pass");
                report.cancelled = true;
                break;
            }
            if submission.is_retry_exhausted(self.options.max_attempts) {
                report.needs_attention += 1;
                continue;
            }

            let owner = self.lease_owner.clone();
            let ttl = self.options.lease_ttl;
            if !self.store(move |s| s.renew_drain_lease(&owner, ttl)).await? {
                warn!("Drain lease lost; leaving the rest of the queue to its new holder");
                report.cancelled = true;
                break;
            }

            match self.attempt(submission).await? {
                Attempt::Synced(outcome) => {
                    report.attempted += 1;
                    report.synced += 1;
                    if outcome == CommitOutcome::AlreadyCommitted {
                        report.already_committed += 1;
                    }
                }
                Attempt::Failed(failure) => {
                    report.attempted += 1;
                    report.failures.push(failure);
                }
                Attempt::Gone => {}
            }
        }

        report.pending_after = self.refresh_pending().await?;
        info!(
            "Drain finished: {} synced, {} failed, {} need attention, {} pending",
            report.synced,
            report.failed(),
            report.needs_attention,
            report.pending_after
        );
        Ok(report)
    }

    /// One delivery attempt. Only a store failure while recording the
    /// outcome is returned as an error.
    async fn attempt(&self, mut submission: Submission) -> Result<Attempt> {
        let id = submission.id;
        let actor = self.actor.clone();
        let started = self
            .store(move |s| s.update_status(&id, SubmissionStatus::Syncing, None, &actor))
            .await;
        match started {
            Ok(_) => submission.status = SubmissionStatus::Syncing,
            // Deleted by the operator since the queue was listed.
            Err(Error::SubmissionNotFound { .. } | Error::InvalidTransition { .. }) => {
                debug!("Submission {} changed since the pass started; skipping", id);
                return Ok(Attempt::Gone);
            }
            Err(e) => return Err(e),
        }

        match self.push(&mut submission).await {
            Ok(outcome) => {
                info!("Submission {} synced", id);
                Ok(Attempt::Synced(outcome))
            }
            Err(err) => {
                let message = err.to_string();
                if err.is_transient() {
                    warn!("Submission {} failed to sync: {}", id, message);
                } else {
                    error!("Submission {} failed to sync: {}", id, message);
                }

                let actor = self.actor.clone();
                let recorded = message.clone();
                let attempts = self
                    .store(move |s| {
                        s.update_status(&id, SubmissionStatus::Error, Some(&recorded), &actor)
                    })
                    .await?;
                if attempts >= self.options.max_attempts {
                    warn!(
                        "Submission {} needs attention after {} failed attempt(s)",
                        id, attempts
                    );
                }
                Ok(Attempt::Failed(DrainFailure {
                    submission_id: id,
                    attempts,
                    message,
                }))
            }
        }
    }

    /// Deliver a `syncing` submission end to end.
    async fn push(&self, submission: &mut Submission) -> Result<CommitOutcome> {
        let id = submission.id;
        self.pipeline.resolve_all(submission).await?;

        let record = ChecklistRecord::build(submission)?;
        let outcome = self
            .remote
            .commit_checklist(&record)
            .await
            .map_err(|e| Error::commit_rejected(e.to_string()))?;
        if outcome == CommitOutcome::AlreadyCommitted {
            info!("Submission {} was already committed; continuing", id);
        }

        let entries = record.non_conformances();
        if !entries.is_empty() {
            self.remote
                .record_non_conformances(&id, &entries)
                .await
                .map_err(|e| Error::commit_rejected(format!("non-conformance entries: {e}")))?;
        }

        let description = match outcome {
            CommitOutcome::Created => "committed to remote service",
            CommitOutcome::AlreadyCommitted => "remote record already present from an earlier attempt",
        };
        let synced = TimelineEvent::new(id, TimelineOperation::Synced, description, &self.actor);
        let mut events = self.store(move |s| s.timeline(&id)).await?;
        events.push(synced.clone());
        self.remote
            .append_timeline(&TimelineBatch::new(id, events))
            .await
            .map_err(|e| Error::commit_rejected(format!("timeline: {e}")))?;

        self.store(move |s| {
            s.transition(&id, SubmissionStatus::Synced, None, &synced)?;
            s.remove(&id)
        })
        .await?;
        Ok(outcome)
    }

    /// Requeue a submission on the operator's request and drain.
    ///
    /// # Errors
    ///
    /// Returns an error if the submission is unknown, is syncing, or the
    /// store fails.
    pub async fn retry(&self, id: SubmissionId, actor: &Principal) -> Result<DrainOutcome> {
        let actor = actor.clone();
        self.store(move |s| s.requeue(&id, &actor)).await?;
        info!("Submission {} requeued for delivery", id);
        self.refresh_pending().await?;
        self.drain().await
    }

    /// Delete a submission on the operator's request.
    ///
    /// Returns `false` if it was already gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the submission is syncing or the store fails.
    pub async fn delete(&self, id: SubmissionId, actor: &Principal) -> Result<bool> {
        let actor = actor.clone();
        let deleted = self
            .store(move |s| s.delete_submission(&id, &actor))
            .await?;
        self.refresh_pending().await?;
        Ok(deleted)
    }

    /// Drive the orchestrator until `shutdown` flips to `true`.
    ///
    /// Drains once at start when online, on every offline to online
    /// transition, and on the poll interval while online. A pass in
    /// progress is always finished before shutdown is honoured.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut online_rx = self.connectivity.subscribe();
        let mut was_online = *online_rx.borrow_and_update();
        let mut ticker = self.options.poll_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        if let Err(e) = self.refresh_pending().await {
            error!("Failed to count pending submissions: {}", e);
        }
        if was_online {
            self.drain_logged().await;
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Sync orchestrator stopping");
                        return;
                    }
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let online = *online_rx.borrow_and_update();
                    if online && !was_online {
                        self.drain_logged().await;
                    }
                    was_online = online;
                }
                () = next_tick(&mut ticker) => {
                    if self.connectivity.is_online() {
                        self.drain_logged().await;
                    }
                }
            }
        }
    }

    async fn drain_logged(&self) {
        match self.drain().await {
            Ok(DrainOutcome::Completed(_)) => {}
            Ok(DrainOutcome::Skipped { reason }) => debug!("Drain skipped: {}", reason),
            Err(e) => error!("Drain aborted: {}", e),
        }
    }
}

enum Attempt {
    Synced(CommitOutcome),
    Failed(DrainFailure),
    Gone,
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
