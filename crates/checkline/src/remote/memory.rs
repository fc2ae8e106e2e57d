//! In-process remote service.
//!
//! Keeps objects, records and timelines in memory with the same
//! idempotency rules as the hosted service. Failures can be scripted, which
//! makes it the stand-in for the network in tests and offline demos.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use uuid::Uuid;

use super::{
    ChecklistRecord, CommitOutcome, NonConformance, RemoteError, RemoteResult, RemoteService,
    TimelineBatch,
};
use crate::submission::SubmissionId;
use crate::timeline::TimelineEvent;

const OBJECT_PREFIX: &str = "memory://objects/";

#[derive(Debug, Default)]
struct State {
    offline: bool,
    objects: HashMap<String, Vec<u8>>,
    records: HashMap<SubmissionId, ChecklistRecord>,
    non_conformances: HashMap<SubmissionId, Vec<NonConformance>>,
    timeline: Vec<TimelineEvent>,
    timeline_ids: HashSet<Uuid>,
    upload_calls: usize,
    commit_calls: usize,
    failing_uploads: Option<String>,
    failing_commits: u32,
    failing_timeline: u32,
    commit_delay: Option<Duration>,
}

/// A remote service that lives in process memory.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    /// Create an empty, reachable service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make every call fail with a transport error, or restore service.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Fail uploads whose object path contains `fragment`; `None` stops failing.
    pub fn fail_uploads_matching(&self, fragment: Option<&str>) {
        self.state().failing_uploads = fragment.map(str::to_string);
    }

    /// Refuse the next `count` commits with a 503.
    pub fn fail_next_commits(&self, count: u32) {
        self.state().failing_commits = count;
    }

    /// Refuse the next `count` timeline appends with a 503.
    pub fn fail_next_timeline_appends(&self, count: u32) {
        self.state().failing_timeline = count;
    }

    /// Hold every commit for `delay` before answering.
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        self.state().commit_delay = delay;
    }

    /// Committed records, in no particular order.
    #[must_use]
    pub fn records(&self) -> Vec<ChecklistRecord> {
        self.state().records.values().cloned().collect()
    }

    /// The committed record for a submission.
    #[must_use]
    pub fn record(&self, id: &SubmissionId) -> Option<ChecklistRecord> {
        self.state().records.get(id).cloned()
    }

    /// Non-conformance entries filed for a submission.
    #[must_use]
    pub fn non_conformances(&self, id: &SubmissionId) -> Vec<NonConformance> {
        self.state()
            .non_conformances
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Timeline events received for a submission, in arrival order.
    #[must_use]
    pub fn timeline(&self, id: &SubmissionId) -> Vec<TimelineEvent> {
        self.state()
            .timeline
            .iter()
            .filter(|e| e.submission_id == *id)
            .cloned()
            .collect()
    }

    /// Object paths stored so far.
    #[must_use]
    pub fn object_paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.state().objects.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of upload calls received, successful or not.
    #[must_use]
    pub fn upload_calls(&self) -> usize {
        self.state().upload_calls
    }

    /// Number of commit calls received, successful or not.
    #[must_use]
    pub fn commit_calls(&self) -> usize {
        self.state().commit_calls
    }
}

#[async_trait::async_trait]
impl RemoteService for MemoryRemote {
    async fn upload_object(
        &self,
        path: &str,
        _content_type: &str,
        bytes: Vec<u8>,
    ) -> RemoteResult<String> {
        let mut state = self.state();
        state.upload_calls += 1;
        if state.offline {
            return Err(RemoteError::transport("network unreachable"));
        }
        if let Some(fragment) = &state.failing_uploads {
            if path.contains(fragment.as_str()) {
                return Err(RemoteError::QuotaExceeded(format!("no space for {path}")));
            }
        }

        state.objects.insert(path.to_string(), bytes);
        Ok(format!("{OBJECT_PREFIX}{path}"))
    }

    async fn commit_checklist(&self, record: &ChecklistRecord) -> RemoteResult<CommitOutcome> {
        let delay = self.state().commit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.commit_calls += 1;
        if state.offline {
            return Err(RemoteError::transport("network unreachable"));
        }
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(RemoteError::rejected(503, "service unavailable"));
        }

        let dangling = record
            .items
            .iter()
            .flat_map(|item| item.attachments.iter())
            .find(|r| {
                r.strip_prefix(OBJECT_PREFIX)
                    .map_or(true, |path| !state.objects.contains_key(path))
            });
        if let Some(reference) = dangling {
            return Err(RemoteError::rejected(
                422,
                format!("unknown attachment reference {reference}"),
            ));
        }

        if state.records.contains_key(&record.submission_id) {
            return Ok(CommitOutcome::AlreadyCommitted);
        }
        state.records.insert(record.submission_id, record.clone());
        Ok(CommitOutcome::Created)
    }

    async fn record_non_conformances(
        &self,
        submission_id: &SubmissionId,
        entries: &[NonConformance],
    ) -> RemoteResult<()> {
        let mut state = self.state();
        if state.offline {
            return Err(RemoteError::transport("network unreachable"));
        }
        if !state.records.contains_key(submission_id) {
            return Err(RemoteError::rejected(
                404,
                format!("no checklist {submission_id}"),
            ));
        }
        state
            .non_conformances
            .insert(*submission_id, entries.to_vec());
        Ok(())
    }

    async fn append_timeline(&self, batch: &TimelineBatch) -> RemoteResult<()> {
        let mut state = self.state();
        if state.offline {
            return Err(RemoteError::transport("network unreachable"));
        }
        if state.failing_timeline > 0 {
            state.failing_timeline -= 1;
            return Err(RemoteError::rejected(503, "timeline unavailable"));
        }

        for event in &batch.events {
            if state.timeline_ids.insert(event.id) {
                state.timeline.push(event.clone());
            }
        }
        Ok(())
    }

    async fn health(&self) -> RemoteResult<()> {
        if self.state().offline {
            return Err(RemoteError::transport("network unreachable"));
        }
        Ok(())
    }
}
