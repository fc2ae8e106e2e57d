//! End-to-end tests: sessions are finalized into the queue and delivered to
//! an in-process remote service.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::watch;

use checkline::remote::RemoteService;
use checkline::session::SnapshotStore;
use checkline::sync::SkipReason;
use checkline::{
    CapturedImage, ChecklistSession, Connectivity, DrainOutcome, Error, MemoryRemote, Principal,
    SessionContext, SessionLimits, Storage, SubmissionId, SubmissionStatus, SyncOptions,
    SyncOrchestrator, Template, TemplateItem, TimelineOperation, Verdict,
};

fn template() -> Template {
    Template {
        id: "engine-daily-v2".to_string(),
        asset_type: "engine".to_string(),
        items: vec![
            TemplateItem::new("pump", "Pump pressure", "Pump"),
            TemplateItem::new("hose", "Hose condition", "Hose"),
            TemplateItem::new("lights", "Emergency lights", "Electrical"),
        ],
    }
}

fn photo(name: &str) -> CapturedImage {
    CapturedImage::new(name, "image/jpeg", name.as_bytes().to_vec())
}

fn start_session(storage: &Arc<Storage>, asset_id: &str) -> ChecklistSession {
    ChecklistSession::start(
        SessionContext::new(asset_id, Principal::new("ff-7")),
        &template(),
        Arc::clone(storage) as Arc<dyn SnapshotStore>,
        SessionLimits::default(),
    )
    .unwrap()
}

/// Complete and queue a checklist with one non-conformant item and two photos.
fn submit(storage: &Arc<Storage>, asset_id: &str) -> SubmissionId {
    let mut session = start_session(storage, asset_id);
    session.set_verdict("pump", Verdict::Conformant).unwrap();
    session.set_verdict("hose", Verdict::NonConformant).unwrap();
    session.set_note("hose", "split near coupling").unwrap();
    session
        .add_attachments("hose", vec![photo("split.jpg"), photo("coupling.png")])
        .unwrap();
    session.set_verdict("lights", Verdict::NotApplicable).unwrap();

    let new = session.finalize().unwrap();
    storage.enqueue(&new).unwrap()
}

struct Harness {
    storage: Arc<Storage>,
    remote: Arc<MemoryRemote>,
    connectivity: Connectivity,
    orchestrator: Arc<SyncOrchestrator>,
}

fn harness_with(storage: Arc<Storage>, online: bool, options: SyncOptions) -> Harness {
    let remote = Arc::new(MemoryRemote::new());
    let connectivity = Connectivity::new(online);
    let orchestrator = Arc::new(SyncOrchestrator::new(
        Arc::clone(&storage),
        Arc::clone(&remote) as Arc<dyn RemoteService>,
        connectivity.clone(),
        options,
        Principal::system(),
    ));
    Harness {
        storage,
        remote,
        connectivity,
        orchestrator,
    }
}

fn harness(online: bool) -> Harness {
    harness_with(
        Arc::new(Storage::open_in_memory().unwrap()),
        online,
        SyncOptions::default(),
    )
}

fn operations(storage: &Storage, id: &SubmissionId) -> Vec<TimelineOperation> {
    storage
        .timeline(id)
        .unwrap()
        .into_iter()
        .map(|e| e.operation)
        .collect()
}

#[tokio::test]
async fn test_full_delivery_with_photos() {
    let h = harness(true);
    let id = submit(&h.storage, "engine-12");

    let outcome = h.orchestrator.drain().await.unwrap();
    assert_eq!(outcome.report().unwrap().synced, 1);

    let record = h.remote.record(&id).unwrap();
    assert_eq!(record.target_asset_id, "engine-12");
    assert_eq!(record.items.len(), 3);
    let hose = record.items.iter().find(|i| i.id == "hose").unwrap();
    assert_eq!(hose.attachments.len(), 2);
    assert_eq!(h.remote.object_paths().len(), 2);

    let entries = h.remote.non_conformances(&id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].item_id, "hose");
    assert_eq!(entries[0].note, "split near coupling");

    assert!(h.storage.get(&id).unwrap().is_none());
    assert_eq!(h.storage.stats().unwrap().attachments, 0);
    assert_eq!(h.orchestrator.pending_count(), 0);
}

#[tokio::test]
async fn test_commit_is_idempotent_across_retries() {
    let h = harness(true);
    let id = submit(&h.storage, "engine-12");

    // The commit lands but the timeline append fails, so the attempt fails.
    h.remote.fail_next_timeline_appends(1);
    let first = h.orchestrator.drain().await.unwrap();
    assert_eq!(first.report().unwrap().failed(), 1);
    assert!(h.remote.record(&id).is_some());

    let second = h.orchestrator.drain().await.unwrap();
    let report = second.report().unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.already_committed, 1);

    assert_eq!(h.remote.records().len(), 1);
    // Photos were resolved on the first attempt and not uploaded again.
    assert_eq!(h.remote.upload_calls(), 2);
}

#[tokio::test]
async fn test_no_commit_without_every_photo() {
    let h = harness(true);
    let id = submit(&h.storage, "engine-12");
    h.remote.fail_uploads_matching(Some(".png"));

    let outcome = h.orchestrator.drain().await.unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(report.failed(), 1);
    assert!(report.failures[0].message.contains("hose"));
    assert_eq!(h.remote.commit_calls(), 0);

    let stored = h.storage.get(&id).unwrap().unwrap();
    assert_eq!(stored.status, SubmissionStatus::Error);
    assert_eq!(stored.unresolved_attachments().count(), 1);

    h.remote.fail_uploads_matching(None);
    h.orchestrator.drain().await.unwrap();
    assert!(h.remote.record(&id).is_some());
    assert_eq!(h.remote.upload_calls(), 3);
}

#[tokio::test]
async fn test_drain_order_is_fifo() {
    let h = harness(true);
    let first = submit(&h.storage, "engine-12");
    let second = submit(&h.storage, "ladder-3");
    let third = submit(&h.storage, "rescue-1");

    h.orchestrator.drain().await.unwrap();

    let synced_at: Vec<_> = [first, second, third]
        .iter()
        .map(|id| {
            h.remote
                .timeline(id)
                .into_iter()
                .find(|e| e.operation == TimelineOperation::Synced)
                .unwrap()
                .occurred_at
        })
        .collect();
    assert!(synced_at.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(h.remote.records().len(), 3);
}

#[tokio::test]
async fn test_failure_does_not_block_later_submissions() {
    let h = harness(true);
    let first = submit(&h.storage, "engine-12");
    let second = submit(&h.storage, "ladder-3");
    h.remote.fail_next_commits(1);

    let outcome = h.orchestrator.drain().await.unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.synced, 1);
    assert_eq!(report.failures[0].submission_id, first);
    assert!(h.remote.record(&second).is_some());
    assert_eq!(report.pending_after, 1);
}

#[tokio::test]
async fn test_retry_ceiling_then_manual_retry() {
    let h = harness_with(
        Arc::new(Storage::open_in_memory().unwrap()),
        true,
        SyncOptions {
            max_attempts: 2,
            ..SyncOptions::default()
        },
    );
    let id = submit(&h.storage, "engine-12");
    h.remote.fail_next_commits(5);

    h.orchestrator.drain().await.unwrap();
    h.orchestrator.drain().await.unwrap();
    let third = h.orchestrator.drain().await.unwrap();
    let report = third.report().unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(report.needs_attention, 1);
    assert_eq!(h.remote.commit_calls(), 2);

    let stuck = h.storage.get(&id).unwrap().unwrap();
    assert_eq!(stuck.sync_attempts, 2);
    assert!(stuck.is_retry_exhausted(2));

    h.remote.fail_next_commits(0);
    let outcome = h
        .orchestrator
        .retry(id, &Principal::new("captain-2"))
        .await
        .unwrap();
    assert_eq!(outcome.report().unwrap().synced, 1);

    let events = h.remote.timeline(&id);
    assert!(events
        .iter()
        .any(|e| e.actor.as_str() == "captain-2" && e.description.contains("requeued")));
}

#[tokio::test]
async fn test_evidence_required_before_queueing() {
    let h = harness(true);
    let mut session = start_session(&h.storage, "engine-12");
    session.set_verdict("pump", Verdict::Conformant).unwrap();
    session.set_verdict("hose", Verdict::NonConformant).unwrap();
    session.set_verdict("lights", Verdict::Conformant).unwrap();

    let failed = session.finalize().unwrap_err();
    assert!(matches!(failed.error, Error::MissingEvidence { .. }));

    // The session comes back intact and can be completed.
    let mut session = *failed.session;
    session.add_attachments("hose", vec![photo("split.jpg")]).unwrap();
    let new = session.finalize().unwrap();
    h.storage.enqueue(&new).unwrap();
    assert_eq!(h.storage.count_pending().unwrap(), 1);
}

#[tokio::test]
async fn test_interrupted_session_resumes_without_photos() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    {
        let storage = Arc::new(Storage::open(&path).unwrap());
        let mut session = start_session(&storage, "engine-12");
        session.set_verdict("hose", Verdict::NonConformant).unwrap();
        session.add_attachments("hose", vec![photo("split.jpg")]).unwrap();
        // Dropped without finalize or abandon.
    }

    let storage = Arc::new(Storage::open(&path).unwrap());
    let session = start_session(&storage, "engine-12");
    assert!(session.is_restored());
    let hose = session.item("hose").unwrap();
    assert_eq!(hose.verdict(), Some(Verdict::NonConformant));
    assert!(hose.attachments().is_empty());
    assert_eq!(hose.lost_attachments(), 1);
}

#[tokio::test]
async fn test_crash_during_sync_is_recovered_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let id = {
        let storage = Arc::new(Storage::open(&path).unwrap());
        let id = submit(&storage, "engine-12");
        storage
            .update_status(&id, SubmissionStatus::Syncing, None, &Principal::system())
            .unwrap();
        id
    };

    let h = harness_with(
        Arc::new(Storage::open(&path).unwrap()),
        true,
        SyncOptions::default(),
    );
    assert_eq!(h.orchestrator.recover().await.unwrap(), vec![id]);
    // A second recovery finds nothing left to repair.
    assert!(h.orchestrator.recover().await.unwrap().is_empty());

    let stored = h.storage.get(&id).unwrap().unwrap();
    assert_eq!(stored.status, SubmissionStatus::Error);
    assert_eq!(stored.sync_attempts, 1);
    let failed_events = operations(&h.storage, &id)
        .into_iter()
        .filter(|op| *op == TimelineOperation::SyncFailed)
        .count();
    assert_eq!(failed_events, 1);

    h.orchestrator.drain().await.unwrap();
    assert!(h.remote.record(&id).is_some());
    assert!(h.storage.get(&id).unwrap().is_none());
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let h = harness(false);
    let id = submit(&h.storage, "engine-12");
    let actor = Principal::new("captain-2");

    assert!(h.orchestrator.delete(id, &actor).await.unwrap());
    assert!(!h.orchestrator.delete(id, &actor).await.unwrap());
    assert_eq!(h.orchestrator.pending_count(), 0);
    assert_eq!(
        operations(&h.storage, &id),
        vec![TimelineOperation::Created, TimelineOperation::Deleted]
    );
}

#[tokio::test]
async fn test_concurrent_drain_is_skipped() {
    let h = harness(true);
    submit(&h.storage, "engine-12");
    h.remote.set_commit_delay(Some(Duration::from_millis(200)));

    let slow = h.orchestrator.drain();
    let eager = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.orchestrator.drain().await
    };
    let (slow, eager) = tokio::join!(slow, eager);

    assert_eq!(slow.unwrap().report().unwrap().synced, 1);
    assert_eq!(
        eager.unwrap(),
        DrainOutcome::Skipped {
            reason: SkipReason::AlreadyDraining
        }
    );
    assert_eq!(h.remote.commit_calls(), 1);
}

#[tokio::test]
async fn test_second_process_leaves_live_attempt_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let watcher = harness_with(
        Arc::new(Storage::open(&path).unwrap()),
        true,
        SyncOptions::default(),
    );
    let id = submit(&watcher.storage, "engine-12");
    watcher
        .remote
        .set_commit_delay(Some(Duration::from_millis(300)));

    // A one-off `sync` with its own connection to the same file.
    let other_storage = Arc::new(Storage::open(&path).unwrap());
    let other = SyncOrchestrator::new(
        Arc::clone(&other_storage),
        Arc::clone(&watcher.remote) as Arc<dyn RemoteService>,
        Connectivity::new(true),
        SyncOptions::default(),
        Principal::system(),
    );

    let slow = watcher.orchestrator.drain();
    let second = async {
        while other_storage.get(&id).unwrap().map(|s| s.status) != Some(SubmissionStatus::Syncing)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let recovered = other.recover().await.unwrap();
        let outcome = other.drain().await.unwrap();
        (recovered, outcome)
    };
    let (slow, (recovered, outcome)) = tokio::join!(slow, second);

    assert!(recovered.is_empty());
    assert_eq!(
        outcome,
        DrainOutcome::Skipped {
            reason: SkipReason::AlreadyDraining
        }
    );
    assert_eq!(slow.unwrap().report().unwrap().synced, 1);
    assert_eq!(watcher.remote.commit_calls(), 1);
    assert_eq!(
        operations(&other_storage, &id),
        vec![
            TimelineOperation::Created,
            TimelineOperation::SyncAttempt,
            TimelineOperation::Synced,
        ]
    );

    // Once the watcher is done the other process may deliver.
    let late = submit(&other_storage, "engine-14");
    let outcome = other.drain().await.unwrap();
    assert_eq!(outcome.report().unwrap().synced, 1);
    assert!(watcher.remote.record(&late).is_some());
}

#[tokio::test]
async fn test_offline_drain_touches_nothing() {
    let h = harness(false);
    let id = submit(&h.storage, "engine-12");

    let outcome = h.orchestrator.drain().await.unwrap();
    assert_eq!(
        outcome,
        DrainOutcome::Skipped {
            reason: SkipReason::Offline
        }
    );
    assert_eq!(h.remote.upload_calls(), 0);
    assert_eq!(
        operations(&h.storage, &id),
        vec![TimelineOperation::Created]
    );
}

#[tokio::test]
async fn test_run_drains_when_connectivity_returns() {
    let h = harness(false);
    let id = submit(&h.storage, "engine-12");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = {
        let orchestrator = Arc::clone(&h.orchestrator);
        tokio::spawn(async move { orchestrator.run(shutdown_rx).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.remote.record(&id).is_none());

    h.connectivity.set_online(true);
    let mut pending = h.orchestrator.subscribe_pending();
    tokio::time::timeout(Duration::from_secs(5), pending.wait_for(|count| *count == 0))
        .await
        .unwrap()
        .unwrap();
    assert!(h.remote.record(&id).is_some());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
}
