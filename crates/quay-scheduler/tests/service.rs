use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::time::Duration;

use quay_events::{Event, EventBus, TransferState};
use quay_scheduler::{
    AddMode, DiskProbe, DiskSpacePolicy, QueuePolicy, Scheduler, SchedulerError,
    SchedulerService, StartOutcome, WaitOutcome,
};
use quay_test_support::fixtures::{Harness, download, info_hash, policy};
use quay_test_support::mocks::RecordingBackend;
use serde_json::json;
use tokio_stream::StreamExt;

#[tokio::test]
async fn commands_are_applied_and_published() {
    let harness = Harness::new(policy(1, 1));
    let handle = SchedulerService::spawn(harness.scheduler);

    let state = handle
        .add(download(1, 0), AddMode::Queue)
        .await
        .expect("add");
    assert_eq!(state, TransferState::Downloading);
    let state = handle
        .add(download(2, 0), AddMode::Queue)
        .await
        .expect("add");
    assert_eq!(state, TransferState::Queued);

    let snapshot = handle.snapshot().await;
    assert_eq!(snapshot.counts.running_downloads, 1);
    assert_eq!(snapshot.counts.queued, 1);
    assert_eq!(snapshot.transfers.len(), 2);

    let mutation = handle
        .apply_policy_patch(json!({ "max_downloads": 2 }))
        .await
        .expect("patch");
    assert!(mutation.mutated);
    assert_eq!(handle.snapshot().await.counts.running_downloads, 2);
}

#[tokio::test]
async fn rejected_patch_surfaces_config_error() {
    let handle = SchedulerService::spawn(Harness::new(policy(1, 1)).scheduler);
    let err = handle
        .apply_policy_patch(json!({ "max_uploads": 2 }))
        .await
        .expect_err("unknown field");
    assert!(matches!(err, SchedulerError::Config { .. }));
}

#[tokio::test]
async fn unknown_transfer_is_reported() {
    let handle = SchedulerService::spawn(Harness::new(policy(1, 1)).scheduler);
    let err = handle
        .start(info_hash(7), true)
        .await
        .expect_err("unknown transfer");
    assert!(matches!(err, SchedulerError::NotFound { .. }));
}

#[tokio::test]
async fn shutdown_settles_and_stops_the_service() {
    let harness = Harness::new(policy(2, 2));
    let handle = SchedulerService::spawn(harness.scheduler);
    handle
        .add(download(1, 0), AddMode::Start)
        .await
        .expect("add");

    let outcome = handle
        .shutdown(Some(Duration::from_secs(1)))
        .await
        .expect("shutdown");
    assert_eq!(outcome, WaitOutcome::AllCompleted);
    assert_eq!(harness.backend.stops(), vec![info_hash(1)]);

    assert!(matches!(
        handle.set_paused(true).await,
        Err(SchedulerError::ServiceStopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn periodic_checks_run_on_the_timer() {
    let harness = Harness::new(QueuePolicy {
        disk: DiskSpacePolicy {
            enabled: true,
            min_free_bytes: 1024,
        },
        check_interval_secs: 5,
        ..policy(2, 2)
    });
    let disk = harness.disk.clone();
    let handle = SchedulerService::spawn(harness.scheduler);
    handle
        .add(download(1, 0), AddMode::Start)
        .await
        .expect("add");
    disk.set_free(0);

    tokio::time::sleep(Duration::from_secs(6)).await;

    let snapshot = handle.snapshot().await;
    assert_eq!(snapshot.transfers[0].state, TransferState::Stopped);
    assert_eq!(snapshot.counts.running_downloads, 0);
}

#[tokio::test]
async fn pause_is_visible_in_snapshots() {
    let handle = SchedulerService::spawn(Harness::new(policy(2, 2)).scheduler);
    handle.set_paused(true).await.expect("pause");
    assert!(handle.snapshot().await.paused);
    handle.set_paused(false).await.expect("resume");
    assert!(!handle.snapshot().await.paused);
}

#[tokio::test]
async fn handle_exposes_the_event_stream() {
    let handle = SchedulerService::spawn(Harness::new(policy(1, 1)).scheduler);
    let mut stream = handle.events().subscribe(None);
    handle
        .add(download(1, 0), AddMode::Stopped)
        .await
        .expect("add");

    let envelope = stream
        .next()
        .await
        .expect("stream open")
        .expect("not lagged");
    assert_eq!(
        envelope.event,
        Event::TransferAdded {
            info_hash: info_hash(1),
            name: "t1".to_string(),
        }
    );
}

/// Disk probe that blocks until the test releases it.
struct GatedProbe {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl DiskProbe for GatedProbe {
    fn free_space(&self, _: &Path) -> io::Result<u64> {
        let _ = self
            .entered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(());
        let _ = self
            .release
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        Ok(u64::MAX)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshots_stay_readable_while_a_disk_probe_blocks() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let probe = GatedProbe {
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    };
    let scheduler = Scheduler::new(
        policy(1, 1),
        EventBus::new(),
        Arc::new(RecordingBackend::new()),
        Arc::new(probe),
    );
    let handle = SchedulerService::spawn(scheduler);
    handle
        .add(download(1, 0), AddMode::Stopped)
        .await
        .expect("add");

    let starter = handle.clone();
    let start = tokio::spawn(async move { starter.start(info_hash(1), true).await });
    tokio::task::spawn_blocking(move || entered_rx.recv())
        .await
        .expect("join")
        .expect("probe entered");

    let snapshot = handle.snapshot().await;
    assert_eq!(snapshot.counts.running_downloads, 0);
    assert!(!start.is_finished());

    release_tx.send(()).expect("release probe");
    let outcome = start.await.expect("join").expect("start");
    assert_eq!(outcome, StartOutcome::Started);
}
