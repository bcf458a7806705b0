use std::time::Duration;

use quay_events::TransferState;
use quay_scheduler::{BarrierToken, ShutdownBarrier, WaitOutcome};
use quay_test_support::fixtures::{Harness, download, info_hash, policy};
use quay_test_support::mocks::{BackendCall, RecordingBackend};
use quay_transfer_core::TrackerTier;

fn running_pair(harness: &mut Harness) {
    for id in 1..=2 {
        harness.scheduler.append(download(id, 0)).expect("append");
        harness.scheduler.start(&info_hash(id), true).expect("start");
    }
    let added = harness
        .scheduler
        .merge_announce_list(
            &info_hash(1),
            &TrackerTier::new(["udp://backup.test:6969", "udp://tracker.t1.test:6969"]),
        )
        .expect("merge");
    assert_eq!(added, 1);
}

#[tokio::test]
async fn exit_waits_for_every_stopped_announce() {
    let mut harness = Harness::with_backend(policy(3, 3), RecordingBackend::holding_announces());
    running_pair(&mut harness);
    harness.scheduler.append(download(3, 0)).expect("idle transfer");

    let barrier = ShutdownBarrier::new();
    assert_eq!(harness.scheduler.on_exit(&barrier), 3);
    assert_eq!(barrier.pending(), 3);
    assert!(
        harness
            .scheduler
            .iter()
            .all(|transfer| transfer.state() == TransferState::Stopped)
    );
    let announced: Vec<BarrierToken> = harness
        .backend
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            BackendCall::AnnounceStopped(token) => Some(token),
            _ => None,
        })
        .collect();
    assert_eq!(announced.len(), 3);
    assert!(announced.iter().all(|token| token.info_hash != info_hash(3)));

    let waiter = {
        let barrier = barrier.clone();
        tokio::spawn(async move { barrier.wait(Duration::from_secs(5)).await })
    };
    assert_eq!(harness.backend.settle_announces(), 3);
    assert_eq!(waiter.await.expect("join"), WaitOutcome::AllCompleted);
}

#[tokio::test(start_paused = true)]
async fn exit_wait_is_bounded_by_the_timeout() {
    let mut harness = Harness::with_backend(policy(3, 3), RecordingBackend::holding_announces());
    running_pair(&mut harness);

    let barrier = ShutdownBarrier::new();
    harness.scheduler.on_exit(&barrier);
    assert_eq!(
        barrier.wait(Duration::from_millis(3_000)).await,
        WaitOutcome::TimedOut
    );
    assert_eq!(barrier.pending(), 3);
}

#[test]
fn admission_stays_off_after_exit() {
    let mut harness = Harness::new(policy(3, 3));
    harness.scheduler.append(download(1, 0)).expect("append");
    harness.scheduler.on_exit(&ShutdownBarrier::new());
    harness.scheduler.queue(&info_hash(1)).expect("queue");
    assert_eq!(harness.scheduler.start_next().started, 0);
    assert!(harness.backend.starts().is_empty());
}
