//! End-to-end sessions: one coordinator, real agents, loopback TCP

use std::sync::Arc;
use std::time::Duration;

use syncshot_core::{AgentId, AgentOutcome, SyncError};
use syncshot_runtime::{Coordinator, CoordinatorConfig, ShutdownStage};
use syncshot_time::SystemClock;

use crate::doubles::{ArtifactStore, RecordingLauncher, ScriptedCamera, ScriptedProbe};
use crate::fleet::{FleetHarness, FleetOutcome};
use crate::rogue::RogueBehavior;

const SHORT_REPLY_TIMEOUT: Duration = Duration::from_millis(300);

fn id(n: u32) -> AgentId {
    AgentId::new(n).unwrap()
}

fn ids(ns: &[u32]) -> Vec<AgentId> {
    ns.iter().map(|n| id(*n)).collect()
}

/// A coordinator nobody will connect to within the test
async fn lonely_coordinator(launcher: Arc<RecordingLauncher>) -> Coordinator {
    let mut config = CoordinatorConfig::local_test(2);
    config.accept_timeout = Duration::from_secs(30);
    config.agent_addresses = vec!["192.168.1.1".into(), "192.168.1.2".into()];
    Coordinator::bind(config, Arc::new(SystemClock), launcher, Arc::new(ArtifactStore::new()))
        .await
        .unwrap()
}

fn outcomes_of(outcome: &FleetOutcome, round: u32) -> Vec<AgentOutcome> {
    let record = &outcome.report.history.rounds()[round as usize - 1];
    assert_eq!(record.round_index, round);
    record.outcomes.values().copied().collect()
}

// ============================================================================
// HAPPY PATH
// ============================================================================

#[tokio::test]
async fn test_three_agents_five_clean_rounds() {
    let outcome = FleetHarness::new(3).run().await.unwrap();
    let report = &outcome.report;

    assert_eq!(report.agents, ids(&[1, 2, 3]));
    assert_eq!(report.history.len(), 5);
    assert_eq!(report.history.completed(), 5);
    assert_eq!(report.abort_reason, None);
    assert_eq!(report.shutdown, ShutdownStage::Collected);
    assert!(report.anomalies.values().all(|rounds| rounds.is_empty()));
    assert_eq!(report.anomalies.len(), 3);
    assert_eq!(report.artifacts.keys().copied().collect::<Vec<_>>(), ids(&[1, 2, 3]));
    assert!(report.is_clean());

    // Rounds 4 and 5 are measured against round 3 for every pair
    assert_eq!(report.skew.len(), 3);
    for pair in &report.skew {
        assert_eq!(pair.samples.iter().map(|(r, _)| *r).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(pair.max_abs_nanos(), Some(0));
    }

    for k in 1..=3 {
        let summary = outcome.summary(k).unwrap();
        assert_eq!(summary.rounds, 5);
        assert_eq!(summary.photos_taken, 5);
        assert_eq!(summary.reference, Some(Duration::from_millis(50)));
        assert!(summary.extracted);
        assert!(!summary.breaker_tripped);

        let csv = outcome.store.pulled(id(k)).unwrap();
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.lines().nth(1).unwrap().starts_with("4,0.050000000,"));
    }

    let mut released = outcome.store.released();
    released.sort();
    assert_eq!(released, ids(&[1, 2, 3]));
}

#[tokio::test]
async fn test_ids_independent_of_arrival_order() {
    let outcome = FleetHarness::new(3)
        .connect_order(&[3, 1, 2])
        .rounds(Some(1))
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.report.agents, ids(&[1, 2, 3]));
    assert_eq!(outcome.report.history.completed(), 1);
    assert!(outcome.report.is_clean());
}

#[tokio::test]
async fn test_agents_are_launched_per_address() {
    let outcome = FleetHarness::new(2)
        .rounds(Some(1))
        .configure(|config| {
            config.agent_addresses = vec!["192.168.1.1".into(), "192.168.1.2".into()];
        })
        .run()
        .await
        .unwrap();

    assert_eq!(
        outcome.launches,
        vec![("192.168.1.1".to_string(), id(1)), ("192.168.1.2".to_string(), id(2))]
    );
}

// ============================================================================
// TIMING ANOMALIES
// ============================================================================

#[tokio::test]
async fn test_late_capture_is_flagged() {
    let outcome = FleetHarness::new(3)
        .camera(1, ScriptedCamera::default().at_round(7, Duration::from_millis(60)))
        .rounds(Some(8))
        .run()
        .await
        .unwrap();
    let report = &outcome.report;

    assert_eq!(report.history.completed(), 8);
    assert_eq!(report.abort_reason, None);
    assert_eq!(report.anomalies[&id(1)], vec![7]);
    assert!(report.anomalies[&id(2)].is_empty());
    assert!(report.anomalies[&id(3)].is_empty());
    assert!(!report.is_clean());

    // 10 ms apart in round 7 only
    let worst = syncshot_time::worst_pair(&report.skew).unwrap();
    assert_eq!(worst.max_abs_nanos(), Some(10_000_000));
    assert!(worst.a == id(1) || worst.b == id(1));

    let csv = outcome.store.pulled(id(1)).unwrap();
    assert!(csv.contains("7,0.060000000,20.0000"));
}

#[tokio::test]
async fn test_offset_clocks_shift_firing_by_their_offset() {
    const AHEAD: i64 = 15_000_000;
    const BEHIND: i64 = -5_000_000;

    let cameras: Vec<ScriptedCamera> = (0..3).map(|_| ScriptedCamera::default()).collect();
    let logs: Vec<_> = cameras.iter().map(|c| c.firing_log()).collect();
    let mut harness = FleetHarness::new(3)
        .rounds(Some(3))
        .clock_offset(2, AHEAD)
        .clock_offset(3, BEHIND);
    for (k, camera) in (1..=3).zip(cameras) {
        harness = harness.camera(k, camera);
    }
    let outcome = harness.run().await.unwrap();

    // Offsets move the shutter, not the reported capture durations
    assert!(outcome.report.is_clean());
    assert_eq!(outcome.report.history.completed(), 3);
    assert_eq!(syncshot_time::worst_pair(&outcome.report.skew).unwrap().max_abs_nanos(), Some(0));

    let offsets_of = |k: usize| -> Vec<i64> {
        logs[k - 1]
            .lock()
            .iter()
            .map(|f| f.fired_at.signed_nanos_since(f.deadline))
            .collect()
    };
    let (on_time, early, late) = (offsets_of(1), offsets_of(2), offsets_of(3));
    assert_eq!(on_time.len(), 3);
    assert_eq!(early.len(), 3);
    assert_eq!(late.len(), 3);

    // An agent never fires before its own clock reaches the deadline
    assert!(on_time.iter().all(|d| *d >= 0));
    assert!(early.iter().all(|d| *d >= -AHEAD));
    assert!(late.iter().all(|d| *d >= -BEHIND));
    for round in 0..3 {
        assert!(early[round] < late[round]);
    }
}

#[tokio::test]
async fn test_capture_failure_ends_round_loop() {
    let outcome = FleetHarness::new(3)
        .camera(3, ScriptedCamera::default().fail_at_round(4))
        .rounds(Some(10))
        .run()
        .await
        .unwrap();
    let report = &outcome.report;

    assert_eq!(report.history.len(), 4);
    assert_eq!(
        outcomes_of(&outcome, 4),
        vec![AgentOutcome::Ok, AgentOutcome::Ok, AgentOutcome::Failed]
    );
    assert!(matches!(report.abort, Some(SyncError::CaptureFailure(_))));
    assert_eq!(report.shutdown, ShutdownStage::Collected);
    assert_eq!(report.anomalies[&id(3)], vec![4]);
}

// ============================================================================
// ROUND LOOP ABORTS
// ============================================================================

#[tokio::test]
async fn test_ram_low_halts_in_that_round() {
    let outcome = FleetHarness::new(3)
        .probe(2, ScriptedProbe::exhausted_from(3))
        .rounds(Some(10))
        .run()
        .await
        .unwrap();
    let report = &outcome.report;

    assert_eq!(report.history.len(), 3);
    assert_eq!(report.history.completed(), 2);
    assert_eq!(
        outcomes_of(&outcome, 3),
        vec![AgentOutcome::Ok, AgentOutcome::Degraded, AgentOutcome::Ok]
    );
    assert_eq!(report.abort, Some(SyncError::ResourceExhaustion(id(2))));

    // STOP_RECORD still reached everyone and the results came back
    assert_eq!(report.shutdown, ShutdownStage::Collected);
    assert!(report.artifacts.contains_key(&id(1)));
    assert!(report.artifacts.contains_key(&id(3)));
    assert!(report.pull_failures.is_empty());

    let tripped = outcome.summary(2).unwrap();
    assert!(tripped.breaker_tripped);
    assert_eq!(tripped.photos_taken, 2);
    assert_eq!(outcome.summary(1).unwrap().photos_taken, 3);
    assert_eq!(outcome.summary(3).unwrap().photos_taken, 3);
}

#[tokio::test]
async fn test_silent_agent_times_out() {
    let outcome = FleetHarness::new(3)
        .rogue(2, RogueBehavior::Silent)
        .configure(|config| config.reply_timeout = SHORT_REPLY_TIMEOUT)
        .run()
        .await
        .unwrap();
    let report = &outcome.report;

    assert_eq!(report.history.len(), 1);
    assert_eq!(
        outcomes_of(&outcome, 1),
        vec![AgentOutcome::Ok, AgentOutcome::Failed, AgentOutcome::Ok]
    );
    assert_eq!(
        report.abort,
        Some(SyncError::ReplyTimeout {
            agent: id(2),
            waited: SHORT_REPLY_TIMEOUT
        })
    );
    // Agent 2 never acknowledged STOP_RECORD either
    assert_eq!(report.shutdown, ShutdownStage::TerminationFailed);
    assert!(report.artifacts.is_empty());

    for k in [1, 3] {
        let summary = outcome.summary(k).unwrap();
        assert_eq!(summary.photos_taken, 1);
        assert!(!summary.extracted);
    }
}

#[tokio::test]
async fn test_lost_connection_aborts() {
    let outcome = FleetHarness::new(3)
        .rogue(3, RogueBehavior::DisconnectAtRound(2))
        .rounds(Some(10))
        .run()
        .await
        .unwrap();
    let report = &outcome.report;

    assert_eq!(report.history.len(), 2);
    assert_eq!(report.history.completed(), 1);
    assert_eq!(report.abort, Some(SyncError::ConnectionLoss(id(3))));
    assert_eq!(report.shutdown, ShutdownStage::TerminationFailed);
}

#[tokio::test]
async fn test_wrong_reply_is_a_violation() {
    let outcome = FleetHarness::new(3)
        .rogue(2, RogueBehavior::WrongReplyAtRound(2))
        .rounds(Some(10))
        .run()
        .await
        .unwrap();
    let report = &outcome.report;

    assert_eq!(report.history.len(), 2);
    assert_eq!(
        report.abort,
        Some(SyncError::ProtocolViolation {
            agent: id(2),
            expected: "PHOTO_TAKEN",
            received: "READY".into()
        })
    );

    // The rogue still shuts down cleanly but never staged results
    assert_eq!(report.shutdown, ShutdownStage::Collected);
    assert!(report.pull_failures.contains_key(&id(2)));
    assert!(report.artifacts.contains_key(&id(1)));
}

#[tokio::test]
async fn test_operator_abort_between_rounds() {
    let outcome = FleetHarness::new(3)
        .abort_at(1, 2)
        .rounds(None)
        .run()
        .await
        .unwrap();
    let report = &outcome.report;

    assert_eq!(report.history.len(), 2);
    assert_eq!(report.history.completed(), 2);
    assert_eq!(report.abort, Some(SyncError::OperatorAbort));
    assert_eq!(report.shutdown, ShutdownStage::Collected);
    assert_eq!(report.artifacts.len(), 3);
}

#[tokio::test]
async fn test_abort_before_start_skips_assembly() {
    let launcher = Arc::new(RecordingLauncher::default());
    let coordinator = lonely_coordinator(launcher.clone()).await;
    coordinator.abort_handle().abort();

    let result = tokio::time::timeout(Duration::from_secs(1), coordinator.run())
        .await
        .expect("abort must not wait out the accept window");

    assert!(matches!(result, Err(SyncError::OperatorAbort)));
    assert!(launcher.launches().is_empty());
}

#[tokio::test]
async fn test_abort_while_assembling_fleet() {
    let launcher = Arc::new(RecordingLauncher::default());
    let coordinator = lonely_coordinator(launcher.clone()).await;
    let abort = coordinator.abort_handle();
    let session = tokio::spawn(coordinator.run());

    tokio::time::sleep(Duration::from_millis(100)).await;
    abort.abort();

    let result = tokio::time::timeout(Duration::from_secs(1), session)
        .await
        .expect("abort must not wait out the accept window")
        .unwrap();

    assert!(matches!(result, Err(SyncError::OperatorAbort)));
    assert_eq!(launcher.launches().len(), 2);
}

// ============================================================================
// SHUTDOWN
// ============================================================================

#[tokio::test]
async fn test_missing_stop_ack_is_not_masked() {
    let outcome = FleetHarness::new(3)
        .rogue(2, RogueBehavior::IgnoreStop)
        .rounds(Some(2))
        .configure(|config| config.reply_timeout = SHORT_REPLY_TIMEOUT)
        .run()
        .await
        .unwrap();
    let report = &outcome.report;

    assert_eq!(report.history.completed(), 2);
    assert_eq!(
        report.abort,
        Some(SyncError::ReplyTimeout {
            agent: id(2),
            waited: SHORT_REPLY_TIMEOUT
        })
    );
    assert_eq!(report.shutdown, ShutdownStage::TerminationFailed);
    assert!(report.anomalies.is_empty());
    assert!(report.artifacts.is_empty());
    assert!(outcome.store.pulled_agents().is_empty());
}

#[tokio::test]
async fn test_failed_pull_still_releases_agent() {
    let harness = FleetHarness::new(3).rounds(Some(1));
    harness.store().make_unreachable(id(2));
    let outcome = harness.run().await.unwrap();
    let report = &outcome.report;

    assert_eq!(report.shutdown, ShutdownStage::Collected);
    assert_eq!(report.pull_failures.keys().copied().collect::<Vec<_>>(), ids(&[2]));
    assert_eq!(report.artifacts.keys().copied().collect::<Vec<_>>(), ids(&[1, 3]));
    assert!(!report.is_clean());

    // EXTRACTION_COMPLETE went out regardless
    assert!(outcome.summary(2).unwrap().extracted);
}

#[tokio::test]
async fn test_incomplete_fleet_never_starts() {
    let result = FleetHarness::new(3)
        .rogue(3, RogueBehavior::Silent)
        .configure(|config| {
            config.agent_count = 4;
            config.accept_timeout = Duration::from_millis(300);
        })
        .run()
        .await;

    assert!(matches!(
        result,
        Err(SyncError::AcceptTimeout {
            accepted: 3,
            expected: 4
        })
    ));
}
