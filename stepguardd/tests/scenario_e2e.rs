//! End-to-end runs of the step-down scenario against an in-process node.

use std::time::Duration;

use serde_json::json;
use stepguard_common::errors::ErrorCode;
use stepguard_common::testing::init_test_logging;
use stepguard_common::{
    Connection, Endpoint, HarnessError, MemberState, Namespace, PollPolicy, ReadOpsDuringStepDown,
    ScenarioConfig, ScenarioPhase, ServerErrorCode, WriteConcern, test_log,
};
use stepguardd::{NodeConfig, RunningNode, spawn_node};

async fn start(config: NodeConfig) -> RunningNode {
    spawn_node(config).await.expect("node should bind an ephemeral port")
}

fn scenario_config(node: &RunningNode) -> ScenarioConfig {
    let mut cfg = ScenarioConfig::new(
        Endpoint::from(node.addr()),
        Namespace::new("test", "coll"),
    );
    cfg.poll = PollPolicy::new(Duration::from_secs(10), Duration::from_millis(20));
    cfg.join_timeout = Duration::from_secs(10);
    cfg
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_survive_step_down() {
    init_test_logging();
    test_log!("test_reads_survive_step_down", "TEST START");

    let node = start(NodeConfig::ephemeral()).await;
    let report = ReadOpsDuringStepDown::new(scenario_config(&node))
        .run()
        .await
        .unwrap_or_else(|failure| panic!("scenario failed: {failure}\n{:#?}", failure.report));

    assert!(report.passed());
    assert_eq!(report.phase(), Some(ScenarioPhase::Verified));
    let entered: Vec<ScenarioPhase> = report.phases.iter().map(|p| p.phase).collect();
    assert!(entered.windows(2).all(|w| w[0] < w[1]), "phases out of order: {entered:?}");

    let marker = report.marker.as_ref().expect("marker recorded");
    assert!(report.parked_at.is_some_and(|parked| marker.seq >= parked));
    assert_eq!(report.actors.len(), 3);
    assert!(report.fail_points.is_empty());
    assert!(report.teardown_errors.is_empty());
    assert_eq!(node.node().role(), MemberState::Secondary);

    test_log!("test_reads_survive_step_down", "TEST PASS");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreleased_fail_points_time_out_join() {
    init_test_logging();
    test_log!("test_unreleased_fail_points_time_out_join", "TEST START");

    let node = start(NodeConfig::ephemeral()).await;
    let mut cfg = scenario_config(&node);
    cfg.release_fail_points = false;
    cfg.join_timeout = Duration::from_millis(500);

    let failure = ReadOpsDuringStepDown::new(cfg).run().await.unwrap_err();
    assert_eq!(failure.phase, ScenarioPhase::Drained);
    assert!(
        matches!(failure.source, HarnessError::JoinTimeout { ref actor, .. } if actor == "getMore"),
        "unexpected error: {}",
        failure.source
    );
    assert_eq!(failure.report.fail_points.len(), 2);
    assert!(failure.report.teardown_errors.is_empty());

    // Teardown released the fail points, so the step-down can complete.
    let mut role = node.node().subscribe_role();
    tokio::time::timeout(
        Duration::from_secs(10),
        role.wait_for(|r| *r == MemberState::Secondary),
    )
    .await
    .expect("step-down should finish once fail points are off")
    .expect("node alive");

    test_log!("test_unreleased_fail_points_time_out_join", "TEST PASS");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interrupting_reads_fails_the_scenario() {
    init_test_logging();
    test_log!("test_interrupting_reads_fails_the_scenario", "TEST START");

    let node = start(NodeConfig {
        interrupt_reads_on_step_down: true,
        ..NodeConfig::ephemeral()
    })
    .await;

    let failure = ReadOpsDuringStepDown::new(scenario_config(&node))
        .run()
        .await
        .unwrap_err();
    assert_eq!(failure.phase, ScenarioPhase::Drained);
    assert!(matches!(failure.source, HarnessError::ActorFailure { .. }));
    assert_eq!(
        failure.source.server_code(),
        Some(ServerErrorCode::InterruptedDueToReplStateChange)
    );
    assert_eq!(failure.source.root_cause().code(), ErrorCode::CommandRejected);

    test_log!("test_interrupting_reads_fails_the_scenario", "TEST PASS");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_fail_point_is_reported_by_actor() {
    init_test_logging();
    test_log!("test_unknown_fail_point_is_reported_by_actor", "TEST START");

    let node = start(NodeConfig::ephemeral()).await;
    let mut cfg = scenario_config(&node);
    cfg.get_more_fail_point = "noSuchFailPoint".to_string();

    let failure = ReadOpsDuringStepDown::new(cfg).run().await.unwrap_err();
    assert_eq!(failure.phase, ScenarioPhase::ActorsBlocked);
    assert!(
        matches!(
            failure.source.root_cause(),
            HarnessError::AdminCommandFailed { command: "configureFailPoint", .. }
        ),
        "unexpected error: {}",
        failure.source
    );
    assert_eq!(failure.source.server_code(), Some(ServerErrorCode::BadValue));
    // Releasing the unknown name during teardown is rejected again.
    assert_eq!(failure.report.teardown_errors.len(), 1);
    assert_eq!(node.node().role(), MemberState::Primary);

    test_log!("test_unknown_fail_point_is_reported_by_actor", "TEST PASS");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handle_opened_before_step_down_matches_fresh_read() {
    init_test_logging();
    test_log!("test_handle_opened_before_step_down_matches_fresh_read", "TEST START");

    let node = start(NodeConfig::ephemeral()).await;
    let ns = Namespace::new("test", "equiv");
    let mut conn = Connection::new(Endpoint::from(node.addr()));
    let docs = vec![json!({"_id": 0, "v": "a"}), json!({"_id": 1, "v": "b"})];
    conn.insert(&ns, docs.clone(), Some(WriteConcern::majority()))
        .await
        .unwrap();

    let handle = conn.find(&ns, None, Some(0)).await.unwrap();
    assert!(handle.batch.is_empty());
    let before = conn.find(&ns, None, None).await.unwrap().batch;

    conn.run_command(stepguard_common::Command::ReplSetStepDown {
        step_down_secs: 100,
        force: true,
    })
    .await
    .unwrap();
    assert_eq!(conn.hello().await.unwrap().state, MemberState::Secondary);

    let resumed = conn.get_more(&ns, handle.id, None).await.unwrap();
    assert!(resumed.id.is_exhausted());
    assert_eq!(resumed.batch, before);
    assert_eq!(resumed.batch, docs);

    let err = conn.find(&ns, None, None).await.unwrap_err();
    assert_eq!(err.server_code(), Some(ServerErrorCode::NotPrimaryNoSecondaryOk));

    test_log!("test_handle_opened_before_step_down_matches_fresh_read", "TEST PASS");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_closing_connections_on_step_down_keeps_scenario_passing() {
    init_test_logging();
    test_log!("test_closing_connections_on_step_down_keeps_scenario_passing", "TEST START");

    let node = start(NodeConfig {
        close_connections_on_step_down: true,
        ..NodeConfig::ephemeral()
    })
    .await;
    let mut idle = Connection::connect(Endpoint::from(node.addr())).await.unwrap();
    idle.ping().await.unwrap();

    let report = ReadOpsDuringStepDown::new(scenario_config(&node))
        .run()
        .await
        .unwrap_or_else(|failure| panic!("scenario failed: {failure}"));
    assert!(report.passed());

    // The connection idle during the transition was closed by the node.
    let err = idle.ping().await.unwrap_err();
    assert!(err.is_transient(), "unexpected error: {err}");
    // A new connection works.
    idle.ping().await.unwrap();

    test_log!("test_closing_connections_on_step_down_keeps_scenario_passing", "TEST PASS");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_replication_fails_seeding_within_poll_timeout() {
    init_test_logging();
    test_log!("test_stalled_replication_fails_seeding_within_poll_timeout", "TEST START");

    let node = start(NodeConfig {
        replication_lag: Duration::from_secs(3600),
        ..NodeConfig::ephemeral()
    })
    .await;
    let mut cfg = scenario_config(&node);
    cfg.poll = PollPolicy::new(Duration::from_millis(500), Duration::from_millis(20));
    cfg.join_timeout = Duration::from_millis(500);

    let failure = tokio::time::timeout(Duration::from_secs(5), ReadOpsDuringStepDown::new(cfg).run())
        .await
        .expect("seeding must give up once the write concern times out")
        .unwrap_err();
    assert_eq!(failure.phase, ScenarioPhase::Seeding);
    assert_eq!(
        failure.source.server_code(),
        Some(ServerErrorCode::WriteConcernFailed),
        "unexpected error: {}",
        failure.source
    );
    assert_eq!(failure.source.code(), ErrorCode::CommandRejected);
    assert!(failure.report.actors.is_empty());
    assert_eq!(node.node().role(), MemberState::Primary);

    test_log!("test_stalled_replication_fails_seeding_within_poll_timeout", "TEST PASS");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_marker_logged_before_parking_is_ordering_violation() {
    init_test_logging();
    test_log!("test_marker_logged_before_parking_is_ordering_violation", "TEST START");

    let node = start(NodeConfig::ephemeral()).await;
    let mut conn = Connection::new(Endpoint::from(node.addr()));
    // An earlier transition leaves its marker in the log.
    conn.run_command(stepguard_common::Command::ReplSetStepDown {
        step_down_secs: 100,
        force: true,
    })
    .await
    .unwrap();
    conn.step_up().await.unwrap();
    assert_eq!(node.node().role(), MemberState::Primary);

    let mut cfg = scenario_config(&node);
    cfg.marker_since = Some(0);
    let failure = ReadOpsDuringStepDown::new(cfg).run().await.unwrap_err();
    assert_eq!(failure.phase, ScenarioPhase::TransitionObserved);
    let HarnessError::OrderingViolation {
        marker_seq,
        parked_at,
        ..
    } = failure.source
    else {
        panic!("unexpected error: {}", failure.source);
    };
    assert!(marker_seq < parked_at);
    assert_eq!(failure.report.parked_at, Some(parked_at));
    assert_eq!(failure.report.marker.as_ref().map(|m| m.seq), Some(marker_seq));
    assert!(failure.report.teardown_errors.is_empty());

    test_log!("test_marker_logged_before_parking_is_ordering_violation", "TEST PASS");
}

#[tokio::test]
async fn test_unreachable_node_fails_in_seeding() {
    init_test_logging();
    // Bind and drop to obtain a port nobody listens on.
    let node = start(NodeConfig::ephemeral()).await;
    let addr = node.addr();
    node.shutdown().await;

    let mut cfg = ScenarioConfig::new(Endpoint::from(addr), Namespace::new("test", "coll"));
    cfg.poll = PollPolicy::new(Duration::from_millis(200), Duration::from_millis(20));
    cfg.connect_timeout = Duration::from_millis(200);
    let failure = ReadOpsDuringStepDown::new(cfg).run().await.unwrap_err();
    assert_eq!(failure.phase, ScenarioPhase::Seeding);
    assert_eq!(failure.source.code(), ErrorCode::ConnectFailed);
}
