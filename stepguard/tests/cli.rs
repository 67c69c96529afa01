//! Black-box tests of the `stepguard` binary against an in-process node.

use std::process::Command;

use stepguard_common::protocol::{CurrentOpReply, ReplSetStatus};
use stepguard_common::scenario::ScenarioReport;
use stepguard_common::testing::init_test_logging;
use stepguard_common::test_log;
use stepguardd::{NodeConfig, RunningNode, spawn_node};

const BIN: &str = env!("CARGO_BIN_EXE_stepguard");

async fn stepguard(node: &RunningNode, args: &[&str]) -> std::process::Output {
    tokio::process::Command::new(BIN)
        .arg("--endpoint")
        .arg(node.addr().to_string())
        .args(args)
        .env_remove("STEPGUARD_ENDPOINT")
        .env("NO_COLOR", "1")
        .output()
        .await
        .expect("failed to run stepguard")
}

#[test]
fn test_help_lists_subcommands() {
    init_test_logging();
    test_log!("test_help_lists_subcommands", "TEST START");

    let output = Command::new(BIN)
        .arg("--help")
        .output()
        .expect("Failed to run stepguard --help");
    assert!(output.status.success(), "stepguard --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    for sub in ["run", "fail-point", "current-op", "status", "log", "step-up"] {
        assert!(stdout.contains(sub), "missing {sub} in help: {stdout}");
    }

    test_log!("test_help_lists_subcommands", "TEST PASS");
}

#[test]
fn test_invalid_fail_point_mode_is_usage_error() {
    let output = Command::new(BIN)
        .args(["fail-point", "waitInFindBeforeMakingBatch", "sometimes"])
        .output()
        .expect("Failed to run stepguard");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown fail point mode"), "stderr: {stderr}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_json_report_passes() {
    init_test_logging();
    test_log!("test_run_json_report_passes", "TEST START");

    let node = spawn_node(NodeConfig::ephemeral()).await.unwrap();
    let output = stepguard(&node, &["--json", "run"]).await;
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "run failed: {stdout}\n{}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report: ScenarioReport = serde_json::from_str(&stdout).unwrap();
    assert!(report.passed());
    assert_eq!(report.actors.len(), 3);

    test_log!("test_run_json_report_passes", "TEST PASS");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_with_kept_fail_points_exits_nonzero() {
    init_test_logging();
    let node = spawn_node(NodeConfig::ephemeral()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("stepguard.toml");
    std::fs::write(
        &config,
        "[timeouts]\njoin_timeout = \"300ms\"\npoll_interval = \"20ms\"\n",
    )
    .unwrap();

    let output = stepguard(
        &node,
        &["--config", config.to_str().unwrap(), "run", "--keep-fail-points"],
    )
    .await;
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("FAIL"), "stdout: {stdout}");
    assert!(stdout.contains("in Drained"), "stdout: {stdout}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admin_subcommands() {
    init_test_logging();
    let node = spawn_node(NodeConfig::ephemeral()).await.unwrap();

    let output = stepguard(&node, &["--json", "status"]).await;
    assert!(output.status.success());
    let status: ReplSetStatus = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status.members.len(), 2);

    let output = stepguard(&node, &["fail-point", "waitInFindBeforeMakingBatch", "times:1"]).await;
    assert!(output.status.success());
    let output = stepguard(&node, &["fail-point", "noSuchFailPoint", "off"]).await;
    assert_eq!(output.status.code(), Some(1));

    let output = stepguard(&node, &["--json", "current-op", "--ns", "test.coll"]).await;
    assert!(output.status.success());
    let ops: CurrentOpReply = serde_json::from_slice(&output.stdout).unwrap();
    assert!(ops.inprog.is_empty());

    let output = stepguard(&node, &["log", "--since", "0"]).await;
    assert!(String::from_utf8_lossy(&output.stdout).contains("transition to PRIMARY from STARTUP"));

    let output = stepguard(&node, &["step-up"]).await;
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("PRIMARY"));
}
