//! Process supervision against the real echo node

use std::time::{Duration, Instant};

use nodehub::config::SupervisorConfig;
use nodehub::{DispatchError, NodeState, SupervisorError, SupervisorStats};
use serde_json::json;

mod common;
use common::{EchoNode, GRACE, Harness, SETTLE, params, send_signal, wait_for_state};

/// Scheduling slack allowed on top of the shutdown ladder
const SLACK: Duration = Duration::from_millis(750);

#[tokio::test]
async fn launch_then_graceful_shutdown() {
    let harness = Harness::new(&[EchoNode::new("echo")]);
    let supervisor = &harness.supervisor;

    let node = supervisor.launch_id("echo").await.unwrap();
    assert_eq!(node.state, NodeState::Running);
    assert_eq!(node.descriptor_id, "echo");
    assert!(node.pid > 0);
    assert_eq!(node.socket_path, harness.socket_path("echo"));
    assert!(node.socket_path.exists());

    let started = Instant::now();
    let stopped = supervisor.shutdown("echo", GRACE).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(stopped.state, NodeState::Stopped);
    assert_eq!(stopped.exit.and_then(|e| e.code), Some(0));
    assert!(elapsed < GRACE + SLACK, "cooperative shutdown took {elapsed:?}");
    assert!(!harness.socket_path("echo").exists());
    assert!(supervisor.get("echo").is_none());
}

#[tokio::test]
async fn ignored_shutdown_request_falls_back_to_sigterm() {
    let harness = Harness::new(&[EchoNode::new("stubborn").args(&["--ignore-shutdown"])]);
    let supervisor = &harness.supervisor;
    supervisor.launch_id("stubborn").await.unwrap();

    let started = Instant::now();
    let stopped = supervisor.shutdown("stubborn", GRACE).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(stopped.state, NodeState::Stopped);
    // The echo node exits cleanly on SIGTERM
    assert_eq!(stopped.exit.and_then(|e| e.code), Some(0));
    assert!(elapsed >= GRACE, "stopped before the grace period: {elapsed:?}");
    assert!(elapsed < GRACE * 2 + SLACK, "forced shutdown took {elapsed:?}");
    assert!(!harness.socket_path("stubborn").exists());
}

#[tokio::test]
async fn ignored_sigterm_ends_in_sigkill() {
    let immortal = EchoNode::new("immortal").args(&["--ignore-shutdown", "--ignore-sigterm"]);
    let harness = Harness::new(&[immortal]);
    let supervisor = &harness.supervisor;
    supervisor.launch_id("immortal").await.unwrap();

    let started = Instant::now();
    let stopped = supervisor.shutdown("immortal", GRACE).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(stopped.state, NodeState::Stopped);
    assert_eq!(stopped.exit.and_then(|e| e.signal), Some(libc::SIGKILL));
    assert!(elapsed < GRACE * 2 + SLACK, "forced shutdown took {elapsed:?}");
    assert!(!harness.socket_path("immortal").exists());
}

#[tokio::test]
async fn out_of_band_kill_is_detected() {
    let harness = Harness::new(&[EchoNode::new("victim")]);
    let supervisor = &harness.supervisor;
    let node = supervisor.launch_id("victim").await.unwrap();

    send_signal(node.pid, "KILL");

    assert!(wait_for_state(supervisor, "victim", NodeState::Crashed, SETTLE).await);
    let crashed = supervisor.get("victim").unwrap();
    assert_eq!(crashed.exit.and_then(|e| e.signal), Some(libc::SIGKILL));
    assert!(crashed.last_error.is_some());
    assert!(!harness.socket_path("victim").exists());

    let err = harness
        .dispatcher()
        .execute("victim", nodehub::Params::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::NodeNotRunning {
            state: Some(NodeState::Crashed),
            ..
        }
    ));

    // Crashed entries are cleaned up without signalling
    let stopped = supervisor.shutdown("victim", GRACE).await.unwrap();
    assert_eq!(stopped.state, NodeState::Stopped);
    assert!(supervisor.get("victim").is_none());
}

#[tokio::test]
async fn node_that_never_binds_times_out() {
    let mute = EchoNode::new("mute").args(&["--no-bind"]).startup_timeout_ms(300);
    let harness = Harness::new(&[mute]);
    let supervisor = &harness.supervisor;

    let started = Instant::now();
    let err = supervisor.launch_id("mute").await.unwrap_err();
    let SupervisorError::StartupTimeout { timeout, .. } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(timeout, Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(3));

    let node = supervisor.get("mute").unwrap();
    assert_eq!(node.state, NodeState::Crashed);

    // The lingering process is killed
    let deadline = Instant::now() + SETTLE;
    while supervisor.get("mute").and_then(|n| n.exit).is_none() {
        assert!(Instant::now() < deadline, "process was not killed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(supervisor.get("mute").unwrap().state, NodeState::Crashed);
}

#[tokio::test]
async fn exit_during_startup_reports_code() {
    let harness = Harness::new(&[EchoNode::new("quitter").args(&["--exit-code", "7"])]);

    let err = harness.supervisor.launch_id("quitter").await.unwrap_err();
    let SupervisorError::ExitedDuringStartup { node_id, exit } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(node_id, "quitter");
    assert_eq!(exit.code, Some(7));
    assert_eq!(
        harness.supervisor.get("quitter").unwrap().state,
        NodeState::Crashed
    );
}

#[tokio::test]
async fn second_launch_is_rejected() {
    let harness = Harness::new(&[EchoNode::new("solo")]);
    let supervisor = &harness.supervisor;
    let first = supervisor.launch_id("solo").await.unwrap();

    let err = supervisor.launch_id("solo").await.unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::AlreadyRunning {
            state: NodeState::Running,
            ..
        }
    ));
    assert_eq!(supervisor.get("solo").unwrap().pid, first.pid);

    supervisor.shutdown("solo", GRACE).await.unwrap();
}

#[tokio::test]
async fn relaunch_after_crash_is_allowed() {
    let harness = Harness::new(&[EchoNode::new("phoenix")]);
    let supervisor = &harness.supervisor;
    let first = supervisor.launch_id("phoenix").await.unwrap();

    send_signal(first.pid, "KILL");
    assert!(wait_for_state(supervisor, "phoenix", NodeState::Crashed, SETTLE).await);

    let second = supervisor.launch_id("phoenix").await.unwrap();
    assert_eq!(second.state, NodeState::Running);
    assert_ne!(second.pid, first.pid);
    assert_eq!(second.restart_count, 1);

    supervisor.shutdown("phoenix", GRACE).await.unwrap();
}

/// Declare a node crashed, relaunch it at once, and check that the old
/// process's teardown leaves the new socket alone
async fn relaunch_after_declared_crash(args: &[&str]) {
    let harness = Harness::new(&[EchoNode::new("phoenix").args(args)]);
    let supervisor = &harness.supervisor;
    let first = supervisor.launch_id("phoenix").await.unwrap();

    assert!(supervisor.mark_crashed("phoenix", "declared dead by test"));
    let second = supervisor.launch_id("phoenix").await.unwrap();
    assert_ne!(second.pid, first.pid);
    assert_eq!(second.state, NodeState::Running);

    // Longer than the old process's SIGTERM/SIGKILL ladder
    tokio::time::sleep(GRACE + Duration::from_millis(300)).await;
    assert!(harness.socket_path("phoenix").exists());
    assert_eq!(supervisor.get("phoenix").unwrap().state, NodeState::Running);

    let result = harness
        .dispatcher()
        .execute("phoenix", params(json!({"again": true})))
        .await
        .unwrap();
    assert_eq!(result, json!({"again": true}));

    supervisor.shutdown("phoenix", GRACE).await.unwrap();
}

#[tokio::test]
async fn relaunch_waits_for_crashed_process_killed_by_sigkill() {
    relaunch_after_declared_crash(&["--ignore-sigterm"]).await;
}

#[tokio::test]
async fn relaunch_waits_for_crashed_process_exiting_on_sigterm() {
    relaunch_after_declared_crash(&[]).await;
}

#[tokio::test]
async fn socket_path_owned_by_another_node_is_refused() {
    // `{runtime_dir}/../run` is the runtime dir itself, which the registry
    // can't see at load time
    let harness = Harness::new(&[
        EchoNode::new("first").socket_template("{runtime_dir}/shared.sock"),
        EchoNode::new("second").socket_template("{runtime_dir}/../run/shared.sock"),
    ]);
    let supervisor = &harness.supervisor;
    supervisor.launch_id("first").await.unwrap();

    let err = supervisor.launch_id("second").await.unwrap_err();
    let SupervisorError::SocketPathInUse { owner, path, .. } = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(owner, "first");
    assert_eq!(path, harness.runtime_dir.join("shared.sock"));
    assert!(supervisor.get("second").is_none());

    // The first node keeps its socket
    assert!(harness.dispatcher().info("first").await.is_ok());

    supervisor.shutdown("first", GRACE).await.unwrap();
    let second = supervisor.launch_id("second").await.unwrap();
    assert_eq!(second.state, NodeState::Running);
    supervisor.shutdown("second", GRACE).await.unwrap();
}

#[tokio::test]
async fn stats_count_lifecycle_events() {
    let harness = Harness::new(&[EchoNode::new("counted")]);
    let supervisor = &harness.supervisor;
    assert_eq!(supervisor.stats(), SupervisorStats::default());

    let first = supervisor.launch_id("counted").await.unwrap();
    assert_eq!(first.restart_count, 0);
    assert_eq!(supervisor.stats().live, 1);

    send_signal(first.pid, "KILL");
    assert!(wait_for_state(supervisor, "counted", NodeState::Crashed, SETTLE).await);

    let second = supervisor.restart("counted", GRACE).await.unwrap();
    assert_eq!(second.restart_count, 1);
    supervisor.shutdown("counted", GRACE).await.unwrap();

    assert_eq!(
        supervisor.stats(),
        SupervisorStats {
            total_started: 2,
            total_crashed: 1,
            total_restarts: 1,
            // Shutting down the crashed entry counts too
            total_stopped: 2,
            live: 0,
        }
    );
}

#[tokio::test]
async fn restart_replaces_the_process() {
    let harness = Harness::new(&[EchoNode::new("cycle")]);
    let supervisor = &harness.supervisor;
    let first = supervisor.launch_id("cycle").await.unwrap();

    let second = supervisor.restart("cycle", GRACE).await.unwrap();
    assert_eq!(second.state, NodeState::Running);
    assert_ne!(second.pid, first.pid);
    assert_eq!(second.restart_count, 1);
    assert!(harness.socket_path("cycle").exists());

    supervisor.shutdown("cycle", GRACE).await.unwrap();
}

#[tokio::test]
async fn launch_all_and_shutdown_all() {
    let harness = Harness::with_config(
        &[EchoNode::new("alpha"), EchoNode::new("beta")],
        SupervisorConfig {
            startup_timeout: Duration::from_secs(10),
            shutdown_grace: GRACE,
        },
    );
    let supervisor = &harness.supervisor;

    let launched = supervisor.launch_all().await;
    assert_eq!(launched.len(), 2);
    assert!(launched.iter().all(|(_, result)| result.is_ok()));

    let ids: Vec<String> = supervisor
        .list()
        .into_iter()
        .map(|node| node.descriptor_id)
        .collect();
    assert_eq!(ids, ["alpha", "beta"]);

    let stopped = supervisor.shutdown_all(GRACE).await;
    for (node_id, result) in stopped {
        let node = result.unwrap();
        assert_eq!(node.state, NodeState::Stopped, "{node_id}");
    }
    assert!(supervisor.list().is_empty());
}
