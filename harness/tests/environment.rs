//! Test environment coordinator tests: teardown, node materialization,
//! cluster construction, and topology loading.

use std::sync::Arc;

use harness::traits::MockConfigPublisher;
use harness::{CliOptions, Collaborators, HarnessError, LifecycleState, Signal, TestEnvironment};
use serde_json::json;

mod common;
use common::{EnvironmentBuilder, StubChannel, TestFixtures};

/// Teardown stops what is still running and resets everything
#[tokio::test]
async fn test_teardown_stops_running_instances() {
    // Arrange
    let mut env = EnvironmentBuilder::new().build();
    let node = env.get_node(0).unwrap();
    let mut cluster = env.cluster(TestFixtures::KIND, json!({}), None).await.unwrap();
    let server = env.server(&node, &mut cluster, CliOptions::new()).unwrap();
    server.start().await.unwrap();

    // Act
    let report = env.finalize_test_case(false).await;

    // Assert
    assert_eq!(report.still_running.len(), 1);
    assert!(report.still_running[0].contains("jubaclassifier"));
    assert!(report.leaked_ports.is_empty());
    assert!(report.attached_logs.is_empty());
    assert_eq!(node.ports_in_use(), 0);
    assert_eq!(server.state().await, LifecycleState::Idle);
}

/// A failed test case gets the raw logs of every used instance
#[tokio::test]
async fn test_failed_case_attaches_logs_of_used_instances() {
    let channel = Arc::new(StubChannel::with_script("echo hello from stub; exec sleep 30"));
    let mut env = EnvironmentBuilder::new()
        .with_nodes(&[3])
        .with_channel(channel)
        .build();
    let node = env.get_node(0).unwrap();
    let mut cluster = env.cluster(TestFixtures::KIND, json!({}), None).await.unwrap();
    let used = env.server(&node, &mut cluster, CliOptions::new()).unwrap();
    let _unused = env.server(&node, &mut cluster, CliOptions::new()).unwrap();
    let proxy = env.proxy(&node, TestFixtures::KIND, CliOptions::new()).unwrap();

    used.start().await.unwrap();
    proxy.start().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    used.stop(Signal::SIGTERM).await.unwrap();

    let report = env.finalize_test_case(true).await;

    assert_eq!(report.still_running.len(), 1);
    assert_eq!(report.attached_logs.len(), 2);
    let server_log = &report.attached_logs[0];
    assert_eq!(server_log.kind, "server");
    assert_eq!(server_log.host, TestFixtures::HOST);
    assert_eq!(server_log.last_port, Some(TestFixtures::FIRST_PORT));
    assert!(server_log.raw.contains("hello from stub"));
    assert_eq!(report.attached_logs[1].kind, "proxy");
}

/// Leases nobody returned are reported, not escalated
#[tokio::test]
async fn test_teardown_reports_leaked_ports() {
    let mut env = EnvironmentBuilder::new().build();
    let node = env.get_node(0).unwrap();
    node.lease_port().unwrap();

    let report = env.finalize_test_case(false).await;

    assert_eq!(report.leaked_ports, vec![(0, TestFixtures::HOST.to_string(), 1)]);
    assert!(!report.is_clean());
}

#[tokio::test]
async fn test_node_beyond_topology_is_skip() {
    let mut env = EnvironmentBuilder::new().with_nodes(&[2, 2]).build();

    assert!(env.get_node(1).is_ok());
    let err = env.get_node(2).unwrap_err();
    assert!(err.is_skip());
}

/// Running out of ports skips the test instead of failing it
#[tokio::test]
async fn test_port_exhaustion_is_skip() {
    let mut env = EnvironmentBuilder::new().with_nodes(&[1]).build();
    let node = env.get_node(0).unwrap();
    let mut cluster = env.cluster(TestFixtures::KIND, json!({}), None).await.unwrap();
    let first = env.server(&node, &mut cluster, CliOptions::new()).unwrap();
    let second = env.server(&node, &mut cluster, CliOptions::new()).unwrap();
    first.start().await.unwrap();

    let err = second.start().await.unwrap_err();

    assert!(err.is_skip());
    assert_eq!(second.state().await, LifecycleState::Idle);
    env.finalize_test_case(false).await;
}

/// A failed publication aborts cluster construction
#[tokio::test]
async fn test_publish_failure_aborts_cluster() {
    let mut publisher = MockConfigPublisher::new();
    publisher
        .expect_publish()
        .times(1)
        .returning(|_, _, _, _| Err(HarnessError::fixture("jubaconfig failed: connection loss")));
    let mut env = EnvironmentBuilder::new().with_publisher(publisher).build();

    let err = env.cluster(TestFixtures::KIND, json!({}), None).await.unwrap_err();

    assert!(matches!(err, HarnessError::FixtureFailed { .. }));
    assert!(err.to_string().contains("connection loss"));
    assert!(env.instances().is_empty());
}

/// Cluster names stay unique across test classes
#[tokio::test]
async fn test_cluster_names_survive_class_teardown() {
    let mut env = EnvironmentBuilder::new().build();

    let first = env.cluster(TestFixtures::KIND, json!({}), None).await.unwrap();
    env.initialize_test_class("First");
    env.finalize_test_class("First");
    let second = env.cluster(TestFixtures::KIND, json!({}), None).await.unwrap();

    assert_eq!(first.name(), "harness-cluster--1");
    assert_eq!(second.name(), "harness-cluster--2");
}

/// A topology document on disk is enough to build an environment
#[test]
fn test_from_config_reads_topology_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("topology.json");
    std::fs::write(
        &path,
        r#"{"directives": [
            {"node": {"host": "10.0.0.1", "ports": [9199, 9200]}},
            {"node": {"host": "10.0.0.2", "ports": 9199}},
            {"ensemble": {"host": "zk1", "port": 2181}},
            {"param": {"key": "rounds", "value": 3}}
        ]}"#,
    )
    .unwrap();

    let mut env = TestEnvironment::from_config(&path, Collaborators::local()).unwrap();

    assert_eq!(env.topology().node_count(), 2);
    assert_eq!(env.get_node(1).unwrap().owned_ports(), &[9199]);
    assert_eq!(env.get_param("rounds"), Some(&json!(3)));
}

#[test]
fn test_from_config_missing_file() {
    let err = TestEnvironment::from_config("/nonexistent/topology.json", Collaborators::local()).unwrap_err();
    assert!(matches!(err, HarnessError::Shared(_)));
}
