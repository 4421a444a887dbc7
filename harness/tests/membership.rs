//! Membership convergence tests
//!
//! Members and the router run as stub processes; the router's member view is
//! scripted per poll.

use std::time::Duration;

use harness::{CliOptions, HarnessError, InstanceRef, MembershipPolicy, Signal, TestEnvironment};
use serde_json::json;

mod common;
use common::{EnvironmentBuilder, RpcScript, TestFixtures};

/// Start `members` clustered servers (ports 10000..) then a router after them
async fn cluster_with_router(env: &mut TestEnvironment, members: usize) -> (Vec<InstanceRef>, InstanceRef) {
    let node = env.get_node(0).unwrap();
    let mut cluster = env
        .cluster(TestFixtures::KIND, json!({}), Some(TestFixtures::CLUSTER))
        .await
        .unwrap();

    let servers: Vec<_> = (0..members)
        .map(|_| env.server(&node, &mut cluster, CliOptions::new()).unwrap())
        .collect();
    cluster.start().await.unwrap();

    let router = env.proxy(&node, TestFixtures::KIND, CliOptions::new()).unwrap();
    router.start().await.unwrap();
    (servers, router)
}

fn identities(count: u16) -> Vec<String> {
    TestFixtures::ports(count).into_iter().map(TestFixtures::identity).collect()
}

#[tokio::test]
async fn test_members_visible_on_first_poll() {
    let script = RpcScript::new().with_members(identities(2), Some(0));
    let mut env = EnvironmentBuilder::new()
        .with_nodes(&[3])
        .with_rpc(script.build())
        .build();
    let (servers, router) = cluster_with_router(&mut env, 2).await;

    env.wait_for_servers(&router, &servers).await.unwrap();

    // One poll, one router query per member
    assert_eq!(RpcScript::count(&script.router_polls), 2);
    env.finalize_test_case(false).await;
}

#[tokio::test]
async fn test_member_registering_late_is_awaited() {
    let script = RpcScript::new().with_members(identities(1), Some(3));
    let mut env = EnvironmentBuilder::new().with_rpc(script.build()).build();
    let (servers, router) = cluster_with_router(&mut env, 1).await;

    env.wait_for_servers(&router, &servers).await.unwrap();

    assert_eq!(RpcScript::count(&script.router_polls), 4);
    env.finalize_test_case(false).await;
}

/// A member that never registers fails after exactly 17 polls over 16 seconds
#[tokio::test(start_paused = true)]
async fn test_member_never_registering_fails_after_budget() {
    let script = RpcScript::new().with_members(Vec::new(), None);
    let mut env = EnvironmentBuilder::new()
        .with_rpc(script.build())
        .with_membership(MembershipPolicy::default())
        .build();
    let (servers, router) = cluster_with_router(&mut env, 1).await;

    let started = tokio::time::Instant::now();
    let err = env.wait_for_servers(&router, &servers).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, HarnessError::FixtureFailed { .. }));
    let message = err.to_string();
    assert!(message.contains(&TestFixtures::identity(TestFixtures::FIRST_PORT)));
    assert!(message.contains(TestFixtures::CLUSTER));
    assert_eq!(RpcScript::count(&script.router_polls), 17);
    assert!(elapsed >= Duration::from_secs(16), "waited only {elapsed:?}");
    assert!(elapsed < Duration::from_secs(17), "waited {elapsed:?}");

    env.finalize_test_case(false).await;
}

/// Only the members that actually registered count
#[tokio::test]
async fn test_partial_membership_times_out() {
    let script = RpcScript::new().with_members(identities(1), Some(0));
    let mut env = EnvironmentBuilder::new()
        .with_nodes(&[3])
        .with_rpc(script.build())
        .build();
    let (servers, router) = cluster_with_router(&mut env, 2).await;

    let err = env.wait_for_servers(&router, &servers).await.unwrap_err();

    assert!(err
        .to_string()
        .contains(&TestFixtures::identity(TestFixtures::FIRST_PORT + 1)));
    // Each of the 17 polls sees the first member, then misses the second
    assert_eq!(RpcScript::count(&script.router_polls), 34);
    env.finalize_test_case(false).await;
}

#[tokio::test]
async fn test_unknown_cluster_reads_as_empty() {
    let script = RpcScript::new().with_members(Vec::new(), None);
    let mut env = EnvironmentBuilder::new().with_rpc(script.build()).build();
    let (servers, router) = cluster_with_router(&mut env, 1).await;

    assert_eq!(router.cluster_members("c1").await.unwrap(), Vec::<String>::new());
    assert!(matches!(
        servers[0].cluster_members("c1").await,
        Err(HarnessError::InvariantViolation { .. })
    ));
    env.finalize_test_case(false).await;
}

/// Scoped cluster form: members run for the body and are stopped afterwards
#[tokio::test]
async fn test_cluster_scoped_run() {
    let mut env = EnvironmentBuilder::new().with_nodes(&[2]).build();
    let node = env.get_node(0).unwrap();
    let mut cluster = env
        .cluster(TestFixtures::KIND, json!({}), Some(TestFixtures::CLUSTER))
        .await
        .unwrap();
    env.server(&node, &mut cluster, CliOptions::new()).unwrap();
    env.server(&node, &mut cluster, CliOptions::new()).unwrap();

    let members = cluster
        .run(|cluster| async move {
            let mut names = Vec::new();
            for member in cluster.members() {
                names.push(member.identity().await?);
            }
            Ok(names)
        })
        .await
        .unwrap();

    assert_eq!(members, identities(2));
    for member in cluster.members() {
        assert!(!member.is_running().await);
    }
    assert_eq!(node.ports_in_use(), 0);
}

/// Members stopped individually are skipped when the whole cluster stops
#[tokio::test]
async fn test_cluster_stop_skips_stopped_members() {
    let mut env = EnvironmentBuilder::new().with_nodes(&[2]).build();
    let node = env.get_node(0).unwrap();
    let mut cluster = env.cluster(TestFixtures::KIND, json!({}), None).await.unwrap();
    let first = env.server(&node, &mut cluster, CliOptions::new()).unwrap();
    let second = env.server(&node, &mut cluster, CliOptions::new()).unwrap();
    cluster.start().await.unwrap();

    first.stop(Signal::SIGTERM).await.unwrap();
    cluster.stop(Signal::SIGTERM).await.unwrap();

    assert!(!second.is_running().await);
    assert_eq!(node.ports_in_use(), 0);
    assert!(env.finalize_test_case(false).await.is_clean());
}
