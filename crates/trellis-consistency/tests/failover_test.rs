// Integration tests for leader failover
// Committed state and open sessions survive the loss of the leader

mod common;

use std::time::Duration;

use trellis_common::TrellisError;

use common::{
    PARTITION, STARTUP_TIMEOUT, client, fast_config, leader_status, start_cluster, wait_until,
};

#[tokio::test]
async fn test_writes_survive_leader_isolation() {
    let cluster = start_cluster(fast_config()).await;
    let client = client(&cluster);
    let map = client.map("inventory").unwrap();
    let counter = client.counter("sequence").unwrap();

    map.put("apples", "3").await.unwrap();
    assert_eq!(counter.increment_and_get().await.unwrap(), 1);

    let old_leader = cluster
        .wait_for_leader(PARTITION, STARTUP_TIMEOUT)
        .await
        .unwrap();
    cluster.isolate(old_leader);

    let elected = wait_until(Duration::from_secs(10), || {
        let cluster = cluster.clone();
        async move { cluster.leader(PARTITION).is_some_and(|l| l != old_leader) }
    })
    .await;
    assert!(elected);

    // The same session keeps working against the new leader
    assert_eq!(map.get("apples").await.unwrap(), Some("3".to_string()));
    assert_eq!(
        map.put("pears", "5").await.unwrap(),
        None,
        "new key has no previous value"
    );
    assert_eq!(counter.increment_and_get().await.unwrap(), 2);

    // The old leader catches up once it can talk to the others again
    cluster.heal(old_leader);
    let caught_up = wait_until(Duration::from_secs(10), || {
        let cluster = cluster.clone();
        async move {
            let Ok(leader) = leader_status(&cluster, PARTITION).await else {
                return false;
            };
            cluster
                .status(old_leader, PARTITION)
                .await
                .is_ok_and(|s| s.applied_index >= leader.commit_index && s.leader.is_some())
        }
    })
    .await;
    assert!(caught_up);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_minority_cannot_commit() {
    let cluster = start_cluster(fast_config()).await;
    let leader = cluster
        .wait_for_leader(PARTITION, STARTUP_TIMEOUT)
        .await
        .unwrap();
    let followers: Vec<u64> = cluster
        .node_ids()
        .await
        .into_iter()
        .filter(|n| *n != leader)
        .collect();
    for follower in &followers {
        cluster.stop_node(*follower).await;
    }

    let mut config = common::client_config(&cluster);
    config.retry_attempts = 5;
    let client = cluster.client_with(config);
    let result = client.map("blocked").unwrap().put("k", "v").await;
    assert!(matches!(
        result,
        Err(TrellisError::NoQuorum
            | TrellisError::Timeout
            | TrellisError::NotLeader { .. }
            | TrellisError::Shutdown)
    ));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_restarted_follower_catches_up() {
    let cluster = start_cluster(fast_config()).await;
    let client = client(&cluster);
    let map = client.map("catalog").unwrap();

    let leader = cluster
        .wait_for_leader(PARTITION, STARTUP_TIMEOUT)
        .await
        .unwrap();
    let follower = cluster
        .node_ids()
        .await
        .into_iter()
        .find(|n| *n != leader)
        .unwrap();
    cluster.stop_node(follower).await;

    for i in 0..10 {
        map.put(&format!("item-{}", i), "present").await.unwrap();
    }

    cluster.restart_node(follower).await.unwrap();
    let caught_up = wait_until(Duration::from_secs(10), || {
        let cluster = cluster.clone();
        async move {
            let Ok(leader) = leader_status(&cluster, PARTITION).await else {
                return false;
            };
            cluster
                .status(follower, PARTITION)
                .await
                .is_ok_and(|s| s.applied_index >= leader.commit_index)
        }
    })
    .await;
    assert!(caught_up);
    assert_eq!(map.size().await.unwrap(), 10);

    cluster.shutdown().await;
}
