// Integration tests for log compaction
// Each retention mode holds back compaction for exactly as long as it must

mod common;

use std::sync::Arc;
use std::time::Duration;

use trellis_common::{CompactionMode, Index, SessionId};
use trellis_consistency::client::ClientSession;
use trellis_consistency::compaction::CompactionInputs;
use trellis_consistency::dispatch::{LogCommand, Operation};
use trellis_consistency::raft::EntryPayload;
use trellis_consistency::service::encode_operation;
use trellis_consistency::service::lock::LockCommand;
use trellis_consistency::service::map::MapOperation;
use trellis_consistency::{
    ClusterConfig, CompactionConfig, CompactionController, LocalCluster, LogEntry,
    PartitionStateMachine, ServiceRegistry,
};

use common::{PARTITION, STARTUP_TIMEOUT, client, fast_config, leader_status, start_cluster, wait_until};

fn compaction_config(retry_margin: u64) -> ClusterConfig {
    let mut config = fast_config();
    config.session.timeout_ms = 20_000;
    config.compaction.entry_threshold = 10;
    config.compaction.sequential_retry_margin = retry_margin;
    config
}

/// Session whose only log traffic is what the test submits
async fn quiet_session(cluster: &LocalCluster) -> ClientSession {
    let session = client(cluster).open_session(PARTITION).await.unwrap();
    session.suspend_keep_alive();
    session
}

async fn put(session: &ClientSession, key: &str) {
    let operation = MapOperation::Put {
        key: key.to_string(),
        value: "x".to_string(),
        ttl_ms: None,
    };
    session
        .execute(
            Operation::new("filler", "map", encode_operation(&operation).unwrap()),
            CompactionMode::Quorum,
        )
        .await
        .unwrap()
        .unwrap();
}

async fn fill(session: &ClientSession, count: usize) {
    for i in 0..count {
        put(session, &format!("key-{}", i)).await;
    }
}

async fn first_index(cluster: &LocalCluster) -> Index {
    leader_status(cluster, PARTITION)
        .await
        .map(|s| s.first_index)
        .unwrap_or(0)
}

async fn wait_for_first_index(cluster: &LocalCluster, above: Index) -> bool {
    wait_until(Duration::from_secs(10), || {
        let cluster = cluster.clone();
        async move { first_index(&cluster).await > above }
    })
    .await
}

#[tokio::test]
async fn test_quorum_entries_are_compacted() {
    let cluster = start_cluster(compaction_config(64)).await;
    let session = quiet_session(&cluster).await;
    fill(&session, 40).await;

    let applied = session.observed_index();
    assert!(wait_for_first_index(&cluster, applied / 2).await);

    // Compacted state is still served
    let size = client(&cluster).map("filler").unwrap().size().await.unwrap();
    assert_eq!(size, 40);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_sequential_entry_waits_for_retry_margin() {
    let cluster = start_cluster(compaction_config(1000)).await;
    let session = quiet_session(&cluster).await;
    fill(&session, 5).await;

    let remove = MapOperation::Remove {
        key: "key-0".to_string(),
    };
    session
        .execute(
            Operation::new("filler", "map", encode_operation(&remove).unwrap()),
            CompactionMode::Quorum,
        )
        .await
        .unwrap()
        .unwrap();
    let remove_index = session.observed_index();
    fill(&session, 30).await;

    // Everything before the removal goes, the removal itself stays
    assert!(wait_for_first_index(&cluster, 1).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(first_index(&cluster).await <= remove_index);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_sequential_entry_compacted_after_margin_and_ack() {
    let cluster = start_cluster(compaction_config(10)).await;
    let session = quiet_session(&cluster).await;

    let try_lock = LockCommand::Lock {
        timeout_ms: Some(1000),
    };
    session
        .execute(
            Operation::new("mutex", "lock", encode_operation(&try_lock).unwrap()),
            try_lock.compaction_mode(),
        )
        .await
        .unwrap()
        .unwrap();
    let lock_index = session.observed_index();

    // Later commands acknowledge the lock result and push commit past the margin
    fill(&session, 30).await;
    assert!(wait_for_first_index(&cluster, lock_index).await);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_full_entry_waits_for_every_replica() {
    let cluster = start_cluster(compaction_config(64)).await;
    let session = quiet_session(&cluster).await;
    let leader = cluster
        .wait_for_leader(PARTITION, STARTUP_TIMEOUT)
        .await
        .unwrap();
    let lagging = cluster
        .node_ids()
        .await
        .into_iter()
        .find(|n| *n != leader)
        .unwrap();
    cluster.isolate(lagging);

    let force = LockCommand::ForceUnlock;
    session
        .execute(
            Operation::new("mutex", "lock", encode_operation(&force).unwrap()),
            force.compaction_mode(),
        )
        .await
        .unwrap()
        .unwrap();
    let force_index = session.observed_index();
    fill(&session, 30).await;

    assert!(wait_for_first_index(&cluster, 1).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(first_index(&cluster).await <= force_index);

    // Once the lagging replica acknowledges the entry compaction resumes
    cluster.heal(lagging);
    fill(&session, 5).await;
    assert!(wait_for_first_index(&cluster, force_index).await);
    cluster.shutdown().await;
}

/// Log of two sessions: puts, removals, a lock held until its session
/// closes, a retried command and a leader change
fn scripted_log(mode: CompactionMode) -> Vec<LogEntry> {
    let writer = SessionId::new(2);
    let holder = SessionId::new(3);
    let map = |operation: MapOperation| {
        Operation::new("inventory", "map", encode_operation(&operation).unwrap())
    };
    let put = |i: u64| {
        map(MapOperation::Put {
            key: format!("item-{}", i % 4),
            value: format!("v{}", i),
            ttl_ms: None,
        })
    };

    let mut payloads = vec![
        (1, EntryPayload::TermStart),
        (
            1,
            EntryPayload::Command(
                LogCommand::OpenSession {
                    client: "writer".to_string(),
                    timeout_ms: 60_000,
                }
                .encode()
                .unwrap(),
            ),
        ),
        (
            1,
            EntryPayload::Command(
                LogCommand::OpenSession {
                    client: "holder".to_string(),
                    timeout_ms: 60_000,
                }
                .encode()
                .unwrap(),
            ),
        ),
    ];
    let command = |term: u64, session: SessionId, seq: u64, operation: Operation| {
        let command = LogCommand::Command {
            session,
            seq,
            ack: seq.saturating_sub(2),
            operation,
        };
        (term, EntryPayload::Command(command.encode().unwrap()))
    };

    let lock = LockCommand::Lock { timeout_ms: None };
    payloads.push(command(
        1,
        holder,
        1,
        Operation::new("mutex", "lock", encode_operation(&lock).unwrap()),
    ));
    for seq in 1..=8 {
        payloads.push(command(1, writer, seq, put(seq)));
    }
    // Retry of a command whose answer was lost
    payloads.push(command(1, writer, 8, put(8)));
    payloads.push(command(
        1,
        writer,
        9,
        map(MapOperation::Remove {
            key: "item-1".to_string(),
        }),
    ));
    payloads.push((2, EntryPayload::TermStart));
    payloads.push((
        2,
        EntryPayload::Command(
            LogCommand::CloseSession { session: holder }
                .encode()
                .unwrap(),
        ),
    ));
    for seq in 10..=16 {
        payloads.push(command(2, writer, seq, put(seq)));
    }
    payloads.push((
        2,
        EntryPayload::Command(
            LogCommand::KeepAlive {
                session: writer,
                command_ack: 12,
            }
            .encode()
            .unwrap(),
        ),
    ));

    payloads
        .into_iter()
        .enumerate()
        .map(|(i, (term, payload))| {
            let compaction = match &payload {
                EntryPayload::Command(_) => mode,
                _ => CompactionMode::Quorum,
            };
            LogEntry {
                index: i as Index + 1,
                term,
                timestamp: (i as u64 + 1) * 10,
                compaction,
                payload,
            }
        })
        .collect()
}

fn replay(entries: &[LogEntry]) -> PartitionStateMachine {
    let mut machine =
        PartitionStateMachine::new(PARTITION, Arc::new(ServiceRegistry::with_builtins()));
    for entry in entries {
        machine.apply(entry);
    }
    machine
}

/// Restoring any snapshot and replaying what compaction left of the log
/// rebuilds exactly the state of a full replay
fn assert_compaction_preserves_state(mode: CompactionMode) {
    let log = scripted_log(mode);
    let commit_index = log.len() as Index;
    let expected = replay(&log).snapshot().unwrap();

    for snapshot_index in 1..=commit_index {
        let prefix = replay(&log[..snapshot_index as usize]);
        let image = prefix.snapshot().unwrap();

        let inputs = CompactionInputs {
            snapshot_index,
            commit_index,
            // One voter lags halfway behind the snapshot
            global_index: snapshot_index / 2,
            retention_floor: prefix.sessions().retention_floor(),
            compacted_index: 0,
        };
        let mut controller = CompactionController::new(
            PARTITION,
            CompactionConfig {
                sequential_retry_margin: 4,
                ..Default::default()
            },
        );
        let plan = controller.plan(&inputs, prefix.retained());
        assert!(plan.upto <= snapshot_index);
        match mode {
            CompactionMode::Quorum => {}
            CompactionMode::Sequential => assert!(plan.upto < inputs.retention_floor),
            CompactionMode::Full => assert!(plan.upto <= inputs.global_index.max(1)),
        }

        let mut restored =
            PartitionStateMachine::new(PARTITION, Arc::new(ServiceRegistry::with_builtins()));
        restored.restore(&image).unwrap();
        for entry in &log[plan.upto as usize..] {
            restored.apply(entry);
        }
        assert_eq!(
            restored.snapshot().unwrap(),
            expected,
            "{:?} log diverged after compacting up to {} with a snapshot at {}",
            mode,
            plan.upto,
            snapshot_index
        );
    }
}

#[test]
fn test_compacting_quorum_entries_preserves_state() {
    assert_compaction_preserves_state(CompactionMode::Quorum);
}

#[test]
fn test_compacting_sequential_entries_preserves_state() {
    assert_compaction_preserves_state(CompactionMode::Sequential);
}

#[test]
fn test_compacting_full_entries_preserves_state() {
    assert_compaction_preserves_state(CompactionMode::Full);
}
