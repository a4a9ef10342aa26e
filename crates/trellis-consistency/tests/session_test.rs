// Integration tests for client sessions
// Exactly-once commands, session expiry and cleanup of held resources

mod common;

use std::time::Duration;

use trellis_common::{CompactionMode, Consistency, TrellisError};
use trellis_consistency::dispatch::{Operation, Request, Response};
use trellis_consistency::service::counter::CounterOperation;
use trellis_consistency::service::map::MapOperation;
use trellis_consistency::service::{decode_output, encode_operation};

use common::{PARTITION, STARTUP_TIMEOUT, client, fast_config, start_cluster, wait_until};

fn map_put(key: &str, value: &str) -> Operation {
    let operation = MapOperation::Put {
        key: key.to_string(),
        value: value.to_string(),
        ttl_ms: None,
    };
    Operation::new("orders", "map", encode_operation(&operation).unwrap())
}

#[tokio::test]
async fn test_retried_put_returns_cached_result() {
    let cluster = start_cluster(fast_config()).await;
    let channel = cluster.channel();
    let leader = cluster
        .wait_for_leader(PARTITION, STARTUP_TIMEOUT)
        .await
        .unwrap();

    let Response::SessionOpened { session, .. } = channel
        .call(
            leader,
            PARTITION,
            Request::OpenSession {
                client: "client-a".to_string(),
                timeout_ms: 5000,
            },
        )
        .await
        .unwrap()
    else {
        panic!("expected a session");
    };

    let put = Request::Execute {
        session,
        seq: 1,
        ack: 0,
        operation: map_put("foo", "bar"),
        compaction: CompactionMode::Quorum,
    };
    let first = channel.call(leader, PARTITION, put.clone()).await.unwrap();
    // The client lost the answer and retries with the same sequence number
    let second = channel.call(leader, PARTITION, put).await.unwrap();
    assert_eq!(first, second);

    let Response::Output { result, .. } = first else {
        panic!("expected an output");
    };
    let previous: Option<String> = decode_output(&result.unwrap()).unwrap();
    assert_eq!(previous, None);

    // Another client reads the value
    let reader = client(&cluster);
    let orders = reader
        .map("orders")
        .unwrap()
        .with_consistency(Consistency::Sequential);
    assert_eq!(orders.get("foo").await.unwrap(), Some("bar".to_string()));
    assert_eq!(orders.size().await.unwrap(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_command_is_applied_once() {
    let cluster = start_cluster(fast_config()).await;
    let client = client(&cluster);
    let session = client.open_session(PARTITION).await.unwrap();
    let channel = cluster.channel();
    let leader = cluster
        .wait_for_leader(PARTITION, STARTUP_TIMEOUT)
        .await
        .unwrap();

    let increment = Request::Execute {
        session: session.id(),
        seq: 1,
        ack: 0,
        operation: Operation::new(
            "hits",
            "counter",
            encode_operation(&CounterOperation::IncrementAndGet).unwrap(),
        ),
        compaction: CompactionMode::Quorum,
    };
    for _ in 0..3 {
        match channel.call(leader, PARTITION, increment.clone()).await.unwrap() {
            Response::Output { result, .. } => {
                let value: i64 = decode_output(&result.unwrap()).unwrap();
                assert_eq!(value, 1);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    let hits = client.counter("hits").unwrap();
    assert_eq!(hits.get().await.unwrap(), 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_sequence_gap_is_rejected() {
    let cluster = start_cluster(fast_config()).await;
    let client = client(&cluster);
    let session = client.open_session(PARTITION).await.unwrap();
    let leader = cluster
        .wait_for_leader(PARTITION, STARTUP_TIMEOUT)
        .await
        .unwrap();

    let skipped = Request::Execute {
        session: session.id(),
        seq: 5,
        ack: 0,
        operation: map_put("k", "v"),
        compaction: CompactionMode::Quorum,
    };
    let result = cluster.channel().call(leader, PARTITION, skipped).await;
    assert!(matches!(
        result,
        Err(TrellisError::SequenceGap {
            expected: 1,
            received: 5
        })
    ));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_expired_session_releases_lock() {
    let cluster = start_cluster(fast_config()).await;
    let holder = client(&cluster);
    let contender = client(&cluster);

    let lock = holder.lock("resource").unwrap();
    let first_token = lock.lock().await.unwrap();
    assert!(lock.is_locked().await.unwrap());

    // The holder hangs: its session stops renewing
    let partition = cluster.router().resolve("resource").unwrap().partition;
    let held_by = holder.session(partition).await.unwrap();
    held_by.suspend_keep_alive();

    let waiting = contender.lock("resource").unwrap();
    let token = waiting
        .try_lock_for(Duration::from_secs(8))
        .await
        .unwrap()
        .expect("lock should be granted after the holder expires");
    assert!(token > first_token);

    // The hung client learns that its session is gone
    let result = lock.unlock().await;
    assert!(matches!(result, Err(TrellisError::SessionExpired { .. })));
    assert!(!held_by.is_open());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_closed_session_is_unknown() {
    let cluster = start_cluster(fast_config()).await;
    let client = client(&cluster);
    let session = client.open_session(PARTITION).await.unwrap();
    session.close().await.unwrap();

    let leader = cluster
        .wait_for_leader(PARTITION, STARTUP_TIMEOUT)
        .await
        .unwrap();
    let result = cluster
        .channel()
        .call(
            leader,
            PARTITION,
            Request::KeepAlive {
                session: session.id(),
                command_ack: 0,
            },
        )
        .await;
    assert!(matches!(result, Err(TrellisError::UnknownSession { .. })));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_client_reopens_session_after_expiry() {
    let cluster = start_cluster(fast_config()).await;
    let client = client(&cluster);
    let map = client.map("config").unwrap();
    map.put("mode", "a").await.unwrap();

    let first = client.session(PARTITION).await.unwrap();
    first.suspend_keep_alive();
    let expired = wait_until(Duration::from_secs(8), || {
        let map = map.clone();
        async move {
            matches!(
                map.get("mode").await,
                Err(TrellisError::SessionExpired { .. })
            )
        }
    })
    .await;
    assert!(expired);

    // The next call runs on a fresh session with fresh sequencing
    map.put("mode", "c").await.unwrap();
    let second = client.session(PARTITION).await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(map.get("mode").await.unwrap(), Some("c".to_string()));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_oversized_command_does_not_block_session() {
    let mut config = fast_config();
    config.raft.max_entry_size = 512;
    let cluster = start_cluster(config).await;
    let client = client(&cluster);
    let session = client.open_session(PARTITION).await.unwrap();

    let result = session
        .execute(map_put("blob", &"x".repeat(4096)), CompactionMode::Quorum)
        .await;
    assert!(matches!(result, Err(TrellisError::IllegalArgument { .. })));

    // The refused command never reached the log, so its sequence number is reused
    let previous = session
        .execute(map_put("foo", "bar"), CompactionMode::Quorum)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(decode_output::<Option<String>>(&previous).unwrap(), None);
    let previous = session
        .execute(map_put("foo", "baz"), CompactionMode::Quorum)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        decode_output::<Option<String>>(&previous).unwrap(),
        Some("bar".to_string())
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failed_command_is_not_resent() {
    let cluster = start_cluster(fast_config()).await;
    let client = client(&cluster);
    let session = client.open_session(PARTITION).await.unwrap();

    let result = session
        .execute(
            Operation::new("permits", "semaphore", vec![]),
            CompactionMode::Quorum,
        )
        .await;
    assert!(matches!(
        result,
        Err(TrellisError::UnknownPrimitiveType { .. })
    ));

    for value in ["a", "b", "c"] {
        session
            .execute(map_put("foo", value), CompactionMode::Quorum)
            .await
            .unwrap()
            .unwrap();
    }

    let map = client.map("orders").unwrap();
    assert_eq!(map.get("foo").await.unwrap(), Some("c".to_string()));
    cluster.shutdown().await;
}
