use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use kafka_connector::coordinator;
use kafka_connector::error::ConnectorError;
use kafka_connector::kafka::types::{PartitionState, Subscription, TopicPartition};
use kafka_connector::test_utils::{test_consumer_settings, MockCluster};

const TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_metadata_queries() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 2);
    cluster.produce("events", 0, None, Some("a".into()), Some(1_000));
    cluster.produce("events", 0, None, Some("b".into()), Some(2_000));
    cluster.produce("events", 0, None, Some("c".into()), Some(3_000));
    let p0 = TopicPartition::new("events", 0);
    let p1 = TopicPartition::new("events", 1);

    let (handle, task) =
        coordinator::start(cluster.consumer("meta"), test_consumer_settings("meta"));

    let partitions = handle.partitions_for("events", TIMEOUT).await.unwrap();
    assert_eq!(partitions, vec![p0.clone(), p1.clone()]);

    let topics = handle.list_topics(TIMEOUT).await.unwrap();
    assert_eq!(topics.get("events").map(Vec::len), Some(2));

    assert_eq!(handle.end_offset_for_partition(p0.clone(), TIMEOUT).await, Ok(3));
    assert_eq!(handle.beginning_offset_for_partition(p1.clone(), TIMEOUT).await, Ok(0));
    assert_eq!(handle.committed_offset(p0.clone(), TIMEOUT).await, Ok(None));

    let by_time = handle
        .offsets_for_times(BTreeMap::from([(p0.clone(), 1_500), (p1, 0)]), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(by_time.get(&p0), Some(&Some(1)));

    handle.shutdown(TIMEOUT).await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_and_invalid_topics() {
    let cluster = MockCluster::new();
    let (handle, task) =
        coordinator::start(cluster.consumer("meta"), test_consumer_settings("meta"));

    assert_eq!(
        handle.partitions_for("missing", TIMEOUT).await,
        Err(ConnectorError::TopicUnknown("missing".into()))
    );
    assert_eq!(
        handle.partitions_for("not a topic!", TIMEOUT).await,
        Err(ConnectorError::InvalidTopic("not a topic!".into()))
    );

    let invalid = handle
        .assign(Subscription::topics(["ok", ".."]), TIMEOUT)
        .await;
    assert_eq!(invalid, Err(ConnectorError::InvalidTopic("..".into())));

    // the coordinator keeps serving after rejected requests
    assert!(handle.list_topics(TIMEOUT).await.unwrap().is_empty());

    handle.shutdown(TIMEOUT).await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_seek_on_partition_not_owned() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 1);
    let (handle, task) =
        coordinator::start(cluster.consumer("seek"), test_consumer_settings("seek"));

    let tp = TopicPartition::new("events", 0);
    assert_eq!(
        handle.seek(tp.clone(), 5, TIMEOUT).await,
        Err(ConnectorError::InvalidPartitionState {
            partition: tp.clone(),
            state: PartitionState::Unassigned,
        })
    );

    handle
        .assign(Subscription::assignment([tp.clone()]), TIMEOUT)
        .await
        .unwrap();
    handle.seek(tp, 0, TIMEOUT).await.unwrap();

    handle.shutdown(TIMEOUT).await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commit_of_partition_not_owned_fails() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 2);
    let p0 = TopicPartition::new("events", 0);
    let p1 = TopicPartition::new("events", 1);
    let (handle, task) =
        coordinator::start(cluster.consumer("commits"), test_consumer_settings("commits"));

    handle
        .assign(Subscription::assignment([p0.clone()]), TIMEOUT)
        .await
        .unwrap();

    let result = handle
        .commit(BTreeMap::from([(p0.clone(), 4), (p1.clone(), 9)]), TIMEOUT)
        .await;
    assert_eq!(result, Err(ConnectorError::commit_failed([p1.clone()])));
    // the owned partition was still committed, as the next position to read
    assert_eq!(cluster.committed("commits", &p0), Some(5));
    assert_eq!(cluster.committed("commits", &p1), None);
    assert_eq!(handle.committed_offset(p0.clone(), TIMEOUT).await, Ok(Some(5)));

    let ack = handle
        .commit(BTreeMap::from([(p0.clone(), 6)]), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(ack, BTreeMap::from([(p0, 6)]));

    handle.shutdown(TIMEOUT).await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_lower_commit_does_not_move_partition_back() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 1);
    let tp = TopicPartition::new("events", 0);
    let (handle, task) =
        coordinator::start(cluster.consumer("late"), test_consumer_settings("late"));

    handle
        .assign(Subscription::assignment([tp.clone()]), TIMEOUT)
        .await
        .unwrap();
    handle
        .commit(BTreeMap::from([(tp.clone(), 8)]), TIMEOUT)
        .await
        .unwrap();

    let ack = handle
        .commit(BTreeMap::from([(tp.clone(), 3)]), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(ack, BTreeMap::from([(tp.clone(), 3)]));
    assert_eq!(cluster.committed("late", &tp), Some(9));
    assert_eq!(cluster.commit_history().len(), 1);

    handle.shutdown(TIMEOUT).await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_request_times_out_but_coordinator_recovers() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 1);
    cluster.set_metadata_delay(Duration::from_millis(300));
    let (handle, task) =
        coordinator::start(cluster.consumer("slow"), test_consumer_settings("slow"));

    let short = Duration::from_millis(50);
    assert_eq!(
        handle.list_topics(short).await,
        Err(ConnectorError::TimedOut(short))
    );

    cluster.set_metadata_delay(Duration::ZERO);
    let partitions = handle.partitions_for("events", TIMEOUT).await.unwrap();
    assert_eq!(partitions.len(), 1);

    handle.shutdown(TIMEOUT).await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_timeout_and_later_requests() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 1);
    cluster.set_close_delay(Duration::from_secs(5));
    let (handle, task) =
        coordinator::start(cluster.consumer("stuck"), test_consumer_settings("stuck"));

    let stop_timeout = Duration::from_millis(100);
    assert_eq!(
        handle.shutdown(stop_timeout).await,
        Err(ConnectorError::ShutdownTimeout(stop_timeout))
    );
    task.await.unwrap();

    assert!(handle.is_closed());
    assert_eq!(
        handle.end_offsets(BTreeSet::new(), TIMEOUT).await,
        Err(ConnectorError::Cancelled)
    );
    // stopping twice is harmless
    handle.shutdown(TIMEOUT).await.unwrap();
}
