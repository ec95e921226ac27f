use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kafka_connector::config::{ConsumerSettings, FailurePolicy, ProducerSettings};
use kafka_connector::coordinator::OffsetsOnAssign;
use kafka_connector::engine::{CommittableRecord, PartitionSource, PartitionedStreamEngine};
use kafka_connector::error::{ConnectorError, ConnectorResult};
use kafka_connector::kafka::types::{RebalanceEvent, Subscription, TopicPartition};
use kafka_connector::producer::{Envelope, ProducerFlow, ProducerRecord};
use kafka_connector::test_utils::{
    test_committer_settings, test_consumer_settings, MockCluster, MockProducer,
};

const WAIT: Duration = Duration::from_secs(10);

async fn start_engine(cluster: &MockCluster, group: &str, topic: &str) -> PartitionedStreamEngine {
    start_engine_with(cluster, topic, test_consumer_settings(group), None).await
}

async fn start_engine_with(
    cluster: &MockCluster,
    topic: &str,
    settings: ConsumerSettings,
    resolver: Option<Arc<dyn OffsetsOnAssign>>,
) -> PartitionedStreamEngine {
    PartitionedStreamEngine::start(
        cluster.consumer(&settings.group_id),
        Subscription::topics([topic]),
        settings,
        test_committer_settings(),
        resolver,
    )
    .await
    .unwrap()
}

/// Start positions from an external store, one answer per assignment
struct ScriptedOffsets {
    answers: Mutex<VecDeque<anyhow::Result<BTreeMap<TopicPartition, i64>>>>,
    delay: Duration,
}

impl ScriptedOffsets {
    fn new(answers: Vec<anyhow::Result<BTreeMap<TopicPartition, i64>>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            delay: Duration::ZERO,
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl OffsetsOnAssign for ScriptedOffsets {
    async fn offsets_for(
        &self,
        _assigned: &BTreeSet<TopicPartition>,
    ) -> anyhow::Result<BTreeMap<TopicPartition, i64>> {
        tokio::time::sleep(self.delay).await;
        let answer = self.answers.lock().unwrap().pop_front();
        answer.unwrap_or_else(|| Ok(BTreeMap::new()))
    }
}

async fn next_source(engine: &mut PartitionedStreamEngine) -> PartitionSource {
    tokio::time::timeout(WAIT, engine.next_partition())
        .await
        .expect("no partition assigned in time")
        .expect("engine stopped")
}

async fn next_record(source: &mut PartitionSource) -> CommittableRecord {
    tokio::time::timeout(WAIT, source.next())
        .await
        .expect("no record in time")
        .expect("partition stream ended")
        .expect("partition stream failed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

type DeliveryLog = Arc<Mutex<Vec<(TopicPartition, i64, &'static str)>>>;

/// A group member that commits every record it receives
struct Member {
    stop: CancellationToken,
    task: JoinHandle<ConnectorResult<()>>,
}

impl Member {
    async fn join(
        cluster: &MockCluster,
        group: &str,
        topic: &str,
        name: &'static str,
        log: DeliveryLog,
    ) -> Self {
        let mut engine = start_engine(cluster, group, topic).await;
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    source = engine.next_partition() => match source {
                        Some(mut source) => {
                            let log = log.clone();
                            tokio::spawn(async move {
                                while let Some(Ok(record)) = source.next().await {
                                    let tp = record.record().topic_partition().clone();
                                    log.lock().unwrap().push((tp, record.record().offset(), name));
                                    record.into_offset().submit();
                                }
                            });
                        }
                        None => break,
                    },
                }
            }
            engine.shutdown().await
        });

        Self { stop, task }
    }

    async fn leave(self) -> ConnectorResult<()> {
        self.stop.cancel();
        self.task.await.unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delivers_every_record_once_in_order() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 1);
    cluster.produce_many("events", 0, 100);
    let tp = TopicPartition::new("events", 0);

    let mut engine = start_engine(&cluster, "readers", "events").await;
    let mut source = next_source(&mut engine).await;
    assert_eq!(source.partition(), &tp);

    let mut offsets = Vec::new();
    while offsets.len() < 100 {
        let record = next_record(&mut source).await;
        offsets.push(record.record().offset());
        record.into_offset().submit();
    }
    assert_eq!(offsets, (0..100).collect::<Vec<i64>>());

    engine.committer().flush().await.unwrap();
    assert_eq!(cluster.committed("readers", &tp), Some(100));

    // nothing more to read
    let idle = tokio::time::timeout(Duration::from_millis(100), source.next()).await;
    assert!(idle.is_err());

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scaling_out_neither_loses_nor_repeats_records() {
    let cluster = MockCluster::new();
    cluster.create_topic("orders", 4);
    for partition in 0..4 {
        cluster.produce_many("orders", partition, 50);
    }
    let log: DeliveryLog = Arc::new(Mutex::new(Vec::new()));

    let first = Member::join(&cluster, "scaling", "orders", "first", log.clone()).await;
    wait_until(|| log.lock().unwrap().len() >= 100).await;

    let second = Member::join(&cluster, "scaling", "orders", "second", log.clone()).await;
    for partition in 0..4 {
        cluster.produce_many("orders", partition, 50);
    }

    let partitions: Vec<TopicPartition> =
        (0..4).map(|p| TopicPartition::new("orders", p)).collect();
    wait_until(|| {
        partitions
            .iter()
            .all(|tp| cluster.committed("scaling", tp) == Some(100))
    })
    .await;

    let delivered = log.lock().unwrap().clone();
    let mut per_partition: BTreeMap<TopicPartition, Vec<i64>> = BTreeMap::new();
    for (tp, offset, _) in &delivered {
        per_partition.entry(tp.clone()).or_default().push(*offset);
    }
    for tp in &partitions {
        let mut offsets = per_partition.remove(tp).unwrap_or_default();
        offsets.sort_unstable();
        assert_eq!(offsets, (0..100).collect::<Vec<i64>>(), "records of {tp}");
    }
    assert!(delivered.iter().any(|(_, _, member)| *member == "second"));

    // the first member gave its partitions back before the second got any
    let rebalances = cluster.rebalance_log();
    let first_revoke = rebalances
        .iter()
        .position(|r| matches!(r.event, RebalanceEvent::Revoked(_)))
        .unwrap();
    let first_split = rebalances
        .iter()
        .position(|r| matches!(r.event, RebalanceEvent::Assigned(ref p) if p.len() == 2))
        .unwrap();
    assert!(first_revoke < first_split);

    second.leave().await.unwrap();
    first.leave().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_commit_is_covered_by_a_later_one() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 1);
    cluster.produce_many("events", 0, 100);
    let tp = TopicPartition::new("events", 0);
    // every attempt the committer makes for offset 50
    cluster.fail_commits([tp.clone()], 3);

    let mut engine = start_engine(&cluster, "retry", "events").await;
    let mut source = next_source(&mut engine).await;

    let mut at_50 = None;
    let mut at_60 = None;
    while at_60.is_none() {
        let record = next_record(&mut source).await;
        match record.record().offset() {
            50 => at_50 = Some(record.into_offset()),
            60 => at_60 = Some(record.into_offset()),
            _ => {}
        }
    }

    let committer = engine.committer().clone();
    let failed = committer.commit_single(at_50.unwrap()).await;
    assert_eq!(failed, Err(ConnectorError::commit_failed([tp.clone()])));
    assert_eq!(cluster.committed("retry", &tp), None);

    let ack = committer.commit_single(at_60.unwrap()).await.unwrap();
    assert_eq!(ack.get(&tp), Some(&60));
    assert_eq!(cluster.committed("retry", &tp), Some(61));

    drop(source);
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_committing_the_same_offset_twice_commits_once() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 1);
    cluster.produce_many("events", 0, 20);
    let tp = TopicPartition::new("events", 0);

    let mut engine = start_engine(&cluster, "idempotent", "events").await;
    let mut source = next_source(&mut engine).await;
    let mut offset = None;
    while offset.is_none() {
        let record = next_record(&mut source).await;
        if record.record().offset() == 10 {
            offset = Some(record.into_offset());
        }
    }

    let committer = engine.committer().clone();
    committer.commit_single(offset.unwrap()).await.unwrap();
    let again = committer.committable_offset(tp.clone(), 10);
    let ack = committer.commit_single(again).await.unwrap();
    assert_eq!(ack.get(&tp), Some(&10));

    let commits = cluster
        .commit_history()
        .into_iter()
        .filter(|c| c.partition == tp && c.position == 11)
        .count();
    assert_eq!(commits, 1);

    drop(source);
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_publish_stops_commits_for_its_partition() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 1);
    cluster.produce_many("events", 0, 10);
    let tp = TopicPartition::new("events", 0);

    let mut engine = start_engine(&cluster, "publisher", "events").await;
    let source = next_source(&mut engine).await;

    let producer = Arc::new(MockProducer::new().failing_when(|record| {
        (record.value.as_deref() == Some(b"0-5".as_slice()))
            .then(|| ConnectorError::Produce("record too large".into()))
    }));
    let flow = ProducerFlow::new(
        producer.clone(),
        ProducerSettings {
            parallelism: 4,
            failure_policy: FailurePolicy::PerElement,
        },
    );

    let envelopes = source.take(10).map(|record| {
        let (record, offset) = record.unwrap().into_parts();
        let value = record.value().cloned().unwrap_or_default();
        Envelope::single(ProducerRecord::new("copies", value), offset)
    });
    flow.committable_sink(envelopes, engine.committer())
        .await
        .unwrap();

    // offsets 0..=4 made it, 5 failed, nothing after it may be committed
    assert_eq!(cluster.committed("publisher", &tp), Some(5));
    assert_eq!(producer.sent().len(), 9);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fatal_client_error_fails_streams_and_requests() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 1);
    let tp = TopicPartition::new("events", 0);

    let mut engine = start_engine(&cluster, "doomed", "events").await;
    let mut source = next_source(&mut engine).await;
    cluster.fail_next_poll("authorization revoked");

    let fatal = ConnectorError::Fatal("authorization revoked".into());
    let item = tokio::time::timeout(WAIT, source.next()).await.unwrap();
    assert_eq!(item.map(|r| r.map(|_| ())), Some(Err(fatal.clone())));
    assert!(tokio::time::timeout(WAIT, source.next()).await.unwrap().is_none());

    wait_until(|| engine.failure().is_some()).await;
    assert_eq!(engine.failure(), Some(fatal.clone()));
    let request = engine
        .coordinator()
        .committed_offset(tp, Duration::from_secs(1))
        .await;
    assert_eq!(request, Err(fatal));
    assert!(engine.next_partition().await.is_none());

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixing_subscription_kinds_is_rejected() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 1);

    let engine = start_engine(&cluster, "mixed", "events").await;
    let result = engine
        .coordinator()
        .assign(Subscription::pattern("^events.*"), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(ConnectorError::SubscriptionConflict { .. })));

    let manual = engine
        .coordinator()
        .assign(
            Subscription::assignment([TopicPartition::new("events", 0)]),
            Duration::from_secs(1),
        )
        .await;
    assert!(matches!(manual, Err(ConnectorError::SubscriptionConflict { .. })));

    // another topic list is fine
    cluster.create_topic("more-events", 1);
    engine
        .coordinator()
        .assign(Subscription::topics(["more-events"]), Duration::from_secs(1))
        .await
        .unwrap();

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_manual_assignment_starts_at_given_offsets() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 2);
    cluster.produce_many("events", 0, 10);
    cluster.produce_many("events", 1, 10);
    let p0 = TopicPartition::new("events", 0);
    let p1 = TopicPartition::new("events", 1);

    let mut engine = PartitionedStreamEngine::start(
        cluster.consumer("manual"),
        Subscription::assignment_with_offsets([(p0.clone(), 7), (p1.clone(), 3)]),
        test_consumer_settings("manual"),
        test_committer_settings(),
        None,
    )
    .await
    .unwrap();

    let mut starts = BTreeMap::new();
    for _ in 0..2 {
        let mut source = next_source(&mut engine).await;
        let record = next_record(&mut source).await;
        starts.insert(source.partition().clone(), record.record().offset());
    }
    assert_eq!(starts, BTreeMap::from([(p0, 7), (p1, 3)]));
    assert_eq!(
        engine.active_partitions(),
        BTreeSet::from([
            TopicPartition::new("events", 0),
            TopicPartition::new("events", 1)
        ])
    );

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_offset_from_an_earlier_assignment_is_refused() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 1);
    cluster.produce_many("events", 0, 20);
    let tp = TopicPartition::new("events", 0);
    let mut settings = test_consumer_settings("rejoin");
    settings.revoke_drain_timeout = Duration::from_millis(200);

    let mut engine = start_engine_with(&cluster, "events", settings, None).await;
    let mut source = next_source(&mut engine).await;
    let mut held = None;
    loop {
        let record = next_record(&mut source).await;
        match record.record().offset() {
            3 => held = Some(record.into_offset()),
            8 => {
                engine
                    .committer()
                    .commit_single(record.into_offset())
                    .await
                    .unwrap();
                break;
            }
            _ => {}
        }
    }
    assert_eq!(cluster.committed("rejoin", &tp), Some(9));

    // a second member joining revokes the partition and hands it straight back
    let other = start_engine(&cluster, "rejoin", "events").await;
    let mut again = next_source(&mut engine).await;
    assert_eq!(again.partition(), &tp);
    assert_eq!(next_record(&mut again).await.record().offset(), 9);

    let late = engine.committer().commit_single(held.unwrap()).await;
    assert_eq!(late, Err(ConnectorError::commit_failed([tp.clone()])));
    assert_eq!(cluster.committed("rejoin", &tp), Some(9));
    assert!(cluster
        .commit_history()
        .iter()
        .all(|commit| commit.position >= 9));

    drop(source);
    drop(again);
    other.shutdown().await.unwrap();
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_offsets_on_assign_win_over_resume_position() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 1);
    cluster.produce_many("events", 0, 40);
    let tp = TopicPartition::new("events", 0);
    let resolver = ScriptedOffsets::new(vec![
        Ok(BTreeMap::new()),
        Ok(BTreeMap::from([(tp.clone(), 25)])),
    ]);

    let mut engine = start_engine_with(
        &cluster,
        "events",
        test_consumer_settings("external"),
        Some(Arc::new(resolver)),
    )
    .await;

    let mut source = next_source(&mut engine).await;
    for expected in 0..5 {
        let record = next_record(&mut source).await;
        assert_eq!(record.record().offset(), expected);
        record.into_offset().submit();
    }

    // reassigned to the same member: without the lookup it would resume at 5
    let other = start_engine(&cluster, "external", "events").await;
    let mut again = next_source(&mut engine).await;
    assert_eq!(again.partition(), &tp);
    let first = next_record(&mut again).await;
    assert_eq!(first.record().offset(), 25);
    assert_eq!(next_record(&mut again).await.record().offset(), 26);

    drop(first);
    drop(source);
    drop(again);
    other.shutdown().await.unwrap();
    engine.shutdown().await.unwrap();
}

async fn first_offset_with(resolver: ScriptedOffsets, settings: ConsumerSettings) -> i64 {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 1);
    cluster.produce_many("events", 0, 20);

    let mut engine =
        start_engine_with(&cluster, "events", settings, Some(Arc::new(resolver))).await;
    let mut source = next_source(&mut engine).await;
    let offset = next_record(&mut source).await.record().offset();

    drop(source);
    engine.shutdown().await.unwrap();
    offset
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_offsets_lookup_starts_from_committed_position() {
    let resolver = ScriptedOffsets::new(vec![Err(anyhow::anyhow!("offset store unavailable"))]);
    let offset = first_offset_with(resolver, test_consumer_settings("lookup-error")).await;
    assert_eq!(offset, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_offsets_lookup_is_abandoned() {
    let tp = TopicPartition::new("events", 0);
    let resolver = ScriptedOffsets::new(vec![Ok(BTreeMap::from([(tp, 15)]))])
        .slow(Duration::from_millis(500));
    let mut settings = test_consumer_settings("lookup-timeout");
    settings.offsets_on_assign_timeout = Duration::from_millis(50);

    let offset = first_offset_with(resolver, settings).await;
    assert_eq!(offset, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_partition_neither_commits_past_failure_nor_blocks_others() {
    let cluster = MockCluster::new();
    cluster.create_topic("events", 2);
    cluster.produce_many("events", 0, 200);
    cluster.produce_many("events", 1, 200);
    let p0 = TopicPartition::new("events", 0);
    let p1 = TopicPartition::new("events", 1);

    let mut engine = start_engine(&cluster, "isolated", "events").await;
    let mut sources = BTreeMap::new();
    for _ in 0..2 {
        let source = next_source(&mut engine).await;
        sources.insert(source.partition().clone(), source);
    }
    let mut failing = sources.remove(&p0).unwrap();
    let mut healthy = sources.remove(&p1).unwrap();

    // processing fails at offset 5 and the stream is not polled again
    loop {
        let record = next_record(&mut failing).await;
        if record.record().offset() == 5 {
            break;
        }
        record.into_offset().submit();
    }

    for expected in 0..200 {
        let record = next_record(&mut healthy).await;
        assert_eq!(record.record().offset(), expected);
        record.into_offset().submit();
    }

    engine.committer().flush().await.unwrap();
    assert_eq!(cluster.committed("isolated", &p1), Some(200));
    assert_eq!(cluster.committed("isolated", &p0), Some(5));
    assert!(cluster
        .commit_history()
        .iter()
        .filter(|commit| commit.partition == p0)
        .all(|commit| commit.position <= 5));

    drop(failing);
    engine.shutdown().await.unwrap();
}
