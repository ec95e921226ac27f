//! In-memory Kafka stand-in for tests: topic logs, consumer groups with an
//! eager rebalance protocol, and a producer with controllable completion.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{CommitterSettings, ConsumerSettings};
use crate::error::{ClientError, ClientResult, ConnectorError, ConnectorResult};
use crate::kafka::client::{ConsumerClient, RebalanceListener};
use crate::kafka::types::{ConsumerRecord, RebalanceEvent, Subscription, TopicPartition};
use crate::producer::client::{ProducerClient, ProducerRecord, RecordMetadata};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Settings with short timeouts, suitable for the in-memory cluster
pub fn test_consumer_settings(group_id: &str) -> ConsumerSettings {
    ConsumerSettings {
        group_id: group_id.to_string(),
        poll_interval: Duration::from_millis(5),
        poll_timeout: Duration::from_millis(5),
        max_poll_records: 50,
        max_batch: 10,
        buffer_capacity: 50,
        sub_stream_buffer: 10,
        request_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_secs(5),
        revoke_drain_timeout: Duration::from_secs(2),
        offsets_on_assign_timeout: Duration::from_secs(1),
        metadata_timeout: Duration::from_secs(1),
    }
}

pub fn test_committer_settings() -> CommitterSettings {
    CommitterSettings {
        max_batch: 100,
        max_interval: Duration::from_millis(20),
        max_attempts: 3,
        commit_timeout: Duration::from_secs(5),
    }
}

/// Decides which member owns which partition. Members are passed in join order.
pub trait AssignmentPolicy: Send + Sync {
    fn assign(
        &self,
        members: &[u64],
        partitions: &[TopicPartition],
    ) -> BTreeMap<u64, BTreeSet<TopicPartition>>;
}

/// Partition `i` goes to member `i % members`
#[derive(Debug, Default)]
pub struct RoundRobin;

impl AssignmentPolicy for RoundRobin {
    fn assign(
        &self,
        members: &[u64],
        partitions: &[TopicPartition],
    ) -> BTreeMap<u64, BTreeSet<TopicPartition>> {
        let mut assignment: BTreeMap<u64, BTreeSet<TopicPartition>> =
            members.iter().map(|member| (*member, BTreeSet::new())).collect();
        if members.is_empty() {
            return assignment;
        }
        for (i, tp) in partitions.iter().enumerate() {
            if let Some(owned) = assignment.get_mut(&members[i % members.len()]) {
                owned.insert(tp.clone());
            }
        }
        assignment
    }
}

/// One commit accepted by the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub group: String,
    pub member: u64,
    pub partition: TopicPartition,
    /// Next offset to read
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceRecord {
    pub group: String,
    pub member: u64,
    pub event: RebalanceEvent,
}

struct CommitFailureRule {
    partitions: BTreeSet<TopicPartition>,
    remaining: usize,
}

#[derive(Default)]
struct MemberSlot {
    topics: BTreeSet<String>,
    revoked_generation: u64,
}

#[derive(Default)]
struct GroupState {
    /// Join order
    members: Vec<u64>,
    slots: BTreeMap<u64, MemberSlot>,
    generation: u64,
    committed: BTreeMap<TopicPartition, i64>,
}

impl GroupState {
    fn bump(&mut self) {
        self.generation += 1;
    }

    fn barrier_passed(&self) -> bool {
        self.slots
            .values()
            .all(|slot| slot.revoked_generation >= self.generation)
    }
}

#[derive(Default)]
struct ClusterState {
    topics: BTreeMap<String, Vec<Vec<ConsumerRecord>>>,
    groups: BTreeMap<String, GroupState>,
    next_member: u64,
    commit_history: Vec<CommitRecord>,
    commit_failures: Vec<CommitFailureRule>,
    rebalance_log: Vec<RebalanceRecord>,
    fatal_poll: Option<String>,
    metadata_delay: Duration,
    close_delay: Duration,
}

impl ClusterState {
    fn partitions_of(&self, topics: &BTreeSet<String>) -> Vec<TopicPartition> {
        topics
            .iter()
            .filter_map(|topic| self.topics.get(topic).map(|logs| (topic, logs.len())))
            .flat_map(|(topic, count)| {
                (0..count as i32).map(move |p| TopicPartition::new(topic.as_str(), p))
            })
            .collect()
    }

    fn log(&self, tp: &TopicPartition) -> ClientResult<&Vec<ConsumerRecord>> {
        self.topics
            .get(tp.topic())
            .and_then(|logs| logs.get(tp.partition() as usize))
            .ok_or_else(|| ClientError::UnknownTopic(tp.to_string()))
    }
}

/// Shared in-memory cluster. Cheap to clone.
#[derive(Clone)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
    policy: Arc<dyn AssignmentPolicy>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    pub fn new() -> Self {
        Self::with_policy(Arc::new(RoundRobin))
    }

    pub fn with_policy(policy: Arc<dyn AssignmentPolicy>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState::default())),
            policy,
        }
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        lock(&self.state)
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        self.state()
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions]);
    }

    /// Append a record and return its offset
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        value: Option<Bytes>,
        timestamp: Option<i64>,
    ) -> i64 {
        let mut state = self.state();
        let logs = state.topics.entry(topic.to_string()).or_default();
        while logs.len() <= partition as usize {
            logs.push(Vec::new());
        }
        let log = &mut logs[partition as usize];
        let offset = log.len() as i64;
        log.push(ConsumerRecord::new(
            TopicPartition::new(topic, partition),
            offset,
            key,
            value,
            timestamp,
        ));
        offset
    }

    /// Append `count` records with values `"<partition>-<offset>"`
    pub fn produce_many(&self, topic: &str, partition: i32, count: usize) {
        for _ in 0..count {
            let offset = self.end_offset(&TopicPartition::new(topic, partition));
            let value = Bytes::from(format!("{partition}-{offset}"));
            self.produce(topic, partition, None, Some(value), Some(offset));
        }
    }

    pub fn end_offset(&self, tp: &TopicPartition) -> i64 {
        self.state()
            .log(tp)
            .map(|log| log.len() as i64)
            .unwrap_or(0)
    }

    pub fn records(&self, tp: &TopicPartition) -> Vec<ConsumerRecord> {
        self.state().log(tp).cloned().unwrap_or_default()
    }

    /// Committed position of the group, the next offset it would read
    pub fn committed(&self, group: &str, tp: &TopicPartition) -> Option<i64> {
        self.state()
            .groups
            .get(group)
            .and_then(|g| g.committed.get(tp).copied())
    }

    pub fn commit_history(&self) -> Vec<CommitRecord> {
        self.state().commit_history.clone()
    }

    pub fn rebalance_log(&self) -> Vec<RebalanceRecord> {
        self.state().rebalance_log.clone()
    }

    /// Reject the next `times` commits touching any of `partitions`
    pub fn fail_commits(&self, partitions: impl IntoIterator<Item = TopicPartition>, times: usize) {
        self.state().commit_failures.push(CommitFailureRule {
            partitions: partitions.into_iter().collect(),
            remaining: times,
        });
    }

    /// The next poll of any consumer fails with a fatal error
    pub fn fail_next_poll(&self, reason: &str) {
        self.state().fatal_poll = Some(reason.to_string());
    }

    pub fn set_metadata_delay(&self, delay: Duration) {
        self.state().metadata_delay = delay;
    }

    pub fn set_close_delay(&self, delay: Duration) {
        self.state().close_delay = delay;
    }

    pub fn consumer(&self, group: &str) -> MockConsumer {
        let member = {
            let mut state = self.state();
            state.next_member += 1;
            state.next_member
        };
        MockConsumer {
            cluster: self.clone(),
            group: group.to_string(),
            member,
            listener: None,
            joined: false,
            assigned: BTreeSet::new(),
            assigned_generation: 0,
            positions: BTreeMap::new(),
            paused: BTreeSet::new(),
            pending_seeks: BTreeMap::new(),
            closed: false,
        }
    }
}

enum GroupStep {
    Revoke(BTreeSet<TopicPartition>),
    Assign(u64, BTreeSet<TopicPartition>),
    Steady,
}

/// One member of a consumer group on a [`MockCluster`]
pub struct MockConsumer {
    cluster: MockCluster,
    group: String,
    member: u64,
    listener: Option<Arc<dyn RebalanceListener>>,
    joined: bool,
    assigned: BTreeSet<TopicPartition>,
    assigned_generation: u64,
    positions: BTreeMap<TopicPartition, i64>,
    paused: BTreeSet<TopicPartition>,
    pending_seeks: BTreeMap<TopicPartition, i64>,
    closed: bool,
}

impl MockConsumer {
    pub fn member_id(&self) -> u64 {
        self.member
    }

    fn check_open(&self) -> ClientResult<()> {
        if self.closed {
            return Err(ClientError::Fatal("consumer closed".to_string()));
        }
        Ok(())
    }

    fn record_rebalance(&self, event: RebalanceEvent) {
        self.cluster.state().rebalance_log.push(RebalanceRecord {
            group: self.group.clone(),
            member: self.member,
            event,
        });
    }

    fn next_step(&self) -> GroupStep {
        let mut state = self.cluster.state();
        let partitions_by_topic = {
            let Some(group) = state.groups.get(&self.group) else {
                return GroupStep::Steady;
            };
            let topics: BTreeSet<String> = group
                .slots
                .values()
                .flat_map(|slot| slot.topics.iter().cloned())
                .collect();
            topics
        };
        let partitions = state.partitions_of(&partitions_by_topic);
        let Some(group) = state.groups.get_mut(&self.group) else {
            return GroupStep::Steady;
        };
        if self.assigned_generation >= group.generation {
            return GroupStep::Steady;
        }

        let generation = group.generation;
        let revoked = group
            .slots
            .get(&self.member)
            .map_or(true, |slot| slot.revoked_generation >= generation);
        if !revoked {
            return GroupStep::Revoke(self.assigned.clone());
        }
        if !group.barrier_passed() {
            return GroupStep::Steady;
        }

        let slot_topics = group
            .slots
            .get(&self.member)
            .map(|slot| slot.topics.clone())
            .unwrap_or_default();
        let assignment = self.cluster.policy.assign(&group.members, &partitions);
        let mine = assignment
            .get(&self.member)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|tp| slot_topics.contains(tp.topic()))
            .collect();
        GroupStep::Assign(generation, mine)
    }

    /// Run at most one rebalance step. Callbacks run without the cluster lock held.
    fn rebalance(&mut self) {
        if !self.joined {
            return;
        }
        match self.next_step() {
            GroupStep::Steady => {}
            GroupStep::Revoke(partitions) => {
                if !partitions.is_empty() {
                    self.record_rebalance(RebalanceEvent::Revoked(partitions.clone()));
                    if let Some(listener) = self.listener.clone() {
                        let cluster = self.cluster.clone();
                        let group = self.group.clone();
                        let member = self.member;
                        let mut commit = |positions: &BTreeMap<TopicPartition, i64>| {
                            commit_to(&cluster, &group, member, positions)
                        };
                        listener.on_partitions_revoked(&partitions, &mut commit);
                    }
                }
                self.release(&partitions);
                let mut state = self.cluster.state();
                if let Some(group) = state.groups.get_mut(&self.group) {
                    let generation = group.generation;
                    if let Some(slot) = group.slots.get_mut(&self.member) {
                        slot.revoked_generation = generation;
                    }
                }
            }
            GroupStep::Assign(generation, partitions) => {
                self.assigned_generation = generation;
                self.take(&partitions);
                if !partitions.is_empty() {
                    self.record_rebalance(RebalanceEvent::Assigned(partitions.clone()));
                    if let Some(listener) = self.listener.clone() {
                        let positions = listener.on_partitions_assigned(&partitions);
                        self.pending_seeks.extend(positions);
                    }
                }
            }
        }
    }

    fn release(&mut self, partitions: &BTreeSet<TopicPartition>) {
        for tp in partitions {
            self.assigned.remove(tp);
            self.positions.remove(tp);
            self.paused.remove(tp);
            self.pending_seeks.remove(tp);
        }
    }

    /// New partitions start paused at the committed position, or the beginning
    fn take(&mut self, partitions: &BTreeSet<TopicPartition>) {
        let state = self.cluster.state();
        let committed = state.groups.get(&self.group).map(|g| &g.committed);
        for tp in partitions {
            let position = committed.and_then(|c| c.get(tp).copied()).unwrap_or(0);
            self.positions.insert(tp.clone(), position);
            self.paused.insert(tp.clone());
            self.assigned.insert(tp.clone());
        }
    }

    fn leave_group(&mut self) {
        if !self.joined {
            return;
        }
        let mut state = self.cluster.state();
        if let Some(group) = state.groups.get_mut(&self.group) {
            group.members.retain(|m| *m != self.member);
            group.slots.remove(&self.member);
            group.bump();
        }
        self.joined = false;
    }
}

fn commit_to(
    cluster: &MockCluster,
    group: &str,
    member: u64,
    positions: &BTreeMap<TopicPartition, i64>,
) -> ClientResult<()> {
    let mut state = cluster.state();

    let mut failed = BTreeSet::new();
    for rule in state.commit_failures.iter_mut() {
        if rule.remaining == 0 {
            continue;
        }
        let hit: BTreeSet<TopicPartition> = positions
            .keys()
            .filter(|tp| rule.partitions.contains(*tp))
            .cloned()
            .collect();
        if !hit.is_empty() {
            rule.remaining -= 1;
            failed.extend(hit);
        }
    }
    state.commit_failures.retain(|rule| rule.remaining > 0);

    for (tp, position) in positions {
        if failed.contains(tp) {
            continue;
        }
        state
            .groups
            .entry(group.to_string())
            .or_default()
            .committed
            .insert(tp.clone(), *position);
        state.commit_history.push(CommitRecord {
            group: group.to_string(),
            member,
            partition: tp.clone(),
            position: *position,
        });
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(ClientError::CommitFailed {
            partitions: failed,
            reason: "injected commit failure".to_string(),
        })
    }
}

impl ConsumerClient for MockConsumer {
    fn subscribe(
        &mut self,
        subscription: &Subscription,
        listener: Arc<dyn RebalanceListener>,
    ) -> ClientResult<()> {
        self.check_open()?;
        let topics = match subscription {
            Subscription::Topics(topics) => topics.clone(),
            Subscription::Pattern(pattern) => {
                let prefix = pattern.trim_start_matches('^').trim_end_matches(".*");
                self.cluster
                    .state()
                    .topics
                    .keys()
                    .filter(|topic| topic.starts_with(prefix))
                    .cloned()
                    .collect()
            }
            _ => return Err(ClientError::Other("manual assignment goes through assign".into())),
        };

        self.listener = Some(listener);
        let mut state = self.cluster.state();
        let group = state.groups.entry(self.group.clone()).or_default();
        if !group.members.contains(&self.member) {
            group.members.push(self.member);
        }
        group.slots.entry(self.member).or_default().topics = topics;
        group.bump();
        self.joined = true;
        Ok(())
    }

    fn assign(&mut self, assignment: &BTreeMap<TopicPartition, Option<i64>>) -> ClientResult<()> {
        self.check_open()?;
        {
            let state = self.cluster.state();
            for tp in assignment.keys() {
                state.log(tp)?;
            }
        }
        let wanted: BTreeSet<TopicPartition> = assignment.keys().cloned().collect();
        let dropped: BTreeSet<TopicPartition> =
            self.assigned.difference(&wanted).cloned().collect();
        self.release(&dropped);

        let fresh: BTreeSet<TopicPartition> = wanted.difference(&self.assigned).cloned().collect();
        self.take(&fresh);
        // the whole assignment is paused again, like a real client
        self.paused = wanted.clone();
        for (tp, position) in assignment {
            if let Some(position) = position {
                self.positions.insert(tp.clone(), *position);
            }
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration, max_records: usize) -> ClientResult<Vec<ConsumerRecord>> {
        self.check_open()?;
        if let Some(reason) = self.cluster.state().fatal_poll.take() {
            return Err(ClientError::Fatal(reason));
        }

        self.rebalance();
        let seeks = std::mem::take(&mut self.pending_seeks);
        for (tp, position) in seeks {
            if self.assigned.contains(&tp) {
                self.positions.insert(tp, position);
            }
        }

        let mut records = Vec::new();
        {
            let state = self.cluster.state();
            for tp in &self.assigned {
                if self.paused.contains(tp) || records.len() >= max_records {
                    continue;
                }
                let Some(position) = self.positions.get(tp).copied() else {
                    continue;
                };
                let Ok(log) = state.log(tp) else {
                    continue;
                };
                let start = position.max(0) as usize;
                let take = (max_records - records.len()).min(log.len().saturating_sub(start));
                records.extend(log[start..start + take].iter().cloned());
            }
        }
        for record in &records {
            self.positions
                .insert(record.topic_partition().clone(), record.offset() + 1);
        }

        if records.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(2)));
        }
        Ok(records)
    }

    fn pause(&mut self, partitions: &BTreeSet<TopicPartition>) -> ClientResult<()> {
        self.check_open()?;
        self.paused
            .extend(partitions.iter().filter(|tp| self.assigned.contains(*tp)).cloned());
        Ok(())
    }

    fn resume(&mut self, partitions: &BTreeSet<TopicPartition>) -> ClientResult<()> {
        self.check_open()?;
        for tp in partitions {
            self.paused.remove(tp);
        }
        Ok(())
    }

    fn seek(&mut self, partition: &TopicPartition, offset: i64) -> ClientResult<()> {
        self.check_open()?;
        if !self.assigned.contains(partition) {
            return Err(ClientError::Other(format!("{partition} is not assigned")));
        }
        self.positions.insert(partition.clone(), offset);
        Ok(())
    }

    fn commit(&mut self, positions: &BTreeMap<TopicPartition, i64>) -> ClientResult<()> {
        self.check_open()?;
        commit_to(&self.cluster, &self.group, self.member, positions)
    }

    fn beginning_offsets(
        &mut self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<TopicPartition, i64>> {
        self.metadata_delay(timeout)?;
        let state = self.cluster.state();
        partitions
            .iter()
            .map(|tp| state.log(tp).map(|_| (tp.clone(), 0)))
            .collect()
    }

    fn end_offsets(
        &mut self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<TopicPartition, i64>> {
        self.metadata_delay(timeout)?;
        let state = self.cluster.state();
        partitions
            .iter()
            .map(|tp| state.log(tp).map(|log| (tp.clone(), log.len() as i64)))
            .collect()
    }

    fn committed_offsets(
        &mut self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<TopicPartition, Option<i64>>> {
        self.metadata_delay(timeout)?;
        let state = self.cluster.state();
        let committed = state.groups.get(&self.group).map(|g| &g.committed);
        partitions
            .iter()
            .map(|tp| {
                state.log(tp)?;
                Ok((tp.clone(), committed.and_then(|c| c.get(tp).copied())))
            })
            .collect()
    }

    fn partitions_for(
        &mut self,
        topic: &str,
        timeout: Duration,
    ) -> ClientResult<Vec<TopicPartition>> {
        self.metadata_delay(timeout)?;
        let state = self.cluster.state();
        let logs = state
            .topics
            .get(topic)
            .ok_or_else(|| ClientError::UnknownTopic(topic.to_string()))?;
        Ok((0..logs.len() as i32)
            .map(|p| TopicPartition::new(topic, p))
            .collect())
    }

    fn list_topics(
        &mut self,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<String, Vec<TopicPartition>>> {
        self.metadata_delay(timeout)?;
        let state = self.cluster.state();
        Ok(state
            .topics
            .iter()
            .map(|(topic, logs)| {
                let partitions = (0..logs.len() as i32)
                    .map(|p| TopicPartition::new(topic.as_str(), p))
                    .collect();
                (topic.clone(), partitions)
            })
            .collect())
    }

    fn offsets_for_times(
        &mut self,
        timestamps: &BTreeMap<TopicPartition, i64>,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<TopicPartition, Option<i64>>> {
        self.metadata_delay(timeout)?;
        let state = self.cluster.state();
        timestamps
            .iter()
            .map(|(tp, timestamp)| {
                let offset = state
                    .log(tp)?
                    .iter()
                    .find(|record| record.timestamp().is_some_and(|ts| ts >= *timestamp))
                    .map(|record| record.offset());
                Ok((tp.clone(), offset))
            })
            .collect()
    }

    fn close(&mut self, timeout: Duration) -> ClientResult<()> {
        if self.closed {
            return Ok(());
        }
        let delay = self.cluster.state().close_delay;
        if delay > timeout {
            std::thread::sleep(timeout);
            self.closed = true;
            self.leave_group();
            return Err(ClientError::CloseTimedOut(timeout));
        }
        std::thread::sleep(delay);

        let owned = self.assigned.clone();
        if !owned.is_empty() {
            self.record_rebalance(RebalanceEvent::Revoked(owned.clone()));
            if let Some(listener) = self.listener.clone() {
                let cluster = self.cluster.clone();
                let group = self.group.clone();
                let member = self.member;
                let mut commit = |positions: &BTreeMap<TopicPartition, i64>| {
                    commit_to(&cluster, &group, member, positions)
                };
                listener.on_partitions_revoked(&owned, &mut commit);
            }
        }
        self.release(&owned);
        self.leave_group();
        self.closed = true;
        Ok(())
    }
}

impl MockConsumer {
    fn metadata_delay(&self, timeout: Duration) -> ClientResult<()> {
        self.check_open()?;
        let delay = self.cluster.state().metadata_delay;
        if delay.is_zero() {
            return Ok(());
        }
        std::thread::sleep(delay.min(timeout));
        if delay > timeout {
            return Err(ClientError::Transient("metadata request timed out".to_string()));
        }
        Ok(())
    }
}

type SendRule = Box<dyn Fn(&ProducerRecord) -> Option<ConnectorError> + Send + Sync>;
type DelayRule = Box<dyn Fn(&ProducerRecord) -> Duration + Send + Sync>;

/// Producer that completes each send after a scripted delay
pub struct MockProducer {
    cluster: Option<MockCluster>,
    delay: Option<DelayRule>,
    failure: Option<SendRule>,
    sent: Mutex<Vec<(ProducerRecord, Instant)>>,
}

impl Default for MockProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProducer {
    pub fn new() -> Self {
        Self {
            cluster: None,
            delay: None,
            failure: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Published records are appended to the cluster's topic logs
    pub fn for_cluster(cluster: MockCluster) -> Self {
        Self {
            cluster: Some(cluster),
            ..Self::new()
        }
    }

    /// How long the broker takes to acknowledge each record
    pub fn with_delay(
        mut self,
        rule: impl Fn(&ProducerRecord) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.delay = Some(Box::new(rule));
        self
    }

    pub fn failing_when(
        mut self,
        rule: impl Fn(&ProducerRecord) -> Option<ConnectorError> + Send + Sync + 'static,
    ) -> Self {
        self.failure = Some(Box::new(rule));
        self
    }

    /// Records acknowledged so far, in completion order
    pub fn sent(&self) -> Vec<ProducerRecord> {
        lock(&self.sent).iter().map(|(record, _)| record.clone()).collect()
    }
}

#[async_trait]
impl ProducerClient for MockProducer {
    async fn send(&self, record: ProducerRecord) -> ConnectorResult<RecordMetadata> {
        let delay = self.delay.as_ref().map_or(Duration::ZERO, |rule| rule(&record));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.failure.as_ref().and_then(|rule| rule(&record)) {
            return Err(error);
        }

        let partition = record.partition.unwrap_or(0);
        let offset = match &self.cluster {
            Some(cluster) => cluster.produce(
                &record.topic,
                partition,
                record.key.clone(),
                record.value.clone(),
                record.timestamp,
            ),
            None => lock(&self.sent).len() as i64,
        };
        lock(&self.sent).push((record.clone(), Instant::now()));

        Ok(RecordMetadata {
            topic: record.topic,
            partition,
            offset,
        })
    }
}
