use std::collections::BTreeSet;
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commit::{CommittableOffset, Committer};
use crate::config::{FailurePolicy, ProducerSettings};
use crate::error::{ConnectorError, ConnectorResult};
use crate::kafka::types::TopicPartition;
use crate::metrics_const::{PRODUCER_RECORDS_COUNTER, PRODUCER_SEND_DURATION_HISTOGRAM};
use crate::producer::client::{ProducerClient, ProducerRecord, RecordMetadata};
use crate::producer::envelope::{Envelope, EnvelopeError, ProducerResult, Shape};
use crate::producer::resequencer::Resequencer;

pub type EnvelopeOutcome<P> = Result<ProducerResult<P>, EnvelopeError<P>>;

/// Publishes envelopes with bounded parallelism and emits their outcomes in
/// the order the envelopes arrived.
pub struct ProducerFlow<C: ProducerClient> {
    client: Arc<C>,
    settings: ProducerSettings,
}

impl<C: ProducerClient> Clone for ProducerFlow<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<C: ProducerClient> ProducerFlow<C> {
    pub fn new(client: Arc<C>, settings: ProducerSettings) -> Self {
        Self { client, settings }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Start publishing `envelopes`. With `FailurePolicy::FailFast` the output
    /// ends right after the first failed envelope.
    pub fn flow<P, S>(&self, envelopes: S) -> ProducerResults<P>
    where
        P: Debug + Send + 'static,
        S: Stream<Item = Envelope<P>> + Send + 'static,
    {
        let parallelism = self.settings.parallelism.max(1);
        let (tx, rx) = mpsc::channel(parallelism);
        let driver = FlowDriver {
            client: self.client.clone(),
            semaphore: Arc::new(Semaphore::new(parallelism)),
            parallelism,
            policy: self.settings.failure_policy,
        };
        let task = tokio::spawn(driver.run(Box::pin(envelopes), tx));
        ProducerResults { rx, task }
    }

    /// Publish `records` and discard the results. Fails on the first failed
    /// record with `FailurePolicy::FailFast`, otherwise logs failures and
    /// publishes everything.
    pub async fn plain_sink<S>(&self, records: S) -> ConnectorResult<()>
    where
        S: Stream<Item = ProducerRecord> + Send + 'static,
    {
        let mut results = self.flow(records.map(|record| Envelope::single(record, ())));
        let mut failures = 0_usize;

        while let Some(outcome) = results.next().await {
            if let Err(EnvelopeError { error, .. }) = outcome {
                if self.settings.failure_policy == FailurePolicy::FailFast {
                    return Err(error);
                }
                warn!("Publish failed: {}", error);
                failures += 1;
            }
        }

        if failures > 0 {
            info!("Sink finished with {} failed records", failures);
        }
        Ok(())
    }

    /// Publish envelopes carrying consumed offsets and commit each offset only
    /// after its envelope was published. A failed envelope's offset is never
    /// committed, nor is any later offset of the same partition.
    pub async fn committable_sink<S>(
        &self,
        envelopes: S,
        committer: &Committer,
    ) -> ConnectorResult<()>
    where
        S: Stream<Item = Envelope<CommittableOffset>> + Send + 'static,
    {
        let mut results = self.flow(envelopes);
        let mut failed_partitions: BTreeSet<TopicPartition> = BTreeSet::new();
        let mut first_error = None;

        while let Some(outcome) = results.next().await {
            match outcome {
                Ok(result) => {
                    let offset = result.into_pass_through();
                    if failed_partitions.contains(offset.partition()) {
                        debug!(
                            topic = offset.partition().topic(),
                            partition = offset.partition().partition(),
                            offset = offset.offset(),
                            "Not committing past a failed publish"
                        );
                        continue;
                    }
                    offset.submit();
                }
                Err(EnvelopeError {
                    error,
                    pass_through,
                }) => {
                    warn!(
                        topic = pass_through.partition().topic(),
                        partition = pass_through.partition().partition(),
                        offset = pass_through.offset(),
                        "Publish failed, offset will not be committed: {}",
                        error
                    );
                    failed_partitions.insert(pass_through.partition().clone());
                    first_error.get_or_insert(error);
                }
            }
        }

        committer.flush().await?;
        match first_error {
            Some(error) if self.settings.failure_policy == FailurePolicy::FailFast => Err(error),
            _ => Ok(()),
        }
    }
}

/// Outcomes of a running producer flow, in input order
pub struct ProducerResults<P: Debug> {
    rx: mpsc::Receiver<EnvelopeOutcome<P>>,
    task: JoinHandle<()>,
}

impl<P: Debug> Stream for ProducerResults<P> {
    type Item = EnvelopeOutcome<P>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<P: Debug> Drop for ProducerResults<P> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct FlowDriver<C: ProducerClient> {
    client: Arc<C>,
    semaphore: Arc<Semaphore>,
    parallelism: usize,
    policy: FailurePolicy,
}

impl<C: ProducerClient> FlowDriver<C> {
    async fn run<P>(
        self,
        mut envelopes: Pin<Box<dyn Stream<Item = Envelope<P>> + Send>>,
        tx: mpsc::Sender<EnvelopeOutcome<P>>,
    ) where
        P: Debug + Send + 'static,
    {
        let mut in_flight = FuturesUnordered::new();
        let mut resequencer = Resequencer::new();
        let mut next_sequence: u64 = 0;
        let mut input_done = false;

        loop {
            // envelopes completed out of order count against the bound too
            let has_capacity = in_flight.len() + resequencer.held() < self.parallelism;

            tokio::select! {
                envelope = envelopes.next(), if !input_done && has_capacity => match envelope {
                    Some(envelope) => {
                        let sequence = next_sequence;
                        next_sequence += 1;
                        let publish =
                            publish(self.client.clone(), self.semaphore.clone(), envelope);
                        in_flight.push(async move { (sequence, publish.await) });
                    }
                    None => input_done = true,
                },
                Some((sequence, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                    for outcome in resequencer.complete(sequence, outcome) {
                        let failed = outcome.is_err();
                        if tx.send(outcome).await.is_err() {
                            debug!("Producer results dropped, stopping flow");
                            return;
                        }
                        if failed && self.policy == FailurePolicy::FailFast {
                            warn!("Stopping producer flow after failed envelope");
                            return;
                        }
                    }
                }
                else => break,
            }
        }
        info!("Producer flow completed {} envelopes", next_sequence);
    }
}

async fn publish<C, P>(
    client: Arc<C>,
    semaphore: Arc<Semaphore>,
    envelope: Envelope<P>,
) -> EnvelopeOutcome<P>
where
    C: ProducerClient,
    P: Debug,
{
    let (shape, records, pass_through) = envelope.into_parts();

    let sends = records.into_iter().map(|record| {
        let client = client.clone();
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| ConnectorError::Cancelled)?;
            let started = Instant::now();
            let result = client.send(record.clone()).await;
            metrics::histogram!(PRODUCER_SEND_DURATION_HISTOGRAM)
                .record(started.elapsed().as_secs_f64());
            let outcome = if result.is_ok() { "success" } else { "failure" };
            metrics::counter!(PRODUCER_RECORDS_COUNTER, "outcome" => outcome).increment(1);
            result.map(|metadata| (record, metadata))
        }
    });
    let sent: Vec<ConnectorResult<(ProducerRecord, RecordMetadata)>> =
        futures::future::join_all(sends).await;

    let mut parts = Vec::with_capacity(sent.len());
    for result in sent {
        match result {
            Ok(part) => parts.push(part),
            Err(error) => {
                return Err(EnvelopeError {
                    error,
                    pass_through,
                })
            }
        }
    }

    match shape {
        Shape::Single => match parts.pop() {
            Some((record, metadata)) => Ok(ProducerResult::Single {
                record,
                metadata,
                pass_through,
            }),
            None => Ok(ProducerResult::PassThrough(pass_through)),
        },
        Shape::Multi => Ok(ProducerResult::Multi {
            parts,
            pass_through,
        }),
        Shape::PassThrough => Ok(ProducerResult::PassThrough(pass_through)),
    }
}
