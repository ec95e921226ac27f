// ==== Coordinator metrics ====
/// Counter for requests served by the coordinator (labels: kind, outcome)
pub const COORDINATOR_REQUESTS_COUNTER: &str = "connector_coordinator_requests_total";

/// Histogram for time a request spent queued and executing on the coordinator thread
pub const COORDINATOR_REQUEST_DURATION_HISTOGRAM: &str =
    "connector_coordinator_request_duration_seconds";

/// Counter for client polls (label: mode = fetch/housekeeping)
pub const COORDINATOR_POLLS_COUNTER: &str = "connector_coordinator_polls_total";

/// Histogram for records returned by a single poll
pub const POLL_RECORDS_HISTOGRAM: &str = "connector_poll_records";

/// Gauge for partitions owned by this member
pub const ASSIGNED_PARTITIONS_GAUGE: &str = "connector_assigned_partitions";

/// Gauge for partitions currently paused because nobody asked for records
pub const PAUSED_PARTITIONS_GAUGE: &str = "connector_paused_partitions";

/// Counter for records dropped by the demand buffer (label: reason)
pub const RECORDS_DROPPED_COUNTER: &str = "connector_records_dropped_total";

/// Counter for offset gaps detected in a partition's record sequence
pub const PARTITION_OFFSET_GAP_DETECTED: &str = "connector_partition_offset_gap_detected_total";

/// Counter for errors reported by the Kafka client (label: error)
pub const KAFKA_CLIENT_ERRORS_COUNTER: &str = "connector_kafka_client_errors_total";

// ==== Rebalance metrics ====
/// Counter for rebalance callbacks handled (label: event_type)
pub const REBALANCE_EVENTS_COUNTER: &str = "connector_rebalance_events_total";

/// Counter for empty rebalance callbacks skipped (label: event_type)
pub const REBALANCE_EMPTY_SKIPPED: &str = "connector_rebalance_empty_skipped_total";

/// Histogram for time spent inside the revoke callback
pub const REVOKE_DURATION_HISTOGRAM: &str = "connector_revoke_duration_seconds";

/// Counter for offsets-on-assign lookups that failed or timed out
pub const OFFSETS_ON_ASSIGN_FAILED_COUNTER: &str = "connector_offsets_on_assign_failed_total";

// ==== Partition stream metrics ====
/// Gauge for running partition workers
pub const ACTIVE_PARTITION_WORKERS_GAUGE: &str = "connector_active_partition_workers";

/// Counter for records handed to partition streams
pub const RECORDS_DELIVERED_COUNTER: &str = "connector_records_delivered_total";

/// Counter for partition workers that stopped (label: reason)
pub const PARTITION_WORKER_STOPPED_COUNTER: &str = "connector_partition_worker_stopped_total";

// ==== Commit metrics ====
/// Counter for commit batches issued by the aggregator (label: outcome)
pub const COMMIT_BATCHES_COUNTER: &str = "connector_commit_batches_total";

/// Histogram for partitions per commit batch
pub const COMMIT_BATCH_SIZE_HISTOGRAM: &str = "connector_commit_batch_partitions";

/// Histogram for commit round-trip time
pub const COMMIT_DURATION_HISTOGRAM: &str = "connector_commit_duration_seconds";

/// Counter for offsets given up on after exhausting retries or losing the partition (label: reason)
pub const COMMIT_ABANDONED_COUNTER: &str = "connector_commit_abandoned_total";

// ==== Producer metrics ====
/// Counter for records published (label: status)
pub const PRODUCER_RECORDS_COUNTER: &str = "connector_producer_records_total";

/// Histogram for producer send duration
pub const PRODUCER_SEND_DURATION_HISTOGRAM: &str = "connector_producer_send_duration_seconds";
