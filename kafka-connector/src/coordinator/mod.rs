//! Consumer Coordinator - the only code that touches the consumer client
//!
//! Callers talk to it through a [`CoordinatorHandle`]; requests are served one at
//! a time on a dedicated blocking thread, interleaved with polls. Rebalance
//! callbacks run inline inside those polls through the [`RebalanceBridge`].

pub mod actor;
pub mod demand_buffer;
pub mod handle;
pub mod partition_table;
pub mod rebalance;
pub mod request;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use actor::ConsumerCoordinator;
pub use demand_buffer::DemandBuffer;
pub use handle::CoordinatorHandle;
pub use rebalance::{
    AssignmentObserver, NoopObserver, OffsetsOnAssign, RebalanceBridge, RevokeOutcome,
};
pub use request::{MetadataQuery, MetadataResponse};

use crate::config::ConsumerSettings;
use crate::kafka::client::ConsumerClient;

/// Start a coordinator that nobody streams records from, for metadata
/// queries and commits. Must be called from within a tokio runtime.
pub fn start<C: ConsumerClient>(
    client: C,
    settings: ConsumerSettings,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (handle, inbox) = CoordinatorHandle::channel(settings.request_timeout);
    let task = ConsumerCoordinator::new(
        client,
        inbox,
        settings,
        Arc::new(NoopObserver),
        None,
        CancellationToken::new(),
    )
    .spawn();
    (handle, task)
}
