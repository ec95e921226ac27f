//! Offset commits: offsets handed out with delivered records, and the
//! aggregator that batches them into coordinator commits.

pub mod aggregator;
pub mod offsets;

pub use aggregator::{CommitAck, Committer, RevokedCommits};
pub use offsets::{CommittableOffset, CommittableOffsetBatch, OutstandingGuard, OutstandingOffsets};
