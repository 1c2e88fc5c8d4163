//! Snapshot persistence plus the rate-limit and retry discipline wrapped
//! around every external source call.

pub mod client;
pub mod fs;
pub mod limiter;
pub mod postgres;
pub mod retry;
pub mod snapshot;

pub use client::{CallError, CallErrorKind, RateLimitedClient};
pub use fs::FsSnapshotStore;
pub use limiter::{LimitError, RateLimiter, TokenBucket, TokenBucketConfig};
pub use postgres::PgSnapshotStore;
pub use retry::{
    classify_reqwest_error, classify_status, BackoffPolicy, BackoffPolicyConfig, RetryClassify,
    RetryDisposition,
};
pub use snapshot::{next_snapshot_time, HistoryPager, InMemorySnapshotStore, SnapshotStore, StoreError};

pub const CRATE_NAME: &str = "fcap-storage";
