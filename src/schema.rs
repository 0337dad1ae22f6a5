//! Database row types for SQLx.
//!
//! These are snapshots of the durable tables backing the queue. Queue rows
//! are read joined with their worker type, so `job_type` carries the name
//! rather than the raw foreign key.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// A pending or claimed job row in the `queue_jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct QueueJob {
    /// Store-assigned identifier; monotonic insertion order.
    pub id: i64,
    /// Name of the worker type that executes this job.
    pub job_type: String,
    /// JSON payload handed to the worker.
    pub arg: Value,
    /// Claim token, rotated on every successful claim.
    pub uniqkey: String,
    /// When the job was enqueued.
    pub enqueue_time: DateTime<Utc>,
    /// Lease expiry. A job is eligible for claiming once this is in the past.
    pub grabbed_until: DateTime<Utc>,
    /// Number of deliberate re-enqueues.
    pub retry_cnt: i32,
    /// Selection priority; lower values are claimed first.
    pub priority: i16,
}

/// A dead-letter row in the `failed_jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct FailedJob {
    /// Store-assigned identifier.
    pub id: i64,
    /// Name of the worker type whose execution failed.
    pub job_type: String,
    /// Error or panic message captured at the dispatch boundary.
    pub message: String,
    /// Payload of the failed execution.
    pub arg: Value,
    /// Claim token the job carried when it failed.
    pub uniqkey: String,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

/// A row in the `worker_types` catalog.
#[derive(Debug, Clone, FromRow)]
pub struct WorkerType {
    /// Store-assigned identifier, referenced by queue and failure rows.
    pub id: i64,
    /// Unique worker-type name.
    pub name: String,
}
