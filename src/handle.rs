use crate::schema;
use crate::storage;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, warn};

/// A claimed job, exclusively owned by the worker executing it.
///
/// The handle is a process-local snapshot of the claimed row plus the store
/// connection needed to finish it. Worker code is expected to call
/// [`JobHandle::complete`] or [`JobHandle::reenqueue`] before returning;
/// a handle dropped without either leaves the row to be claimed again once
/// its lease expires.
#[derive(Debug)]
pub struct JobHandle {
    pool: PgPool,
    id: i64,
    job_type: String,
    uniqkey: String,
    retry_cnt: i32,
    grabbed_until: DateTime<Utc>,
    arg: Value,
    completed: bool,
}

/// Field overrides applied by [`JobHandle::reenqueue`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ReenqueueUpdate {
    /// How long to keep the job ineligible before it can be claimed again.
    /// `None` makes it eligible immediately.
    pub delay: Option<Duration>,
    /// New selection priority; `None` keeps the current one.
    pub priority: Option<i16>,
}

impl JobHandle {
    pub(crate) fn new(pool: PgPool, job: schema::QueueJob) -> Self {
        Self {
            pool,
            id: job.id,
            job_type: job.job_type,
            uniqkey: job.uniqkey,
            retry_cnt: job.retry_cnt,
            grabbed_until: job.grabbed_until,
            arg: job.arg,
            completed: false,
        }
    }

    /// Store-assigned identifier of the claimed row.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Name of the worker type executing this job.
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// The claim token this job currently carries.
    pub fn uniqkey(&self) -> &str {
        &self.uniqkey
    }

    /// Number of deliberate re-enqueues so far.
    pub fn retry_cnt(&self) -> i32 {
        self.retry_cnt
    }

    /// When this claim's lease expires.
    pub fn grabbed_until(&self) -> DateTime<Utc> {
        self.grabbed_until
    }

    /// The JSON payload the job was enqueued with.
    pub fn arg(&self) -> &Value {
        &self.arg
    }

    /// Whether `complete` has been called on this handle.
    ///
    /// Local state only; it does not consult the store.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Deletes the underlying row, finishing the job.
    ///
    /// Calling this twice is a caller error but harmless: the second call
    /// logs a warning and does nothing.
    pub async fn complete(&mut self) -> Result<(), sqlx::Error> {
        if self.completed {
            warn!(job.id = self.id, "complete() called on an already completed job");
            return Ok(());
        }

        storage::delete_job(&self.pool, self.id).await?;
        self.completed = true;
        debug!(job.id = self.id, "Job completed");
        Ok(())
    }

    /// Puts the job back in the queue for a deliberate retry.
    ///
    /// Resets the lease (after `update.delay`, if any), increments the retry
    /// counter, and optionally overrides the priority, then refreshes this
    /// handle from the updated row.
    pub async fn reenqueue(&mut self, update: ReenqueueUpdate) -> Result<(), sqlx::Error> {
        let delay_seconds = update
            .delay
            .map(|delay| delay.as_secs() as i64)
            .unwrap_or(0);

        let job = storage::reenqueue_job(&self.pool, self.id, delay_seconds, update.priority)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        self.retry_cnt = job.retry_cnt;
        self.grabbed_until = job.grabbed_until;
        debug!(job.id = self.id, job.retry_cnt = self.retry_cnt, "Job re-enqueued");
        Ok(())
    }
}
