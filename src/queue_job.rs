use crate::errors::EnqueueError;
use crate::handle::JobHandle;
use crate::queue::Queue;
use crate::schema;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::instrument;

/// Trait for defining jobs that can be enqueued and claimed by workers.
pub trait QueueJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the worker type.
    ///
    /// This MUST be unique for the whole application.
    const JOB_NAME: &'static str;

    /// How long a successful claim on this job type stays exclusive, in
    /// seconds.
    ///
    /// If a worker crashes mid-execution, the job becomes claimable again
    /// once this lease expires.
    const GRAB_FOR: i64 = 60;

    /// Default priority of the job. Lower values are claimed first.
    ///
    /// [`Queue::enqueue`] can be used to override the priority value.
    const PRIORITY: i16 = 5;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the job. This method should define its logic.
    ///
    /// The handle is the claimed row: call [`JobHandle::complete`] when the
    /// work is done, or [`JobHandle::reenqueue`] for a deliberate retry.
    /// Returning without either leaves the row to be retried after its
    /// lease expires.
    fn run(
        &self,
        ctx: Self::Context,
        handle: &mut JobHandle,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Enqueue this job for execution with its default priority.
    ///
    /// Fails with [`EnqueueError::UnknownWorkerType`] if [`Self::JOB_NAME`]
    /// was never added to the worker-type catalog.
    #[instrument(name = "claimq.enqueue", skip(self, queue), fields(message = Self::JOB_NAME))]
    fn enqueue<'a>(
        &'a self,
        queue: &'a Queue<Self::Context>,
    ) -> BoxFuture<'a, Result<schema::QueueJob, EnqueueError>>
    where
        Self::Context: Sync,
    {
        queue
            .enqueue(Self::JOB_NAME, self, None, Some(Self::PRIORITY))
            .boxed()
    }
}
