use crate::claim;
use crate::errors::{EnqueueError, RunError};
use crate::handle::JobHandle;
use crate::job_registry::JobRegistry;
use crate::queue_job::QueueJob;
use crate::schema;
use crate::storage;
use crate::worker::Worker;
use futures_util::future::join_all;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, instrument, warn};
use uuid::Uuid;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Candidate selection policy for claiming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderMode {
    /// Insertion order only; priority is ignored.
    #[default]
    Fifo,
    /// Ascending `(priority, insertion order)`; lower priority values are
    /// claimed first.
    Priority,
}

/// The queue facade: enqueueing, claiming, reporting, and the worker loop.
///
/// A `Queue` owns a connection pool, the application context handed to
/// jobs, and the capability registry of this process. Construct it
/// explicitly with [`Queue::new`] and builder-style configuration; several
/// independent queues (or processes) may point at the same database.
pub struct Queue<Context> {
    pool: PgPool,
    context: Context,
    job_registry: JobRegistry<Context>,
    worker_type_cache: Arc<Mutex<HashMap<String, i64>>>,
    shutdown: CancellationToken,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    find_job_limit: i64,
    shutdown_when_queue_empty: bool,
}

impl<Context: std::fmt::Debug> std::fmt::Debug for Queue<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("job_types", &self.job_registry.job_types())
            .field("context", &self.context)
            .field("num_workers", &self.num_workers)
            .field("poll_interval", &self.poll_interval)
            .field("find_job_limit", &self.find_job_limit)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Queue<Context> {
    /// Create a new queue with the given connection pool and context.
    pub fn new(pool: PgPool, context: Context) -> Self {
        Self {
            pool,
            context,
            job_registry: JobRegistry::default(),
            worker_type_cache: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            find_job_limit: claim::DEFAULT_FIND_JOB_LIMIT,
            shutdown_when_queue_empty: false,
        }
    }

    /// Register a job type this process is able to execute.
    ///
    /// Purely in-process; the worker-type catalog in the store is managed
    /// separately through [`Queue::register_worker_type`].
    #[must_use]
    pub fn register<J: QueueJob<Context = Context>>(mut self) -> Self {
        self.job_registry.register::<J>();
        self
    }

    /// Set how often workers poll for new jobs when idle.
    #[must_use]
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    #[must_use]
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Bound the candidate window scanned per claim attempt.
    #[must_use]
    pub fn find_job_limit(mut self, find_job_limit: i64) -> Self {
        self.find_job_limit = find_job_limit;
        self
    }

    /// Set the number of worker tasks spawned by [`Queue::start`].
    #[must_use]
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Make worker loops shut down once no claimable job is found.
    #[must_use]
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Add a worker-type name to the backing catalog if it is missing.
    ///
    /// Returns `true` if the catalog row was created by this call.
    pub async fn register_worker_type(&self, name: &str) -> Result<bool, sqlx::Error> {
        storage::register_worker_type(&self.pool, name).await
    }

    /// Enqueue a job by worker-type name.
    ///
    /// The payload is serialized to JSON and must round-trip losslessly. A
    /// fresh claim token is generated when `uniqkey` is `None`; priority
    /// defaults to the store's mid-range default when `None`. The new row
    /// is immediately eligible for claiming.
    ///
    /// Fails with [`EnqueueError::UnknownWorkerType`] if `funcname` was
    /// never registered in the catalog.
    #[instrument(name = "claimq.enqueue", skip(self, arg))]
    pub async fn enqueue(
        &self,
        funcname: &str,
        arg: &impl Serialize,
        uniqkey: Option<String>,
        priority: Option<i16>,
    ) -> Result<schema::QueueJob, EnqueueError> {
        let worker_type_id = self.resolve_worker_type_id(funcname).await?;
        let arg = serde_json::to_value(arg)?;
        let uniqkey = uniqkey.unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let job = storage::insert_job(&self.pool, worker_type_id, &arg, &uniqkey, priority).await?;
        Ok(job)
    }

    /// Resolve a worker-type name to its catalog id, caching per process.
    async fn resolve_worker_type_id(&self, funcname: &str) -> Result<i64, EnqueueError> {
        if let Some(id) = self.worker_type_cache.lock().await.get(funcname) {
            return Ok(*id);
        }

        let id = storage::resolve_worker_type(&self.pool, funcname)
            .await?
            .ok_or_else(|| EnqueueError::UnknownWorkerType(funcname.to_string()))?;

        self.worker_type_cache
            .lock()
            .await
            .insert(funcname.to_string(), id);
        Ok(id)
    }

    /// Re-create a queue row from a dead-letter record.
    ///
    /// The new row carries the original worker type, payload, and claim
    /// token with a fresh lease. The failure record itself is left as
    /// history.
    pub async fn resubmit(
        &self,
        failed: &schema::FailedJob,
    ) -> Result<schema::QueueJob, EnqueueError> {
        let worker_type_id = self.resolve_worker_type_id(&failed.job_type).await?;
        let job =
            storage::insert_job(&self.pool, worker_type_id, &failed.arg, &failed.uniqkey, None)
                .await?;
        Ok(job)
    }

    /// Claim the next eligible job without dispatching it.
    ///
    /// Exposed for callers that drive their own dispatch; the worker loop
    /// uses the same engine internally.
    pub async fn find_job(&self, order: OrderMode) -> Result<Option<JobHandle>, sqlx::Error> {
        claim::find_job(&self.pool, &self.job_registry, order, self.find_job_limit).await
    }

    /// Claim and dispatch a single job.
    ///
    /// Returns `Ok(Some(job_id))` when a job was dispatched (whether its
    /// execution succeeded or was recorded as a failure) and `Ok(None)`
    /// when nothing was claimable. Fails fast with
    /// [`RunError::NoRegisteredCapabilities`] when nothing is registered.
    pub async fn run_once(&self, order: OrderMode) -> anyhow::Result<Option<i64>> {
        if !self.job_registry.has_any() {
            return Err(RunError::NoRegisteredCapabilities.into());
        }

        self.worker(order).run_next_job().await
    }

    /// Run the worker loop in the calling task, claiming in FIFO order.
    ///
    /// Returns once termination is requested (or, with
    /// `shutdown_when_queue_empty`, once an idle poll finds nothing).
    pub async fn run(&self) -> Result<(), RunError> {
        self.run_with_order(OrderMode::Fifo).await
    }

    /// Run the worker loop in the calling task, claiming in priority order.
    pub async fn run_prioritized(&self) -> Result<(), RunError> {
        self.run_with_order(OrderMode::Priority).await
    }

    async fn run_with_order(&self, order: OrderMode) -> Result<(), RunError> {
        if !self.job_registry.has_any() {
            return Err(RunError::NoRegisteredCapabilities);
        }

        self.worker(order).run().await;
        Ok(())
    }

    /// Start the configured number of worker tasks.
    ///
    /// This returns a [`RunHandle`] which can be used to wait for the
    /// workers to shut down. Fails fast with
    /// [`RunError::NoRegisteredCapabilities`] when nothing is registered.
    pub fn start(&self, order: OrderMode) -> Result<RunHandle, RunError> {
        if !self.job_registry.has_any() {
            return Err(RunError::NoRegisteredCapabilities);
        }

        let mut handles = Vec::new();
        for i in 1..=self.num_workers {
            let name = format!("queue-worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = self.worker(order);
            let span = info_span!("worker", worker.name = %name);
            let handle = tokio::spawn(async move { worker.run().instrument(span).await });

            handles.push(handle);
        }

        Ok(RunHandle { handles })
    }

    /// Request cooperative termination of all loops driven by this queue.
    ///
    /// Loops exit at the top of their next iteration; in-flight jobs are
    /// allowed to finish.
    pub fn request_termination(&self) {
        info!("Requesting worker termination…");
        self.shutdown.cancel();
    }

    /// Delete all queue rows unconditionally, claimed or not.
    ///
    /// Administrative and test operation; returns the number of rows
    /// removed. Dead-letter records are not touched.
    pub async fn purge(&self) -> Result<u64, sqlx::Error> {
        storage::delete_all_jobs(&self.pool).await
    }

    /// List currently eligible jobs in insertion order.
    ///
    /// Bounded by the same candidate-window limit used for claiming.
    pub async fn list_pending(
        &self,
        job_types: Option<&[String]>,
    ) -> Result<Vec<schema::QueueJob>, sqlx::Error> {
        storage::pending_jobs(&self.pool, job_types, self.find_job_limit).await
    }

    /// Count queue rows, claimed or not, optionally filtered by type.
    pub async fn count_all(&self, job_types: Option<&[String]>) -> Result<i64, sqlx::Error> {
        storage::count_jobs(&self.pool, job_types).await
    }

    /// List dead-letter records, optionally filtered by type.
    pub async fn list_failures(
        &self,
        job_types: Option<&[String]>,
    ) -> Result<Vec<schema::FailedJob>, sqlx::Error> {
        storage::failed_jobs(&self.pool, job_types).await
    }

    /// List the worker-type catalog in registration order.
    pub async fn list_registered_types(&self) -> Result<Vec<schema::WorkerType>, sqlx::Error> {
        storage::list_worker_types(&self.pool).await
    }

    fn worker(&self, order: OrderMode) -> Worker<Context> {
        Worker {
            pool: self.pool.clone(),
            context: self.context.clone(),
            job_registry: Arc::new(self.job_registry.clone()),
            shutdown: self.shutdown.clone(),
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            find_job_limit: self.find_job_limit,
            order,
        }
    }
}

/// Handle to a running set of worker tasks.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait for all workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Worker task panicked");
            }
        });
    }
}
