use crate::claim;
use crate::errors::DispatchError;
use crate::job_registry::JobRegistry;
use crate::queue::OrderMode;
use crate::storage;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use sqlx::PgPool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, trace, warn};

pub(crate) struct Worker<Context> {
    pub(crate) pool: PgPool,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) find_job_limit: i64,
    pub(crate) order: OrderMode,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Sleep through an idle poll, waking early if termination is requested.
    async fn idle_wait(&self, sleep_duration: Duration) {
        tokio::select! {
            () = self.shutdown.cancelled() => {}
            () = sleep(sleep_duration) => {}
        }
    }

    /// Run jobs until termination is requested, or until the queue is empty
    /// if `shutdown_when_queue_empty` is set.
    ///
    /// The termination check sits at the top of the loop: an in-flight
    /// dispatch is always allowed to finish.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                debug!("Termination requested. Shutting down the worker…");
                break;
            }

            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No claimable jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No claimable jobs found. Polling again in {sleep_duration:?}…");
                    self.idle_wait(sleep_duration).await;
                }
                Err(error) => {
                    // Store trouble is transient: back off like an idle poll
                    // instead of tearing the loop down.
                    error!("Failed to run job: {error}");
                    self.idle_wait(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Claim and run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was dispatched
    /// - `Ok(None)` if no jobs were claimable
    /// - `Err(...)` if there was an error claiming the job
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run_next_job(&self) -> anyhow::Result<Option<i64>> {
        let context = self.context.clone();
        let job_registry = self.job_registry.clone();
        let pool = &self.pool;

        trace!("Looking for the next claimable job…");

        let Some(mut handle) =
            claim::find_job(pool, &job_registry, self.order, self.find_job_limit).await?
        else {
            return Ok(None);
        };

        let job_id = handle.id();
        let job_type = handle.job_type().to_string();
        let span = info_span!("job", job.id = %job_id, job.type = %job_type);

        debug!("Running job…");

        let future = with_sentry_transaction(&job_type, async || {
            let run_task_fn = job_registry
                .get(&job_type)
                .map(|entry| entry.run.clone())
                .ok_or_else(|| DispatchError::UnresolvedCapability(job_type.clone()))?;

            AssertUnwindSafe(run_task_fn(context, &mut handle))
                .catch_unwind()
                .await
                .map_err(|e| try_to_extract_panic_info(&*e))
                // TODO: Replace with flatten() once that stabilizes
                .and_then(std::convert::identity)
        });

        let result = future
            .instrument(span.clone())
            .bind_hub(Hub::current())
            .await;

        let _enter = span.enter();
        match result {
            Ok(()) => {
                if !handle.is_completed() {
                    trace!("Job returned without completing; it retries after its lease expires");
                }
            }
            Err(error) => {
                warn!("Failed to run job: {error}");
                let message = format!("{error:#}");
                if let Err(log_error) = storage::insert_failed_job(
                    pool,
                    &job_type,
                    handle.uniqkey(),
                    handle.arg(),
                    &message,
                )
                .await
                {
                    // The original failure stays authoritative; the failed
                    // write is reported separately.
                    error!("Failed to record job failure: {log_error} (job failed with: {error})");
                }
            }
        }

        Ok(Some(job_id))
    }
}
