use crate::handle::JobHandle;
use crate::queue_job::QueueJob;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type RunTaskFn<Context> =
    dyn for<'a> Fn(Context, &'a mut JobHandle) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync;

/// A registered capability: the lease duration and the type-erased entry
/// point for one worker type.
pub(crate) struct RegistryEntry<Context> {
    pub(crate) grab_for: i64,
    pub(crate) run: Arc<RunTaskFn<Context>>,
}

impl<Context> Clone for RegistryEntry<Context> {
    fn clone(&self) -> Self {
        Self {
            grab_for: self.grab_for,
            run: self.run.clone(),
        }
    }
}

/// Maps worker-type names to their entry points.
///
/// Registration is static: a capability resolves at compile time through
/// [`QueueJob`], so the only runtime lookup that can fail is dispatching a
/// row whose type was never registered in this process.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, RegistryEntry<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context> JobRegistry<Context> {
    pub(crate) fn get(&self, job_type: &str) -> Option<&RegistryEntry<Context>> {
        self.entries.get(job_type)
    }

    /// The set of registered names, driving the claim scan filter.
    pub(crate) fn job_types(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub(crate) fn has_any(&self) -> bool {
        !self.entries.is_empty()
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: QueueJob<Context = Context>>(&mut self) {
        let run: Arc<RunTaskFn<Context>> = Arc::new(runnable::<J>);
        let entry = RegistryEntry {
            grab_for: J::GRAB_FOR,
            run,
        };
        self.entries.insert(J::JOB_NAME.to_string(), entry);
    }
}

/// Deserializes the payload into the concrete job type and runs it.
fn runnable<J: QueueJob>(
    ctx: J::Context,
    handle: &mut JobHandle,
) -> BoxFuture<'_, anyhow::Result<()>> {
    let job = serde_json::from_value::<J>(handle.arg().clone());
    async move {
        let job = job?;
        job.run(ctx, handle).await
    }
    .boxed()
}
