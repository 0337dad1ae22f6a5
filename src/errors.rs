use thiserror::Error;

/// Errors that can occur when enqueueing a job.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The worker-type name has never been registered in the catalog.
    #[error("unknown worker type: {0}")]
    UnknownWorkerType(String),

    /// Failed to serialize the job payload to JSON.
    #[error("failed to serialize job payload")]
    SerializationError(#[from] serde_json::Error),

    /// A database error occurred.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}

/// Errors that can occur when dispatching a claimed job.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A claimed row names a worker type this process has no entry point for.
    #[error("unresolved capability: {0}")]
    UnresolvedCapability(String),
}

/// Errors that can occur when running the worker loop.
#[derive(Debug, Error)]
pub enum RunError {
    /// The registry is empty. Polling would never find claimable work, so
    /// the loop refuses to start instead of idling forever.
    #[error("no registered capabilities; refusing to poll for work")]
    NoRegisteredCapabilities,

    /// A database error occurred.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}
