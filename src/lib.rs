#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod claim;
mod errors;
mod handle;
mod job_registry;
mod queue;
mod queue_job;
/// Database row types.
pub mod schema;
mod storage;
mod util;
mod worker;

/// Error types for enqueueing, dispatching, and running workers.
pub use self::errors::{DispatchError, EnqueueError, RunError};
/// The claimed-job handle passed to worker code.
pub use self::handle::{JobHandle, ReenqueueUpdate};
/// The queue facade and its run configuration.
pub use self::queue::{OrderMode, Queue, RunHandle};
/// The main trait for defining claimable jobs.
pub use self::queue_job::QueueJob;
/// Database setup and reporting helpers.
pub use self::storage::{failed_job_count, setup_database};
