use crate::handle::JobHandle;
use crate::job_registry::JobRegistry;
use crate::queue::OrderMode;
use crate::storage;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

/// Default bound on the candidate window scanned per claim attempt.
///
/// Small on purpose: many concurrent workers racing over a handful of rows
/// keeps the read cost low, at some expense of fairness under load.
pub(crate) const DEFAULT_FIND_JOB_LIMIT: i64 = 4;

/// Finds and claims the next eligible job, if any.
///
/// Scans a bounded window of eligible rows for the registry's capability
/// set, then walks the candidates in order attempting the atomic claim
/// update. Losing a claim race is not an error; the next candidate is
/// tried. Returns the first successfully claimed job as a [`JobHandle`],
/// or `None` when no candidate could be claimed.
pub(crate) async fn find_job<Context>(
    pool: &PgPool,
    registry: &JobRegistry<Context>,
    order: OrderMode,
    limit: i64,
) -> Result<Option<JobHandle>, sqlx::Error> {
    let job_types = registry.job_types();
    let candidates = storage::find_grabbable_jobs(pool, &job_types, order, limit).await?;

    for candidate in candidates {
        let Some(entry) = registry.get(&candidate.job_type) else {
            continue;
        };

        let new_uniqkey = Uuid::new_v4().simple().to_string();
        let grabbed = storage::grab_job(
            pool,
            candidate.id,
            &candidate.uniqkey,
            &new_uniqkey,
            entry.grab_for,
        )
        .await?;

        if grabbed == 0 {
            debug!(
                job.id = candidate.id,
                "Job could not be grabbed, another worker may have claimed it"
            );
            continue;
        }

        // Re-read by id and rotated token for a consistent snapshot of the
        // claimed row.
        match storage::load_grabbed_job(pool, candidate.id, &new_uniqkey).await? {
            Some(job) => return Ok(Some(JobHandle::new(pool.clone(), job))),
            None => {
                debug!(job.id = candidate.id, "Claimed job vanished before re-read");
                continue;
            }
        }
    }

    Ok(None)
}
