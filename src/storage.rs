use crate::queue::OrderMode;
use crate::schema::{FailedJob, QueueJob, WorkerType};
use sqlx::PgPool;

/// Create the queue tables by running the bundled migrations.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Finds eligible candidate jobs for the given worker types.
///
/// A job is eligible once its lease has expired (`grabbed_until <= NOW()`).
/// The scan is bounded by `limit` so that many concurrent workers contend
/// over a small window of rows instead of the whole table.
pub(crate) async fn find_grabbable_jobs(
    pool: &PgPool,
    job_types: &[String],
    order: OrderMode,
    limit: i64,
) -> Result<Vec<QueueJob>, sqlx::Error> {
    let query = match order {
        OrderMode::Priority => {
            r"
            SELECT q.id, w.name AS job_type, q.arg, q.uniqkey, q.enqueue_time,
                   q.grabbed_until, q.retry_cnt, q.priority
            FROM queue_jobs q
            JOIN worker_types w ON w.id = q.worker_type_id
            WHERE w.name = ANY($1) AND q.grabbed_until <= NOW()
            ORDER BY q.priority ASC, q.id ASC
            LIMIT $2
            "
        }
        OrderMode::Fifo => {
            r"
            SELECT q.id, w.name AS job_type, q.arg, q.uniqkey, q.enqueue_time,
                   q.grabbed_until, q.retry_cnt, q.priority
            FROM queue_jobs q
            JOIN worker_types w ON w.id = q.worker_type_id
            WHERE w.name = ANY($1) AND q.grabbed_until <= NOW()
            ORDER BY q.id ASC
            LIMIT $2
            "
        }
    };

    sqlx::query_as::<_, QueueJob>(query)
        .bind(job_types)
        .bind(limit)
        .fetch_all(pool)
        .await
}

/// Attempts to claim a job with an atomic conditional update.
///
/// The update rotates the claim token and pushes the lease forward, but only
/// if the row still carries the token observed during the scan and its lease
/// is still expired at update time. Returns the number of rows affected:
/// zero means another worker won the race (or the row vanished), one means
/// the claim succeeded.
pub(crate) async fn grab_job(
    pool: &PgPool,
    job_id: i64,
    expected_uniqkey: &str,
    new_uniqkey: &str,
    grab_for_seconds: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE queue_jobs
        SET uniqkey = $3, grabbed_until = NOW() + make_interval(secs => $4)
        WHERE id = $1 AND uniqkey = $2 AND grabbed_until <= NOW()
        ",
    )
    .bind(job_id)
    .bind(expected_uniqkey)
    .bind(new_uniqkey)
    .bind(grab_for_seconds as f64)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Re-reads a freshly claimed job by id and its rotated token.
pub(crate) async fn load_grabbed_job(
    pool: &PgPool,
    job_id: i64,
    uniqkey: &str,
) -> Result<Option<QueueJob>, sqlx::Error> {
    sqlx::query_as::<_, QueueJob>(
        r"
        SELECT q.id, w.name AS job_type, q.arg, q.uniqkey, q.enqueue_time,
               q.grabbed_until, q.retry_cnt, q.priority
        FROM queue_jobs q
        JOIN worker_types w ON w.id = q.worker_type_id
        WHERE q.id = $1 AND q.uniqkey = $2
        ",
    )
    .bind(job_id)
    .bind(uniqkey)
    .fetch_optional(pool)
    .await
}

/// Inserts a new job row, immediately eligible for claiming.
pub(crate) async fn insert_job(
    pool: &PgPool,
    worker_type_id: i64,
    arg: &serde_json::Value,
    uniqkey: &str,
    priority: Option<i16>,
) -> Result<QueueJob, sqlx::Error> {
    sqlx::query_as::<_, QueueJob>(
        r"
        WITH inserted AS (
            INSERT INTO queue_jobs (worker_type_id, arg, uniqkey, priority)
            VALUES ($1, $2, $3, COALESCE($4, 5::smallint))
            RETURNING id, worker_type_id, arg, uniqkey, enqueue_time,
                      grabbed_until, retry_cnt, priority
        )
        SELECT i.id, w.name AS job_type, i.arg, i.uniqkey, i.enqueue_time,
               i.grabbed_until, i.retry_cnt, i.priority
        FROM inserted i
        JOIN worker_types w ON w.id = i.worker_type_id
        ",
    )
    .bind(worker_type_id)
    .bind(arg)
    .bind(uniqkey)
    .bind(priority)
    .fetch_one(pool)
    .await
}

/// Deletes a job that has completed running.
pub(crate) async fn delete_job(pool: &PgPool, job_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Deletes all job rows unconditionally. Administrative operation.
pub(crate) async fn delete_all_jobs(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM queue_jobs").execute(pool).await?;
    Ok(result.rows_affected())
}

/// Resets a claimed job's lease for a deliberate retry.
///
/// Increments the retry counter, makes the job eligible again after
/// `delay_seconds`, and optionally overrides its priority. Returns the
/// refreshed row, or `None` if the job no longer exists.
pub(crate) async fn reenqueue_job(
    pool: &PgPool,
    job_id: i64,
    delay_seconds: i64,
    priority: Option<i16>,
) -> Result<Option<QueueJob>, sqlx::Error> {
    sqlx::query_as::<_, QueueJob>(
        r"
        WITH updated AS (
            UPDATE queue_jobs
            SET retry_cnt = retry_cnt + 1,
                grabbed_until = NOW() + make_interval(secs => $2),
                priority = COALESCE($3, priority)
            WHERE id = $1
            RETURNING id, worker_type_id, arg, uniqkey, enqueue_time,
                      grabbed_until, retry_cnt, priority
        )
        SELECT u.id, w.name AS job_type, u.arg, u.uniqkey, u.enqueue_time,
               u.grabbed_until, u.retry_cnt, u.priority
        FROM updated u
        JOIN worker_types w ON w.id = u.worker_type_id
        ",
    )
    .bind(job_id)
    .bind(delay_seconds as f64)
    .bind(priority)
    .fetch_optional(pool)
    .await
}

/// Lists currently eligible jobs in insertion order, bounded by `limit`.
pub(crate) async fn pending_jobs(
    pool: &PgPool,
    job_types: Option<&[String]>,
    limit: i64,
) -> Result<Vec<QueueJob>, sqlx::Error> {
    match job_types {
        Some(types) => {
            sqlx::query_as::<_, QueueJob>(
                r"
                SELECT q.id, w.name AS job_type, q.arg, q.uniqkey, q.enqueue_time,
                       q.grabbed_until, q.retry_cnt, q.priority
                FROM queue_jobs q
                JOIN worker_types w ON w.id = q.worker_type_id
                WHERE w.name = ANY($1) AND q.grabbed_until <= NOW()
                ORDER BY q.id ASC
                LIMIT $2
                ",
            )
            .bind(types)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, QueueJob>(
                r"
                SELECT q.id, w.name AS job_type, q.arg, q.uniqkey, q.enqueue_time,
                       q.grabbed_until, q.retry_cnt, q.priority
                FROM queue_jobs q
                JOIN worker_types w ON w.id = q.worker_type_id
                WHERE q.grabbed_until <= NOW()
                ORDER BY q.id ASC
                LIMIT $1
                ",
            )
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
}

/// Counts job rows, claimed or not, optionally filtered by worker type.
pub(crate) async fn count_jobs(
    pool: &PgPool,
    job_types: Option<&[String]>,
) -> Result<i64, sqlx::Error> {
    match job_types {
        Some(types) => {
            sqlx::query_scalar::<_, i64>(
                r"
                SELECT COUNT(*)
                FROM queue_jobs q
                JOIN worker_types w ON w.id = q.worker_type_id
                WHERE w.name = ANY($1)
                ",
            )
            .bind(types)
            .fetch_one(pool)
            .await
        }
        None => {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queue_jobs")
                .fetch_one(pool)
                .await
        }
    }
}

/// Records a failed execution in the dead-letter table.
pub(crate) async fn insert_failed_job(
    pool: &PgPool,
    job_type: &str,
    uniqkey: &str,
    arg: &serde_json::Value,
    message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO failed_jobs (worker_type_id, message, arg, uniqkey)
        SELECT id, $2, $3, $4 FROM worker_types WHERE name = $1
        ",
    )
    .bind(job_type)
    .bind(message)
    .bind(arg)
    .bind(uniqkey)
    .execute(pool)
    .await?;
    Ok(())
}

/// Lists dead-letter rows, optionally filtered by worker type.
pub(crate) async fn failed_jobs(
    pool: &PgPool,
    job_types: Option<&[String]>,
) -> Result<Vec<FailedJob>, sqlx::Error> {
    match job_types {
        Some(types) => {
            sqlx::query_as::<_, FailedJob>(
                r"
                SELECT f.id, w.name AS job_type, f.message, f.arg, f.uniqkey, f.failed_at
                FROM failed_jobs f
                JOIN worker_types w ON w.id = f.worker_type_id
                WHERE w.name = ANY($1)
                ORDER BY f.id ASC
                ",
            )
            .bind(types)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, FailedJob>(
                r"
                SELECT f.id, w.name AS job_type, f.message, f.arg, f.uniqkey, f.failed_at
                FROM failed_jobs f
                JOIN worker_types w ON w.id = f.worker_type_id
                ORDER BY f.id ASC
                ",
            )
            .fetch_all(pool)
            .await
        }
    }
}

/// The number of recorded failures.
pub async fn failed_job_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM failed_jobs")
        .fetch_one(pool)
        .await
}

/// Looks up a worker type's catalog id by name.
pub(crate) async fn resolve_worker_type(
    pool: &PgPool,
    name: &str,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT id FROM worker_types WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
}

/// Adds a worker type to the catalog if it is not already present.
///
/// Returns `true` if a new row was created.
pub(crate) async fn register_worker_type(pool: &PgPool, name: &str) -> Result<bool, sqlx::Error> {
    let inserted = sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO worker_types (name)
        VALUES ($1)
        ON CONFLICT (name) DO NOTHING
        RETURNING id
        ",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(inserted.is_some())
}

/// Lists the worker-type catalog in registration order.
pub(crate) async fn list_worker_types(pool: &PgPool) -> Result<Vec<WorkerType>, sqlx::Error> {
    sqlx::query_as::<_, WorkerType>("SELECT id, name FROM worker_types ORDER BY id ASC")
        .fetch_all(pool)
        .await
}
