#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use anyhow::anyhow;
use claimq::{
    EnqueueError, JobHandle, OrderMode, Queue, QueueJob, ReenqueueUpdate, RunError,
    failed_job_count, setup_database,
};
use claims::{assert_none, assert_some};
use insta::assert_compact_json_snapshot;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Barrier;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((pool, container))
    }
}

async fn all_jobs(pool: &PgPool) -> anyhow::Result<Vec<(String, Value)>> {
    let rows = sqlx::query(
        r"
        SELECT w.name, q.arg
        FROM queue_jobs q
        JOIN worker_types w ON w.id = q.worker_type_id
        ORDER BY q.id
        ",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|row| (row.get(0), row.get(1))).collect())
}

#[tokio::test]
async fn setup_database_creates_tables() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let table_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables
         WHERE table_name IN ('worker_types', 'queue_jobs', 'failed_jobs')
         AND table_schema = 'public'",
    )
    .fetch_one(&pool)
    .await?;

    assert_eq!(
        table_count, 3,
        "Expected worker_types, queue_jobs and failed_jobs tables"
    );

    Ok(())
}

#[tokio::test]
async fn worker_type_registration_is_idempotent() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Queue::new(pool, ());

    assert!(queue.register_worker_type("resize_image").await?);
    assert!(!queue.register_worker_type("resize_image").await?);
    assert!(queue.register_worker_type("send_email").await?);

    let types = queue.list_registered_types().await?;
    let names: Vec<_> = types.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["resize_image", "send_email"]);

    Ok(())
}

#[tokio::test]
async fn enqueue_with_unknown_worker_type_fails() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Queue::new(pool, ());

    let error = queue
        .enqueue("never_registered", &json!({"number": 1}), None, None)
        .await
        .unwrap_err();
    assert!(matches!(error, EnqueueError::UnknownWorkerType(_)));

    assert_eq!(queue.count_all(None).await?, 0);

    Ok(())
}

#[derive(Serialize, Deserialize)]
struct OrderingJob {
    number: i64,
}

impl QueueJob for OrderingJob {
    const JOB_NAME: &'static str = "ordering";
    type Context = ();

    async fn run(&self, _ctx: Self::Context, _handle: &mut JobHandle) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn seed_ordering_jobs(queue: &Queue<()>) -> anyhow::Result<()> {
    for (number, priority) in [(1, 5), (2, 1), (3, 3)] {
        queue
            .enqueue("ordering", &json!({"number": number}), None, Some(priority))
            .await?;
    }
    Ok(())
}

#[tokio::test]
async fn find_job_respects_priority_order() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Queue::new(pool, ()).register::<OrderingJob>();
    queue.register_worker_type("ordering").await?;

    seed_ordering_jobs(&queue).await?;

    for expected in [2, 3, 1] {
        let mut handle = assert_some!(queue.find_job(OrderMode::Priority).await?);
        assert_eq!(handle.arg()["number"], expected);
        handle.complete().await?;
    }
    assert_none!(queue.find_job(OrderMode::Priority).await?);

    Ok(())
}

#[tokio::test]
async fn find_job_fifo_ignores_priority() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Queue::new(pool, ()).register::<OrderingJob>();
    queue.register_worker_type("ordering").await?;

    seed_ordering_jobs(&queue).await?;

    for expected in [1, 2, 3] {
        let mut handle = assert_some!(queue.find_job(OrderMode::Fifo).await?);
        assert_eq!(handle.arg()["number"], expected);
        handle.complete().await?;
    }
    assert_none!(queue.find_job(OrderMode::Fifo).await?);

    Ok(())
}

#[tokio::test]
async fn claimed_jobs_are_not_claimable_again() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Queue::new(pool, ()).register::<OrderingJob>();
    queue.register_worker_type("ordering").await?;

    queue
        .enqueue("ordering", &json!({"number": 1}), None, None)
        .await?;

    let mut handle = assert_some!(queue.find_job(OrderMode::Fifo).await?);
    assert_none!(queue.find_job(OrderMode::Fifo).await?);

    handle.complete().await?;
    assert_none!(queue.find_job(OrderMode::Fifo).await?);
    assert_eq!(queue.count_all(None).await?, 0);

    Ok(())
}

#[derive(Serialize, Deserialize)]
struct ShortLeaseJob;

impl QueueJob for ShortLeaseJob {
    const JOB_NAME: &'static str = "short_lease";
    const GRAB_FOR: i64 = 1;
    type Context = ();

    async fn run(&self, _ctx: Self::Context, _handle: &mut JobHandle) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn expired_leases_make_jobs_claimable_again() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Queue::new(pool, ()).register::<ShortLeaseJob>();
    queue.register_worker_type("short_lease").await?;

    queue.enqueue("short_lease", &json!({}), None, None).await?;

    let first = assert_some!(queue.find_job(OrderMode::Fifo).await?);
    let first_uniqkey = first.uniqkey().to_string();
    assert_none!(queue.find_job(OrderMode::Fifo).await?);

    // Simulates a crashed worker: the claim is never completed, so the job
    // becomes eligible again once the one-second lease runs out.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let second = assert_some!(queue.find_job(OrderMode::Fifo).await?);
    assert_eq!(second.id(), first.id());
    assert_ne!(second.uniqkey(), first_uniqkey);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn contended_claims_have_a_single_winner() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Arc::new(Queue::new(pool, ()).register::<OrderingJob>());
    queue.register_worker_type("ordering").await?;

    queue
        .enqueue("ordering", &json!({"number": 1}), None, None)
        .await?;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            queue.find_job(OrderMode::Fifo).await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await?.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    Ok(())
}

#[tokio::test]
async fn completing_twice_is_harmless() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Queue::new(pool, ()).register::<OrderingJob>();
    queue.register_worker_type("ordering").await?;

    queue
        .enqueue("ordering", &json!({"number": 1}), None, None)
        .await?;

    let mut handle = assert_some!(queue.find_job(OrderMode::Fifo).await?);
    assert!(!handle.is_completed());

    handle.complete().await?;
    assert!(handle.is_completed());

    handle.complete().await?;
    assert_eq!(queue.count_all(None).await?, 0);

    Ok(())
}

#[tokio::test]
async fn reenqueue_resets_lease_and_increments_retry_count() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Queue::new(pool, ()).register::<OrderingJob>();
    queue.register_worker_type("ordering").await?;

    queue
        .enqueue("ordering", &json!({"number": 1}), None, Some(5))
        .await?;

    let mut handle = assert_some!(queue.find_job(OrderMode::Fifo).await?);
    assert_eq!(handle.retry_cnt(), 0);

    handle
        .reenqueue(ReenqueueUpdate {
            delay: None,
            priority: Some(1),
        })
        .await?;
    assert_eq!(handle.retry_cnt(), 1);
    assert!(!handle.is_completed());

    let pending = queue.list_pending(None).await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_cnt, 1);
    assert_eq!(pending[0].priority, 1);

    let again = assert_some!(queue.find_job(OrderMode::Fifo).await?);
    assert_eq!(again.id(), handle.id());
    assert_eq!(again.retry_cnt(), 1);

    Ok(())
}

#[derive(Serialize, Deserialize)]
struct TypeOne {
    number: i64,
}

impl QueueJob for TypeOne {
    const JOB_NAME: &'static str = "test_one";
    type Context = ();

    async fn run(&self, _ctx: Self::Context, _handle: &mut JobHandle) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct TypeTwo {
    number: i64,
}

impl QueueJob for TypeTwo {
    const JOB_NAME: &'static str = "test_two";
    type Context = ();

    async fn run(&self, _ctx: Self::Context, _handle: &mut JobHandle) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Enqueues the mixed-type fixture: (type, number, priority) in id order.
async fn seed_mixed_types(queue: &Queue<()>) -> anyhow::Result<()> {
    for (funcname, number, priority) in [
        ("test_one", 1, 5),
        ("test_one", 2, 1),
        ("test_two", 3, 3),
        ("test_one", 4, 3),
        ("test_two", 5, 3),
    ] {
        queue
            .enqueue(funcname, &json!({"number": number}), None, Some(priority))
            .await?;
    }
    Ok(())
}

#[tokio::test]
async fn fifo_routing_across_both_types() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Queue::new(pool, ())
        .register::<TypeOne>()
        .register::<TypeTwo>();
    queue.register_worker_type("test_one").await?;
    queue.register_worker_type("test_two").await?;

    seed_mixed_types(&queue).await?;

    for expected in [1, 2, 3, 4, 5] {
        let mut handle = assert_some!(queue.find_job(OrderMode::Fifo).await?);
        assert_eq!(handle.arg()["number"], expected);
        handle.complete().await?;
    }
    assert_none!(queue.find_job(OrderMode::Fifo).await?);

    Ok(())
}

#[tokio::test]
async fn priority_routing_across_both_types() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Queue::new(pool, ())
        .register::<TypeOne>()
        .register::<TypeTwo>();
    queue.register_worker_type("test_one").await?;
    queue.register_worker_type("test_two").await?;

    seed_mixed_types(&queue).await?;

    for expected in [2, 3, 4, 5, 1] {
        let mut handle = assert_some!(queue.find_job(OrderMode::Priority).await?);
        assert_eq!(handle.arg()["number"], expected);
        handle.complete().await?;
    }
    assert_none!(queue.find_job(OrderMode::Priority).await?);

    Ok(())
}

#[tokio::test]
async fn single_type_queue_skips_other_types() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let seeding_queue = Queue::new(pool.clone(), ())
        .register::<TypeOne>()
        .register::<TypeTwo>();
    seeding_queue.register_worker_type("test_one").await?;
    seeding_queue.register_worker_type("test_two").await?;
    seed_mixed_types(&seeding_queue).await?;

    let queue = Queue::new(pool, ()).register::<TypeOne>();

    for expected in [1, 2, 4] {
        let mut handle = assert_some!(queue.find_job(OrderMode::Fifo).await?);
        assert_eq!(handle.job_type(), "test_one");
        assert_eq!(handle.arg()["number"], expected);
        handle.complete().await?;
    }
    assert_none!(queue.find_job(OrderMode::Fifo).await?);

    // The other type's jobs are untouched and still visible.
    let pending = queue.list_pending(None).await?;
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|job| job.job_type == "test_two"));

    Ok(())
}

#[derive(Serialize, Deserialize, Clone)]
struct RoundtripJob {
    value: String,
}

#[derive(Clone, Default)]
struct RoundtripContext {
    received: Arc<std::sync::Mutex<Vec<RoundtripJob>>>,
}

impl QueueJob for RoundtripJob {
    const JOB_NAME: &'static str = "roundtrip";
    type Context = RoundtripContext;

    async fn run(&self, ctx: Self::Context, handle: &mut JobHandle) -> anyhow::Result<()> {
        ctx.received.lock().unwrap().push(self.clone());
        handle.complete().await?;
        Ok(())
    }
}

#[tokio::test]
async fn payloads_survive_the_roundtrip_to_the_worker() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let context = RoundtripContext::default();
    let queue = Queue::new(pool.clone(), context.clone())
        .register::<RoundtripJob>()
        .poll_interval(Duration::from_millis(50))
        .shutdown_when_queue_empty();
    queue.register_worker_type("roundtrip").await?;

    let job = RoundtripJob {
        value: "foo".to_string(),
    };
    job.enqueue(&queue).await?;
    assert_compact_json_snapshot!(all_jobs(&pool).await?, @r#"[["roundtrip", {"value": "foo"}]]"#);

    queue.start(OrderMode::Fifo)?.wait_for_shutdown().await;

    let received = context.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].value, "foo");
    drop(received);

    assert_eq!(queue.count_all(None).await?, 0);

    Ok(())
}

#[derive(Serialize, Deserialize)]
struct FailingJob {
    value: String,
}

impl QueueJob for FailingJob {
    const JOB_NAME: &'static str = "failing";
    type Context = ();

    async fn run(&self, _ctx: Self::Context, _handle: &mut JobHandle) -> anyhow::Result<()> {
        Err(anyhow!("boom goes the dynamite"))
    }
}

#[tokio::test]
async fn failing_jobs_are_recorded_without_stopping_the_loop() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Queue::new(pool.clone(), ()).register::<FailingJob>();
    queue.register_worker_type("failing").await?;

    queue
        .enqueue("failing", &json!({"value": "boom"}), None, None)
        .await?;

    assert_some!(queue.run_once(OrderMode::Fifo).await?);

    let failures = queue.list_failures(None).await?;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].job_type, "failing");
    assert_eq!(failures[0].arg, json!({"value": "boom"}));
    assert!(failures[0].message.contains("boom goes the dynamite"));
    assert!(!failures[0].uniqkey.is_empty());
    assert_eq!(failed_job_count(&pool).await?, 1);

    // The job row survives the failure; it stays leased until the claim
    // expires, so the next poll simply finds nothing.
    assert_eq!(queue.count_all(None).await?, 1);
    assert_none!(queue.run_once(OrderMode::Fifo).await?);

    Ok(())
}

#[derive(Serialize, Deserialize)]
struct PanickingJob;

impl QueueJob for PanickingJob {
    const JOB_NAME: &'static str = "panicking";
    type Context = ();

    async fn run(&self, _ctx: Self::Context, _handle: &mut JobHandle) -> anyhow::Result<()> {
        panic!("this job always panics")
    }
}

#[tokio::test]
async fn panicking_jobs_are_recorded_as_failures() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Queue::new(pool, ()).register::<PanickingJob>();
    queue.register_worker_type("panicking").await?;

    queue.enqueue("panicking", &json!({}), None, None).await?;

    assert_some!(queue.run_once(OrderMode::Fifo).await?);

    let failures = queue.list_failures(None).await?;
    assert_eq!(failures.len(), 1);
    assert!(failures[0].message.contains("panicked"));

    Ok(())
}

#[tokio::test]
async fn failed_jobs_can_be_resubmitted() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Queue::new(pool, ()).register::<FailingJob>();
    queue.register_worker_type("failing").await?;

    queue
        .enqueue("failing", &json!({"value": "boom"}), None, None)
        .await?;
    assert_some!(queue.run_once(OrderMode::Fifo).await?);

    // Clear the original (still leased) row, then bring the failure back.
    queue.purge().await?;
    assert_eq!(queue.count_all(None).await?, 0);

    let failures = queue.list_failures(None).await?;
    let job = queue.resubmit(&failures[0]).await?;
    assert_eq!(job.job_type, "failing");
    assert_eq!(job.arg, json!({"value": "boom"}));
    assert_eq!(job.uniqkey, failures[0].uniqkey);

    let pending = queue.list_pending(None).await?;
    assert_eq!(pending.len(), 1);

    // Resubmission leaves the failure record as history.
    assert_eq!(queue.list_failures(None).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn queue_without_capabilities_refuses_to_run() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = Queue::new(pool, ());

    assert!(matches!(
        queue.run().await,
        Err(RunError::NoRegisteredCapabilities)
    ));
    assert!(matches!(
        queue.run_prioritized().await,
        Err(RunError::NoRegisteredCapabilities)
    ));
    assert!(matches!(
        queue.start(OrderMode::Fifo),
        Err(RunError::NoRegisteredCapabilities)
    ));
    assert!(queue.run_once(OrderMode::Fifo).await.is_err());

    Ok(())
}

#[derive(Clone)]
struct BlockingContext {
    job_started_barrier: Arc<Barrier>,
    assertions_finished_barrier: Arc<Barrier>,
}

#[derive(Serialize, Deserialize)]
struct BlockingJob;

impl QueueJob for BlockingJob {
    const JOB_NAME: &'static str = "blocking";
    type Context = BlockingContext;

    async fn run(&self, ctx: Self::Context, handle: &mut JobHandle) -> anyhow::Result<()> {
        ctx.job_started_barrier.wait().await;
        ctx.assertions_finished_barrier.wait().await;
        handle.complete().await?;
        Ok(())
    }
}

#[tokio::test]
async fn termination_waits_for_in_flight_jobs() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let context = BlockingContext {
        job_started_barrier: Arc::new(Barrier::new(2)),
        assertions_finished_barrier: Arc::new(Barrier::new(2)),
    };

    let queue = Queue::new(pool, context.clone())
        .register::<BlockingJob>()
        .poll_interval(Duration::from_millis(50));
    queue.register_worker_type("blocking").await?;

    BlockingJob.enqueue(&queue).await?;

    let handle = queue.start(OrderMode::Fifo)?;
    context.job_started_barrier.wait().await;

    // Termination is requested while the job is mid-execution; the loop
    // must let it finish before exiting.
    queue.request_termination();
    context.assertions_finished_barrier.wait().await;
    handle.wait_for_shutdown().await;

    assert_eq!(queue.count_all(None).await?, 0);

    Ok(())
}

#[derive(Clone, Default)]
struct CountingContext {
    runs: Arc<AtomicU8>,
}

#[derive(Serialize, Deserialize)]
struct CountingJob {
    number: i64,
}

impl QueueJob for CountingJob {
    const JOB_NAME: &'static str = "counting";
    type Context = CountingContext;

    async fn run(&self, ctx: Self::Context, handle: &mut JobHandle) -> anyhow::Result<()> {
        ctx.runs.fetch_add(1, Ordering::SeqCst);
        handle.complete().await?;
        Ok(())
    }
}

#[tokio::test]
async fn workers_drain_the_queue_and_shut_down() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let context = CountingContext::default();
    let queue = Queue::new(pool, context.clone())
        .register::<CountingJob>()
        .num_workers(2)
        .poll_interval(Duration::from_millis(50))
        .shutdown_when_queue_empty();
    queue.register_worker_type("counting").await?;

    for number in 1..=3 {
        CountingJob { number }.enqueue(&queue).await?;
    }
    assert_eq!(queue.count_all(None).await?, 3);

    queue.start(OrderMode::Fifo)?.wait_for_shutdown().await;

    assert_eq!(context.runs.load(Ordering::SeqCst), 3);
    assert_eq!(queue.count_all(None).await?, 0);

    Ok(())
}
