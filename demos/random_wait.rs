//! End-to-end demo: enqueue a batch of jobs that sleep for a random
//! duration, then drain the queue with two workers.
//!
//! This demo uses TestContainers to automatically start a PostgreSQL
//! database, so no manual setup is required. Just run:
//!
//! ```bash
//! cargo run --example random_wait
//! ```

use anyhow::Result;
use claimq::{JobHandle, OrderMode, Queue, QueueJob};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;

/// A job that waits for the number of milliseconds it was enqueued with.
#[derive(Serialize, Deserialize)]
struct RandomWait {
    wait_millis: u64,
}

impl QueueJob for RandomWait {
    const JOB_NAME: &'static str = "random_wait";
    const GRAB_FOR: i64 = 50;
    type Context = ();

    async fn run(&self, _ctx: Self::Context, handle: &mut JobHandle) -> Result<()> {
        println!("job {} waits {} ms", handle.id(), self.wait_millis);
        tokio::time::sleep(Duration::from_millis(self.wait_millis)).await;

        handle.complete().await?;
        Ok(())
    }
}

/// Set up a PostgreSQL database using TestContainers
async fn setup_database() -> Result<(PgPool, ContainerAsync<Postgres>)> {
    println!("Starting PostgreSQL container...");
    let postgres_image = Postgres::default();
    let container = postgres_image.start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

    println!("Connecting to database at {}:{}...", host, port);
    let pool = PgPool::connect(&connection_string).await?;

    println!("Running database migrations...");
    claimq::setup_database(&pool).await?;

    Ok((pool, container))
}

#[tokio::main]
async fn main() -> Result<()> {
    let (pool, _container) = setup_database().await?;

    let queue = Queue::new(pool.clone(), ())
        .register::<RandomWait>()
        .num_workers(2)
        .poll_interval(Duration::from_millis(100))
        .shutdown_when_queue_empty();

    queue.register_worker_type(RandomWait::JOB_NAME).await?;

    println!("Enqueueing 20 jobs...\n");
    for _ in 0..20 {
        let wait_millis = rand::thread_rng().gen_range(10..250);
        RandomWait { wait_millis }.enqueue(&queue).await?;
    }

    println!("Processing jobs...\n");
    let handle = queue.start(OrderMode::Fifo)?;
    handle.wait_for_shutdown().await;

    println!("\nAll jobs completed!");
    println!("Jobs left in queue: {}", queue.count_all(None).await?);
    println!("Recorded failures: {}", claimq::failed_job_count(&pool).await?);

    Ok(())
}
