//! Redis Stream consumer for grading jobs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use deadpool_redis::redis;

use crate::config::Config;
use crate::coordinator::{JobCoordinator, WorkerIdentity};
use crate::metrics::{ACTIVE_JOBS, JOBS_FAILED, JOBS_PROCESSED};
use crate::queue::{parse_stream_reply, RedisPublisher, StreamJob};

/// Where XREADGROUP starts reading
#[derive(Debug, Clone, Copy)]
enum ReadFrom {
    /// Messages already delivered to this consumer but never acknowledged
    Backlog,
    /// New messages only
    New,
}

/// Job consumer that processes jobs from Redis Stream
pub struct JobConsumer {
    config: Config,
    redis_pool: deadpool_redis::Pool,
    shutdown: Arc<AtomicBool>,
    coordinator: JobCoordinator<RedisPublisher>,
}

impl JobConsumer {
    /// Create a new job consumer
    pub fn new(config: Config, redis_pool: deadpool_redis::Pool, shutdown: Arc<AtomicBool>) -> Self {
        let coordinator = JobCoordinator::new(
            &config.storage,
            config.execution.clone(),
            config.queue.clone(),
            WorkerIdentity::detect(),
            RedisPublisher::new(redis_pool.clone()),
        );

        Self {
            config,
            redis_pool,
            shutdown,
            coordinator,
        }
    }

    /// Initialize consumer group
    pub async fn initialize(&self) -> Result<()> {
        let mut conn = self.redis_pool.get().await?;
        let queue = &self.config.queue;

        // Create consumer group (ignore error if already exists)
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&queue.job_stream)
            .arg(&queue.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut *conn)
            .await;

        match result {
            Ok(_) => {
                tracing::info!(
                    "Created consumer group '{}' on stream '{}'",
                    queue.consumer_group,
                    queue.job_stream
                );
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                tracing::debug!("Consumer group already exists");
            }
            Err(e) => {
                return Err(anyhow!("Failed to create consumer group: {}", e));
            }
        }

        Ok(())
    }

    /// Run the consumer loop
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(
            "Starting job consumer '{}' in group '{}'",
            self.config.queue.worker_id,
            self.config.queue.consumer_group
        );

        // Take over jobs abandoned by dead workers, then work through our own
        // backlog once before waiting for new jobs.
        if let Err(e) = self.claim_pending_messages().await {
            if e.to_string().contains("NOGROUP") {
                tracing::warn!("Consumer group not found during pending-claim, re-initializing...");
                self.initialize().await?;
            } else {
                return Err(e);
            }
        }
        if let Err(e) = self.process_batch(ReadFrom::Backlog).await {
            tracing::error!("Error processing backlog: {}", e);
        }

        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.process_batch(ReadFrom::New).await {
                let err_msg = e.to_string();
                tracing::error!("Error reading jobs: {}", err_msg);

                // If Redis lost the consumer group, re-create it
                if err_msg.contains("NOGROUP") {
                    tracing::warn!("Consumer group missing, re-initializing...");
                    if let Err(init_err) = self.initialize().await {
                        tracing::error!("Failed to re-initialize consumer group: {}", init_err);
                    }
                }

                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        tracing::info!("Job consumer shutting down");
        Ok(())
    }

    /// Claim pending messages from dead consumers
    async fn claim_pending_messages(&self) -> Result<()> {
        let mut conn = self.redis_pool.get().await?;
        let queue = &self.config.queue;

        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&queue.job_stream)
            .arg(&queue.consumer_group)
            .arg("-")
            .arg("+")
            .arg(10)
            .query_async(&mut *conn)
            .await?;

        for (message_id, consumer, idle_time, _delivery_count) in pending {
            if consumer == queue.worker_id || idle_time <= queue.claim_idle_ms {
                continue;
            }
            tracing::info!("Claiming abandoned message {} from {}", message_id, consumer);

            let claimed: Result<redis::Value, _> = redis::cmd("XCLAIM")
                .arg(&queue.job_stream)
                .arg(&queue.consumer_group)
                .arg(&queue.worker_id)
                .arg(queue.claim_idle_ms)
                .arg(&message_id)
                .query_async(&mut *conn)
                .await;
            if let Err(e) = claimed {
                tracing::warn!("Failed to claim message {}: {}", message_id, e);
            }
        }

        Ok(())
    }

    /// Read and process one batch of jobs
    async fn process_batch(&self, from: ReadFrom) -> Result<()> {
        let queue = &self.config.queue;
        let reply: Vec<redis::Value> = {
            let mut conn = self.redis_pool.get().await?;
            let mut cmd = redis::cmd("XREADGROUP");
            cmd.arg("GROUP")
                .arg(&queue.consumer_group)
                .arg(&queue.worker_id);
            match from {
                ReadFrom::Backlog => {
                    cmd.arg("COUNT").arg(100).arg("STREAMS").arg(&queue.job_stream).arg("0");
                }
                ReadFrom::New => {
                    cmd.arg("COUNT")
                        .arg(1)
                        .arg("BLOCK")
                        .arg(queue.block_timeout_ms)
                        .arg("STREAMS")
                        .arg(&queue.job_stream)
                        .arg(">");
                }
            }
            cmd.query_async(&mut *conn).await?
        };

        for entry in parse_stream_reply(&reply)? {
            match entry {
                Ok(job) => self.process_job(job).await?,
                Err((message_id, e)) => {
                    // Unparseable jobs can never succeed; drop them.
                    tracing::error!("Dropping malformed job {}: {}", message_id, e);
                    self.ack_message(&message_id).await?;
                }
            }
        }

        Ok(())
    }

    async fn process_job(&self, entry: StreamJob) -> Result<()> {
        let StreamJob { message_id, job } = entry;
        tracing::info!(
            "Processing job {} (message: {})",
            job.key(),
            message_id
        );

        ACTIVE_JOBS.inc();
        let result = self.coordinator.process(&job).await;
        ACTIVE_JOBS.dec();

        match result {
            Ok(results) => {
                JOBS_PROCESSED.inc();
                self.ack_message(&message_id).await?;
                tracing::info!("Job {} done: {} test cases", job.key(), results.len());
            }
            Err(e) => {
                // Left unacknowledged; redelivery is up to the queue.
                JOBS_FAILED.inc();
                tracing::error!(
                    job = %job.key(),
                    code = e.error_code(),
                    "Job failed: {}",
                    e
                );
            }
        }

        Ok(())
    }

    /// Acknowledge a message
    async fn ack_message(&self, message_id: &str) -> Result<()> {
        let mut conn = self.redis_pool.get().await?;

        redis::cmd("XACK")
            .arg(&self.config.queue.job_stream)
            .arg(&self.config.queue.consumer_group)
            .arg(message_id)
            .query_async::<i64>(&mut *conn)
            .await?;

        Ok(())
    }
}
