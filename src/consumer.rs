//! src/consumer.rs
//! Stream consumer runtime: one long-running pipeline per transaction
//! stream.
//!
//! Each pipeline fetches batches through a consumer-group read, pushes the
//! entries into a bounded buffer and processes them one at a time, in
//! stream order. The use-case outcome drives acknowledgment: everything is
//! acked except a `Replay`, which re-injects the already-parsed command
//! after a delay until the per-message attempt cap is reached. Poison
//! messages go to `<stream>:<dlqSuffix>` on a best-effort basis.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{decode_event, EventCommand};
use crate::metrics::{ConsumerMetrics, MetricsSnapshot};
use crate::use_cases::{self, ErrorKind, ProcessingOutcome};

const FETCH_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub stream: String,
    pub group: String,
    pub consumer_name: String,
    pub block_ms: u64,
    pub read_count: usize,
    pub buffer_size: usize,
    pub replay_delay: Duration,
    pub max_replay_attempts: u32,
    pub max_fetch_retries: u32,
    pub restart_delay: Duration,
    pub dlq_suffix: String,
}

impl ConsumerSettings {
    pub fn dlq_stream(&self) -> String {
        format!("{}:{}", self.stream, self.dlq_suffix)
    }
}

/// Process-local replay bookkeeping, keyed by stream message id. Lost on
/// restart: the broker redelivers unacked entries and counting starts over.
#[derive(Debug, Default)]
pub struct ReplayTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl ReplayTracker {
    /// Grant another replay for this message, returning the attempt number,
    /// or `None` once the cap is reached.
    pub fn try_schedule(&self, message_id: &str, max_attempts: u32) -> Option<u32> {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let count = attempts.entry(message_id.to_string()).or_insert(0);
        if *count < max_attempts {
            *count += 1;
            Some(*count)
        } else {
            None
        }
    }

    /// Forget a message after a terminal outcome.
    pub fn clear(&self, message_id: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(message_id);
    }
}

#[derive(Debug)]
enum Job {
    /// Fresh (or redelivered) stream entry.
    Incoming { id: String, payload: String },
    /// Scheduled re-execution of an already-parsed command.
    Replay {
        id: String,
        payload: String,
        command: EventCommand,
    },
}

/// One consumer instance bound to one stream. `start` is idempotent; the
/// pipeline restarts itself after a short delay for as long as the running
/// flag stays set.
pub struct StreamConsumer {
    settings: ConsumerSettings,
    redis: ConnectionManager,
    pool: PgPool,
    running: Arc<AtomicBool>,
    metrics: Arc<ConsumerMetrics>,
    replays: Arc<ReplayTracker>,
}

impl StreamConsumer {
    pub fn new(settings: ConsumerSettings, redis: ConnectionManager, pool: PgPool) -> Self {
        Self {
            settings,
            redis,
            pool,
            running: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(ConsumerMetrics::default()),
            replays: Arc::new(ReplayTracker::default()),
        }
    }

    /// Start the pipeline. Returns `None` when it is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(stream = %self.settings.stream, "consumer already running");
            return None;
        }

        let settings = self.settings.clone();
        let redis = self.redis.clone();
        let pool = self.pool.clone();
        let running = Arc::clone(&self.running);
        let metrics = Arc::clone(&self.metrics);
        let replays = Arc::clone(&self.replays);

        Some(tokio::spawn(async move {
            supervise(settings, redis, pool, running, metrics, replays).await;
        }))
    }

    /// Request a stop; the fetch loop exits after its current batch drains.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn stream(&self) -> &str {
        &self.settings.stream
    }
}

async fn supervise(
    settings: ConsumerSettings,
    redis: ConnectionManager,
    pool: PgPool,
    running: Arc<AtomicBool>,
    metrics: Arc<ConsumerMetrics>,
    replays: Arc<ReplayTracker>,
) {
    info!(
        stream = %settings.stream,
        consumer = %settings.consumer_name,
        group = %settings.group,
        "consumer pipeline starting"
    );

    while running.load(Ordering::SeqCst) {
        let result = run_pipeline(
            &settings,
            redis.clone(),
            pool.clone(),
            &running,
            &metrics,
            &replays,
        )
        .await;

        match result {
            Ok(()) => break,
            Err(e) => {
                error!(stream = %settings.stream, error = %format!("{e:#}"), "consumer pipeline died");
                if running.load(Ordering::SeqCst) {
                    info!(
                        stream = %settings.stream,
                        delay_secs = settings.restart_delay.as_secs(),
                        "restarting consumer pipeline"
                    );
                    tokio::time::sleep(settings.restart_delay).await;
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    info!(
        stream = %settings.stream,
        stats = %metrics.snapshot(),
        "consumer pipeline stopped"
    );
}

async fn run_pipeline(
    settings: &ConsumerSettings,
    redis: ConnectionManager,
    pool: PgPool,
    running: &Arc<AtomicBool>,
    metrics: &Arc<ConsumerMetrics>,
    replays: &Arc<ReplayTracker>,
) -> Result<()> {
    let (job_tx, job_rx) = mpsc::channel::<Job>(settings.buffer_size);

    let pipeline = Pipeline {
        settings: settings.clone(),
        redis: redis.clone(),
        pool,
        metrics: Arc::clone(metrics),
        replays: Arc::clone(replays),
        replay_tx: job_tx.downgrade(),
    };
    let processor = tokio::spawn(pipeline.run(job_rx));

    let fetch_result = fetch_loop(settings, redis, running, job_tx).await;
    processor.await.context("processor task failed")?;
    fetch_result
}

/// Batch fetch into the buffer. Starts by draining entries that were
/// delivered to this consumer before a restart (id `0`), then switches to
/// new-message delivery (`>`). Fetch faults back off and never kill the
/// pipeline; after the retry cap an empty batch keeps the loop alive.
async fn fetch_loop(
    settings: &ConsumerSettings,
    mut redis: ConnectionManager,
    running: &Arc<AtomicBool>,
    job_tx: mpsc::Sender<Job>,
) -> Result<()> {
    let mut cursor = "0".to_string();
    let mut consecutive_failures = 0u32;

    while running.load(Ordering::SeqCst) {
        let options = StreamReadOptions::default()
            .group(&settings.group, &settings.consumer_name)
            .count(settings.read_count)
            .block(settings.block_ms as usize);

        let reply: Result<StreamReadReply, redis::RedisError> = redis
            .xread_options(&[settings.stream.as_str()], &[cursor.as_str()], &options)
            .await;

        match reply {
            Ok(reply) => {
                consecutive_failures = 0;
                let mut delivered = 0usize;
                for key in reply.keys {
                    for entry in key.ids {
                        delivered += 1;
                        let payload: String = entry.get("payload").unwrap_or_default();
                        let job = Job::Incoming {
                            id: entry.id,
                            payload,
                        };
                        if job_tx.send(job).await.is_err() {
                            return Err(anyhow!("job buffer closed mid-batch"));
                        }
                    }
                }
                if cursor == "0" && delivered == 0 {
                    debug!(stream = %settings.stream, "pending entries drained, reading new messages");
                    cursor = ">".to_string();
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures > settings.max_fetch_retries {
                    warn!(
                        stream = %settings.stream,
                        error = %e,
                        "stream fetch kept failing, yielding empty batch"
                    );
                    consecutive_failures = 0;
                } else {
                    warn!(
                        stream = %settings.stream,
                        error = %e,
                        attempt = consecutive_failures,
                        "stream fetch failed, backing off"
                    );
                    tokio::time::sleep(FETCH_BACKOFF).await;
                }
            }
        }
    }

    Ok(())
}

/// Serial per-message processing half of one pipeline. Holds only a weak
/// handle to the job buffer so the channel closes when the fetch half and
/// any in-flight replay timers are gone.
struct Pipeline {
    settings: ConsumerSettings,
    redis: ConnectionManager,
    pool: PgPool,
    metrics: Arc<ConsumerMetrics>,
    replays: Arc<ReplayTracker>,
    replay_tx: mpsc::WeakSender<Job>,
}

impl Pipeline {
    async fn run(mut self, mut jobs: mpsc::Receiver<Job>) {
        while let Some(job) = jobs.recv().await {
            self.metrics.message_started();
            self.handle_job(job).await;
            self.metrics.message_finished();
        }
        debug!(stream = %self.settings.stream, "job buffer drained");
    }

    async fn handle_job(&mut self, job: Job) {
        match job {
            Job::Incoming { id, payload } => match decode_event(&payload) {
                Ok(command) => self.handle_command(id, payload, command).await,
                Err(e) => {
                    warn!(
                        stream = %self.settings.stream,
                        message_id = %id,
                        error = %e,
                        "dropping undecodable message"
                    );
                    self.dead_letter(&id, &e.to_string(), &payload).await;
                    self.ack(&id).await;
                }
            },
            Job::Replay {
                id,
                payload,
                command,
            } => self.handle_command(id, payload, command).await,
        }
    }

    async fn handle_command(&mut self, id: String, payload: String, command: EventCommand) {
        let kind = command.kind();
        let outcome = self.dispatch(command.clone()).await;

        match outcome {
            ProcessingOutcome::Success(position) => {
                debug!(
                    stream = %self.settings.stream,
                    message_id = %id,
                    event = kind,
                    ticker = %position.ticker,
                    "message applied"
                );
                self.metrics.record_processed();
                self.replays.clear(&id);
                self.ack(&id).await;
            }
            ProcessingOutcome::Ignored { reason } => {
                debug!(
                    stream = %self.settings.stream,
                    message_id = %id,
                    event = kind,
                    reason = %reason,
                    "message ignored"
                );
                self.replays.clear(&id);
                self.ack(&id).await;
            }
            ProcessingOutcome::Error { kind: error_kind, message } => {
                warn!(
                    stream = %self.settings.stream,
                    message_id = %id,
                    event = kind,
                    error_kind = %error_kind,
                    message = %message,
                    "message failed"
                );
                self.metrics.record_error();
                self.replays.clear(&id);
                self.ack(&id).await;
            }
            ProcessingOutcome::Replay { reason, .. } => {
                match self
                    .replays
                    .try_schedule(&id, self.settings.max_replay_attempts)
                {
                    Some(attempt) => {
                        info!(
                            stream = %self.settings.stream,
                            message_id = %id,
                            reason = %reason,
                            attempt,
                            delay_secs = self.settings.replay_delay.as_secs(),
                            "scheduling replay"
                        );
                        self.metrics.record_replay_scheduled();
                        self.schedule_replay(id, payload, command);
                        // No ack: the entry stays pending until it resolves.
                    }
                    None => {
                        warn!(
                            stream = %self.settings.stream,
                            message_id = %id,
                            reason = %reason,
                            "replay attempts exhausted"
                        );
                        self.metrics.record_error();
                        self.replays.clear(&id);
                        self.dead_letter(&id, &format!("replay attempts exhausted: {reason}"), &payload)
                            .await;
                        self.ack(&id).await;
                    }
                }
            }
        }
    }

    /// Run the matching use case in its own task so an untyped fault acks
    /// the message as an error instead of wedging the pipeline.
    async fn dispatch(&self, command: EventCommand) -> ProcessingOutcome {
        let pool = self.pool.clone();
        let result = tokio::spawn(async move {
            match &command {
                EventCommand::Created(c) => use_cases::apply_created(&pool, c).await,
                EventCommand::Updated(c) => use_cases::apply_updated(&pool, c).await,
                EventCommand::Deleted(c) => use_cases::apply_deleted(&pool, c).await,
            }
        })
        .await;

        result.unwrap_or_else(|e| ProcessingOutcome::Error {
            kind: ErrorKind::UnexpectedError,
            message: format!("processing task failed: {e}"),
        })
    }

    fn schedule_replay(&self, id: String, payload: String, command: EventCommand) {
        let Some(job_tx) = self.replay_tx.upgrade() else {
            debug!(message_id = %id, "pipeline gone, replay dropped");
            return;
        };
        let delay = self.settings.replay_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let job = Job::Replay {
                id,
                payload,
                command,
            };
            // A send failure means the pipeline restarted in the meantime;
            // the broker still has the entry pending and will redeliver it.
            let _ = job_tx.send(job).await;
        });
    }

    async fn ack(&mut self, id: &str) {
        let result: Result<i64, redis::RedisError> = self
            .redis
            .xack(&self.settings.stream, &self.settings.group, &[id])
            .await;
        if let Err(e) = result {
            warn!(
                stream = %self.settings.stream,
                message_id = %id,
                error = %e,
                "failed to acknowledge message"
            );
        }
    }

    /// Best-effort dead-letter append; failures are logged, never block the
    /// ack.
    async fn dead_letter(&mut self, id: &str, error_text: &str, payload: &str) {
        let dlq = self.settings.dlq_stream();
        let fields = [
            ("originalMessageId", id),
            ("originalStream", self.settings.stream.as_str()),
            ("error", error_text),
            ("data", payload),
        ];
        let result: Result<String, redis::RedisError> = self.redis.xadd(&dlq, "*", &fields).await;
        if let Err(e) = result {
            warn!(stream = %dlq, message_id = %id, error = %e, "failed to dead-letter message");
        }
    }
}

/// Create the consumer group, tolerating one that already exists.
pub async fn ensure_group(
    redis: &mut ConnectionManager,
    stream: &str,
    group: &str,
) -> Result<()> {
    let result: Result<String, redis::RedisError> =
        redis.xgroup_create_mkstream(stream, group, "$").await;
    match result {
        Ok(_) => {
            info!(stream, group, "created consumer group");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => {
            debug!(stream, group, "consumer group already exists");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("creating consumer group {group} on {stream}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_tracker_caps_attempts_per_message() {
        let tracker = ReplayTracker::default();

        assert_eq!(tracker.try_schedule("m-1", 3), Some(1));
        assert_eq!(tracker.try_schedule("m-1", 3), Some(2));
        assert_eq!(tracker.try_schedule("m-1", 3), Some(3));
        assert_eq!(tracker.try_schedule("m-1", 3), None);

        // Other messages are unaffected.
        assert_eq!(tracker.try_schedule("m-2", 3), Some(1));
    }

    #[test]
    fn replay_tracker_clear_resets_counting() {
        let tracker = ReplayTracker::default();
        assert_eq!(tracker.try_schedule("m-1", 1), Some(1));
        assert_eq!(tracker.try_schedule("m-1", 1), None);

        tracker.clear("m-1");
        assert_eq!(tracker.try_schedule("m-1", 1), Some(1));
    }

    #[test]
    fn dlq_stream_name_appends_suffix() {
        let settings = ConsumerSettings {
            stream: "transaction:created".to_string(),
            group: "portfolio-consumers".to_string(),
            consumer_name: "test-1".to_string(),
            block_ms: 5000,
            read_count: 50,
            buffer_size: 256,
            replay_delay: Duration::from_secs(10),
            max_replay_attempts: 3,
            max_fetch_retries: 3,
            restart_delay: Duration::from_secs(5),
            dlq_suffix: "dlq".to_string(),
        };
        assert_eq!(settings.dlq_stream(), "transaction:created:dlq");
    }
}
