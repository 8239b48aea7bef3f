//! Queue-draining worker process
//!
//! One message at a time per slot: deserialize, re-validate authorization
//! (the world may have changed since enqueue), execute in the sandbox,
//! persist idempotently, acknowledge. Malformed or unauthorized messages
//! are rejected without requeue; they will never get better. Only
//! infrastructure failures enter the retry path: republish with an
//! incremented envelope after an exponential delay, or dead-letter once
//! the budget is spent. The backoff sleep happens in the slot itself,
//! which keeps the original message unacknowledged (and therefore safe)
//! until the copy is durably republished.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::{LanguageRegistry, QueueConfig};
use crate::core_types::{
    CompletionNotice, ExecutionResult, HistoryEntry, Job, JobOutcome, JobRecord, PermissionLevel,
};
use crate::errors::CrucibleError;
use crate::queue::{Delivery, JobQueue, QueueConsumer, CODE_EXECUTION_QUEUE, NOTIFICATIONS_QUEUE};
use crate::sandbox::SandboxRunner;
use crate::store::{ResultStore, SessionDirectory};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl From<&QueueConfig> for WorkerConfig {
    fn from(queue: &QueueConfig) -> Self {
        Self {
            max_retries: queue.max_retries,
            backoff_base_ms: queue.backoff_base_ms,
            backoff_cap_ms: queue.backoff_cap_ms,
        }
    }
}

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    sandbox: Arc<dyn SandboxRunner>,
    sessions: Arc<dyn SessionDirectory>,
    store: Arc<dyn ResultStore>,
    registry: Arc<LanguageRegistry>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        sandbox: Arc<dyn SandboxRunner>,
        sessions: Arc<dyn SessionDirectory>,
        store: Arc<dyn ResultStore>,
        registry: Arc<LanguageRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            sandbox,
            sessions,
            store,
            registry,
            config,
        }
    }

    /// Consume the main queue until `shutdown` fires. The in-flight
    /// message, if any, is finished before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), CrucibleError> {
        let mut consumer = self.queue.subscribe(CODE_EXECUTION_QUEUE).await?;
        log::info!("worker consuming '{CODE_EXECUTION_QUEUE}'");

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = consumer.next_delivery() => delivery?,
            };
            self.process_delivery(&mut consumer, delivery, &shutdown).await?;
        }

        log::info!("worker shut down");
        Ok(())
    }

    /// Handle one delivery through the full state machine. Public so the
    /// worker binary and tests can drive a consumer slot directly.
    pub async fn process_delivery(
        &self,
        consumer: &mut Box<dyn QueueConsumer>,
        delivery: Delivery,
        shutdown: &CancellationToken,
    ) -> Result<(), CrucibleError> {
        let job: Job = match serde_json::from_value(delivery.message.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                // Malformed messages are not worth retrying.
                log::error!(
                    "rejecting malformed message {}: {e}",
                    delivery.message.message_id
                );
                return consumer.nack(&delivery, false).await;
            }
        };

        log::info!(
            "processing job {} (session={}, language={}, retry={})",
            job.job_id,
            job.session_id,
            job.language,
            delivery.message.envelope.retry_count
        );

        if let Some(reason) = self.validate(&job).await? {
            log::warn!("rejecting job {}: {reason}", job.job_id);
            return consumer.nack(&delivery, false).await;
        }

        // Closed-set language always has a profile unless the table was
        // narrowed after enqueue; treat that like any other stale job.
        let Some(profile) = self.registry.get(job.language) else {
            log::warn!(
                "rejecting job {}: language '{}' no longer configured",
                job.job_id,
                job.language
            );
            return consumer.nack(&delivery, false).await;
        };

        let timeout_ms = job
            .timeout_ms
            .unwrap_or(profile.default_timeout_ms)
            .min(profile.max_timeout_ms);

        match self
            .sandbox
            .execute(&job.job_id, profile, &job.code, job.stdin.as_deref(), timeout_ms)
            .await
        {
            Ok(result) => {
                self.persist_success(&job, &result).await?;
                consumer.ack(&delivery).await
            }
            Err(e) => {
                let error = e.to_string();
                log::error!("infrastructure failure for job {}: {error}", job.job_id);
                self.handle_infra_failure(consumer, delivery, &job, error, shutdown)
                    .await
            }
        }
    }

    /// Returns a rejection reason for jobs that must not run, None when
    /// the job is still valid.
    async fn validate(&self, job: &Job) -> Result<Option<String>, CrucibleError> {
        if job.code.is_empty() {
            return Ok(Some("empty code".into()));
        }
        if !self.sessions.session_exists(&job.session_id).await? {
            return Ok(Some(format!("session {} no longer exists", job.session_id)));
        }
        if !self
            .sessions
            .has_permission(&job.session_id, &job.user_id, PermissionLevel::Write)
            .await?
        {
            return Ok(Some(format!(
                "user {} is no longer permitted on session {}",
                job.user_id, job.session_id
            )));
        }
        Ok(None)
    }

    async fn persist_success(
        &self,
        job: &Job,
        result: &ExecutionResult,
    ) -> Result<(), CrucibleError> {
        let record = JobRecord {
            job_id: job.job_id.clone(),
            request_id: job.request_id.clone(),
            session_id: job.session_id.clone(),
            user_id: job.user_id.clone(),
            language: job.language,
            outcome: JobOutcome::Completed,
            result: Some(result.clone()),
            error: None,
            recorded_at: Utc::now(),
        };

        // First write wins: on redelivery of an already-persisted job the
        // history append is skipped too, so nothing duplicates.
        let inserted = self.store.record_job(record).await?;
        if !inserted {
            log::warn!("job {} already persisted, skipping history append", job.job_id);
            return Ok(());
        }

        self.store
            .append_history(&job.session_id, HistoryEntry::from_result(job, result))
            .await?;
        self.notify(job, JobOutcome::Completed, result).await;

        log::info!(
            "job {} persisted ({}ms, timed_out={})",
            job.job_id,
            result.execution_time_ms,
            result.timed_out
        );
        Ok(())
    }

    async fn handle_infra_failure(
        &self,
        consumer: &mut Box<dyn QueueConsumer>,
        delivery: Delivery,
        job: &Job,
        error: String,
        shutdown: &CancellationToken,
    ) -> Result<(), CrucibleError> {
        let envelope = &delivery.message.envelope;

        if envelope.retry_count >= self.config.max_retries {
            log::error!(
                "job {} exhausted its retry budget ({}), dead-lettering",
                job.job_id,
                self.config.max_retries
            );
            let record = JobRecord {
                job_id: job.job_id.clone(),
                request_id: job.request_id.clone(),
                session_id: job.session_id.clone(),
                user_id: job.user_id.clone(),
                language: job.language,
                outcome: JobOutcome::Failed,
                result: None,
                error: Some(error),
                recorded_at: Utc::now(),
            };
            let _ = self.store.record_job(record).await?;
            return consumer.nack(&delivery, false).await;
        }

        let delay = self.backoff_delay(envelope.retry_count);
        log::info!(
            "requeuing job {} in {}ms (attempt {} of {})",
            job.job_id,
            delay.as_millis(),
            envelope.retry_count + 1,
            self.config.max_retries
        );

        // Wait in the slot; the original stays unacknowledged, so a crash
        // here redelivers rather than losing the job.
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => {
                return consumer.nack(&delivery, true).await;
            }
        }

        self.queue
            .publish(
                CODE_EXECUTION_QUEUE,
                delivery.message.payload.clone(),
                envelope.next_attempt(error),
            )
            .await?;
        consumer.ack(&delivery).await
    }

    /// Base delay doubled per attempt, capped.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exp = retry_count.min(16);
        let delay = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.backoff_cap_ms);
        Duration::from_millis(delay)
    }

    /// Fire-and-forget completion notification for the real-time layer.
    async fn notify(&self, job: &Job, outcome: JobOutcome, result: &ExecutionResult) {
        let notice = CompletionNotice {
            job_id: job.job_id.clone(),
            request_id: job.request_id.clone(),
            session_id: job.session_id.clone(),
            user_id: job.user_id.clone(),
            outcome,
            timed_out: result.timed_out,
            execution_time_ms: result.execution_time_ms,
            emitted_at: Utc::now(),
        };
        let payload = match serde_json::to_value(&notice) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("could not encode completion notice: {e}");
                return;
            }
        };
        if let Err(e) = self
            .queue
            .publish(NOTIFICATIONS_QUEUE, payload, Default::default())
            .await
        {
            log::warn!("could not publish completion notice for {}: {e}", job.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{Language, RetryEnvelope, Termination};
    use crate::queue::{standard_topology, DurableQueue, CODE_EXECUTION_DLQ};
    use crate::store::{InMemoryResultStore, InMemorySessions};
    use crate::test_utils::ScriptedSandbox;
    use tempfile::tempdir;

    fn job(job_id: &str) -> Job {
        Job {
            job_id: job_id.to_string(),
            request_id: format!("req-{job_id}"),
            session_id: "s-1".into(),
            user_id: "u-1".into(),
            language: Language::Python,
            code: "print('hi')".into(),
            stdin: None,
            timeout_ms: Some(2_000),
            submitted_at: Utc::now(),
        }
    }

    fn ok_result() -> ExecutionResult {
        ExecutionResult {
            stdout: "hi\n".into(),
            stderr: String::new(),
            execution_time_ms: 10,
            timed_out: false,
            termination: Termination::Success,
        }
    }

    struct Harness {
        queue: Arc<DurableQueue>,
        sandbox: Arc<ScriptedSandbox>,
        sessions: Arc<InMemorySessions>,
        store: Arc<InMemoryResultStore>,
        worker: Worker,
        _dir: tempfile::TempDir,
    }

    async fn harness(config: WorkerConfig) -> Harness {
        let dir = tempdir().unwrap();
        let queue = Arc::new(
            DurableQueue::open(
                dir.path(),
                standard_topology(&crate::config::QueueConfig::default()),
            )
            .await
            .unwrap(),
        );
        let sandbox = Arc::new(ScriptedSandbox::new(ok_result()));
        let sessions = Arc::new(InMemorySessions::new());
        sessions.add_session("s-1", "u-1");
        let store = Arc::new(InMemoryResultStore::new());
        let worker = Worker::new(
            queue.clone() as Arc<dyn JobQueue>,
            sandbox.clone(),
            sessions.clone(),
            store.clone(),
            Arc::new(LanguageRegistry::builtin()),
            config,
        );
        Harness {
            queue,
            sandbox,
            sessions,
            store,
            worker,
            _dir: dir,
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            max_retries: 3,
            backoff_base_ms: 1,
            backoff_cap_ms: 8,
        }
    }

    async fn publish_job(h: &Harness, j: &Job) {
        h.queue
            .publish(
                CODE_EXECUTION_QUEUE,
                serde_json::to_value(j).unwrap(),
                RetryEnvelope::new(),
            )
            .await
            .unwrap();
    }

    async fn drive_one(h: &Harness) {
        let mut consumer = h.queue.subscribe(CODE_EXECUTION_QUEUE).await.unwrap();
        let delivery = consumer.next_delivery().await.unwrap();
        h.worker
            .process_delivery(&mut consumer, delivery, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn successful_job_is_persisted_and_acked() {
        let h = harness(fast_config()).await;
        publish_job(&h, &job("j-1")).await;
        drive_one(&h).await;

        let record = h.store.fetch_job("j-1").await.unwrap().unwrap();
        assert_eq!(record.outcome, JobOutcome::Completed);
        assert_eq!(record.result.unwrap().stdout, "hi\n");
        assert_eq!(h.store.history("s-1", 10).await.unwrap().len(), 1);

        let depth = h.queue.depth(CODE_EXECUTION_QUEUE).await.unwrap();
        assert_eq!((depth.ready, depth.in_flight), (0, 0));
        // A completion notice was emitted.
        assert_eq!(h.queue.depth(NOTIFICATIONS_QUEUE).await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn malformed_message_goes_to_dlq_without_retry() {
        let h = harness(fast_config()).await;
        h.queue
            .publish(
                CODE_EXECUTION_QUEUE,
                serde_json::json!({"not": "a job"}),
                RetryEnvelope::new(),
            )
            .await
            .unwrap();
        drive_one(&h).await;

        assert_eq!(h.queue.depth(CODE_EXECUTION_DLQ).await.unwrap().ready, 1);
        assert_eq!(h.sandbox.executions(), 0);
    }

    #[tokio::test]
    async fn vanished_session_rejects_without_requeue() {
        let h = harness(fast_config()).await;
        let mut j = job("j-1");
        j.session_id = "gone".into();
        publish_job(&h, &j).await;
        drive_one(&h).await;

        assert_eq!(h.queue.depth(CODE_EXECUTION_DLQ).await.unwrap().ready, 1);
        assert_eq!(h.sandbox.executions(), 0);
        assert!(h.store.fetch_job("j-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revoked_permission_rejects_after_enqueue() {
        let h = harness(fast_config()).await;
        h.sessions.add_session("s-2", "someone-else");
        let mut j = job("j-1");
        j.session_id = "s-2".into();
        // u-1 is not a participant of s-2.
        publish_job(&h, &j).await;
        drive_one(&h).await;

        assert_eq!(h.sandbox.executions(), 0);
        assert_eq!(h.queue.depth(CODE_EXECUTION_DLQ).await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn infra_failures_retry_then_dead_letter() {
        let h = harness(fast_config()).await;
        h.sandbox.fail_always("docker daemon unreachable");
        publish_job(&h, &job("j-1")).await;

        // Initial attempt plus max_retries republished copies.
        for _ in 0..=h.worker.config.max_retries {
            drive_one(&h).await;
        }

        assert_eq!(h.sandbox.executions(), 4);
        assert_eq!(h.queue.depth(CODE_EXECUTION_QUEUE).await.unwrap().ready, 0);
        let dlq_depth = h.queue.depth(CODE_EXECUTION_DLQ).await.unwrap();
        assert_eq!(dlq_depth.ready, 1);

        // The dead-lettered copy carries the full retry trail.
        let mut dlq = h.queue.subscribe(CODE_EXECUTION_DLQ).await.unwrap();
        let dead = dlq.next_delivery().await.unwrap();
        assert_eq!(dead.message.envelope.retry_count, 3);
        assert_eq!(
            dead.message.envelope.last_error.as_deref(),
            Some("could not allocate working area: docker daemon unreachable")
        );
        dlq.ack(&dead).await.unwrap();

        // The failure is visible to status polling.
        let record = h.store.fetch_job("j-1").await.unwrap().unwrap();
        assert_eq!(record.outcome, JobOutcome::Failed);
    }

    #[tokio::test]
    async fn transient_infra_failure_recovers() {
        let h = harness(fast_config()).await;
        h.sandbox.fail_times(2, "docker hiccup");
        publish_job(&h, &job("j-1")).await;

        for _ in 0..3 {
            drive_one(&h).await;
        }

        assert_eq!(h.sandbox.executions(), 3);
        let record = h.store.fetch_job("j-1").await.unwrap().unwrap();
        assert_eq!(record.outcome, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn duplicate_delivery_does_not_duplicate_persistence() {
        let h = harness(fast_config()).await;
        publish_job(&h, &job("j-1")).await;
        publish_job(&h, &job("j-1")).await; // same job id delivered twice

        drive_one(&h).await;
        drive_one(&h).await;

        assert_eq!(h.sandbox.executions(), 2);
        assert_eq!(h.store.history("s-1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backoff_is_strictly_increasing_until_the_cap() {
        let h = harness(WorkerConfig {
            max_retries: 10,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
        })
        .await;
        let delays: Vec<u64> = (0..6)
            .map(|n| h.worker.backoff_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000]);
        for pair in delays.windows(2) {
            assert!(pair[0] < pair[1] || pair[1] == 30_000);
        }
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness(fast_config()).await;
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        tokio::time::timeout(Duration::from_secs(2), h.worker.run(shutdown))
            .await
            .expect("run should return after cancellation")
            .unwrap();
    }
}
