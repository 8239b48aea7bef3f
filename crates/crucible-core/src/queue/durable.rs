//! Embedded disk-journaled queue broker
//!
//! The queue directory IS the broker: every ready message is one JSON
//! journal file in its queue's directory, so any process that opens the
//! same root shares the same queues. A delivery claims its message by
//! atomically renaming the journal file into the queue's `in-flight/`
//! subdirectory; the rename succeeds for exactly one claimant, so
//! concurrent consumers (in this process or another) can never hold the
//! same message at once. Ack deletes the claimed file, nack renames it
//! back (or rewrites it into the dead-letter directory), and claims that
//! sit past the queue's redelivery timeout are presumed orphaned by a
//! dead consumer and returned to ready. A message is lost only after its
//! journal file is removed, which happens on ack or once it has been
//! rewritten at its dead-letter destination.
//!
//! Wakeup is hybrid: publishes in the same process trip a `Notify`,
//! while messages from other processes are picked up by a short poll of
//! the directory.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{Delivery, JobQueue, QueueConsumer, QueueDepth, QueueSpec, QueuedMessage};
use crate::core_types::RetryEnvelope;
use crate::errors::CrucibleError;

const IN_FLIGHT_DIR: &str = "in-flight";
/// How often a waiting consumer rescans the directory for messages
/// published by another process.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct DurableQueue {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    /// Immutable after `open`; all mutable broker state lives on disk.
    queues: HashMap<String, Topic>,
}

struct Topic {
    spec: QueueSpec,
    notify: Arc<Notify>,
}

impl DurableQueue {
    /// Open (or create) the broker at `root`, declaring `specs`. Stale
    /// in-flight claims from a crashed run are returned to ready; claims
    /// still inside their redelivery window are left alone, since they
    /// may belong to a live consumer in another process.
    pub async fn open(
        root: impl Into<PathBuf>,
        specs: Vec<QueueSpec>,
    ) -> Result<Self, CrucibleError> {
        let root = root.into();
        let mut queues = HashMap::new();
        for spec in specs {
            tokio::fs::create_dir_all(root.join(&spec.name).join(IN_FLIGHT_DIR)).await?;
            queues.insert(
                spec.name.clone(),
                Topic {
                    spec,
                    notify: Arc::new(Notify::new()),
                },
            );
        }

        let broker = Self {
            inner: Arc::new(Inner { root, queues }),
        };
        for name in broker.inner.queues.keys() {
            broker.reclaim_stale(name).await?;
            let ready = broker.list_ready(name).await?.len();
            if ready > 0 {
                log::info!("found {ready} ready message(s) on queue '{name}'");
            }
        }
        Ok(broker)
    }

    fn topic(&self, queue: &str) -> Result<&Topic, CrucibleError> {
        self.inner
            .queues
            .get(queue)
            .ok_or_else(|| CrucibleError::UnknownQueue(queue.to_string()))
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.inner.root.join(queue)
    }

    fn ready_path(&self, queue: &str, message_id: &str) -> PathBuf {
        self.queue_dir(queue).join(format!("{message_id}.json"))
    }

    fn claimed_path(&self, queue: &str, message_id: &str) -> PathBuf {
        self.queue_dir(queue)
            .join(IN_FLIGHT_DIR)
            .join(format!("{message_id}.json"))
    }

    /// Write a journal file via a temp name plus rename, so a concurrent
    /// directory scan in another process never reads a torn file.
    async fn write_journal(&self, path: &Path, msg: &QueuedMessage) -> Result<(), CrucibleError> {
        let bytes = serde_json::to_vec_pretty(msg)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// All ready messages on `queue`, oldest first.
    async fn list_ready(&self, queue: &str) -> Result<Vec<QueuedMessage>, CrucibleError> {
        self.topic(queue)?;
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(self.queue_dir(queue)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(raw) => match serde_json::from_slice::<QueuedMessage>(&raw) {
                    Ok(msg) => out.push(msg),
                    Err(e) => log::warn!(
                        "skipping unreadable journal entry {}: {e}",
                        path.display()
                    ),
                },
                // Claimed by another consumer between the scan and the read.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        out.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(out)
    }

    /// Atomically claim a ready message by renaming its journal file into
    /// the in-flight directory. Exactly one claimant can win the rename;
    /// the losers see the source gone and move on.
    async fn try_claim(&self, queue: &str, msg: &QueuedMessage) -> Result<bool, CrucibleError> {
        let to = self.claimed_path(queue, &msg.message_id);
        match tokio::fs::rename(self.ready_path(queue, &msg.message_id), &to).await {
            Ok(()) => {
                // Rewrite so the file's mtime marks the claim, which is
                // what the stale-claim sweep measures against.
                self.write_journal(&to, msg).await?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Return a claimed message to the ready set.
    async fn release(&self, queue: &str, message_id: &str) -> Result<(), CrucibleError> {
        match tokio::fs::rename(
            self.claimed_path(queue, message_id),
            self.ready_path(queue, message_id),
        )
        .await
        {
            Ok(()) => {
                self.topic(queue)?.notify.notify_one();
                Ok(())
            }
            // Already returned by the stale-claim sweep.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a claimed message to `target`, journal-first. A crash before
    /// the removal leaves the message in both directories; the stale
    /// sweep turns that into a duplicate delivery, which at-least-once
    /// tolerates.
    async fn dead_letter(
        &self,
        from_queue: &str,
        msg: &QueuedMessage,
        target: &str,
    ) -> Result<(), CrucibleError> {
        log::warn!(
            "dead-lettering message {} from '{from_queue}' to '{target}'",
            msg.message_id
        );
        let notify = self.topic(target)?.notify.clone();
        self.write_journal(&self.ready_path(target, &msg.message_id), msg)
            .await?;
        notify.notify_one();
        remove_if_present(&self.claimed_path(from_queue, &msg.message_id)).await
    }

    fn is_expired(spec: &QueueSpec, msg: &QueuedMessage) -> bool {
        match spec.message_ttl_ms {
            Some(ttl) => {
                let age = Utc::now().signed_duration_since(msg.enqueued_at);
                age.num_milliseconds() >= 0 && age.num_milliseconds() as u64 > ttl
            }
            None => false,
        }
    }

    /// Return claims older than the queue's redelivery timeout to ready.
    /// Such claims belong to a consumer that died without cleanup.
    async fn reclaim_stale(&self, queue: &str) -> Result<usize, CrucibleError> {
        let topic = self.topic(queue)?;
        let window = Duration::from_millis(topic.spec.redelivery_timeout_ms);
        let mut reclaimed = 0;
        let mut entries =
            tokio::fs::read_dir(self.queue_dir(queue).join(IN_FLIGHT_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(meta) = tokio::fs::metadata(&path).await else {
                continue;
            };
            let claimed_at = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let age = SystemTime::now()
                .duration_since(claimed_at)
                .unwrap_or_default();
            if age < window {
                continue;
            }
            let Some(name) = path.file_name() else {
                continue;
            };
            match tokio::fs::rename(&path, self.queue_dir(queue).join(name)).await {
                Ok(()) => reclaimed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if reclaimed > 0 {
            log::warn!("returned {reclaimed} stale claim(s) to queue '{queue}'");
            topic.notify.notify_one();
        }
        Ok(reclaimed)
    }

    /// Liveness and TTL sweep across all queues: stale claims return to
    /// the ready set, then expired ready messages are routed to their
    /// dead-letter destination (or dropped without one). Returns the
    /// number of expired messages routed.
    pub async fn sweep_expired(&self) -> Result<usize, CrucibleError> {
        let mut expired = 0;
        for (name, topic) in &self.inner.queues {
            self.reclaim_stale(name).await?;
            if topic.spec.message_ttl_ms.is_none() {
                continue;
            }
            for msg in self.list_ready(name).await? {
                if !Self::is_expired(&topic.spec, &msg) {
                    continue;
                }
                // Claim first so two sweepers cannot both route it.
                if !self.try_claim(name, &msg).await? {
                    continue;
                }
                match &topic.spec.dead_letter_to {
                    Some(target) => self.dead_letter(name, &msg, target).await?,
                    None => {
                        remove_if_present(&self.claimed_path(name, &msg.message_id)).await?
                    }
                }
                expired += 1;
            }
        }
        Ok(expired)
    }
}

async fn remove_if_present(path: &Path) -> Result<(), CrucibleError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn count_journals(dir: &Path) -> Result<usize, CrucibleError> {
    let mut count = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
            count += 1;
        }
    }
    Ok(count)
}

#[async_trait]
impl JobQueue for DurableQueue {
    async fn publish(
        &self,
        queue: &str,
        payload: serde_json::Value,
        envelope: RetryEnvelope,
    ) -> Result<String, CrucibleError> {
        let notify = self.topic(queue)?.notify.clone();
        let msg = QueuedMessage {
            message_id: Uuid::new_v4().to_string(),
            payload,
            envelope,
            enqueued_at: Utc::now(),
        };
        self.write_journal(&self.ready_path(queue, &msg.message_id), &msg)
            .await?;

        // Wakes local consumers; other processes see the file on their
        // next poll.
        notify.notify_one();
        log::debug!("published message {} to '{queue}'", msg.message_id);
        Ok(msg.message_id)
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, CrucibleError> {
        self.topic(queue)?;
        Ok(Box::new(DurableConsumer {
            broker: self.clone(),
            queue: queue.to_string(),
            in_flight: None,
        }))
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth, CrucibleError> {
        self.topic(queue)?;
        Ok(QueueDepth {
            ready: count_journals(&self.queue_dir(queue)).await?,
            in_flight: count_journals(&self.queue_dir(queue).join(IN_FLIGHT_DIR)).await?,
        })
    }
}

pub struct DurableConsumer {
    broker: DurableQueue,
    queue: String,
    in_flight: Option<String>,
}

impl DurableConsumer {
    fn take_in_flight(&mut self, delivery: &Delivery) -> Result<String, CrucibleError> {
        match self.in_flight.take() {
            Some(id) if id == delivery.message.message_id => Ok(id),
            other => {
                self.in_flight = other;
                Err(CrucibleError::QueueError(format!(
                    "delivery {} is not held by this consumer slot",
                    delivery.message.message_id
                )))
            }
        }
    }
}

#[async_trait]
impl QueueConsumer for DurableConsumer {
    async fn next_delivery(&mut self) -> Result<Delivery, CrucibleError> {
        if self.in_flight.is_some() {
            return Err(CrucibleError::QueueError(
                "consumer slot already holds an unacknowledged delivery".into(),
            ));
        }

        loop {
            let (spec, notify) = {
                let topic = self.broker.topic(&self.queue)?;
                (topic.spec.clone(), topic.notify.clone())
            };

            for msg in self.broker.list_ready(&self.queue).await? {
                if DurableQueue::is_expired(&spec, &msg) {
                    if self.broker.try_claim(&self.queue, &msg).await? {
                        match &spec.dead_letter_to {
                            Some(target) => {
                                self.broker.dead_letter(&self.queue, &msg, target).await?
                            }
                            None => {
                                remove_if_present(
                                    &self.broker.claimed_path(&self.queue, &msg.message_id),
                                )
                                .await?
                            }
                        }
                    }
                    continue;
                }
                if self.broker.try_claim(&self.queue, &msg).await? {
                    self.in_flight = Some(msg.message_id.clone());
                    return Ok(Delivery {
                        queue: self.queue.clone(),
                        message: msg,
                    });
                }
                // Lost the claim race; try the next message.
            }

            // notify_one stores a permit, so a local publish racing this
            // await is not lost; the timeout covers publishers in other
            // processes.
            let _ = tokio::time::timeout(POLL_INTERVAL, notify.notified()).await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), CrucibleError> {
        let id = self.take_in_flight(delivery)?;
        remove_if_present(&self.broker.claimed_path(&self.queue, &id)).await
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), CrucibleError> {
        let id = self.take_in_flight(delivery)?;
        if requeue {
            return self.broker.release(&self.queue, &id).await;
        }
        let target = self.broker.topic(&self.queue)?.spec.dead_letter_to.clone();
        match target {
            Some(target) => {
                self.broker
                    .dead_letter(&self.queue, &delivery.message, &target)
                    .await
            }
            None => remove_if_present(&self.broker.claimed_path(&self.queue, &id)).await,
        }
    }
}

impl Drop for DurableConsumer {
    fn drop(&mut self) {
        // An unacknowledged delivery goes back to the ready set.
        if let Some(id) = self.in_flight.take() {
            let _ = std::fs::rename(
                self.broker.claimed_path(&self.queue, &id),
                self.broker.ready_path(&self.queue, &id),
            );
            if let Ok(topic) = self.broker.topic(&self.queue) {
                topic.notify.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::standard_topology;
    use serde_json::json;
    use tempfile::tempdir;

    fn topology() -> Vec<QueueSpec> {
        standard_topology(&crate::config::QueueConfig::default())
    }

    async fn broker(dir: &std::path::Path) -> DurableQueue {
        DurableQueue::open(dir, topology()).await.unwrap()
    }

    #[tokio::test]
    async fn publish_consume_ack_removes_journal() {
        let dir = tempdir().unwrap();
        let q = broker(dir.path()).await;

        let id = q
            .publish("code_execution", json!({"n": 1}), RetryEnvelope::new())
            .await
            .unwrap();
        assert!(dir.path().join("code_execution").join(format!("{id}.json")).exists());
        assert_eq!(q.depth("code_execution").await.unwrap().ready, 1);

        let mut consumer = q.subscribe("code_execution").await.unwrap();
        let delivery = consumer.next_delivery().await.unwrap();
        assert_eq!(delivery.message.payload["n"], 1);
        assert_eq!(q.depth("code_execution").await.unwrap().in_flight, 1);

        consumer.ack(&delivery).await.unwrap();
        assert!(!dir.path().join("code_execution").join(format!("{id}.json")).exists());
        let depth = q.depth("code_execution").await.unwrap();
        assert_eq!((depth.ready, depth.in_flight), (0, 0));
    }

    #[tokio::test]
    async fn prefetch_is_one_per_consumer_slot() {
        let dir = tempdir().unwrap();
        let q = broker(dir.path()).await;
        for n in 0..2 {
            q.publish("code_execution", json!({ "n": n }), RetryEnvelope::new())
                .await
                .unwrap();
        }

        let mut consumer = q.subscribe("code_execution").await.unwrap();
        let first = consumer.next_delivery().await.unwrap();
        let err = consumer.next_delivery().await.unwrap_err();
        assert!(matches!(err, CrucibleError::QueueError(_)));

        // After acking, the slot accepts the next message.
        consumer.ack(&first).await.unwrap();
        let second = consumer.next_delivery().await.unwrap();
        consumer.ack(&second).await.unwrap();
    }

    #[tokio::test]
    async fn nack_requeue_redelivers_same_message() {
        let dir = tempdir().unwrap();
        let q = broker(dir.path()).await;
        q.publish("code_execution", json!({"job": "a"}), RetryEnvelope::new())
            .await
            .unwrap();

        let mut consumer = q.subscribe("code_execution").await.unwrap();
        let first = consumer.next_delivery().await.unwrap();
        consumer.nack(&first, true).await.unwrap();

        let second = consumer.next_delivery().await.unwrap();
        assert_eq!(second.message.message_id, first.message.message_id);
        consumer.ack(&second).await.unwrap();
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters() {
        let dir = tempdir().unwrap();
        let q = broker(dir.path()).await;
        q.publish("code_execution", json!({"job": "bad"}), RetryEnvelope::new())
            .await
            .unwrap();

        let mut consumer = q.subscribe("code_execution").await.unwrap();
        let delivery = consumer.next_delivery().await.unwrap();
        consumer.nack(&delivery, false).await.unwrap();

        let depth = q.depth("code_execution").await.unwrap();
        assert_eq!((depth.ready, depth.in_flight), (0, 0));
        assert_eq!(q.depth("code_execution_dlq").await.unwrap().ready, 1);

        let mut dlq = q.subscribe("code_execution_dlq").await.unwrap();
        let dead = dlq.next_delivery().await.unwrap();
        assert_eq!(dead.message.payload["job"], "bad");
        dlq.ack(&dead).await.unwrap();
    }

    #[tokio::test]
    async fn expired_messages_route_to_dlq_on_sweep() {
        let dir = tempdir().unwrap();
        let specs = vec![
            QueueSpec::new("main").with_ttl(1).dead_letter_to("dlq"),
            QueueSpec::new("dlq"),
        ];
        let q = DurableQueue::open(dir.path(), specs).await.unwrap();
        q.publish("main", json!({"job": "old"}), RetryEnvelope::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let swept = q.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(q.depth("main").await.unwrap().ready, 0);
        assert_eq!(q.depth("dlq").await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn expired_messages_are_not_delivered() {
        let dir = tempdir().unwrap();
        let specs = vec![
            QueueSpec::new("main").with_ttl(1).dead_letter_to("dlq"),
            QueueSpec::new("dlq"),
        ];
        let q = DurableQueue::open(dir.path(), specs).await.unwrap();
        q.publish("main", json!({"job": "stale"}), RetryEnvelope::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut consumer = q.subscribe("main").await.unwrap();
        // The only message is expired, so delivery blocks after routing it.
        let waited =
            tokio::time::timeout(Duration::from_millis(50), consumer.next_delivery()).await;
        assert!(waited.is_err());
        assert_eq!(q.depth("dlq").await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn journal_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let q = broker(dir.path()).await;
            q.publish("code_execution", json!({"n": 1}), RetryEnvelope::new())
                .await
                .unwrap();
            q.publish("code_execution", json!({"n": 2}), RetryEnvelope::new())
                .await
                .unwrap();
        }

        let q = broker(dir.path()).await;
        assert_eq!(q.depth("code_execution").await.unwrap().ready, 2);

        let mut consumer = q.subscribe("code_execution").await.unwrap();
        let first = consumer.next_delivery().await.unwrap();
        // Recovery preserves enqueue order.
        assert_eq!(first.message.payload["n"], 1);
        consumer.ack(&first).await.unwrap();
    }

    #[tokio::test]
    async fn dropped_consumer_returns_delivery_to_ready() {
        let dir = tempdir().unwrap();
        let q = broker(dir.path()).await;
        q.publish("code_execution", json!({"n": 1}), RetryEnvelope::new())
            .await
            .unwrap();

        {
            let mut consumer = q.subscribe("code_execution").await.unwrap();
            let _unacked = consumer.next_delivery().await.unwrap();
            assert_eq!(q.depth("code_execution").await.unwrap().in_flight, 1);
            // Slot dropped without ack.
        }

        let depth = q.depth("code_execution").await.unwrap();
        assert_eq!((depth.ready, depth.in_flight), (1, 0));

        let mut consumer = q.subscribe("code_execution").await.unwrap();
        let delivery = consumer.next_delivery().await.unwrap();
        consumer.ack(&delivery).await.unwrap();
    }

    #[tokio::test]
    async fn publishing_wakes_a_waiting_consumer() {
        let dir = tempdir().unwrap();
        let q = broker(dir.path()).await;
        let mut consumer = q.subscribe("code_execution").await.unwrap();

        let publisher = q.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish("code_execution", json!({"n": 9}), RetryEnvelope::new())
                .await
                .unwrap();
        });

        let delivery =
            tokio::time::timeout(Duration::from_secs(2), consumer.next_delivery())
                .await
                .expect("consumer should be woken")
                .unwrap();
        assert_eq!(delivery.message.payload["n"], 9);
        consumer.ack(&delivery).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn a_second_broker_on_the_same_directory_sees_published_messages() {
        let dir = tempdir().unwrap();
        let server_side = broker(dir.path()).await;
        let worker_side = broker(dir.path()).await;

        // The consumer waits on one broker instance while a different
        // instance publishes, as the server and worker binaries do.
        let mut consumer = worker_side.subscribe("code_execution").await.unwrap();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            server_side
                .publish("code_execution", json!({"n": 7}), RetryEnvelope::new())
                .await
                .unwrap();
        });

        let delivery =
            tokio::time::timeout(Duration::from_secs(2), consumer.next_delivery())
                .await
                .expect("delivery should cross broker instances")
                .unwrap();
        assert_eq!(delivery.message.payload["n"], 7);
        consumer.ack(&delivery).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn a_claimed_message_is_invisible_to_other_broker_instances() {
        let dir = tempdir().unwrap();
        let first = broker(dir.path()).await;
        first
            .publish("code_execution", json!({"n": 1}), RetryEnvelope::new())
            .await
            .unwrap();

        let mut holder = first.subscribe("code_execution").await.unwrap();
        let held = holder.next_delivery().await.unwrap();

        // A broker opened while the claim is live must not recover it.
        let second = broker(dir.path()).await;
        assert_eq!(second.depth("code_execution").await.unwrap().ready, 0);
        let mut rival = second.subscribe("code_execution").await.unwrap();
        let refused =
            tokio::time::timeout(Duration::from_millis(400), rival.next_delivery()).await;
        assert!(refused.is_err());

        holder.ack(&held).await.unwrap();
        let depth = second.depth("code_execution").await.unwrap();
        assert_eq!((depth.ready, depth.in_flight), (0, 0));
    }

    #[tokio::test]
    async fn stale_claims_are_returned_to_ready_by_the_sweep() {
        let dir = tempdir().unwrap();
        let specs = vec![QueueSpec::new("main").redeliver_after(5)];
        let q = DurableQueue::open(dir.path(), specs).await.unwrap();
        q.publish("main", json!({"job": "orphaned"}), RetryEnvelope::new())
            .await
            .unwrap();

        let mut consumer = q.subscribe("main").await.unwrap();
        let held = consumer.next_delivery().await.unwrap();
        // A consumer process dying without cleanup leaves its claim behind.
        std::mem::forget(consumer);
        assert_eq!(q.depth("main").await.unwrap().in_flight, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.sweep_expired().await.unwrap();
        assert_eq!(q.depth("main").await.unwrap().ready, 1);

        let mut successor = q.subscribe("main").await.unwrap();
        let redelivered = successor.next_delivery().await.unwrap();
        assert_eq!(redelivered.message.message_id, held.message.message_id);
        successor.ack(&redelivered).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_queue_is_rejected() {
        let dir = tempdir().unwrap();
        let q = broker(dir.path()).await;
        let err = q
            .publish("no_such_queue", json!({}), RetryEnvelope::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CrucibleError::UnknownQueue(_)));
    }
}
