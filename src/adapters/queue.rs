//! Typed request/response client over the durable work queue and the worker
//! result topic.
//!
//! The engine pushes task envelopes onto per-kind queues and waits for the
//! matching terminal message on the broadcast topic. The push is the commit
//! point: a crash before subscribing can lose the correlation but never the
//! work.

use crate::domain::{ResultEnvelope, TaskEnvelope, TaskKind, TaskStatus};
use crate::error::{AlertError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Topic workers publish progress and terminal messages on.
pub const RESULT_TOPIC: &str = "worker_task_updates";

pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Transport seam: a durable push queue plus a broadcast result topic.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn push(&self, queue: &str, payload: String) -> Result<()>;

    /// Subscribe to the result topic. Dropping the stream abandons the
    /// subscription.
    async fn subscribe(&self) -> Result<MessageStream>;
}

/// Redis transport used in production: RPUSH onto `<kind>_queue`, SUBSCRIBE
/// on the result topic.
pub struct RedisQueueTransport {
    conn: ConnectionManager,
    client: redis::Client,
}

impl RedisQueueTransport {
    pub fn new(client: redis::Client, conn: ConnectionManager) -> Self {
        Self { conn, client }
    }
}

#[async_trait]
impl QueueTransport for RedisQueueTransport {
    async fn push(&self, queue: &str, payload: String) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(queue, payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(RESULT_TOPIC).await?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(Box::pin(stream))
    }
}

/// In-memory transport used for testing. Tests pop pushed envelopes and
/// publish worker responses by hand.
pub struct InMemoryQueueTransport {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    topic: broadcast::Sender<String>,
}

impl InMemoryQueueTransport {
    pub fn new() -> Self {
        let (topic, _) = broadcast::channel(64);
        Self {
            queues: Mutex::new(HashMap::new()),
            topic,
        }
    }

    /// Worker side: take the oldest pending task off a queue.
    pub fn pop_task(&self, queue: &str) -> Option<String> {
        self.queues
            .lock()
            .unwrap()
            .get_mut(queue)
            .and_then(|q| q.pop_front())
    }

    pub fn queued_len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Worker side: publish a message on the result topic.
    pub fn publish(&self, payload: String) {
        let _ = self.topic.send(payload);
    }
}

impl Default for InMemoryQueueTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueueTransport {
    async fn push(&self, queue: &str, payload: String) -> Result<()> {
        self.queues
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        Ok(())
    }

    async fn subscribe(&self) -> Result<MessageStream> {
        let rx = self.topic.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("result topic receiver lagged, skipped {skipped}");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Client for submitting tasks and awaiting their typed results.
pub struct QueueClient {
    transport: Arc<dyn QueueTransport>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl QueueClient {
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self {
            transport,
            shutdown: None,
        }
    }

    /// Tie pending waits to the supervisor's stop signal.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Submit a task and await its terminal message.
    ///
    /// Exactly one terminal is consumed per call; progress messages are
    /// forwarded to `on_progress` and otherwise ignored. On deadline expiry
    /// the subscription is abandoned and `Timeout` returned.
    pub async fn submit_and_await<T: DeserializeOwned>(
        &self,
        kind: TaskKind,
        correlation: i64,
        args: serde_json::Value,
        timeout: Duration,
        on_progress: Option<&(dyn Fn(&ResultEnvelope) + Send + Sync)>,
    ) -> Result<T> {
        let task_id = Self::task_id(kind, correlation);
        let envelope = TaskEnvelope::new(task_id.clone(), kind, args);
        let payload = serde_json::to_string(&envelope)?;

        self.transport
            .push(&kind.queue_name(), payload)
            .await
            .map_err(|e| AlertError::QueueUnavailable(e.to_string()))?;
        debug!("submitted task {task_id}");

        // The push above committed the work; losing the subscription from
        // here on can only lose the correlation.
        let mut stream = self
            .transport
            .subscribe()
            .await
            .map_err(|e| AlertError::Cache(format!("result subscription failed: {e}")))?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                msg = stream.next() => {
                    let Some(raw) = msg else {
                        return Err(AlertError::Cache("result topic closed".to_string()));
                    };
                    let Ok(result) = serde_json::from_str::<ResultEnvelope>(&raw) else {
                        // Non-protocol chatter on the topic
                        continue;
                    };
                    if result.task_id != task_id {
                        continue;
                    }
                    match result.status {
                        TaskStatus::Progress => {
                            if let Some(callback) = on_progress {
                                callback(&result);
                            }
                        }
                        TaskStatus::Failed => {
                            let message = result
                                .error_message
                                .clone()
                                .or_else(|| result.error.as_ref().map(|e| e.to_string()))
                                .unwrap_or_else(|| "unspecified worker error".to_string());
                            return Err(AlertError::Worker { message });
                        }
                        TaskStatus::Completed => {
                            let value = result.result.unwrap_or(serde_json::Value::Null);
                            return serde_json::from_value(value)
                                .map_err(|e| AlertError::Decode(e.to_string()));
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(AlertError::Timeout { task_id });
                }
                _ = wait_for_stop(&mut shutdown) => {
                    return Err(AlertError::Cancelled);
                }
            }
        }
    }

    fn task_id(kind: TaskKind, correlation: i64) -> String {
        let nanos = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        format!("{}_{}_{}", kind.as_str(), correlation, nanos)
    }
}

/// Resolves when the stop signal fires; pends forever without one.
async fn wait_for_stop(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AlertTaskResult;
    use serde_json::json;

    fn terminal(task_id: &str, status: &str, result: serde_json::Value) -> String {
        json!({"task_id": task_id, "status": status, "result": result}).to_string()
    }

    async fn submitted_task_id(transport: &InMemoryQueueTransport) -> String {
        let raw = transport.pop_task("alert_queue").expect("task queued");
        let envelope: TaskEnvelope = serde_json::from_str(&raw).unwrap();
        envelope.task_id
    }

    #[tokio::test]
    async fn test_progress_then_terminal() {
        let transport = Arc::new(InMemoryQueueTransport::new());
        let client = QueueClient::new(transport.clone());

        let worker = transport.clone();
        let progress_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let progress_count = progress_seen.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let task_id = submitted_task_id(&worker).await;
            worker.publish(json!({"task_id": task_id, "status": "progress"}).to_string());
            worker.publish(terminal(
                &task_id,
                "completed",
                json!({"success": true, "instances": [{"symbol": "AAPL"}]}),
            ));
        });

        let on_progress = {
            let progress_seen = progress_seen.clone();
            move |_: &ResultEnvelope| {
                progress_seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        };
        let result: AlertTaskResult = client
            .submit_and_await(
                TaskKind::Alert,
                7,
                json!({"strategy_id": 7}),
                Duration::from_secs(5),
                Some(&on_progress),
            )
            .await
            .unwrap();

        handle.await.unwrap();
        assert!(result.success);
        assert_eq!(result.instances[0].symbol, "AAPL");
        assert_eq!(progress_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unrelated_and_malformed_messages_are_skipped() {
        let transport = Arc::new(InMemoryQueueTransport::new());
        let client = QueueClient::new(transport.clone());

        let worker = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let task_id = submitted_task_id(&worker).await;
            worker.publish("not json".to_string());
            worker.publish(terminal("alert_999_1", "completed", json!({"success": false})));
            worker.publish(terminal(&task_id, "completed", json!({"success": true})));
        });

        let result: AlertTaskResult = client
            .submit_and_await(
                TaskKind::Alert,
                7,
                json!({}),
                Duration::from_secs(5),
                None,
            )
            .await
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_failed_terminal_maps_to_worker_error() {
        let transport = Arc::new(InMemoryQueueTransport::new());
        let client = QueueClient::new(transport.clone());

        let worker = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let task_id = submitted_task_id(&worker).await;
            worker.publish(
                json!({"task_id": task_id, "status": "failed", "error_message": "exploded"})
                    .to_string(),
            );
        });

        let err = client
            .submit_and_await::<AlertTaskResult>(
                TaskKind::Alert,
                7,
                json!({}),
                Duration::from_secs(5),
                None,
            )
            .await
            .unwrap_err();
        match err {
            AlertError::Worker { message } => assert_eq!(message, "exploded"),
            other => panic!("expected Worker error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_with_only_progress() {
        let transport = Arc::new(InMemoryQueueTransport::new());
        let client = QueueClient::new(transport.clone());

        let worker = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let task_id = submitted_task_id(&worker).await;
            loop {
                worker.publish(json!({"task_id": task_id, "status": "progress"}).to_string());
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let err = client
            .submit_and_await::<AlertTaskResult>(
                TaskKind::Alert,
                7,
                json!({}),
                Duration::from_millis(80),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AlertError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_decode_error_on_schema_mismatch() {
        let transport = Arc::new(InMemoryQueueTransport::new());
        let client = QueueClient::new(transport.clone());

        let worker = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let task_id = submitted_task_id(&worker).await;
            worker.publish(terminal(&task_id, "completed", json!({"success": "not-a-bool"})));
        });

        let err = client
            .submit_and_await::<AlertTaskResult>(
                TaskKind::Alert,
                7,
                json!({}),
                Duration::from_secs(5),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AlertError::Decode(_)));
    }

    #[tokio::test]
    async fn test_stop_signal_cancels_wait() {
        let transport = Arc::new(InMemoryQueueTransport::new());
        let (tx, rx) = watch::channel(false);
        let client = QueueClient::new(transport.clone()).with_shutdown(rx);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        });

        let err = client
            .submit_and_await::<AlertTaskResult>(
                TaskKind::Alert,
                7,
                json!({}),
                Duration::from_secs(30),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AlertError::Cancelled));
    }
}
