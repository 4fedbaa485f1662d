//! In-memory capability implementations for tests and local development.
//!
//! - [`InMemoryQueue`]: visibility timeouts, receipts, receive counts and
//!   redelivery of messages whose visibility lapsed
//! - [`InMemoryObjectStore`]: key/value object map with a write log
//! - [`InMemoryPublisher`]: records every published payload
//!
//! Each one supports scripted failure injection, either for the next N calls
//! or for a specific key/message id. All timing uses `tokio::time`, so tests
//! can run on a paused clock.

use crate::error::{PipelineError, PipelineResult};
use crate::message::{Message, NotificationEvent, ReceiptToken, StorageKey};
use crate::notification::Publisher;
use crate::queue::QueueClient;
use crate::storage::ObjectStore;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted failures: the next N calls, or every call for a given key.
#[derive(Debug, Default)]
struct FailureScript {
    next: VecDeque<PipelineError>,
    by_key: HashMap<String, PipelineError>,
}

impl FailureScript {
    fn take(&mut self, key: &str) -> Option<PipelineError> {
        if let Some(err) = self.by_key.get(key) {
            return Some(err.clone());
        }
        self.next.pop_front()
    }

    fn push(&mut self, times: usize, err: PipelineError) {
        self.next.extend(std::iter::repeat_n(err, times));
    }
}

/// Tracks how many calls are running at once.
#[derive(Debug, Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) -> ConcurrencyGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ConcurrencyGuard(self)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct ConcurrencyGuard<'a>(&'a Concurrency);

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    body: Bytes,
    receive_count: u32,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    /// Keyed by receipt token
    in_flight: HashMap<String, InFlight>,
    deleted: Vec<String>,
    receive_calls: usize,
    receive_failures: FailureScript,
    delete_failures: FailureScript,
    extend_failures: FailureScript,
    extensions: usize,
}

impl QueueState {
    /// Move in-flight messages whose visibility lapsed back to the ready queue.
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(flight) = self.in_flight.remove(&receipt) {
                self.ready.push_back(flight.message);
            }
        }
    }

    fn next_visibility_change(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.visible_at).min()
    }

    /// Receipt is known and its visibility has not lapsed.
    fn live_receipt(&mut self, receipt: &ReceiptToken, now: Instant) -> Option<&mut InFlight> {
        self.in_flight
            .get_mut(receipt.as_str())
            .filter(|f| f.visible_at > now)
    }
}

/// In-memory at-least-once queue.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    visibility_timeout: Duration,
    arrivals: Notify,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl InMemoryQueue {
    /// Create a queue whose receives hide messages for `visibility_timeout`.
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            visibility_timeout,
            arrivals: Notify::new(),
        }
    }

    /// Enqueue a message with a generated id. Returns the id.
    pub fn send(&self, body: impl Into<Bytes>) -> String {
        let id = Uuid::new_v4().to_string();
        self.send_with_id(id.clone(), body);
        id
    }

    /// Enqueue a message with an explicit id.
    pub fn send_with_id(&self, id: impl Into<String>, body: impl Into<Bytes>) {
        lock(&self.state).ready.push_back(StoredMessage {
            id: id.into(),
            body: body.into(),
            receive_count: 0,
            enqueued_at: Utc::now(),
        });
        self.arrivals.notify_waiters();
    }

    /// Fail the next `times` receive calls with `err`.
    pub fn fail_receives(&self, times: usize, err: PipelineError) {
        lock(&self.state).receive_failures.push(times, err);
    }

    /// Fail the next `times` delete calls with `err`.
    pub fn fail_deletes(&self, times: usize, err: PipelineError) {
        lock(&self.state).delete_failures.push(times, err);
    }

    /// Fail the next `times` visibility extensions with `err`.
    pub fn fail_extensions(&self, times: usize, err: PipelineError) {
        lock(&self.state).extend_failures.push(times, err);
    }

    /// Messages waiting to be received.
    pub fn visible_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.requeue_expired(Instant::now());
        state.ready.len()
    }

    /// Messages received but neither deleted nor expired.
    pub fn in_flight_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.requeue_expired(Instant::now());
        state.in_flight.len()
    }

    /// Ids of deleted messages, in deletion order.
    pub fn deleted_ids(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    pub fn receive_calls(&self) -> usize {
        lock(&self.state).receive_calls
    }

    pub fn extension_count(&self) -> usize {
        lock(&self.state).extensions
    }

    /// Take up to `max` visible messages, or report when to look again.
    fn try_receive(&self, max: usize) -> (Vec<Message>, Option<Instant>) {
        let now = Instant::now();
        let mut state = lock(&self.state);
        state.requeue_expired(now);

        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(mut stored) = state.ready.pop_front() else {
                break;
            };
            stored.receive_count += 1;

            let receipt = ReceiptToken::new(format!("{}#{}", stored.id, Uuid::new_v4()));
            batch.push(
                Message::new(stored.id.clone(), stored.body.clone(), receipt.clone())
                    .with_receive_count(stored.receive_count)
                    .with_enqueued_at(stored.enqueued_at),
            );
            state.in_flight.insert(
                receipt.as_str().to_string(),
                InFlight {
                    message: stored,
                    visible_at: now + self.visibility_timeout,
                },
            );
        }

        (batch, state.next_visibility_change())
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait_timeout: Duration,
    ) -> PipelineResult<Vec<Message>> {
        {
            let mut state = lock(&self.state);
            state.receive_calls += 1;
            if let Some(err) = state.receive_failures.take("") {
                return Err(err);
            }
        }

        let deadline = Instant::now() + wait_timeout;
        loop {
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let (batch, next_change) = self.try_receive(max_messages.max(1));
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }

            let wake_at = next_change.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt: &ReceiptToken) -> PipelineResult<()> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        if let Some(err) = state.delete_failures.take(receipt.as_str()) {
            return Err(err);
        }

        if state.live_receipt(receipt, now).is_none() {
            return Err(PipelineError::receipt_expired(
                "receipt handle is invalid or its visibility lapsed",
            ));
        }
        if let Some(flight) = state.in_flight.remove(receipt.as_str()) {
            state.deleted.push(flight.message.id);
        }
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt: &ReceiptToken,
        duration: Duration,
    ) -> PipelineResult<()> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        if let Some(err) = state.extend_failures.take(receipt.as_str()) {
            return Err(err);
        }

        let Some(flight) = state.live_receipt(receipt, now) else {
            return Err(PipelineError::receipt_expired(
                "receipt handle is invalid or its visibility lapsed",
            ));
        };
        flight.visible_at = now + duration;
        state.extensions += 1;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// Object store
// ============================================================================

/// In-memory object store.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
    writes: Mutex<Vec<(String, Bytes)>>,
    failures: Mutex<FailureScript>,
    latency: Option<Duration>,
    concurrency: Concurrency,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every put by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `times` puts with `err`.
    pub fn fail_next(&self, times: usize, err: PipelineError) {
        lock(&self.failures).push(times, err);
    }

    /// Fail every put to `key` with `err`.
    pub fn fail_key(&self, key: &StorageKey, err: PipelineError) {
        lock(&self.failures)
            .by_key
            .insert(key.as_str().to_string(), err);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    /// Every successful put, in order.
    pub fn writes(&self) -> Vec<(String, Bytes)> {
        lock(&self.writes).clone()
    }

    /// Most puts observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.concurrency.peak()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &StorageKey, body: Bytes) -> PipelineResult<()> {
        let _running = self.concurrency.enter();
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(err) = lock(&self.failures).take(key.as_str()) {
            return Err(err);
        }

        lock(&self.objects).insert(key.as_str().to_string(), body.clone());
        lock(&self.writes).push((key.as_str().to_string(), body));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// In-memory notification publisher.
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    published: Mutex<Vec<(String, serde_json::Value)>>,
    failures: Mutex<FailureScript>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` publishes with `err`.
    pub fn fail_next(&self, times: usize, err: PipelineError) {
        lock(&self.failures).push(times, err);
    }

    /// Fail every publish for `message_id` with `err`.
    pub fn fail_message(&self, message_id: &str, err: PipelineError) {
        lock(&self.failures)
            .by_key
            .insert(message_id.to_string(), err);
    }

    /// Raw `(topic, payload)` pairs, in publish order.
    pub fn published(&self) -> Vec<(String, serde_json::Value)> {
        lock(&self.published).clone()
    }

    /// Published payloads decoded as notification events.
    pub fn events(&self) -> Vec<NotificationEvent> {
        lock(&self.published)
            .iter()
            .filter_map(|(_, payload)| serde_json::from_value(payload.clone()).ok())
            .collect()
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> PipelineResult<()> {
        let message_id = payload
            .get("sourceMessageId")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if let Some(err) = lock(&self.failures).take(message_id) {
            return Err(err);
        }

        lock(&self.published).push((topic.to_string(), payload.clone()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_empty() {
        let queue = InMemoryQueue::default();
        let start = Instant::now();

        let batch = queue.receive(10, Duration::from_secs(20)).await.unwrap();

        assert!(batch.is_empty());
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_wakes_on_send() {
        let queue = std::sync::Arc::new(InMemoryQueue::default());
        let receiver = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.receive(10, Duration::from_secs(20)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.send_with_id("a", "hello");

        let batch = receiver.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_redelivered() {
        let queue = InMemoryQueue::new(Duration::from_secs(5));
        queue.send_with_id("a", "x");

        let first = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(first[0].receive_count, 1);
        assert_eq!(queue.visible_count(), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;

        let second = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(second[0].id, "a");
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(second[0].receipt, first[0].receipt);

        // The first receipt lapsed
        let err = queue.delete(&first[0].receipt).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReceiptExpired);
        assert!(queue.delete(&second[0].receipt).await.is_ok());
        assert_eq!(queue.deleted_ids(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_visibility_keeps_message_hidden() {
        let queue = InMemoryQueue::new(Duration::from_secs(5));
        queue.send_with_id("a", "x");
        let batch = queue.receive(1, Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        queue
            .extend_visibility(&batch[0].receipt, Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(queue.visible_count(), 0);
        assert_eq!(queue.in_flight_count(), 1);
        assert_eq!(queue.extension_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_receive_failures() {
        let queue = InMemoryQueue::default();
        queue.fail_receives(1, PipelineError::transient("connection refused"));

        assert!(queue.receive(1, Duration::ZERO).await.is_err());
        assert!(queue.receive(1, Duration::ZERO).await.is_ok());
        assert_eq!(queue.receive_calls(), 2);
    }

    #[tokio::test]
    async fn test_object_store_records_writes() {
        let store = InMemoryObjectStore::new();
        let key = StorageKey::for_message("1");

        store.put(&key, Bytes::from_static(b"a")).await.unwrap();
        store.put(&key, Bytes::from_static(b"a")).await.unwrap();

        assert_eq!(store.object_count(), 1);
        assert_eq!(store.writes().len(), 2);
        assert_eq!(store.get("message-1.txt"), Some(Bytes::from_static(b"a")));
    }

    #[tokio::test]
    async fn test_object_store_key_failure_is_sticky() {
        let store = InMemoryObjectStore::new();
        let key = StorageKey::for_message("bad");
        store.fail_key(&key, PipelineError::permanent("AccessDenied"));

        assert!(store.put(&key, Bytes::new()).await.is_err());
        assert!(store.put(&key, Bytes::new()).await.is_err());
        assert!(store
            .put(&StorageKey::for_message("good"), Bytes::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_publisher_fails_by_message_id() {
        let publisher = InMemoryPublisher::new();
        publisher.fail_message("7", PipelineError::transient("Throttling"));

        let bad = serde_json::to_value(NotificationEvent::stored("7", StorageKey::for_message("7")))
            .unwrap();
        let good = serde_json::to_value(NotificationEvent::stored("8", StorageKey::for_message("8")))
            .unwrap();

        assert!(publisher.publish("t", &bad).await.is_err());
        assert!(publisher.publish("t", &good).await.is_ok());
        assert_eq!(publisher.events().len(), 1);
        assert_eq!(publisher.events()[0].source_message_id, "8");
    }
}
