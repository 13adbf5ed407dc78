use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::PublishError;
use crate::store::CompensationChannel;

const MAX_TRACKED_OPERATIONS: usize = 100_000;

/// Why the synchronous call path failed, carried inside the compensation
/// record so the consumer can distinguish a skipped call from an exhausted
/// one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The breaker was open; the dependency was never called.
    DependencyUnavailable,
    /// Every permitted attempt failed.
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Durable fallback payload published when the synchronous path fails.
///
/// Carries everything the out-of-band consumer needs to complete the
/// provisioning effect without reaching back into the producer: the unique
/// operation id (the downstream dedupe key), the full business payload, the
/// failure reason, and the creation timestamp in unix milliseconds. After a
/// successful publish the producer retains no reference to the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub operation_id: String,
    pub payload: serde_json::Value,
    pub reason: FailureReason,
    pub created_at_ms: u64,
}

impl CompensationRecord {
    pub fn new(operation_id: impl Into<String>, payload: serde_json::Value, reason: FailureReason) -> Self {
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            operation_id: operation_id.into(),
            payload,
            reason,
            created_at_ms,
        }
    }
}

/// A message as handed to the asynchronous channel: the topic key (the
/// operation id) and the serialized record body.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub key: String,
    pub body: String,
}

/// In-memory compensation channel backed by a tokio mpsc queue.
///
/// This is the default channel used by [`Dispatcher`] and the one the test
/// suite consumes from. A real deployment plugs a broker producer in via
/// [`CompensationChannel`]; delivery then has to be at-least-once, with the
/// consumer deduping by operation id.
#[derive(Clone)]
pub struct InMemoryChannel {
    tx: mpsc::UnboundedSender<Published>,
}

impl InMemoryChannel {
    /// Create the channel and hand back the consumer end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Published>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CompensationChannel for InMemoryChannel {
    fn publish(
        &self,
        record: &CompensationRecord,
    ) -> impl std::future::Future<Output = Result<(), PublishError>> + Send {
        let result = serde_json::to_string(record)
            .map_err(PublishError::from)
            .and_then(|body| {
                self.tx
                    .send(Published {
                        key: record.operation_id.clone(),
                        body,
                    })
                    .map_err(|_| PublishError::ChannelClosed)
            });
        std::future::ready(result)
    }
}

enum DispatchState {
    /// A publish for this id is in flight. The receiver is signalled when
    /// it concludes; a sender dropped without signalling means the
    /// publishing caller was cancelled mid-flight.
    InFlight(watch::Receiver<()>),
    Done,
}

/// Publishes compensation records, at most once per operation id.
///
/// Invoked when the protected call path is exhausted or skipped. The
/// dispatcher builds the [`CompensationRecord`] and hands it to the
/// asynchronous channel; channel acknowledgement is the commit point, after
/// which the record is owned by the channel and will never be re-published
/// from here. A publish failure is terminal for the logical operation
/// (there is no second fallback) and clears the dispatch guard so a later
/// re-submission of the same logical operation can try again.
///
/// Concurrent calls for the same operation id collapse into one publish:
/// later callers wait on the in-flight dispatch and report its outcome.
/// They only claim success once a record has actually been acknowledged;
/// if the in-flight publish fails, a waiter retries it itself.
pub struct Dispatcher<C: CompensationChannel = InMemoryChannel> {
    channel: C,
    dispatched: Arc<DashMap<String, DispatchState>>,
}

impl<C: CompensationChannel> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            dispatched: self.dispatched.clone(),
        }
    }
}

impl<C: CompensationChannel> Dispatcher<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            dispatched: Arc::new(DashMap::new()),
        }
    }

    /// Build and publish a compensation record for `operation_id`.
    ///
    /// Returns `Ok(())` once a record for this id has been accepted by the
    /// channel, whether by this call or an earlier one. A caller that finds
    /// a publish already in flight waits for its outcome rather than
    /// assuming it will succeed; if it fails or is cancelled, the waiter
    /// publishes itself and reports that result.
    pub async fn compensate(
        &self,
        operation_id: &str,
        payload: serde_json::Value,
        reason: FailureReason,
    ) -> Result<(), PublishError> {
        loop {
            let mut conclude = None;
            let in_flight = match self.dispatched.entry(operation_id.to_string()) {
                Entry::Occupied(entry) => match entry.get() {
                    DispatchState::Done => {
                        tracing::debug!(operation_id, "compensation already dispatched");
                        return Ok(());
                    }
                    DispatchState::InFlight(rx) => Some(rx.clone()),
                },
                Entry::Vacant(entry) => {
                    let (tx, rx) = watch::channel(());
                    entry.insert(DispatchState::InFlight(rx));
                    conclude = Some(tx);
                    None
                }
            };

            if let Some(mut rx) = in_flight {
                // The map is updated before the conclusion signal is sent,
                // so re-reading it after the wait observes the outcome. An
                // error here means the publishing caller was dropped without
                // concluding; clear its stale reservation and take over.
                if rx.changed().await.is_err() {
                    self.dispatched.remove_if(operation_id, |_, state| {
                        matches!(state, DispatchState::InFlight(cur) if cur.same_channel(&rx))
                    });
                }
                continue;
            }

            let record = CompensationRecord::new(operation_id, payload.clone(), reason.clone());
            let result = self.channel.publish(&record).await;
            match &result {
                Ok(()) => {
                    tracing::warn!(
                        operation_id,
                        reason = ?record.reason,
                        "synchronous path failed, compensation record published"
                    );
                    self.dispatched
                        .insert(operation_id.to_string(), DispatchState::Done);
                    self.trim_tracked();
                }
                Err(err) => {
                    tracing::error!(operation_id, error = %err, "compensation publish failed");
                    self.dispatched.remove(operation_id);
                }
            }
            if let Some(tx) = conclude {
                let _ = tx.send(());
            }
            return result;
        }
    }

    /// The dispatch guard only needs to cover operations that could still
    /// be re-attempted concurrently; bound its footprint by dropping old
    /// completed entries once over the cap.
    fn trim_tracked(&self) {
        if self.dispatched.len() <= MAX_TRACKED_OPERATIONS {
            return;
        }
        let victim = self
            .dispatched
            .iter()
            .find(|entry| matches!(entry.value(), DispatchState::Done))
            .map(|entry| entry.key().clone());
        if let Some(key) = victim {
            self.dispatched.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;

    fn payload() -> serde_json::Value {
        serde_json::json!({
            "operation_id": "P1:provision",
            "name": "John Doe",
            "email": "john@example.com",
        })
    }

    #[tokio::test]
    async fn publishes_record_keyed_by_operation_id() {
        let (channel, mut rx) = InMemoryChannel::new();
        let dispatcher = Dispatcher::new(channel);

        dispatcher
            .compensate("P1:provision", payload(), FailureReason::DependencyUnavailable)
            .await
            .unwrap();

        let published = rx.recv().await.unwrap();
        assert_eq!(published.key, "P1:provision");

        // The body must be self-contained: id, payload, and reason all
        // survive the trip through the channel.
        let record: CompensationRecord = serde_json::from_str(&published.body).unwrap();
        assert_eq!(record.operation_id, "P1:provision");
        assert_eq!(record.payload, payload());
        assert_eq!(record.reason, FailureReason::DependencyUnavailable);
        assert!(record.created_at_ms > 0);
    }

    #[tokio::test]
    async fn second_dispatch_for_same_operation_is_dropped() {
        let (channel, mut rx) = InMemoryChannel::new();
        let dispatcher = Dispatcher::new(channel);

        dispatcher
            .compensate("P1:provision", payload(), FailureReason::DependencyUnavailable)
            .await
            .unwrap();
        dispatcher
            .compensate(
                "P1:provision",
                payload(),
                FailureReason::RetriesExhausted {
                    attempts: 3,
                    last_error: "timeout".to_string(),
                },
            )
            .await
            .unwrap();

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err(), "duplicate record was published");
    }

    #[tokio::test]
    async fn distinct_operations_each_publish() {
        let (channel, mut rx) = InMemoryChannel::new();
        let dispatcher = Dispatcher::new(channel);

        dispatcher
            .compensate("P1:provision", payload(), FailureReason::DependencyUnavailable)
            .await
            .unwrap();
        dispatcher
            .compensate("P2:provision", payload(), FailureReason::DependencyUnavailable)
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().key, "P1:provision");
        assert_eq!(rx.recv().await.unwrap().key, "P2:provision");
    }

    /// Publishes block until released, then fail the way an external broker
    /// client would, with an opaque backend error.
    #[derive(Clone)]
    struct GatedFailingChannel {
        started: Arc<Notify>,
        release: Arc<Notify>,
        attempts: Arc<AtomicUsize>,
    }

    impl GatedFailingChannel {
        fn new() -> Self {
            Self {
                started: Arc::new(Notify::new()),
                release: Arc::new(Notify::new()),
                attempts: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl CompensationChannel for GatedFailingChannel {
        fn publish(
            &self,
            _record: &CompensationRecord,
        ) -> impl std::future::Future<Output = Result<(), PublishError>> + Send {
            let started = self.started.clone();
            let release = self.release.clone();
            let attempts = self.attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                started.notify_one();
                release.notified().await;
                Err(PublishError::Other("broker unavailable".into()))
            }
        }
    }

    #[tokio::test]
    async fn concurrent_caller_sees_in_flight_publish_failure() {
        let channel = GatedFailingChannel::new();
        let dispatcher = Dispatcher::new(channel.clone());

        let first = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .compensate("P1:provision", payload(), FailureReason::DependencyUnavailable)
                    .await
            }
        });
        channel.started.notified().await;

        // Second caller arrives while the first publish is in flight.
        let second = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .compensate("P1:provision", payload(), FailureReason::DependencyUnavailable)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        channel.release.notify_one();
        assert!(first.await.unwrap().is_err());

        // The waiter takes over the publish and reports its own outcome.
        channel.started.notified().await;
        channel.release.notify_one();
        let err = second.await.unwrap().unwrap_err();
        assert!(
            matches!(err, PublishError::Other(_)),
            "waiter must not report success when nothing was published"
        );
        assert_eq!(err.to_string(), "broker unavailable");
        assert_eq!(channel.attempts.load(Ordering::SeqCst), 2);
        assert!(dispatcher.dispatched.is_empty());
    }

    #[tokio::test]
    async fn publish_failure_clears_guard_for_retry() {
        let (channel, rx) = InMemoryChannel::new();
        drop(rx);
        let dispatcher = Dispatcher::new(channel);

        let err = dispatcher
            .compensate("P1:provision", payload(), FailureReason::DependencyUnavailable)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::ChannelClosed));

        // The guard must not remember a failed dispatch.
        assert!(dispatcher.dispatched.is_empty());
    }
}
