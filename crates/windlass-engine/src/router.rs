//! Signal delivery and event fan-out.
//!
//! Signals are point-to-point: [`SignalRouter::send`] writes a
//! `SignalReceived` event to the target execution's queue. Emitted events are
//! fan-out: [`EventRouter::emit`] dispatches each envelope to every
//! registered subscription whose filter matches, retrying failed deliveries
//! with an attempt-bounded policy and routing terminal failures to a
//! dead-letter sink.

use std::sync::{Arc, Mutex, PoisonError};

use metrics::counter;
use serde_json::Value;
use ulid::Ulid;

use windlass_core::event::{EmittedEvent, EventPayload};
use windlass_core::{ExecutionId, HistoryEvent, SignalId};

use crate::error::{Error, Failure, Result};
use crate::metrics::{labels, names};
use crate::queue::{ExecutionQueue, WorkflowTask};
use crate::registry::Registry;

/// Delivers signals to executions.
pub struct SignalRouter {
    queue: Arc<dyn ExecutionQueue>,
}

impl SignalRouter {
    /// Creates a signal router over the workflow-task queue.
    #[must_use]
    pub fn new(queue: Arc<dyn ExecutionQueue>) -> Self {
        Self { queue }
    }

    /// Sends a signal to `execution_id`.
    ///
    /// `id` is an optional client-supplied idempotency key: re-sends with
    /// the same id inside the queue's deduplication window are dropped.
    /// Without one, a fresh ULID id is generated and every send is
    /// delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue submission fails.
    #[tracing::instrument(skip(self, payload), fields(execution_id = %execution_id, signal_id = %signal_id))]
    pub async fn send(
        &self,
        execution_id: ExecutionId,
        signal_id: SignalId,
        payload: Value,
        id: Option<String>,
    ) -> Result<()> {
        let dedup = id.clone();
        let event = HistoryEvent::new(EventPayload::SignalReceived {
            id: id.unwrap_or_else(|| Ulid::new().to_string()),
            signal_id,
            payload,
        });
        let task = WorkflowTask::single(execution_id, event);
        match dedup {
            Some(key) => {
                self.queue
                    .submit_deduplicated(&format!("signal/{key}"), task)
                    .await?;
            }
            None => {
                self.queue.submit(task).await?;
            }
        }
        Ok(())
    }
}

/// A delivery that exhausted its retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Name of the subscription that failed.
    pub subscription: String,
    /// The undeliverable event.
    pub event: EmittedEvent,
    /// The last delivery error.
    pub error: String,
}

/// Sink for deliveries that exhausted their retry budget.
#[async_trait::async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Records a dead-lettered delivery.
    async fn publish(&self, letter: DeadLetter) -> Result<()>;
}

/// In-memory dead-letter sink for testing.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded letters.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn letters(&self) -> Result<Vec<DeadLetter>> {
        let letters = self
            .letters
            .lock()
            .map_err(|_: PoisonError<_>| Error::storage("lock poisoned"))?;
        Ok(letters.clone())
    }
}

#[async_trait::async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn publish(&self, letter: DeadLetter) -> Result<()> {
        let mut letters = self
            .letters
            .lock()
            .map_err(|_: PoisonError<_>| Error::storage("lock poisoned"))?;
        letters.push(letter);
        Ok(())
    }
}

/// Fans emitted events out to matching subscriptions.
pub struct EventRouter {
    registry: Arc<Registry>,
    dead_letter: Arc<dyn DeadLetterSink>,
    max_attempts: u32,
}

impl EventRouter {
    /// Creates an event router.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        dead_letter: Arc<dyn DeadLetterSink>,
        max_attempts: u32,
    ) -> Self {
        Self {
            registry,
            dead_letter,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Dispatches each envelope to every matching subscription.
    ///
    /// Individual delivery failures are retried up to the attempt bound and
    /// then dead-lettered; they never fail the emission as a whole.
    ///
    /// # Errors
    ///
    /// Returns an error only if the dead-letter sink itself fails.
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    pub async fn emit(&self, events: &[EmittedEvent]) -> Result<()> {
        for event in events {
            for subscription in self.registry.subscriptions() {
                if !subscription.matches(event) {
                    continue;
                }
                self.deliver(subscription.name.clone(), &subscription.handler, event)
                    .await?;
            }
        }
        Ok(())
    }

    async fn deliver(
        &self,
        subscription: String,
        handler: &crate::registry::SubscriptionFn,
        event: &EmittedEvent,
    ) -> Result<()> {
        let mut last_failure: Option<Failure> = None;
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }
            match handler(event.clone()).await {
                Ok(()) => {
                    counter!(names::ROUTER_DELIVERIES_TOTAL, labels::RESULT => "delivered")
                        .increment(1);
                    return Ok(());
                }
                Err(failure) => {
                    tracing::warn!(
                        subscription = %subscription,
                        event = %event.name,
                        attempt,
                        error = %failure,
                        "subscription delivery failed"
                    );
                    last_failure = Some(failure);
                }
            }
        }

        counter!(names::ROUTER_DELIVERIES_TOTAL, labels::RESULT => "dead_lettered").increment(1);
        let error = last_failure.map(|failure| failure.to_string()).unwrap_or_default();
        self.dead_letter
            .publish(DeadLetter {
                subscription,
                event: event.clone(),
                error,
            })
            .await
    }
}

fn backoff(attempt: u32) -> std::time::Duration {
    std::time::Duration::from_millis(10u64.saturating_mul(1u64 << attempt.min(6)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Subscription;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry_with(subscription: Subscription) -> Arc<Registry> {
        let mut registry = Registry::new();
        registry.register_subscription(subscription);
        Arc::new(registry)
    }

    #[tokio::test]
    async fn matching_subscription_receives_the_event() {
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let registry = registry_with(Subscription {
            name: "audit".into(),
            event_name: Some("order-created".into()),
            predicate: None,
            handler: Arc::new(move |_| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        });
        let router = EventRouter::new(registry, Arc::new(InMemoryDeadLetterSink::new()), 3);

        router
            .emit(&[
                EmittedEvent::new("order-created", json!({"total": 5})),
                EmittedEvent::new("unrelated", json!({})),
            ])
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_are_dead_lettered() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let registry = registry_with(Subscription {
            name: "flaky".into(),
            event_name: None,
            predicate: None,
            handler: Arc::new(move |_| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Failure::new("Unavailable", "downstream offline"))
                })
            }),
        });
        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let router = EventRouter::new(registry, Arc::clone(&sink) as Arc<dyn DeadLetterSink>, 2);

        router
            .emit(&[EmittedEvent::new("order-created", json!({}))])
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let letters = sink.letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].subscription, "flaky");
        assert!(letters[0].error.contains("Unavailable"));
    }

    #[tokio::test]
    async fn signal_send_lands_on_the_target_queue() {
        let queue = Arc::new(crate::queue::InMemoryExecutionQueue::new());
        let router = SignalRouter::new(Arc::clone(&queue) as Arc<dyn ExecutionQueue>);
        let target: ExecutionId = "wf/run".parse().unwrap();

        router
            .send(target.clone(), SignalId::new("go"), json!("ok"), None)
            .await
            .unwrap();

        let tasks = queue.receive(10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(matches!(
            &tasks[0].events[0].payload,
            EventPayload::SignalReceived { signal_id, .. } if signal_id.as_str() == "go"
        ));
    }

    #[tokio::test]
    async fn client_id_deduplicates_resends() {
        let queue = Arc::new(crate::queue::InMemoryExecutionQueue::new());
        let router = SignalRouter::new(Arc::clone(&queue) as Arc<dyn ExecutionQueue>);
        let target: ExecutionId = "wf/run".parse().unwrap();

        for _ in 0..2 {
            router
                .send(
                    target.clone(),
                    SignalId::new("go"),
                    json!("ok"),
                    Some("client-key-1".into()),
                )
                .await
                .unwrap();
        }

        let tasks = queue.receive(10).await.unwrap();
        assert_eq!(tasks[0].events.len(), 1);
    }
}
