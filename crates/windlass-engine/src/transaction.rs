//! Optimistic multi-entity transactions.
//!
//! A transaction function runs in a shadow environment that records every
//! read (with its observed version) and buffers every write and event
//! emission. At commit, a conditional multi-write asserts that nothing
//! observed has changed: written keys are updated conditionally on their
//! observed version, read-only keys are checked unchanged. On conflict the
//! function re-executes from scratch, with exponential backoff, up to
//! [`MAX_RETRIES`] attempts.
//!
//! Buffered events are emitted strictly after a successful commit.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use tokio::sync::Mutex;

use windlass_core::HistoryEvent;
use windlass_core::event::{EmittedEvent, EventPayload};

use crate::dispatch::TransactionEnvelope;
use crate::error::{Failure, Result, codes};
use crate::metrics::{labels, names};
use crate::queue::{ExecutionQueue, WorkflowTask};
use crate::registry::Registry;
use crate::router::EventRouter;
use crate::store::{EntityStore, TransactItem, TransactResult};

/// Maximum commit attempts before a transaction fails permanently.
pub const MAX_RETRIES: u32 = 100;

/// How a transaction finished.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    /// The transaction committed with this output.
    Succeeded(Value),
    /// The transaction failed permanently.
    Failed(Failure),
}

#[derive(Debug, Default)]
struct TxState {
    /// First observed version per key; `None` records an absent key.
    reads: HashMap<String, Option<u64>>,
    /// Buffered writes; `None` value is a delete.
    writes: HashMap<String, Option<Value>>,
    /// Events buffered until commit.
    events: Vec<EmittedEvent>,
}

/// Shadow environment handed to a transaction function.
///
/// Reads are version-recorded, writes and emissions are buffered; nothing
/// touches the store until commit.
#[derive(Clone)]
pub struct TransactionContext {
    entities: Arc<dyn EntityStore>,
    state: Arc<Mutex<TxState>>,
}

impl TransactionContext {
    fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self {
            entities,
            state: Arc::new(Mutex::new(TxState::default())),
        }
    }

    /// Reads an entity, observing its version for the commit condition.
    ///
    /// Reads-after-writes see the buffered value.
    ///
    /// # Errors
    ///
    /// Returns a failure if the underlying store read fails.
    pub async fn get(&self, key: &str) -> std::result::Result<Option<Value>, Failure> {
        let mut state = self.state.lock().await;
        if let Some(pending) = state.writes.get(key) {
            return Ok(pending.clone());
        }
        let current = self.read_through(&mut state, key).await?;
        Ok(current)
    }

    /// Buffers a write.
    ///
    /// # Errors
    ///
    /// Returns a failure if observing the key's current version fails.
    pub async fn set(&self, key: &str, value: Value) -> std::result::Result<(), Failure> {
        let mut state = self.state.lock().await;
        if !state.reads.contains_key(key) {
            self.read_through(&mut state, key).await?;
        }
        state.writes.insert(key.to_string(), Some(value));
        Ok(())
    }

    /// Buffers a delete.
    ///
    /// # Errors
    ///
    /// Returns a failure if observing the key's current version fails.
    pub async fn delete(&self, key: &str) -> std::result::Result<(), Failure> {
        let mut state = self.state.lock().await;
        if !state.reads.contains_key(key) {
            self.read_through(&mut state, key).await?;
        }
        state.writes.insert(key.to_string(), None);
        Ok(())
    }

    /// Buffers events for post-commit emission.
    pub async fn emit_events(&self, events: Vec<EmittedEvent>) {
        let mut state = self.state.lock().await;
        state.events.extend(events);
    }

    async fn read_through(
        &self,
        state: &mut TxState,
        key: &str,
    ) -> std::result::Result<Option<Value>, Failure> {
        let current = self
            .entities
            .get(key)
            .await
            .map_err(|e| Failure::new("StorageError", e.to_string()))?;
        state
            .reads
            .entry(key.to_string())
            .or_insert_with(|| current.as_ref().map(|entry| entry.version));
        Ok(current.map(|entry| entry.value))
    }
}

/// Executes transaction functions with optimistic concurrency.
pub struct TransactionExecutor {
    entities: Arc<dyn EntityStore>,
    events: Arc<EventRouter>,
    registry: Arc<Registry>,
}

impl TransactionExecutor {
    /// Creates a transaction executor.
    #[must_use]
    pub fn new(
        entities: Arc<dyn EntityStore>,
        events: Arc<EventRouter>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            entities,
            events,
            registry,
        }
    }

    /// Runs the transaction registered under `name` to completion.
    #[tracing::instrument(skip(self, input))]
    pub async fn execute(&self, name: &str, input: Value) -> TransactionOutcome {
        let Some(handler) = self.registry.transaction(name) else {
            return TransactionOutcome::Failed(Failure::new(
                codes::TRANSACTION_NOT_FOUND,
                format!("no transaction registered under '{name}'"),
            ));
        };

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(conflict_backoff(attempt)).await;
            }

            let ctx = TransactionContext::new(Arc::clone(&self.entities));
            let output = match handler(input.clone(), ctx.clone()).await {
                Ok(output) => output,
                // User failures are not conflicts; surface them immediately.
                Err(failure) => return TransactionOutcome::Failed(failure),
            };

            match self.commit(&ctx).await {
                Ok(TransactResult::Committed) => {
                    counter!(names::TRANSACTION_ATTEMPTS_TOTAL, labels::RESULT => "committed")
                        .increment(1);
                    let buffered = {
                        let state = ctx.state.lock().await;
                        state.events.clone()
                    };
                    if let Err(error) = self.events.emit(&buffered).await {
                        tracing::warn!(%error, "post-commit event emission failed");
                    }
                    return TransactionOutcome::Succeeded(output);
                }
                Ok(TransactResult::Conflict { key }) => {
                    counter!(names::TRANSACTION_ATTEMPTS_TOTAL, labels::RESULT => "conflict")
                        .increment(1);
                    tracing::debug!(transaction = name, conflict_key = %key, attempt, "transaction conflict, retrying");
                }
                Err(error) => {
                    return TransactionOutcome::Failed(Failure::new(
                        "StorageError",
                        error.to_string(),
                    ));
                }
            }
        }

        TransactionOutcome::Failed(Failure::new(
            codes::TRANSACTION_CONFLICT,
            format!("transaction did not commit within {MAX_RETRIES} attempts"),
        ))
    }

    /// Runs a dispatched transaction and reports the result event back to
    /// the calling execution's queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the result cannot be submitted.
    pub async fn run_envelope(
        &self,
        envelope: TransactionEnvelope,
        queue: &dyn ExecutionQueue,
    ) -> Result<()> {
        let outcome = self.execute(&envelope.name, envelope.input.clone()).await;
        let payload = match outcome {
            TransactionOutcome::Succeeded(result) => EventPayload::TransactionRequestSucceeded {
                seq: envelope.seq,
                result,
            },
            TransactionOutcome::Failed(failure) => EventPayload::TransactionRequestFailed {
                seq: envelope.seq,
                error: failure.error,
                message: failure.message,
            },
        };
        queue
            .submit(WorkflowTask::single(
                envelope.execution_id,
                HistoryEvent::new(payload),
            ))
            .await?;
        Ok(())
    }

    async fn commit(&self, ctx: &TransactionContext) -> Result<TransactResult> {
        let state = ctx.state.lock().await;
        let mut items = Vec::with_capacity(state.reads.len());
        for (key, observed) in &state.reads {
            match state.writes.get(key) {
                Some(Some(value)) => items.push(TransactItem::Put {
                    key: key.clone(),
                    value: value.clone(),
                    expect_version: *observed,
                }),
                Some(None) => items.push(TransactItem::Delete {
                    key: key.clone(),
                    expect_version: *observed,
                }),
                None => items.push(TransactItem::Check {
                    key: key.clone(),
                    expect_version: *observed,
                }),
            }
        }
        drop(state);
        self.entities.transact(&items).await
    }
}

fn conflict_backoff(attempt: u32) -> std::time::Duration {
    std::time::Duration::from_millis(u64::from(2u32.saturating_pow(attempt.min(6))))
}
