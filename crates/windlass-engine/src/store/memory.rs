//! In-memory store implementations for testing.
//!
//! Thread-safe `RwLock`-based implementations of every store trait. These
//! mirror the conditional-write semantics of the durable backends so engine
//! logic can be exercised without external infrastructure.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no durability, no cross-process
//!   coordination
//! - **Single-process only**: state is lost when the process exits

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

use windlass_core::event::SearchOperation;
use windlass_core::{Execution, ExecutionId, ExecutionStatus, HistoryEvent};

use super::{
    ClaimResult, EntityStore, ExecutionFilter, ExecutionStore, HistoryStore, JournalRecord,
    JournalStore, Page, PageRequest, PutResult, SearchStore, TerminalOutcome, TimerScheduleRow,
    TimerStore, TransactItem, TransactResult, UpdateResult, VersionedValue, BucketStore,
    decode_history, encode_history,
};
use crate::error::{Error, Result};

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// In-memory history store keeping newline-delimited JSON blobs.
///
/// Appends re-encode through the blob format so the wire encoding is
/// exercised even in tests.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    blobs: RwLock<HashMap<ExecutionId, Bytes>>,
}

impl InMemoryHistoryStore {
    /// Creates an empty history store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, execution_id: &ExecutionId) -> Result<Vec<HistoryEvent>> {
        let blob = {
            let blobs = self.blobs.read().map_err(poison_err)?;
            blobs.get(execution_id).cloned()
        };
        match blob {
            Some(blob) => decode_history(&blob),
            None => Ok(Vec::new()),
        }
    }

    async fn append(&self, execution_id: &ExecutionId, events: &[HistoryEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let encoded = encode_history(events)?;
        let mut blobs = self.blobs.write().map_err(poison_err)?;
        let entry = blobs.entry(execution_id.clone()).or_default();
        let mut combined = Vec::with_capacity(entry.len() + encoded.len());
        combined.extend_from_slice(entry);
        combined.extend_from_slice(&encoded);
        *entry = Bytes::from(combined);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ClaimRow {
    claimer: String,
    #[allow(dead_code)]
    claimed_at: DateTime<Utc>,
}

/// In-memory execution metadata index and task claim table.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<ExecutionId, Execution>>,
    claims: RwLock<HashMap<(ExecutionId, u64, u32), ClaimRow>>,
    heartbeats: RwLock<HashMap<(ExecutionId, u64), DateTime<Utc>>>,
}

impl InMemoryExecutionStore {
    /// Creates an empty execution store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of executions currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn execution_count(&self) -> Result<usize> {
        let count = {
            let executions = self.executions.read().map_err(poison_err)?;
            executions.len()
        };
        Ok(count)
    }
}

fn matches_filter(execution: &Execution, filter: &ExecutionFilter) -> bool {
    if let Some(status) = filter.status {
        if execution.status != status {
            return false;
        }
    }
    if let Some(workflow) = &filter.workflow_name {
        if &execution.workflow_name != workflow {
            return false;
        }
    }
    true
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, execution: &Execution) -> Result<PutResult> {
        let mut executions = self.executions.write().map_err(poison_err)?;
        if executions.contains_key(&execution.id) {
            return Ok(PutResult::AlreadyExists);
        }
        executions.insert(execution.id.clone(), execution.clone());
        Ok(PutResult::Created)
    }

    async fn get(&self, execution_id: &ExecutionId) -> Result<Option<Execution>> {
        let result = {
            let executions = self.executions.read().map_err(poison_err)?;
            executions.get(execution_id).cloned()
        };
        Ok(result)
    }

    async fn complete(
        &self,
        execution_id: &ExecutionId,
        outcome: &TerminalOutcome,
    ) -> Result<UpdateResult> {
        let mut executions = self.executions.write().map_err(poison_err)?;
        let Some(execution) = executions.get_mut(execution_id) else {
            return Ok(UpdateResult::NotFound);
        };
        if execution.status != ExecutionStatus::InProgress {
            return Ok(UpdateResult::StatusMismatch {
                actual: execution.status,
            });
        }
        execution.status = outcome.status;
        execution.end_time = Some(outcome.end_time);
        execution.result = outcome.result.clone();
        execution.error = outcome.error.clone();
        execution.message = outcome.message.clone();
        Ok(UpdateResult::Success)
    }

    async fn list(&self, filter: &ExecutionFilter, page: &PageRequest) -> Result<Page<Execution>> {
        let mut matching: Vec<Execution> = {
            let executions = self.executions.read().map_err(poison_err)?;
            executions
                .values()
                .filter(|execution| matches_filter(execution, filter))
                .cloned()
                .collect()
        };
        matching.sort_by(|a, b| a.id.cmp(&b.id));

        let offset = match &page.token {
            Some(token) => token.parse::<usize>().map_err(|_| {
                Error::storage(format!("invalid page token '{token}'"))
            })?,
            None => 0,
        };
        let size = if page.size == 0 { matching.len() } else { page.size };
        let items: Vec<Execution> = matching.iter().skip(offset).take(size).cloned().collect();
        let consumed = offset + items.len();
        let next_token = (consumed < matching.len()).then(|| consumed.to_string());
        Ok(Page { items, next_token })
    }

    async fn claim_task(
        &self,
        execution_id: &ExecutionId,
        seq: u64,
        retry: u32,
        claimer: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult> {
        let mut claims = self.claims.write().map_err(poison_err)?;
        let key = (execution_id.clone(), seq, retry);
        if let Some(existing) = claims.get(&key) {
            return Ok(ClaimResult::AlreadyClaimed {
                claimer: existing.claimer.clone(),
            });
        }
        claims.insert(
            key,
            ClaimRow {
                claimer: claimer.to_string(),
                claimed_at: now,
            },
        );
        Ok(ClaimResult::Acquired)
    }

    async fn record_heartbeat(
        &self,
        execution_id: &ExecutionId,
        seq: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut heartbeats = self.heartbeats.write().map_err(poison_err)?;
        heartbeats.insert((execution_id.clone(), seq), now);
        Ok(())
    }

    async fn last_heartbeat(
        &self,
        execution_id: &ExecutionId,
        seq: u64,
    ) -> Result<Option<DateTime<Utc>>> {
        let result = {
            let heartbeats = self.heartbeats.read().map_err(poison_err)?;
            heartbeats.get(&(execution_id.clone(), seq)).copied()
        };
        Ok(result)
    }
}

/// In-memory long-tier timer schedule store.
#[derive(Debug, Default)]
pub struct InMemoryTimerStore {
    schedules: RwLock<Vec<TimerScheduleRow>>,
}

impl InMemoryTimerStore {
    /// Creates an empty timer store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of pending schedules.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn pending_count(&self) -> Result<usize> {
        let count = {
            let schedules = self.schedules.read().map_err(poison_err)?;
            schedules.len()
        };
        Ok(count)
    }
}

#[async_trait]
impl TimerStore for InMemoryTimerStore {
    async fn put(&self, schedule: &TimerScheduleRow) -> Result<()> {
        let mut schedules = self.schedules.write().map_err(poison_err)?;
        schedules.push(schedule.clone());
        Ok(())
    }

    async fn delete(&self, schedule_id: &str) -> Result<()> {
        let mut schedules = self.schedules.write().map_err(poison_err)?;
        schedules.retain(|row| row.id != schedule_id);
        Ok(())
    }

    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<TimerScheduleRow>> {
        let mut schedules = self.schedules.write().map_err(poison_err)?;
        let (due, pending): (Vec<_>, Vec<_>) = schedules
            .drain(..)
            .partition(|row| row.due_time <= now);
        *schedules = pending;
        Ok(due)
    }
}

/// In-memory versioned entity store.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    entities: RwLock<HashMap<String, VersionedValue>>,
}

impl InMemoryEntityStore {
    /// Creates an empty entity store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn version_of(entities: &HashMap<String, VersionedValue>, key: &str) -> Option<u64> {
    entities.get(key).map(|entry| entry.version)
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        let result = {
            let entities = self.entities.read().map_err(poison_err)?;
            entities.get(key).cloned()
        };
        Ok(result)
    }

    async fn set(&self, key: &str, value: Value) -> Result<u64> {
        let mut entities = self.entities.write().map_err(poison_err)?;
        let version = version_of(&entities, key).unwrap_or(0) + 1;
        entities.insert(key.to_string(), VersionedValue { value, version });
        Ok(version)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entities = self.entities.write().map_err(poison_err)?;
        entities.remove(key);
        Ok(())
    }

    async fn transact(&self, items: &[TransactItem]) -> Result<TransactResult> {
        let mut entities = self.entities.write().map_err(poison_err)?;

        // Validate every condition before applying any write.
        for item in items {
            let (key, expect_version) = match item {
                TransactItem::Put {
                    key,
                    expect_version,
                    ..
                }
                | TransactItem::Delete {
                    key,
                    expect_version,
                }
                | TransactItem::Check {
                    key,
                    expect_version,
                } => (key, expect_version),
            };
            if version_of(&entities, key) != *expect_version {
                return Ok(TransactResult::Conflict { key: key.clone() });
            }
        }

        for item in items {
            match item {
                TransactItem::Put { key, value, .. } => {
                    let version = version_of(&entities, key).unwrap_or(0) + 1;
                    entities.insert(
                        key.clone(),
                        VersionedValue {
                            value: value.clone(),
                            version,
                        },
                    );
                }
                TransactItem::Delete { key, .. } => {
                    entities.remove(key);
                }
                TransactItem::Check { .. } => {}
            }
        }
        Ok(TransactResult::Committed)
    }
}

/// In-memory bucket (blob) store.
#[derive(Debug, Default)]
pub struct InMemoryBucketStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl InMemoryBucketStore {
    /// Creates an empty bucket store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let result = {
            let blobs = self.blobs.read().map_err(poison_err)?;
            blobs.get(key).cloned()
        };
        Ok(result)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(poison_err)?;
        blobs.insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(poison_err)?;
        blobs.remove(key);
        Ok(())
    }
}

/// In-memory field-match search index.
#[derive(Debug, Default)]
pub struct InMemorySearchStore {
    indexes: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl InMemorySearchStore {
    /// Creates an empty search store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SearchStore for InMemorySearchStore {
    async fn put_document(&self, index: &str, id: &str, document: Value) -> Result<()> {
        let mut indexes = self.indexes.write().map_err(poison_err)?;
        indexes
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), document);
        Ok(())
    }

    async fn query(&self, operation: &SearchOperation) -> Result<Vec<Value>> {
        let indexes = self.indexes.read().map_err(poison_err)?;
        let Some(documents) = indexes.get(&operation.index) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<(String, Value)> = documents
            .iter()
            .filter(|(_, document)| document.get(&operation.field) == Some(&operation.value))
            .map(|(id, document)| (id.clone(), document.clone()))
            .collect();
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(hits.into_iter().map(|(_, document)| document).collect())
    }
}

/// In-memory event journal.
#[derive(Debug, Default)]
pub struct InMemoryJournalStore {
    records: RwLock<HashMap<ExecutionId, Vec<JournalRecord>>>,
}

impl InMemoryJournalStore {
    /// Creates an empty journal store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JournalStore for InMemoryJournalStore {
    async fn append(&self, execution_id: &ExecutionId, events: &[HistoryEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut records = self.records.write().map_err(poison_err)?;
        let entry = records.entry(execution_id.clone()).or_default();
        for event in events {
            entry.push(JournalRecord::new(execution_id.clone(), event.clone()));
        }
        Ok(())
    }

    async fn read(&self, execution_id: &ExecutionId) -> Result<Vec<JournalRecord>> {
        let mut result = {
            let records = self.records.read().map_err(poison_err)?;
            records.get(execution_id).cloned().unwrap_or_default()
        };
        result.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
        Ok(result)
    }
}
