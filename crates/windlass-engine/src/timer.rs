//! Timer service: delayed event delivery and heartbeat monitoring.
//!
//! The service accepts time-based requests and delivers their payloads to
//! the target execution's queue at the due time. Two tiers keep both ends of
//! the latency spectrum cheap:
//!
//! - **Short timers** (at or under the configured threshold) sit in an
//!   in-process delay queue whose visibility delay is the remaining wait.
//! - **Long timers** are persisted as schedule rows and swept by
//!   [`TimerService::tick`]; on fire, the payload is forwarded to the short
//!   tier for delivery.
//!
//! Delivery is at-least-once. Duplicate completions are harmless because the
//! workflow executor deduplicates result events by `seq`-keyed event id.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use ulid::Ulid;

use windlass_core::event::EventPayload;
use windlass_core::{ExecutionId, HistoryEvent};

use crate::error::{Error, Result};
use crate::metrics::{labels, names};
use crate::queue::{ExecutionQueue, WorkflowTask};
use crate::store::{ExecutionStore, TimerPayload, TimerScheduleRow, TimerStore};

/// A time-based request accepted by the timer service.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerRequest {
    /// Deliver `event` to `execution_id` at `due_time`.
    ScheduleEvent {
        /// Target execution.
        execution_id: ExecutionId,
        /// Event to deliver.
        event: HistoryEvent,
        /// When to deliver it.
        due_time: DateTime<Utc>,
    },
    /// Fire a heartbeat check for the task at `seq` at `due_at`.
    HeartbeatMonitor {
        /// Execution owning the task.
        execution_id: ExecutionId,
        /// Sequence of the monitored task.
        seq: u64,
        /// Maximum gap between heartbeats.
        heartbeat_timeout: Duration,
        /// When to run the first check.
        due_at: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct ShortTimer {
    row: TimerScheduleRow,
    from_long_tier: bool,
}

impl PartialEq for ShortTimer {
    fn eq(&self, other: &Self) -> bool {
        self.row.due_time == other.row.due_time && self.row.id == other.row.id
    }
}

impl Eq for ShortTimer {}

impl PartialOrd for ShortTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ShortTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest due time pops
        // first.
        other
            .row
            .due_time
            .cmp(&self.row.due_time)
            .then_with(|| other.row.id.cmp(&self.row.id))
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// Delivers delayed events and heartbeat checks to execution queues.
pub struct TimerService {
    short_threshold: Duration,
    store: Arc<dyn TimerStore>,
    queue: Arc<dyn ExecutionQueue>,
    executions: Arc<dyn ExecutionStore>,
    short: Mutex<BinaryHeap<ShortTimer>>,
    cancelled: Mutex<HashSet<String>>,
}

impl TimerService {
    /// Creates a timer service.
    #[must_use]
    pub fn new(
        short_threshold: Duration,
        store: Arc<dyn TimerStore>,
        queue: Arc<dyn ExecutionQueue>,
        executions: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            short_threshold,
            store,
            queue,
            executions,
            short: Mutex::new(BinaryHeap::new()),
            cancelled: Mutex::new(HashSet::new()),
        }
    }

    /// Accepts a timer request; returns the schedule id for cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule cannot be stored.
    pub async fn start_timer(&self, request: TimerRequest, now: DateTime<Utc>) -> Result<String> {
        let row = match request {
            TimerRequest::ScheduleEvent {
                execution_id,
                event,
                due_time,
            } => TimerScheduleRow {
                id: Ulid::new().to_string(),
                execution_id,
                due_time,
                payload: TimerPayload::Event(event),
            },
            TimerRequest::HeartbeatMonitor {
                execution_id,
                seq,
                heartbeat_timeout,
                due_at,
            } => TimerScheduleRow {
                id: Ulid::new().to_string(),
                execution_id,
                due_time: due_at,
                payload: TimerPayload::HeartbeatMonitor {
                    seq,
                    heartbeat_timeout,
                },
            },
        };
        let id = row.id.clone();

        if row.due_time - now <= self.short_threshold {
            let mut short = self.short.lock().map_err(poison_err)?;
            short.push(ShortTimer {
                row,
                from_long_tier: false,
            });
        } else {
            self.store.put(&row).await?;
        }
        Ok(id)
    }

    /// Convenience for scheduling an event delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule cannot be stored.
    pub async fn schedule_event(
        &self,
        execution_id: ExecutionId,
        event: HistoryEvent,
        due_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<String> {
        self.start_timer(
            TimerRequest::ScheduleEvent {
                execution_id,
                event,
                due_time,
            },
            now,
        )
        .await
    }

    /// Cancels a schedule before it fires. Cancelling an already-fired or
    /// unknown schedule is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule row cannot be deleted.
    pub async fn clear_schedule(&self, schedule_id: &str) -> Result<()> {
        {
            let mut cancelled = self.cancelled.lock().map_err(poison_err)?;
            cancelled.insert(schedule_id.to_string());
        }
        self.store.delete(schedule_id).await
    }

    /// Fires everything due at `now`; returns the number of deliveries.
    ///
    /// Long-tier rows that come due are forwarded into the short tier and
    /// fired in the same tick.
    ///
    /// # Errors
    ///
    /// Returns an error if a store or queue operation fails.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        // Forward due long-tier schedules to the short tier.
        let due_rows = self.store.take_due(now).await?;
        {
            let mut short = self.short.lock().map_err(poison_err)?;
            for row in due_rows {
                short.push(ShortTimer {
                    row,
                    from_long_tier: true,
                });
            }
        }

        let mut fired = 0;
        loop {
            let next = {
                let mut short = self.short.lock().map_err(poison_err)?;
                match short.peek() {
                    Some(timer) if timer.row.due_time <= now => short.pop(),
                    _ => None,
                }
            };
            let Some(timer) = next else {
                break;
            };

            let was_cancelled = {
                let mut cancelled = self.cancelled.lock().map_err(poison_err)?;
                cancelled.remove(&timer.row.id)
            };
            if was_cancelled {
                continue;
            }

            self.fire(timer.row, now).await?;
            let tier = if timer.from_long_tier { "long" } else { "short" };
            counter!(names::TIMER_FIRES_TOTAL, labels::TIER => tier).increment(1);
            fired += 1;
        }
        Ok(fired)
    }

    /// Runs the sweep loop until the task is aborted.
    pub async fn run(self: Arc<Self>, poll_interval: std::time::Duration) {
        loop {
            if let Err(error) = self.tick(Utc::now()).await {
                tracing::warn!(%error, "timer tick failed");
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn fire(&self, row: TimerScheduleRow, now: DateTime<Utc>) -> Result<()> {
        match row.payload {
            TimerPayload::Event(event) => {
                tracing::debug!(
                    execution_id = %row.execution_id,
                    event_type = event.payload.event_type(),
                    "timer fired"
                );
                self.queue
                    .submit(WorkflowTask::single(row.execution_id, event))
                    .await?;
                Ok(())
            }
            TimerPayload::HeartbeatMonitor {
                seq,
                heartbeat_timeout,
            } => {
                self.fire_heartbeat_check(row.execution_id, seq, heartbeat_timeout, now)
                    .await
            }
        }
    }

    /// Checks a task's heartbeat; fails the task if the window lapsed and
    /// re-arms the monitor otherwise.
    async fn fire_heartbeat_check(
        &self,
        execution_id: ExecutionId,
        seq: u64,
        heartbeat_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let last = self.executions.last_heartbeat(&execution_id, seq).await?;
        let deadline = last.map_or(now, |at| at + heartbeat_timeout);
        if last.is_none() || deadline <= now {
            self.queue
                .submit(WorkflowTask::single(
                    execution_id,
                    HistoryEvent::at(now, EventPayload::TaskHeartbeatTimedOut { seq }),
                ))
                .await?;
            return Ok(());
        }

        // Heartbeats arrived inside the window; check again at the next
        // deadline.
        self.start_timer(
            TimerRequest::HeartbeatMonitor {
                execution_id,
                seq,
                heartbeat_timeout,
                due_at: deadline,
            },
            now,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryExecutionQueue;
    use crate::store::memory::{InMemoryExecutionStore, InMemoryTimerStore};

    fn service(
        threshold_secs: i64,
    ) -> (
        Arc<TimerService>,
        Arc<InMemoryExecutionQueue>,
        Arc<InMemoryExecutionStore>,
        Arc<InMemoryTimerStore>,
    ) {
        let queue = Arc::new(InMemoryExecutionQueue::new());
        let executions = Arc::new(InMemoryExecutionStore::new());
        let store = Arc::new(InMemoryTimerStore::new());
        let timer = Arc::new(TimerService::new(
            Duration::seconds(threshold_secs),
            Arc::clone(&store) as Arc<dyn TimerStore>,
            Arc::clone(&queue) as Arc<dyn ExecutionQueue>,
            Arc::clone(&executions) as Arc<dyn ExecutionStore>,
        ));
        (timer, queue, executions, store)
    }

    fn completion(seq: u64) -> HistoryEvent {
        HistoryEvent::new(EventPayload::TimerCompleted { seq })
    }

    #[tokio::test]
    async fn short_timer_fires_through_the_in_process_tier() {
        let (timer, queue, _, store) = service(120);
        let now = Utc::now();
        let execution_id: ExecutionId = "wf/run".parse().unwrap();

        timer
            .schedule_event(
                execution_id.clone(),
                completion(0),
                now + Duration::seconds(30),
                now,
            )
            .await
            .unwrap();
        assert_eq!(store.pending_count().unwrap(), 0);

        // Not due yet.
        assert_eq!(timer.tick(now).await.unwrap(), 0);
        // Due now.
        assert_eq!(
            timer.tick(now + Duration::seconds(30)).await.unwrap(),
            1
        );
        let tasks = queue.receive(10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].events[0].payload.seq(), Some(0));
    }

    #[tokio::test]
    async fn long_timer_goes_through_the_store() {
        let (timer, queue, _, store) = service(60);
        let now = Utc::now();
        let execution_id: ExecutionId = "wf/run".parse().unwrap();

        timer
            .schedule_event(
                execution_id,
                completion(1),
                now + Duration::hours(2),
                now,
            )
            .await
            .unwrap();
        assert_eq!(store.pending_count().unwrap(), 1);

        assert_eq!(timer.tick(now).await.unwrap(), 0);
        assert_eq!(timer.tick(now + Duration::hours(2)).await.unwrap(), 1);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cleared_schedule_never_fires() {
        let (timer, queue, _, _) = service(120);
        let now = Utc::now();
        let execution_id: ExecutionId = "wf/run".parse().unwrap();

        let id = timer
            .schedule_event(
                execution_id,
                completion(0),
                now + Duration::seconds(10),
                now,
            )
            .await
            .unwrap();
        timer.clear_schedule(&id).await.unwrap();

        assert_eq!(timer.tick(now + Duration::minutes(1)).await.unwrap(), 0);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn heartbeat_monitor_fails_a_silent_task() {
        let (timer, queue, _, _) = service(120);
        let now = Utc::now();
        let execution_id: ExecutionId = "wf/run".parse().unwrap();

        timer
            .start_timer(
                TimerRequest::HeartbeatMonitor {
                    execution_id,
                    seq: 2,
                    heartbeat_timeout: Duration::seconds(30),
                    due_at: now + Duration::seconds(30),
                },
                now,
            )
            .await
            .unwrap();

        timer.tick(now + Duration::seconds(30)).await.unwrap();
        let tasks = queue.receive(10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(matches!(
            tasks[0].events[0].payload,
            EventPayload::TaskHeartbeatTimedOut { seq: 2 }
        ));
    }

    #[tokio::test]
    async fn heartbeat_monitor_rearms_while_heartbeats_arrive() {
        let (timer, queue, executions, _) = service(120);
        let now = Utc::now();
        let execution_id: ExecutionId = "wf/run".parse().unwrap();

        executions
            .record_heartbeat(&execution_id, 2, now + Duration::seconds(25))
            .await
            .unwrap();

        timer
            .start_timer(
                TimerRequest::HeartbeatMonitor {
                    execution_id: execution_id.clone(),
                    seq: 2,
                    heartbeat_timeout: Duration::seconds(30),
                    due_at: now + Duration::seconds(30),
                },
                now,
            )
            .await
            .unwrap();

        // First check: heartbeat at +25s keeps the task alive.
        timer.tick(now + Duration::seconds(30)).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);

        // No further heartbeats; the re-armed check at +55s fails the task.
        timer.tick(now + Duration::seconds(55)).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 1);
    }
}
