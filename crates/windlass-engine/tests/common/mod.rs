//! Shared wiring for end-to-end engine tests.
//!
//! Builds a complete engine over the in-memory stores and queues, plus a
//! drain helper that pumps the orchestrator, task worker, transaction
//! executor, and timer until the system is quiescent.

// Not every test binary touches every handle.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use windlass_engine::command_executor::CommandExecutor;
use windlass_engine::dispatch::{InMemoryTaskQueue, InMemoryTransactionQueue, TaskQueue, TransactionQueue};
use windlass_engine::error::Result;
use windlass_engine::orchestrator::Orchestrator;
use windlass_engine::queue::{ExecutionQueue, InMemoryExecutionQueue};
use windlass_engine::registry::Registry;
use windlass_engine::router::{DeadLetterSink, EventRouter, InMemoryDeadLetterSink};
use windlass_engine::service::{EngineClient, EngineService};
use windlass_engine::store::memory::{
    InMemoryBucketStore, InMemoryEntityStore, InMemoryExecutionStore, InMemoryHistoryStore,
    InMemoryJournalStore, InMemorySearchStore, InMemoryTimerStore,
};
use windlass_engine::store::{
    BucketStore, EntityStore, ExecutionStore, HistoryStore, JournalStore, SearchStore, TimerStore,
};
use windlass_engine::timer::TimerService;
use windlass_engine::transaction::TransactionExecutor;
use windlass_engine::worker::TaskWorker;

/// A fully wired engine over in-memory infrastructure.
pub struct TestEngine {
    pub executions: Arc<InMemoryExecutionStore>,
    pub history: Arc<InMemoryHistoryStore>,
    pub journal: Arc<InMemoryJournalStore>,
    pub queue: Arc<InMemoryExecutionQueue>,
    pub tasks: Arc<InMemoryTaskQueue>,
    pub transactions: Arc<InMemoryTransactionQueue>,
    pub entities: Arc<InMemoryEntityStore>,
    pub buckets: Arc<InMemoryBucketStore>,
    pub search: Arc<InMemorySearchStore>,
    pub timer: Arc<TimerService>,
    pub dead_letters: Arc<InMemoryDeadLetterSink>,
    pub service: Arc<EngineService>,
    pub orchestrator: Orchestrator,
    pub worker: TaskWorker,
    pub tx_executor: Arc<TransactionExecutor>,
}

impl TestEngine {
    pub fn new(registry: Registry) -> Self {
        let registry = Arc::new(registry);
        let executions = Arc::new(InMemoryExecutionStore::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let journal = Arc::new(InMemoryJournalStore::new());
        let queue = Arc::new(InMemoryExecutionQueue::new());
        let tasks = Arc::new(InMemoryTaskQueue::default());
        let transactions = Arc::new(InMemoryTransactionQueue::new());
        let entities = Arc::new(InMemoryEntityStore::new());
        let buckets = Arc::new(InMemoryBucketStore::new());
        let search = Arc::new(InMemorySearchStore::new());
        let timer_store = Arc::new(InMemoryTimerStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterSink::new());

        let timer = Arc::new(TimerService::new(
            Duration::seconds(120),
            Arc::clone(&timer_store) as Arc<dyn TimerStore>,
            Arc::clone(&queue) as Arc<dyn ExecutionQueue>,
            Arc::clone(&executions) as Arc<dyn ExecutionStore>,
        ));
        let events = Arc::new(EventRouter::new(
            Arc::clone(&registry),
            Arc::clone(&dead_letters) as Arc<dyn DeadLetterSink>,
            3,
        ));
        let tx_executor = Arc::new(TransactionExecutor::new(
            Arc::clone(&entities) as Arc<dyn EntityStore>,
            Arc::clone(&events),
            Arc::clone(&registry),
        ));
        let service = Arc::new(EngineService::new(
            Arc::clone(&executions) as Arc<dyn ExecutionStore>,
            Arc::clone(&history) as Arc<dyn HistoryStore>,
            Arc::clone(&queue) as Arc<dyn ExecutionQueue>,
            Arc::clone(&events),
            Arc::clone(&tx_executor),
        ));
        let commands = Arc::new(CommandExecutor::new(
            Arc::clone(&queue) as Arc<dyn ExecutionQueue>,
            Arc::clone(&tasks) as Arc<dyn TaskQueue>,
            Arc::clone(&transactions) as Arc<dyn TransactionQueue>,
            Arc::clone(&timer),
            Arc::clone(&events),
            Arc::clone(&service) as Arc<dyn EngineClient>,
            Arc::clone(&entities) as Arc<dyn EntityStore>,
            Arc::clone(&buckets) as Arc<dyn BucketStore>,
            Arc::clone(&search) as Arc<dyn SearchStore>,
        ));
        let orchestrator = Orchestrator::new(
            Arc::clone(&history) as Arc<dyn HistoryStore>,
            Arc::clone(&executions) as Arc<dyn ExecutionStore>,
            Arc::clone(&queue) as Arc<dyn ExecutionQueue>,
            Arc::clone(&journal) as Arc<dyn JournalStore>,
            Arc::clone(&timer),
            commands,
            Arc::clone(&registry),
        );
        let worker = TaskWorker::new(
            Arc::clone(&executions) as Arc<dyn ExecutionStore>,
            Arc::clone(&queue) as Arc<dyn ExecutionQueue>,
            Arc::clone(&timer),
            Arc::clone(&registry),
            Arc::clone(&service) as Arc<dyn EngineClient>,
            "test-worker",
        );

        Self {
            executions,
            history,
            journal,
            queue,
            tasks,
            transactions,
            entities,
            buckets,
            search,
            timer,
            dead_letters,
            service,
            orchestrator,
            worker,
            tx_executor,
        }
    }

    /// Pumps every component until nothing makes progress.
    ///
    /// Timers are swept at `now`; pass a future instant to fast-forward.
    pub async fn drain_at(&self, now: DateTime<Utc>) -> Result<()> {
        for _ in 0..64 {
            let mut progressed = false;

            if self.queue.depth().await? > 0 {
                self.orchestrator.run_once(16).await?;
                progressed = true;
            }
            while self.worker.poll_once(&*self.tasks).await? {
                progressed = true;
            }
            while let Some(envelope) = self.transactions.dequeue().await? {
                self.tx_executor
                    .run_envelope(envelope, &*self.queue)
                    .await?;
                progressed = true;
            }
            if self.timer.tick(now).await? > 0 {
                progressed = true;
            }

            if !progressed {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Pumps every component until quiescent, sweeping timers at the
    /// current wall clock.
    pub async fn drain(&self) -> Result<()> {
        self.drain_at(Utc::now()).await
    }
}
