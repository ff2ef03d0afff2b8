//! The engine service API.
//!
//! [`EngineService`] is the abstract RPC surface callers (and the engine's
//! own components) use to start and inspect executions, deliver signals and
//! events, and complete asynchronous tasks. Transport bindings live outside
//! the core; everything here is encoding-agnostic.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use metrics::counter;
use serde_json::Value;

use windlass_core::event::{EmittedEvent, EventPayload};
use windlass_core::execution::ParentRef;
use windlass_core::hash::input_hash;
use windlass_core::{
    Execution, ExecutionId, ExecutionName, HistoryEvent, SignalId, TaskToken, WorkflowName,
};

use crate::error::{Error, Result};
use crate::metrics::{labels, names};
use crate::queue::{ExecutionQueue, WorkflowTask};
use crate::router::{EventRouter, SignalRouter};
use crate::store::{ExecutionFilter, ExecutionStore, HistoryStore, Page, PageRequest, PutResult};
use crate::transaction::{TransactionExecutor, TransactionOutcome};

/// Request to start (or idempotently re-start) an execution.
#[derive(Debug, Clone)]
pub struct StartExecutionRequest {
    /// Workflow to run.
    pub workflow: WorkflowName,
    /// Execution name; generated when absent.
    pub execution_name: Option<ExecutionName>,
    /// Workflow input.
    pub input: Value,
    /// Workflow-level timeout, relative to the start time.
    pub timeout: Option<Duration>,
    /// Reference to the spawning execution, for child workflows.
    pub parent: Option<ParentRef>,
}

/// Response to [`StartExecutionRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartExecutionResponse {
    /// The execution's id.
    pub execution_id: ExecutionId,
    /// True when an execution with the same name and input already existed.
    pub already_running: bool,
}

/// Request to list executions.
#[derive(Debug, Clone, Default)]
pub struct ListExecutionsRequest {
    /// Filters to apply.
    pub filter: ExecutionFilter,
    /// Page to fetch.
    pub page: PageRequest,
}

/// Response to a heartbeat report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// True when the execution already reached a terminal status and the
    /// task should stop working.
    pub cancelled: bool,
}

/// The result of a directly executed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteTransactionResponse {
    /// True when the transaction committed.
    pub succeeded: bool,
    /// Transaction output, on success.
    pub output: Option<Value>,
    /// Stable error identifier, on failure.
    pub error: Option<String>,
    /// Human-readable failure description, on failure.
    pub reason: Option<String>,
}

/// The slice of the service the engine's own components call back into:
/// starting executions (child workflows), sending signals, emitting events.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Starts an execution idempotently.
    async fn start_execution(&self, request: StartExecutionRequest)
    -> Result<StartExecutionResponse>;

    /// Sends a signal to an execution.
    async fn send_signal(
        &self,
        execution_id: ExecutionId,
        signal_id: SignalId,
        payload: Value,
        id: Option<String>,
    ) -> Result<()>;

    /// Emits events to subscribers.
    async fn emit_events(&self, events: Vec<EmittedEvent>) -> Result<()>;
}

/// The engine service.
pub struct EngineService {
    executions: Arc<dyn ExecutionStore>,
    history: Arc<dyn HistoryStore>,
    queue: Arc<dyn ExecutionQueue>,
    signals: SignalRouter,
    events: Arc<EventRouter>,
    transactions: Arc<TransactionExecutor>,
}

impl EngineService {
    /// Creates the service over its stores and routers.
    #[must_use]
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        history: Arc<dyn HistoryStore>,
        queue: Arc<dyn ExecutionQueue>,
        events: Arc<EventRouter>,
        transactions: Arc<TransactionExecutor>,
    ) -> Self {
        let signals = SignalRouter::new(Arc::clone(&queue));
        Self {
            executions,
            history,
            queue,
            signals,
            events,
            transactions,
        }
    }

    /// Gets an execution's metadata record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn get_execution(&self, execution_id: &ExecutionId) -> Result<Option<Execution>> {
        self.executions.get(execution_id).await
    }

    /// Lists executions with optional status and workflow filters.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn list_executions(
        &self,
        request: ListExecutionsRequest,
    ) -> Result<Page<Execution>> {
        self.executions.list(&request.filter, &request.page).await
    }

    /// Reads a page of an execution's history.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is unknown or the read fails.
    pub async fn get_execution_history(
        &self,
        execution_id: &ExecutionId,
        page: &PageRequest,
    ) -> Result<Page<HistoryEvent>> {
        if self.executions.get(execution_id).await?.is_none() {
            return Err(Error::ExecutionNotFound {
                execution_id: execution_id.clone(),
            });
        }
        let events = self.history.read(execution_id).await?;

        let offset = match &page.token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| Error::storage(format!("invalid page token '{token}'")))?,
            None => 0,
        };
        let size = if page.size == 0 { events.len() } else { page.size };
        let items: Vec<HistoryEvent> = events.iter().skip(offset).take(size).cloned().collect();
        let consumed = offset + items.len();
        let next_token = (consumed < events.len()).then(|| consumed.to_string());
        Ok(Page { items, next_token })
    }

    /// Reports an out-of-band task success.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is invalid or the submission fails.
    #[tracing::instrument(skip(self, result))]
    pub async fn send_task_success(&self, task_token: &str, result: Value) -> Result<()> {
        let token = TaskToken::decode(task_token)?;
        self.queue
            .submit(WorkflowTask::single(
                token.execution_id,
                HistoryEvent::new(EventPayload::TaskSucceeded {
                    seq: token.seq,
                    result,
                }),
            ))
            .await?;
        Ok(())
    }

    /// Reports an out-of-band task failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is invalid or the submission fails.
    #[tracing::instrument(skip(self))]
    pub async fn send_task_failure(
        &self,
        task_token: &str,
        error: impl Into<String> + std::fmt::Debug,
        message: impl Into<String> + std::fmt::Debug,
    ) -> Result<()> {
        let token = TaskToken::decode(task_token)?;
        self.queue
            .submit(WorkflowTask::single(
                token.execution_id,
                HistoryEvent::new(EventPayload::TaskFailed {
                    seq: token.seq,
                    error: error.into(),
                    message: message.into(),
                }),
            ))
            .await?;
        Ok(())
    }

    /// Records a task heartbeat and reports whether the execution has been
    /// cancelled out from under the task.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is invalid or the store write fails.
    pub async fn send_task_heartbeat(&self, task_token: &str) -> Result<HeartbeatResponse> {
        let token = TaskToken::decode(task_token)?;
        self.executions
            .record_heartbeat(&token.execution_id, token.seq, Utc::now())
            .await?;
        let cancelled = self
            .executions
            .get(&token.execution_id)
            .await?
            .is_some_and(|execution| execution.is_terminal());
        Ok(HeartbeatResponse { cancelled })
    }

    /// Executes a transaction directly (outside any workflow).
    pub async fn execute_transaction(
        &self,
        transaction: &str,
        input: Value,
    ) -> ExecuteTransactionResponse {
        match self.transactions.execute(transaction, input).await {
            TransactionOutcome::Succeeded(output) => ExecuteTransactionResponse {
                succeeded: true,
                output: Some(output),
                error: None,
                reason: None,
            },
            TransactionOutcome::Failed(failure) => ExecuteTransactionResponse {
                succeeded: false,
                output: None,
                error: Some(failure.error),
                reason: Some(failure.message),
            },
        }
    }
}

#[async_trait]
impl EngineClient for EngineService {
    /// Starts an execution.
    ///
    /// Idempotency: the same `(workflow, executionName, inputHash)` returns
    /// `already_running = true`; a name collision with a different input
    /// hash is a conflict error.
    #[tracing::instrument(skip(self, request), fields(workflow = %request.workflow, execution_id = tracing::field::Empty))]
    async fn start_execution(
        &self,
        request: StartExecutionRequest,
    ) -> Result<StartExecutionResponse> {
        let name = request
            .execution_name
            .unwrap_or_else(ExecutionName::generate);
        let execution_id = ExecutionId::new(request.workflow.clone(), name);
        tracing::Span::current().record("execution_id", tracing::field::display(&execution_id));

        let hash = input_hash(&request.input)?;
        if let Some(existing) = self.executions.get(&execution_id).await? {
            return Self::reconcile_existing(&existing, &hash, execution_id);
        }

        let start_time = Utc::now();
        let execution = Execution::new(
            execution_id.clone(),
            request.input.clone(),
            hash.clone(),
            start_time,
            request.parent.clone(),
        );
        if self.executions.create(&execution).await? == PutResult::AlreadyExists {
            // Lost a creation race; fall back to the idempotency check.
            let existing = self.executions.get(&execution_id).await?.ok_or_else(|| {
                Error::storage("execution vanished after a failed conditional create")
            })?;
            return Self::reconcile_existing(&existing, &hash, execution_id);
        }

        let started = HistoryEvent::at(
            start_time,
            EventPayload::WorkflowStarted {
                id: EventPayload::fresh_id(),
                workflow_name: request.workflow,
                input: request.input,
                timeout_time: request.timeout.map(|timeout| start_time + timeout),
                parent: request.parent.clone(),
            },
        );
        self.history.append(&execution_id, std::slice::from_ref(&started)).await?;
        self.queue
            .submit(WorkflowTask::single(execution_id.clone(), started))
            .await?;

        let source = if request.parent.is_some() { "child" } else { "caller" };
        counter!(names::EXECUTIONS_STARTED_TOTAL, labels::SOURCE => source).increment(1);

        Ok(StartExecutionResponse {
            execution_id,
            already_running: false,
        })
    }

    async fn send_signal(
        &self,
        execution_id: ExecutionId,
        signal_id: SignalId,
        payload: Value,
        id: Option<String>,
    ) -> Result<()> {
        self.signals.send(execution_id, signal_id, payload, id).await
    }

    async fn emit_events(&self, events: Vec<EmittedEvent>) -> Result<()> {
        self.events.emit(&events).await
    }
}

impl EngineService {
    fn reconcile_existing(
        existing: &Execution,
        hash: &str,
        execution_id: ExecutionId,
    ) -> Result<StartExecutionResponse> {
        if existing.input_hash == hash {
            Ok(StartExecutionResponse {
                execution_id,
                already_running: true,
            })
        } else {
            Err(Error::ExecutionConflict { execution_id })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryExecutionQueue;
    use crate::registry::Registry;
    use crate::router::InMemoryDeadLetterSink;
    use crate::store::memory::{
        InMemoryEntityStore, InMemoryExecutionStore, InMemoryHistoryStore,
    };
    use serde_json::json;

    fn service() -> (EngineService, Arc<InMemoryExecutionQueue>) {
        let executions = Arc::new(InMemoryExecutionStore::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let queue = Arc::new(InMemoryExecutionQueue::new());
        let registry = Arc::new(Registry::new());
        let events = Arc::new(EventRouter::new(
            Arc::clone(&registry),
            Arc::new(InMemoryDeadLetterSink::new()),
            1,
        ));
        let transactions = Arc::new(TransactionExecutor::new(
            Arc::new(InMemoryEntityStore::new()),
            Arc::clone(&events),
            registry,
        ));
        (
            EngineService::new(
                executions,
                history,
                Arc::clone(&queue) as Arc<dyn ExecutionQueue>,
                events,
                transactions,
            ),
            queue,
        )
    }

    fn start_request(name: &str, input: Value) -> StartExecutionRequest {
        StartExecutionRequest {
            workflow: WorkflowName::new("order-fulfillment").unwrap(),
            execution_name: Some(ExecutionName::new(name).unwrap()),
            input,
            timeout: None,
            parent: None,
        }
    }

    #[tokio::test]
    async fn start_seeds_history_and_enqueues_first_task() {
        let (service, queue) = service();
        let response = service
            .start_execution(start_request("order-1", json!({"n": 1})))
            .await
            .unwrap();
        assert!(!response.already_running);

        let record = service
            .get_execution(&response.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, windlass_core::ExecutionStatus::InProgress);

        let tasks = queue.receive(10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(matches!(
            tasks[0].events[0].payload,
            EventPayload::WorkflowStarted { .. }
        ));
    }

    #[tokio::test]
    async fn same_name_same_input_is_already_running() {
        let (service, _) = service();
        service
            .start_execution(start_request("order-1", json!({"n": 1})))
            .await
            .unwrap();
        let second = service
            .start_execution(start_request("order-1", json!({"n": 1})))
            .await
            .unwrap();
        assert!(second.already_running);
    }

    #[tokio::test]
    async fn same_name_different_input_conflicts() {
        let (service, _) = service();
        service
            .start_execution(start_request("order-1", json!({"n": 1})))
            .await
            .unwrap();
        let conflict = service
            .start_execution(start_request("order-1", json!({"n": 2})))
            .await;
        assert!(matches!(conflict, Err(Error::ExecutionConflict { .. })));
    }

    #[tokio::test]
    async fn task_callbacks_route_through_the_token() {
        let (service, queue) = service();
        let execution_id: ExecutionId = "order-fulfillment/order-1".parse().unwrap();
        let token = TaskToken::new(execution_id.clone(), 4).encode().unwrap();

        service
            .send_task_success(&token, json!("done"))
            .await
            .unwrap();

        let tasks = queue.receive(10).await.unwrap();
        assert!(matches!(
            tasks[0].events[0].payload,
            EventPayload::TaskSucceeded { seq: 4, .. }
        ));
    }

    #[tokio::test]
    async fn history_pages_walk_the_log() {
        let (service, _) = service();
        let response = service
            .start_execution(start_request("order-1", json!(1)))
            .await
            .unwrap();

        let page = service
            .get_execution_history(&response.execution_id, &PageRequest::first(10))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.next_token.is_none());
    }
}
