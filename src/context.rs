//! Per-transaction execution context
//!
//! Every operation belonging to one transaction id runs on the same dedicated
//! worker task: callers hand a command off through a single-consumer channel
//! and block on a oneshot reply, which gives strict per-transaction ordering
//! without any global lock. Transactions on different ids proceed fully in
//! parallel. The worker self-terminates, removing its entry from the
//! participant's live-context map, when the transaction reaches a terminal
//! status or when begin itself fails.

use crate::error::{Result, TransactionError};
use crate::lock::TransactionLock;
use crate::log::{TransactionLog, TransactionLogEntry};
use crate::provider::{ResourceTransactionProvider, TransactionOperationExecutor};
use crate::status::TransactionStatus;
use crate::transaction_id::TransactionId;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Live contexts of one participant, guarded by a short-held mutex around map
/// access only, never around unit-of-work execution.
pub(crate) type ContextMap = Arc<Mutex<HashMap<TransactionId, Arc<ExecutionContext>>>>;

pub(crate) enum ContextCommand {
    Begin,
    Execute {
        session_token: String,
        operation: String,
        arguments: Vec<Value>,
    },
    Prepare,
    Commit,
    Rollback,
}

struct ContextJob {
    command: ContextCommand,
    reply: oneshot::Sender<Result<Value>>,
}

/// Caller-facing half of an execution context.
pub(crate) struct ExecutionContext {
    pub txn_id: TransactionId,
    pub session_token: Option<String>,
    pub lock: TransactionLock,
    status: Arc<Mutex<TransactionStatus>>,
    jobs: mpsc::UnboundedSender<ContextJob>,
}

impl ExecutionContext {
    pub(crate) fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    /// Hand a command to the dedicated worker and block until it completes.
    /// Callers must hold the context's `TransactionLock`, which is what
    /// rejects a second concurrent operation for the same id.
    pub(crate) async fn submit(&self, command: ContextCommand) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.jobs
            .send(ContextJob {
                command,
                reply: reply_tx,
            })
            .map_err(|_| TransactionError::ContextClosed(self.txn_id))?;
        reply_rx
            .await
            .map_err(|_| TransactionError::ContextClosed(self.txn_id))?
    }
}

/// Worker-owned half: current status plus the opaque resource-transaction
/// handle. Recovered contexts carry no handle; the provider finishes those by
/// id.
pub(crate) struct WorkerState<P: ResourceTransactionProvider> {
    txn_id: TransactionId,
    participant_id: String,
    status: Arc<Mutex<TransactionStatus>>,
    two_phase: bool,
    handle: Option<P::Handle>,
    provider: Arc<P>,
    executor: Arc<dyn TransactionOperationExecutor>,
    log: Arc<dyn TransactionLog>,
    contexts: ContextMap,
}

/// Spawn the dedicated worker for one transaction. The returned context must
/// be inserted into the participant's live-context map by the caller (which
/// holds the map lock and has already checked capacity).
pub(crate) fn spawn_context<P: ResourceTransactionProvider>(
    txn_id: TransactionId,
    session_token: Option<String>,
    two_phase: bool,
    initial_status: TransactionStatus,
    participant_id: String,
    provider: Arc<P>,
    executor: Arc<dyn TransactionOperationExecutor>,
    log: Arc<dyn TransactionLog>,
    contexts: ContextMap,
) -> Arc<ExecutionContext> {
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let status = Arc::new(Mutex::new(initial_status));

    let state = WorkerState {
        txn_id,
        participant_id,
        status: status.clone(),
        two_phase,
        handle: None,
        provider,
        executor,
        log,
        contexts,
    };
    tokio::spawn(run_worker(state, jobs_rx));

    Arc::new(ExecutionContext {
        txn_id,
        session_token,
        lock: TransactionLock::new(txn_id),
        status,
        jobs: jobs_tx,
    })
}

async fn run_worker<P: ResourceTransactionProvider>(
    mut state: WorkerState<P>,
    mut jobs: mpsc::UnboundedReceiver<ContextJob>,
) {
    while let Some(job) = jobs.recv().await {
        let (result, done) = state.handle(job.command).await;
        if done {
            // Remove before replying so no live context remains once the
            // caller observes completion.
            state.contexts.lock().remove(&state.txn_id);
        }
        let _ = job.reply.send(result);
        if done {
            return;
        }
    }
}

impl<P: ResourceTransactionProvider> WorkerState<P> {
    async fn handle(&mut self, command: ContextCommand) -> (Result<Value>, bool) {
        match command {
            ContextCommand::Begin => match self.begin().await {
                Ok(()) => (Ok(Value::Null), false),
                // A failed begin tears the context down.
                Err(e) => (Err(e), true),
            },
            ContextCommand::Execute {
                session_token,
                operation,
                arguments,
            } => (self.execute(&session_token, &operation, &arguments).await, false),
            ContextCommand::Prepare => (self.prepare().await.map(|_| Value::Null), false),
            ContextCommand::Commit => match self.commit().await {
                Ok(()) => (Ok(Value::Null), true),
                // Kept alive so the coordinator can retry during recovery.
                Err(e) => (Err(e), false),
            },
            ContextCommand::Rollback => match self.rollback().await {
                Ok(()) => (Ok(Value::Null), true),
                Err(e) => (Err(e), false),
            },
        }
    }

    fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    /// Durably log the transition, then advance the in-memory status. A log
    /// failure leaves the in-memory status untouched and aborts the caller.
    fn set_status(&mut self, status: TransactionStatus) -> Result<()> {
        self.log.log_status(TransactionLogEntry::new(
            self.txn_id,
            status,
            self.two_phase,
        ))?;
        *self.status.lock() = status;
        Ok(())
    }

    fn expect_status(&self, expected: &[TransactionStatus]) -> Result<()> {
        let actual = self.status();
        if expected.contains(&actual) {
            return Ok(());
        }
        Err(TransactionError::UnexpectedStatus {
            id: self.txn_id,
            actual,
            expected: expected.to_vec(),
        })
    }

    async fn begin(&mut self) -> Result<()> {
        self.expect_status(&[TransactionStatus::New])?;
        self.set_status(TransactionStatus::BeginStarted)?;

        tracing::info!(
            "[{}] Begin transaction '{}' started",
            self.participant_id,
            self.txn_id
        );

        let handle = self.provider.begin(self.txn_id).await?;
        self.handle = Some(handle);

        if let Err(e) = self.set_status(TransactionStatus::BeginFinished) {
            // The transition could not be made durable: abort instead of
            // carrying an unlogged resource transaction.
            if let Some(handle) = self.handle.take() {
                let _ = self.provider.rollback(self.txn_id, Some(handle)).await;
            }
            return Err(e);
        }

        tracing::info!(
            "[{}] Begin transaction '{}' finished successfully",
            self.participant_id,
            self.txn_id
        );
        Ok(())
    }

    async fn execute(
        &mut self,
        session_token: &str,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value> {
        self.expect_status(&[TransactionStatus::BeginFinished])?;

        tracing::info!(
            "[{}] Transaction '{}' execute operation '{}' started",
            self.participant_id,
            self.txn_id,
            operation
        );

        // A failing operation does not alter the transaction's lifecycle
        // status; the caller decides whether to keep working or roll back.
        let result = match self.executor.execute(session_token, operation, arguments).await {
            Ok(result) => result,
            Err(e @ TransactionError::OperationFailed { .. }) => return Err(e),
            Err(e) => {
                return Err(TransactionError::OperationFailed {
                    operation: operation.to_string(),
                    message: e.to_string(),
                });
            }
        };

        tracing::info!(
            "[{}] Transaction '{}' execute operation '{}' finished successfully",
            self.participant_id,
            self.txn_id,
            operation
        );
        Ok(result)
    }

    async fn prepare(&mut self) -> Result<()> {
        self.expect_status(&[TransactionStatus::BeginFinished])?;

        if !self.two_phase {
            return Err(TransactionError::PrepareNotAllowed(self.txn_id));
        }

        tracing::info!(
            "[{}] Prepare transaction '{}' started",
            self.participant_id,
            self.txn_id
        );

        self.set_status(TransactionStatus::PrepareStarted)?;
        self.provider
            .prepare(self.txn_id, self.handle.as_ref())
            .await?;
        self.set_status(TransactionStatus::PrepareFinished)?;

        tracing::info!(
            "[{}] Prepare transaction '{}' finished successfully",
            self.participant_id,
            self.txn_id
        );
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.expect_status(&[
            TransactionStatus::New,
            TransactionStatus::PrepareFinished,
            TransactionStatus::CommitStarted,
        ])?;

        tracing::info!(
            "[{}] Commit transaction '{}' started",
            self.participant_id,
            self.txn_id
        );

        if self.status() != TransactionStatus::New {
            // CommitStarted means a previous attempt crashed between the log
            // write and the provider call; re-logging it is skipped.
            if self.status() == TransactionStatus::PrepareFinished {
                self.set_status(TransactionStatus::CommitStarted)?;
            }
            self.provider.commit(self.txn_id, self.handle.take()).await?;
            self.set_status(TransactionStatus::CommitFinished)?;
        }

        tracing::info!(
            "[{}] Commit transaction '{}' finished successfully",
            self.participant_id,
            self.txn_id
        );
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.status() == TransactionStatus::RollbackFinished {
            tracing::info!(
                "[{}] Transaction '{}' has been already rolled back before",
                self.participant_id,
                self.txn_id
            );
            return Ok(());
        }

        self.expect_status(&[
            TransactionStatus::New,
            TransactionStatus::BeginStarted,
            TransactionStatus::BeginFinished,
            TransactionStatus::PrepareStarted,
            TransactionStatus::PrepareFinished,
            TransactionStatus::CommitStarted,
            TransactionStatus::RollbackStarted,
        ])?;

        tracing::info!(
            "[{}] Rollback transaction '{}' started",
            self.participant_id,
            self.txn_id
        );

        if self.status() != TransactionStatus::New {
            if self.status() != TransactionStatus::RollbackStarted {
                self.set_status(TransactionStatus::RollbackStarted)?;
            }
            self.provider
                .rollback(self.txn_id, self.handle.take())
                .await?;
            self.set_status(TransactionStatus::RollbackFinished)?;
        }

        tracing::info!(
            "[{}] Rollback transaction '{}' finished successfully",
            self.participant_id,
            self.txn_id
        );
        Ok(())
    }
}
