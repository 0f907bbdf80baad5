//! Transaction participant
//!
//! A participant owns one resource's transaction lifecycle: it validates the
//! caller's credentials, routes each call onto the per-transaction execution
//! context, delegates the underlying begin/prepare/commit/rollback to the
//! injected resource-transaction provider and business calls to the injected
//! operation executor, and persists every status transition to its own
//! durable log.

use crate::config::ParticipantConfig;
use crate::context::{ContextCommand, ContextMap, ExecutionContext, spawn_context};
use crate::error::{Result, TransactionError};
use crate::log::TransactionLog;
use crate::provider::{
    ResourceTransactionProvider, SessionTokenValidator, TransactionOperationExecutor,
};
use crate::status::TransactionStatus;
use crate::transaction_id::TransactionId;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// The remote-call seam between the coordinator and a participant. The
/// surrounding system decides how these calls travel; in-process the concrete
/// [`TransactionParticipant`] is used directly.
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    fn participant_id(&self) -> &str;

    async fn begin_transaction(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: Option<&str>,
    ) -> Result<()>;

    async fn execute_operation(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        operation: &str,
        arguments: Vec<Value>,
    ) -> Result<Value>;

    async fn prepare_transaction(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()>;

    async fn commit_transaction(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()>;

    /// Coordinator-key-only overload used during recovery.
    async fn commit_recovered_transaction(
        &self,
        id: TransactionId,
        coordinator_key: &str,
    ) -> Result<()>;

    async fn rollback_transaction(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()>;

    /// Coordinator-key-only overload used during recovery.
    async fn rollback_recovered_transaction(
        &self,
        id: TransactionId,
        coordinator_key: &str,
    ) -> Result<()>;

    /// Ids of all transactions this participant still considers in doubt:
    /// durably PREPARE_FINISHED, or COMMIT_STARTED after a crash mid-commit.
    async fn get_transactions(&self, coordinator_key: &str) -> Result<Vec<TransactionId>>;
}

pub struct TransactionParticipant<P: ResourceTransactionProvider> {
    config: ParticipantConfig,
    validator: Arc<dyn SessionTokenValidator>,
    provider: Arc<P>,
    executor: Arc<dyn TransactionOperationExecutor>,
    log: Arc<dyn TransactionLog>,
    contexts: ContextMap,
}

impl<P: ResourceTransactionProvider> TransactionParticipant<P> {
    pub fn new(
        config: ParticipantConfig,
        validator: Arc<dyn SessionTokenValidator>,
        provider: Arc<P>,
        executor: Arc<dyn TransactionOperationExecutor>,
        log: Arc<dyn TransactionLog>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            validator,
            provider,
            executor,
            log,
            contexts: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn participant_id(&self) -> &str {
        &self.config.participant_id
    }

    /// Whether an execution context is currently live for `id`.
    pub fn is_running(&self, id: TransactionId) -> bool {
        self.contexts.lock().contains_key(&id)
    }

    /// Rebuild execution contexts from the durable log at startup. Recovered
    /// contexts carry no resource handle and are backdated so the stale sweep
    /// can act on them immediately; terminal and NEW entries need no
    /// recovery.
    pub fn recover_from_log(&self) {
        tracing::info!(
            "[{}] Started recovering transactions from the transaction log",
            self.participant_id()
        );

        for (id, entry) in self.log.last_entries() {
            if entry.status == TransactionStatus::New || entry.status.is_terminal() {
                tracing::info!(
                    "[{}] Nothing to recover for transaction '{}' with last status '{}'",
                    self.participant_id(),
                    id,
                    entry.status
                );
                continue;
            }

            match self.create_context(id, None, entry.two_phase, entry.status) {
                Ok(context) => {
                    context
                        .lock
                        .set_last_accessed(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
                    tracing::info!(
                        "[{}] Recovered transaction '{}' with last status '{}'",
                        self.participant_id(),
                        id,
                        entry.status
                    );
                }
                Err(TransactionError::TransactionAlreadyExists(_)) => {}
                Err(e) => {
                    tracing::warn!(
                        "[{}] Recovering transaction '{}' with last status '{}' has failed: {}",
                        self.participant_id(),
                        id,
                        entry.status,
                        e
                    );
                }
            }
        }

        tracing::info!(
            "[{}] Finished recovering transactions from the transaction log",
            self.participant_id()
        );
    }

    /// Begin a transaction. With a coordinator key it joins the two-phase
    /// protocol; without one it is single-phase and cannot be prepared, and
    /// since commit requires a prior prepare it can only end in rollback
    /// (or the timeout sweep).
    pub async fn begin_transaction(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: Option<&str>,
    ) -> Result<()> {
        self.check_session_token(session_token)?;
        self.check_interactive_session_key(interactive_session_key)?;
        if let Some(key) = coordinator_key {
            self.check_coordinator_key(key)?;
        }

        let context = self.create_context(
            id,
            Some(session_token.to_string()),
            coordinator_key.is_some(),
            TransactionStatus::New,
        )?;

        context
            .lock
            .run_or_fail(async { context.submit(ContextCommand::Begin).await.map(|_| ()) })
            .await
    }

    pub async fn execute_operation(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        operation: &str,
        arguments: Vec<Value>,
    ) -> Result<Value> {
        self.check_session_token(session_token)?;
        self.check_interactive_session_key(interactive_session_key)?;

        let context = self.get_context(id)?;
        context
            .lock
            .run_or_fail(async {
                self.check_transaction_access(&context, session_token)?;
                context
                    .submit(ContextCommand::Execute {
                        session_token: session_token.to_string(),
                        operation: operation.to_string(),
                        arguments,
                    })
                    .await
            })
            .await
    }

    pub async fn prepare_transaction(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()> {
        self.check_session_token(session_token)?;
        self.check_interactive_session_key(interactive_session_key)?;
        self.check_coordinator_key(coordinator_key)?;

        let context = self.get_context(id)?;
        context
            .lock
            .run_or_fail(async {
                self.check_transaction_access(&context, session_token)?;
                context.submit(ContextCommand::Prepare).await.map(|_| ())
            })
            .await
    }

    pub async fn commit_transaction(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        self.check_session_token(session_token)?;
        self.check_interactive_session_key(interactive_session_key)?;

        let context = self.get_context(id)?;
        context
            .lock
            .run_or_fail(async {
                self.check_transaction_access(&context, session_token)?;
                context.submit(ContextCommand::Commit).await.map(|_| ())
            })
            .await
    }

    pub async fn commit_recovered_transaction(
        &self,
        id: TransactionId,
        coordinator_key: &str,
    ) -> Result<()> {
        self.check_coordinator_key(coordinator_key)?;

        let context = self.get_context(id)?;
        context
            .lock
            .run_or_wait(self.config.transaction_timeout(), async {
                context.submit(ContextCommand::Commit).await.map(|_| ())
            })
            .await
    }

    pub async fn rollback_transaction(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        self.check_session_token(session_token)?;
        self.check_interactive_session_key(interactive_session_key)?;

        // Rolling back a transaction this participant does not know is a
        // no-op, not an error.
        let Some(context) = self.find_context(id) else {
            return Ok(());
        };
        context
            .lock
            .run_or_fail(async {
                self.check_transaction_access(&context, session_token)?;
                context.submit(ContextCommand::Rollback).await.map(|_| ())
            })
            .await
    }

    pub async fn rollback_recovered_transaction(
        &self,
        id: TransactionId,
        coordinator_key: &str,
    ) -> Result<()> {
        self.check_coordinator_key(coordinator_key)?;

        let Some(context) = self.find_context(id) else {
            return Ok(());
        };
        context
            .lock
            .run_or_wait(self.config.transaction_timeout(), async {
                context.submit(ContextCommand::Rollback).await.map(|_| ())
            })
            .await
    }

    pub fn get_transactions(&self, coordinator_key: &str) -> Result<Vec<TransactionId>> {
        self.check_coordinator_key(coordinator_key)?;

        let in_doubt = self
            .log
            .last_entries()
            .into_iter()
            .filter(|(_, entry)| {
                entry.two_phase
                    && matches!(
                        entry.status,
                        TransactionStatus::PrepareFinished | TransactionStatus::CommitStarted
                    )
            })
            .map(|(id, _)| id)
            .collect();
        Ok(in_doubt)
    }

    /// Skip-locked sweep over live contexts: finish interrupted transitions,
    /// roll back transactions idle past the configured timeout, and leave
    /// PREPARE_FINISHED ones for the coordinator to decide.
    pub async fn finish_stale_transactions(&self) {
        tracing::info!(
            "[{}] Started processing of failed or abandoned transactions",
            self.participant_id()
        );

        let contexts: Vec<Arc<ExecutionContext>> =
            self.contexts.lock().values().cloned().collect();

        for context in contexts {
            let id = context.txn_id;
            // Evaluated before taking the lock, which refreshes the
            // last-accessed stamp on acquisition.
            let last_accessed = context.lock.last_accessed();
            let timed_out = context
                .lock
                .is_idle_longer_than(self.config.transaction_timeout());
            let result = context
                .lock
                .run_or_skip(async {
                    match context.status() {
                        TransactionStatus::BeginStarted
                        | TransactionStatus::PrepareStarted
                        | TransactionStatus::RollbackStarted => {
                            // An interrupted transition; the lock being free
                            // means nobody is finishing it.
                            context.submit(ContextCommand::Rollback).await.map(|_| ())
                        }
                        TransactionStatus::New | TransactionStatus::BeginFinished => {
                            if timed_out {
                                tracing::info!(
                                    "[{}] Transaction '{}' has timed out, last accessed at '{}'",
                                    self.participant_id(),
                                    id,
                                    last_accessed
                                );
                                context.submit(ContextCommand::Rollback).await.map(|_| ())
                            } else {
                                Ok(())
                            }
                        }
                        TransactionStatus::CommitStarted => {
                            context.submit(ContextCommand::Commit).await.map(|_| ())
                        }
                        // Wait for the coordinator to decide.
                        TransactionStatus::PrepareFinished => Ok(()),
                        TransactionStatus::CommitFinished
                        | TransactionStatus::RollbackFinished => Ok(()),
                    }
                })
                .await;

            if let Err(e) = result {
                tracing::warn!(
                    "[{}] Finishing failed or abandoned transaction '{}' has failed: {}",
                    self.participant_id(),
                    id,
                    e
                );
            }
        }

        tracing::info!(
            "[{}] Finished processing of failed or abandoned transactions",
            self.participant_id()
        );
    }

    fn create_context(
        &self,
        id: TransactionId,
        session_token: Option<String>,
        two_phase: bool,
        initial_status: TransactionStatus,
    ) -> Result<Arc<ExecutionContext>> {
        let mut contexts = self.contexts.lock();

        if contexts.contains_key(&id) {
            return Err(TransactionError::TransactionAlreadyExists(id));
        }
        if contexts.len() >= self.config.transaction_limit {
            return Err(TransactionError::TransactionLimitReached {
                id,
                limit: self.config.transaction_limit,
            });
        }
        if let Some(token) = &session_token
            && let Some(existing) = contexts
                .values()
                .find(|c| c.session_token.as_deref() == Some(token))
        {
            return Err(TransactionError::SessionAlreadyHasTransaction {
                existing: existing.txn_id,
            });
        }

        let context = spawn_context(
            id,
            session_token,
            two_phase,
            initial_status,
            self.config.participant_id.clone(),
            self.provider.clone(),
            self.executor.clone(),
            self.log.clone(),
            self.contexts.clone(),
        );
        contexts.insert(id, context.clone());
        Ok(context)
    }

    fn find_context(&self, id: TransactionId) -> Option<Arc<ExecutionContext>> {
        self.contexts.lock().get(&id).cloned()
    }

    fn get_context(&self, id: TransactionId) -> Result<Arc<ExecutionContext>> {
        self.find_context(id)
            .ok_or(TransactionError::TransactionNotFound(id))
    }

    fn check_session_token(&self, session_token: &str) -> Result<()> {
        if self.validator.is_valid(session_token) {
            Ok(())
        } else {
            Err(TransactionError::InvalidSessionToken)
        }
    }

    fn check_interactive_session_key(&self, interactive_session_key: &str) -> Result<()> {
        if self.config.interactive_session_key == interactive_session_key {
            Ok(())
        } else {
            Err(TransactionError::InvalidInteractiveSessionKey)
        }
    }

    fn check_coordinator_key(&self, coordinator_key: &str) -> Result<()> {
        if self.config.transaction_coordinator_key == coordinator_key {
            Ok(())
        } else {
            Err(TransactionError::InvalidCoordinatorKey)
        }
    }

    fn check_transaction_access(
        &self,
        context: &ExecutionContext,
        session_token: &str,
    ) -> Result<()> {
        if self.validator.is_privileged(session_token) {
            return Ok(());
        }
        // Recovered contexts have no owning session; only privileged tokens
        // and the coordinator key reach them.
        if context.session_token.as_deref() == Some(session_token) {
            Ok(())
        } else {
            Err(TransactionError::AccessDenied(context.txn_id))
        }
    }
}

#[async_trait]
impl<P: ResourceTransactionProvider> ParticipantClient for TransactionParticipant<P> {
    fn participant_id(&self) -> &str {
        TransactionParticipant::participant_id(self)
    }

    async fn begin_transaction(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: Option<&str>,
    ) -> Result<()> {
        TransactionParticipant::begin_transaction(
            self,
            id,
            session_token,
            interactive_session_key,
            coordinator_key,
        )
        .await
    }

    async fn execute_operation(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        operation: &str,
        arguments: Vec<Value>,
    ) -> Result<Value> {
        TransactionParticipant::execute_operation(
            self,
            id,
            session_token,
            interactive_session_key,
            operation,
            arguments,
        )
        .await
    }

    async fn prepare_transaction(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()> {
        TransactionParticipant::prepare_transaction(
            self,
            id,
            session_token,
            interactive_session_key,
            coordinator_key,
        )
        .await
    }

    async fn commit_transaction(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        TransactionParticipant::commit_transaction(self, id, session_token, interactive_session_key)
            .await
    }

    async fn commit_recovered_transaction(
        &self,
        id: TransactionId,
        coordinator_key: &str,
    ) -> Result<()> {
        TransactionParticipant::commit_recovered_transaction(self, id, coordinator_key).await
    }

    async fn rollback_transaction(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        TransactionParticipant::rollback_transaction(
            self,
            id,
            session_token,
            interactive_session_key,
        )
        .await
    }

    async fn rollback_recovered_transaction(
        &self,
        id: TransactionId,
        coordinator_key: &str,
    ) -> Result<()> {
        TransactionParticipant::rollback_recovered_transaction(self, id, coordinator_key).await
    }

    async fn get_transactions(&self, coordinator_key: &str) -> Result<Vec<TransactionId>> {
        TransactionParticipant::get_transactions(self, coordinator_key)
    }
}
