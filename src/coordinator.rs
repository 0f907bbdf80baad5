//! Transaction coordinator
//!
//! Drives the two-phase protocol across all registered participants for one
//! transaction id: begin fan-out with compensating rollback on partial
//! failure, prepare followed by commit-of-prepared, and rollback. Commit and
//! rollback fan-outs attempt every participant even after a failure
//! (participants past PREPARE_FINISHED are obligated to converge) and only
//! then raise the first encountered error. Startup recovery replays in-doubt
//! transactions from the coordinator's own durable log against only the
//! participants that still report them as pending.

use crate::config::CoordinatorConfig;
use crate::error::{Result, TransactionError};
use crate::lock::TransactionLock;
use crate::log::{TransactionLog, TransactionLogEntry};
use crate::participant::ParticipantClient;
use crate::provider::SessionTokenValidator;
use crate::status::TransactionStatus;
use crate::transaction_id::TransactionId;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Coordinator-side record of one distributed transaction.
struct CoordinatedTransaction {
    id: TransactionId,
    status: Mutex<TransactionStatus>,
    lock: TransactionLock,
}

impl CoordinatedTransaction {
    fn new(id: TransactionId, status: TransactionStatus) -> Arc<Self> {
        Arc::new(Self {
            id,
            status: Mutex::new(status),
            lock: TransactionLock::new(id),
        })
    }

    fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    /// Durable write first; the in-memory status only advances once the log
    /// acknowledged the transition.
    fn set_status(&self, log: &dyn TransactionLog, status: TransactionStatus) -> Result<()> {
        log.log_status(TransactionLogEntry::new(self.id, status, true))?;
        *self.status.lock() = status;
        Ok(())
    }
}

/// How a fan-out call authenticates itself against participants.
#[derive(Clone, Copy)]
enum CallAuth<'a> {
    Interactive { session_token: &'a str },
    Recovery,
}

pub struct TransactionCoordinator {
    config: CoordinatorConfig,
    validator: Arc<dyn SessionTokenValidator>,
    participants: Vec<Arc<dyn ParticipantClient>>,
    log: Arc<dyn TransactionLog>,
    transactions: Mutex<HashMap<TransactionId, Arc<CoordinatedTransaction>>>,
}

impl TransactionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        validator: Arc<dyn SessionTokenValidator>,
        participants: Vec<Arc<dyn ParticipantClient>>,
        log: Arc<dyn TransactionLog>,
    ) -> Result<Self> {
        config.validate()?;
        if participants.is_empty() {
            return Err(TransactionError::InvalidConfig(
                "participants cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            config,
            validator,
            participants,
            log,
            transactions: Mutex::new(HashMap::new()),
        })
    }

    /// Last known status of a transaction this coordinator is tracking.
    pub fn transaction_status(&self, id: TransactionId) -> Option<TransactionStatus> {
        self.transactions.lock().get(&id).map(|txn| txn.status())
    }

    pub async fn begin_transaction(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        self.check_session_token(session_token)?;
        self.check_interactive_session_key(interactive_session_key)?;

        let txn = self.create_transaction(id, TransactionStatus::New)?;
        let result = txn
            .lock
            .run_or_fail(async {
                txn.set_status(&*self.log, TransactionStatus::BeginStarted)?;
                tracing::info!("Begin transaction '{}' started", id);

                for participant in &self.participants {
                    tracing::info!(
                        "Begin transaction '{}' for participant '{}'",
                        id,
                        participant.participant_id()
                    );
                    if let Err(e) = participant
                        .begin_transaction(
                            id,
                            session_token,
                            interactive_session_key,
                            Some(&self.config.transaction_coordinator_key),
                        )
                        .await
                    {
                        tracing::info!(
                            "Begin transaction '{}' failed for participant '{}': {}",
                            id,
                            participant.participant_id(),
                            e
                        );
                        // Best-effort compensation; the original failure is
                        // what the caller sees.
                        let _ = self
                            .rollback_fanout(&txn, CallAuth::Interactive { session_token })
                            .await;
                        return Err(e);
                    }
                }

                txn.set_status(&*self.log, TransactionStatus::BeginFinished)?;
                tracing::info!("Begin transaction '{}' finished successfully", id);
                Ok(())
            })
            .await;

        // A transaction that never got past NEW leaves no durable trace and
        // no record.
        if result.is_err() && txn.status() == TransactionStatus::New {
            self.transactions.lock().remove(&id);
        }
        result
    }

    pub async fn execute_operation(
        &self,
        id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        participant_id: &str,
        operation: &str,
        arguments: Vec<Value>,
    ) -> Result<Value> {
        self.check_session_token(session_token)?;
        self.check_interactive_session_key(interactive_session_key)?;

        let txn = self.get_transaction(id)?;
        txn.lock
            .run_or_fail(async {
                self.expect_status(&txn, &[TransactionStatus::BeginFinished])?;

                let participant = self
                    .participants
                    .iter()
                    .find(|p| p.participant_id() == participant_id)
                    .ok_or_else(|| {
                        TransactionError::UnknownParticipant(participant_id.to_string())
                    })?;

                tracing::info!(
                    "Transaction '{}' execute operation '{}' started",
                    id,
                    operation
                );
                let result = participant
                    .execute_operation(
                        id,
                        session_token,
                        interactive_session_key,
                        operation,
                        arguments,
                    )
                    .await?;
                tracing::info!(
                    "Transaction '{}' execute operation '{}' finished successfully",
                    id,
                    operation
                );
                Ok(result)
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

        let txn = self.get_transaction(id)?;
        txn.lock
            .run_or_fail(async {
                self.expect_status(&txn, &[TransactionStatus::BeginFinished])?;

                tracing::info!("Commit transaction '{}' started", id);
                self.prepare_fanout(&txn, session_token, interactive_session_key)
                    .await?;
                self.commit_prepared_fanout(&txn, CallAuth::Interactive { session_token })
                    .await?;
                tracing::info!("Commit transaction '{}' finished successfully", id);
                Ok(())
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

        // Unknown transactions roll back as a no-op.
        let Some(txn) = self.find_transaction(id) else {
            return Ok(());
        };
        txn.lock
            .run_or_fail(async {
                self.expect_status(
                    &txn,
                    &[
                        TransactionStatus::BeginStarted,
                        TransactionStatus::BeginFinished,
                        TransactionStatus::PrepareStarted,
                        TransactionStatus::PrepareFinished,
                        TransactionStatus::RollbackStarted,
                    ],
                )?;
                self.rollback_fanout(&txn, CallAuth::Interactive { session_token })
                    .await
            })
            .await
    }

    /// Recovery, safe to run at startup and as periodic maintenance.
    /// Classifies every transaction in the coordinator's durable log by its
    /// last status and replays either rollback or commit-of-prepared in
    /// recovery mode, skipping participants that no longer report the
    /// transaction as pending. Live NEW/BEGIN_FINISHED transactions are only
    /// rolled back once idle past the configured timeout; busy ones are
    /// skipped. A failure while recovering one transaction never aborts
    /// recovery of the others.
    pub async fn restore_transactions(&self) {
        tracing::info!("Started restoring transactions");

        let statuses = self.log.last_statuses();
        if statuses.is_empty() {
            tracing::info!("No transactions found in the transaction log");
        }

        for (id, status) in statuses {
            if status.is_terminal() {
                continue;
            }
            if let Err(e) = self.restore_one(id, status).await {
                tracing::warn!(
                    "Restoring transaction '{}' with last status '{}' has failed: {}",
                    id,
                    status,
                    e
                );
            }
        }

        tracing::info!("Finished restoring transactions");
    }

    async fn restore_one(&self, id: TransactionId, status: TransactionStatus) -> Result<()> {
        let txn = self.recover_transaction(id, status)?;
        // Evaluated before taking the lock, which refreshes the last-accessed
        // stamp on acquisition. Records rebuilt from the log are backdated,
        // so they always count as timed out.
        let last_accessed = txn.lock.last_accessed();
        let timed_out = txn
            .lock
            .is_idle_longer_than(self.config.transaction_timeout());
        txn.lock
            .run_or_skip(async {
                tracing::info!(
                    "Restoring transaction '{}' with last status '{}'",
                    id,
                    txn.status()
                );
                match txn.status() {
                    TransactionStatus::BeginStarted
                    | TransactionStatus::PrepareStarted
                    | TransactionStatus::RollbackStarted => {
                        self.rollback_fanout(&txn, CallAuth::Recovery).await
                    }
                    TransactionStatus::New | TransactionStatus::BeginFinished => {
                        // A live transaction between operations is only
                        // abandoned once it has been idle past the timeout.
                        if timed_out {
                            tracing::info!(
                                "Transaction '{}' has timed out, last accessed at '{}'",
                                id,
                                last_accessed
                            );
                            self.rollback_fanout(&txn, CallAuth::Recovery).await
                        } else {
                            tracing::info!(
                                "Transaction '{}' hasn't timed out yet, last accessed at '{}'",
                                id,
                                last_accessed
                            );
                            Ok(())
                        }
                    }
                    TransactionStatus::PrepareFinished | TransactionStatus::CommitStarted => {
                        self.commit_prepared_fanout(&txn, CallAuth::Recovery)
                            .await
                    }
                    other => {
                        // Never guess on an unexpected last status.
                        tracing::error!(
                            "Transaction '{}' has an unsupported last status '{}'",
                            id,
                            other
                        );
                        Ok(())
                    }
                }
            })
            .await
            .map(|_| ())
    }

    async fn prepare_fanout(
        &self,
        txn: &CoordinatedTransaction,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        tracing::info!("Prepare transaction '{}' started", txn.id);
        txn.set_status(&*self.log, TransactionStatus::PrepareStarted)?;

        for participant in &self.participants {
            tracing::info!(
                "Prepare transaction '{}' for participant '{}'",
                txn.id,
                participant.participant_id()
            );
            if let Err(e) = participant
                .prepare_transaction(
                    txn.id,
                    session_token,
                    interactive_session_key,
                    &self.config.transaction_coordinator_key,
                )
                .await
            {
                tracing::info!(
                    "Prepare transaction '{}' failed for participant '{}': {}",
                    txn.id,
                    participant.participant_id(),
                    e
                );
                let _ = self
                    .rollback_fanout(txn, CallAuth::Interactive { session_token })
                    .await;
                tracing::info!("Prepare transaction '{}' has failed", txn.id);
                return Err(e);
            }
        }

        txn.set_status(&*self.log, TransactionStatus::PrepareFinished)?;
        tracing::info!("Prepare transaction '{}' finished successfully", txn.id);
        Ok(())
    }

    /// Second phase. Every participant is attempted regardless of earlier
    /// failures; only the first error is raised once all attempts are done.
    async fn commit_prepared_fanout(
        &self,
        txn: &CoordinatedTransaction,
        auth: CallAuth<'_>,
    ) -> Result<()> {
        tracing::info!("Commit prepared transaction '{}' started", txn.id);

        if txn.status() == TransactionStatus::PrepareFinished {
            txn.set_status(&*self.log, TransactionStatus::CommitStarted)?;
        }

        let mut first_error = None;
        for participant in &self.participants {
            let attempt = self
                .commit_at_participant(txn.id, participant.as_ref(), auth)
                .await;
            if let Err(e) = attempt {
                tracing::warn!(
                    "Commit prepared transaction '{}' failed for participant '{}': {}",
                    txn.id,
                    participant.participant_id(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => {
                txn.set_status(&*self.log, TransactionStatus::CommitFinished)?;
                self.transactions.lock().remove(&txn.id);
                tracing::info!(
                    "Commit prepared transaction '{}' finished successfully",
                    txn.id
                );
                Ok(())
            }
            Some(e) => {
                tracing::info!("Commit prepared transaction '{}' has failed", txn.id);
                Err(e)
            }
        }
    }

    async fn commit_at_participant(
        &self,
        id: TransactionId,
        participant: &dyn ParticipantClient,
        auth: CallAuth<'_>,
    ) -> Result<()> {
        if let CallAuth::Recovery = auth {
            let pending = participant
                .get_transactions(&self.config.transaction_coordinator_key)
                .await?;
            if !pending.contains(&id) {
                tracing::info!(
                    "Skipping commit of prepared transaction '{}' for participant '{}': already committed there before",
                    id,
                    participant.participant_id()
                );
                return Ok(());
            }
        }

        tracing::info!(
            "Commit prepared transaction '{}' for participant '{}'",
            id,
            participant.participant_id()
        );
        match auth {
            CallAuth::Interactive { session_token } => {
                participant
                    .commit_transaction(id, session_token, &self.config.interactive_session_key)
                    .await
            }
            CallAuth::Recovery => {
                participant
                    .commit_recovered_transaction(id, &self.config.transaction_coordinator_key)
                    .await
            }
        }
    }

    /// Symmetric to the commit fan-out: attempt all, then raise the first
    /// error. In recovery mode a participant is only called if it still
    /// lists the transaction as pending.
    async fn rollback_fanout(
        &self,
        txn: &CoordinatedTransaction,
        auth: CallAuth<'_>,
    ) -> Result<()> {
        tracing::info!("Rollback transaction '{}' started", txn.id);

        if txn.status() != TransactionStatus::RollbackStarted {
            txn.set_status(&*self.log, TransactionStatus::RollbackStarted)?;
        }

        let mut first_error = None;
        for participant in &self.participants {
            let attempt = self
                .rollback_at_participant(txn.id, participant.as_ref(), auth)
                .await;
            if let Err(e) = attempt {
                tracing::info!(
                    "Rollback transaction '{}' failed for participant '{}': {}",
                    txn.id,
                    participant.participant_id(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => {
                txn.set_status(&*self.log, TransactionStatus::RollbackFinished)?;
                self.transactions.lock().remove(&txn.id);
                tracing::info!("Rollback transaction '{}' finished successfully", txn.id);
                Ok(())
            }
            Some(e) => {
                tracing::info!("Rollback transaction '{}' has failed", txn.id);
                Err(e)
            }
        }
    }

    async fn rollback_at_participant(
        &self,
        id: TransactionId,
        participant: &dyn ParticipantClient,
        auth: CallAuth<'_>,
    ) -> Result<()> {
        if let CallAuth::Recovery = auth {
            // Participants that no longer list the transaction as pending
            // either finished it already or never prepared it; the latter
            // clean up on their own through the stale-transaction sweep.
            let pending = participant
                .get_transactions(&self.config.transaction_coordinator_key)
                .await?;
            if !pending.contains(&id) {
                tracing::info!(
                    "Skipping rollback of transaction '{}' for participant '{}': no longer pending there",
                    id,
                    participant.participant_id()
                );
                return Ok(());
            }
        }

        tracing::info!(
            "Rollback transaction '{}' for participant '{}'",
            id,
            participant.participant_id()
        );
        match auth {
            CallAuth::Interactive { session_token } => {
                participant
                    .rollback_transaction(id, session_token, &self.config.interactive_session_key)
                    .await
            }
            CallAuth::Recovery => {
                participant
                    .rollback_recovered_transaction(id, &self.config.transaction_coordinator_key)
                    .await
            }
        }
    }

    fn create_transaction(
        &self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<Arc<CoordinatedTransaction>> {
        let mut transactions = self.transactions.lock();
        if transactions.contains_key(&id) {
            return Err(TransactionError::TransactionAlreadyExists(id));
        }
        if transactions.len() >= self.config.transaction_limit {
            return Err(TransactionError::TransactionLimitReached {
                id,
                limit: self.config.transaction_limit,
            });
        }
        let txn = CoordinatedTransaction::new(id, status);
        transactions.insert(id, txn.clone());
        Ok(txn)
    }

    /// Look up a transaction for recovery, rebuilding the record from its
    /// logged status if no live one exists. Deliberately does not touch the
    /// last-accessed stamp; rebuilt records are backdated so the idle check
    /// treats them as already abandoned.
    fn recover_transaction(
        &self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<Arc<CoordinatedTransaction>> {
        if let Some(txn) = self.transactions.lock().get(&id) {
            return Ok(txn.clone());
        }
        let txn = self.create_transaction(id, status)?;
        txn.lock
            .set_last_accessed(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
        Ok(txn)
    }

    fn find_transaction(&self, id: TransactionId) -> Option<Arc<CoordinatedTransaction>> {
        let transactions = self.transactions.lock();
        let txn = transactions.get(&id).cloned();
        if let Some(txn) = &txn {
            txn.lock.touch();
        }
        txn
    }

    fn get_transaction(&self, id: TransactionId) -> Result<Arc<CoordinatedTransaction>> {
        self.find_transaction(id)
            .ok_or(TransactionError::TransactionNotFound(id))
    }

    fn expect_status(
        &self,
        txn: &CoordinatedTransaction,
        expected: &[TransactionStatus],
    ) -> Result<()> {
        let actual = txn.status();
        if expected.contains(&actual) {
            return Ok(());
        }
        Err(TransactionError::UnexpectedStatus {
            id: txn.id,
            actual,
            expected: expected.to_vec(),
        })
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
}
