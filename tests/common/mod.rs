//! Shared test fixtures: a recording resource provider with injectable
//! failures, an echo operation executor, a static session validator and a
//! small in-process cluster builder.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use async_trait::async_trait;
use lims_txn::{
    CoordinatorConfig, MemoryTransactionLog, ParticipantClient, ParticipantConfig,
    ResourceTransactionProvider, Result, SessionTokenValidator, TransactionCoordinator,
    TransactionError, TransactionId, TransactionOperationExecutor, TransactionParticipant,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Honors `RUST_LOG`; repeated calls are fine.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const SESSION: &str = "session-1";
pub const SESSION_2: &str = "session-2";
pub const ADMIN_SESSION: &str = "admin";
pub const INVALID_SESSION: &str = "invalid";
pub const ISK: &str = "interactive-key";
pub const COORDINATOR_KEY: &str = "coordinator-key";

pub struct StaticValidator;

impl SessionTokenValidator for StaticValidator {
    fn is_valid(&self, session_token: &str) -> bool {
        session_token != INVALID_SESSION
    }

    fn is_privileged(&self, session_token: &str) -> bool {
        session_token == ADMIN_SESSION
    }
}

/// Records every lifecycle call made against the underlying resource and can
/// be scripted to fail any of them.
#[derive(Default)]
pub struct RecordingProvider {
    calls: Mutex<Vec<String>>,
    fail_begin: AtomicBool,
    fail_prepare: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
}

impl RecordingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn fail_begin(&self, fail: bool) {
        self.fail_begin.store(fail, Ordering::SeqCst);
    }

    pub fn fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.fail_rollback.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: String, fail: &AtomicBool) -> Result<()> {
        self.calls.lock().push(call.clone());
        if fail.load(Ordering::SeqCst) {
            Err(TransactionError::Resource(format!("injected {call} failure")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ResourceTransactionProvider for RecordingProvider {
    type Handle = TransactionId;

    async fn begin(&self, id: TransactionId) -> Result<TransactionId> {
        self.record(format!("begin {id}"), &self.fail_begin)?;
        Ok(id)
    }

    async fn prepare(&self, id: TransactionId, handle: Option<&TransactionId>) -> Result<()> {
        assert_eq!(handle, Some(&id));
        self.record(format!("prepare {id}"), &self.fail_prepare)
    }

    async fn commit(&self, id: TransactionId, handle: Option<TransactionId>) -> Result<()> {
        let kind = if handle.is_some() {
            "commit"
        } else {
            "commit-recovered"
        };
        self.record(format!("{kind} {id}"), &self.fail_commit)
    }

    async fn rollback(&self, id: TransactionId, handle: Option<TransactionId>) -> Result<()> {
        let kind = if handle.is_some() {
            "rollback"
        } else {
            "rollback-recovered"
        };
        self.record(format!("{kind} {id}"), &self.fail_rollback)
    }
}

/// Echoes the operation back; "fail" errors and "slow" sleeps first so tests
/// can hold a transaction busy.
pub struct EchoExecutor;

#[async_trait]
impl TransactionOperationExecutor for EchoExecutor {
    async fn execute(
        &self,
        _session_token: &str,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value> {
        match operation {
            "fail" => Err(TransactionError::OperationFailed {
                operation: operation.to_string(),
                message: "injected operation failure".to_string(),
            }),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!({ "operation": operation, "arguments": arguments }))
            }
            _ => Ok(json!({ "operation": operation, "arguments": arguments })),
        }
    }
}

pub struct TestParticipant {
    pub participant: Arc<TransactionParticipant<RecordingProvider>>,
    pub provider: Arc<RecordingProvider>,
    pub log: Arc<MemoryTransactionLog>,
}

pub fn participant_config(participant_id: &str) -> ParticipantConfig {
    ParticipantConfig {
        participant_id: participant_id.to_string(),
        transaction_coordinator_key: COORDINATOR_KEY.to_string(),
        interactive_session_key: ISK.to_string(),
        transaction_limit: 10,
        transaction_timeout_secs: 3600,
    }
}

pub fn coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        transaction_coordinator_key: COORDINATOR_KEY.to_string(),
        interactive_session_key: ISK.to_string(),
        transaction_limit: 10,
        transaction_timeout_secs: 3600,
    }
}

pub fn participant(participant_id: &str) -> TestParticipant {
    let log = Arc::new(MemoryTransactionLog::new());
    participant_over_log(participant_id, log)
}

/// Build a participant over an existing log, as after a process restart.
pub fn participant_over_log(
    participant_id: &str,
    log: Arc<MemoryTransactionLog>,
) -> TestParticipant {
    init_tracing();
    let provider = RecordingProvider::new();
    let participant = Arc::new(
        TransactionParticipant::new(
            participant_config(participant_id),
            Arc::new(StaticValidator),
            provider.clone(),
            Arc::new(EchoExecutor),
            log.clone(),
        )
        .unwrap(),
    );
    TestParticipant {
        participant,
        provider,
        log,
    }
}

pub struct Cluster {
    pub coordinator: Arc<TransactionCoordinator>,
    pub coordinator_log: Arc<MemoryTransactionLog>,
    pub participants: Vec<TestParticipant>,
}

pub fn cluster(participant_count: usize) -> Cluster {
    let participants: Vec<TestParticipant> = (0..participant_count)
        .map(|i| participant(&format!("participant-{i}")))
        .collect();
    let coordinator_log = Arc::new(MemoryTransactionLog::new());
    let coordinator = coordinator_over_log(&participants, coordinator_log.clone());
    Cluster {
        coordinator,
        coordinator_log,
        participants,
    }
}

/// Build a coordinator over an existing log and existing participants, as
/// after a coordinator restart.
pub fn coordinator_over_log(
    participants: &[TestParticipant],
    log: Arc<MemoryTransactionLog>,
) -> Arc<TransactionCoordinator> {
    coordinator_with_config(participants, log, coordinator_config())
}

pub fn coordinator_with_config(
    participants: &[TestParticipant],
    log: Arc<MemoryTransactionLog>,
    config: CoordinatorConfig,
) -> Arc<TransactionCoordinator> {
    let clients: Vec<Arc<dyn ParticipantClient>> = participants
        .iter()
        .map(|p| p.participant.clone() as Arc<dyn ParticipantClient>)
        .collect();
    Arc::new(
        TransactionCoordinator::new(config, Arc::new(StaticValidator), clients, log).unwrap(),
    )
}
