//! Error types for transaction coordination

use crate::status::TransactionStatus;
use crate::transaction_id::TransactionId;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by the coordinator, participants and the transaction log.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid session token")]
    InvalidSessionToken,

    #[error("Invalid interactive session key")]
    InvalidInteractiveSessionKey,

    #[error("Invalid transaction coordinator key")]
    InvalidCoordinatorKey,

    #[error("Access denied to transaction '{0}'")]
    AccessDenied(TransactionId),

    #[error("Transaction '{0}' does not exist")]
    TransactionNotFound(TransactionId),

    #[error("Transaction '{0}' already exists")]
    TransactionAlreadyExists(TransactionId),

    #[error(
        "Transaction '{id}' unexpected status '{actual}'. Expected statuses {expected:?}"
    )]
    UnexpectedStatus {
        id: TransactionId,
        actual: TransactionStatus,
        expected: Vec<TransactionStatus>,
    },

    #[error(
        "Cannot create transaction '{id}' because the transaction count limit ({limit}) has been reached"
    )]
    TransactionLimitReached { id: TransactionId, limit: usize },

    #[error(
        "Cannot create more than one transaction for the same session token. \
         The already existing and still active transaction: '{existing}'"
    )]
    SessionAlreadyHasTransaction { existing: TransactionId },

    #[error(
        "Cannot execute a new action on transaction '{0}' as it is still busy executing a previous action"
    )]
    Busy(TransactionId),

    #[error(
        "Cannot execute a new action on transaction '{id}' as it is still busy executing a previous action. Waited since '{since}'"
    )]
    BusyTimedOut {
        id: TransactionId,
        since: DateTime<Utc>,
    },

    #[error("Transaction '{0}' is no longer running")]
    ContextClosed(TransactionId),

    #[error(
        "Transaction '{0}' was started without a transaction coordinator key, therefore calling prepare is not allowed"
    )]
    PrepareNotAllowed(TransactionId),

    #[error("Unknown participant id: {0}")]
    UnknownParticipant(String),

    #[error("Operation '{operation}' failed: {message}")]
    OperationFailed { operation: String, message: String },

    #[error("Resource transaction error: {0}")]
    Resource(String),

    #[error("Transaction log storage error: {0}")]
    Storage(#[from] fjall::Error),

    #[error("Transaction log write failed: {0}")]
    LogWriteFailed(String),

    #[error("Transaction log encoding error: {0}")]
    LogEncoding(String),

    #[error(
        "Transaction '{id}' status '{status}' cannot be logged after '{last}'"
    )]
    IllegalTransition {
        id: TransactionId,
        status: TransactionStatus,
        last: TransactionStatus,
    },
}

pub type Result<T> = std::result::Result<T, TransactionError>;
