//! Distributed two-phase-commit transaction coordination.
//!
//! A [`TransactionCoordinator`] drives atomic transactions across a set of
//! [`ParticipantClient`]s. Each [`TransactionParticipant`] wraps one resource
//! behind a [`ResourceTransactionProvider`], executes operations through a
//! [`TransactionOperationExecutor`], serializes work per transaction on a
//! dedicated task, and records every status transition in a durable
//! [`TransactionLog`] before acknowledging it. Both sides recover in-doubt
//! transactions from their logs after a crash and converge them to the same
//! terminal outcome.

pub mod config;
mod context;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod log;
pub mod participant;
pub mod provider;
pub mod status;
pub mod transaction_id;

pub use config::{CoordinatorConfig, ParticipantConfig};
pub use coordinator::TransactionCoordinator;
pub use error::{Result, TransactionError};
pub use lock::TransactionLock;
pub use log::{FjallTransactionLog, MemoryTransactionLog, TransactionLog, TransactionLogEntry};
pub use participant::{ParticipantClient, TransactionParticipant};
pub use provider::{
    ResourceTransactionProvider, SessionTokenValidator, TransactionOperationExecutor,
};
pub use status::TransactionStatus;
pub use transaction_id::TransactionId;
