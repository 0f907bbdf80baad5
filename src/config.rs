//! Configuration for coordinators and participants
//!
//! The coordinator key and the interactive session key are static secrets
//! shared out-of-band between the coordinator and every participant.

use crate::error::{Result, TransactionError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_transaction_limit() -> usize {
    10
}

fn default_transaction_timeout_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantConfig {
    /// Stable identifier of this participant, unique across the deployment.
    pub participant_id: String,

    /// Authenticates coordinator-driven recovery calls.
    pub transaction_coordinator_key: String,

    /// Authenticates interactive calls.
    pub interactive_session_key: String,

    /// Maximum number of live execution contexts. Exceeding it is a
    /// synchronous rejection, not a queue.
    #[serde(default = "default_transaction_limit")]
    pub transaction_limit: usize,

    /// Idle time after which a NEW or BEGIN_FINISHED transaction is
    /// considered abandoned, and the wait bound for recovery-mode lock
    /// acquisition.
    #[serde(default = "default_transaction_timeout_secs")]
    pub transaction_timeout_secs: u64,
}

impl ParticipantConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.participant_id.is_empty() {
            return Err(TransactionError::InvalidConfig(
                "participant id cannot be empty".to_string(),
            ));
        }
        validate_common(
            &self.transaction_coordinator_key,
            &self.interactive_session_key,
            self.transaction_limit,
            self.transaction_timeout_secs,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub transaction_coordinator_key: String,

    pub interactive_session_key: String,

    #[serde(default = "default_transaction_limit")]
    pub transaction_limit: usize,

    #[serde(default = "default_transaction_timeout_secs")]
    pub transaction_timeout_secs: u64,
}

impl CoordinatorConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(
            &self.transaction_coordinator_key,
            &self.interactive_session_key,
            self.transaction_limit,
            self.transaction_timeout_secs,
        )
    }
}

fn validate_common(
    coordinator_key: &str,
    interactive_session_key: &str,
    transaction_limit: usize,
    transaction_timeout_secs: u64,
) -> Result<()> {
    if coordinator_key.is_empty() {
        return Err(TransactionError::InvalidConfig(
            "transaction coordinator key cannot be empty".to_string(),
        ));
    }
    if interactive_session_key.is_empty() {
        return Err(TransactionError::InvalidConfig(
            "interactive session key cannot be empty".to_string(),
        ));
    }
    if transaction_limit == 0 {
        return Err(TransactionError::InvalidConfig(
            "transaction count limit cannot be 0".to_string(),
        ));
    }
    if transaction_timeout_secs == 0 {
        return Err(TransactionError::InvalidConfig(
            "transaction timeout cannot be 0".to_string(),
        ));
    }
    Ok(())
}
