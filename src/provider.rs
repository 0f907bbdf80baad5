//! Seams to the surrounding system
//!
//! The coordination core never owns a datastore transaction and never
//! interprets a business operation: both are injected per participant. A
//! session token validator is shared by the coordinator and all participants.

use crate::error::Result;
use crate::transaction_id::TransactionId;
use async_trait::async_trait;
use serde_json::Value;

/// The actual underlying datastore transaction, opaque to this crate.
///
/// `commit` and `rollback` receive `None` for transactions recovered after a
/// crash: the in-memory handle is gone and the provider is expected to finish
/// the prepared resource transaction by id (e.g. `COMMIT PREPARED`).
#[async_trait]
pub trait ResourceTransactionProvider: Send + Sync + 'static {
    type Handle: Send + 'static;

    async fn begin(&self, id: TransactionId) -> Result<Self::Handle>;

    async fn prepare(&self, id: TransactionId, handle: Option<&Self::Handle>) -> Result<()>;

    async fn commit(&self, id: TransactionId, handle: Option<Self::Handle>) -> Result<()>;

    async fn rollback(&self, id: TransactionId, handle: Option<Self::Handle>) -> Result<()>;
}

/// Dispatches named business operations. This crate never interprets the
/// operation name or its arguments.
#[async_trait]
pub trait TransactionOperationExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        session_token: &str,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value>;
}

/// Validates the opaque session tokens carried by interactive calls.
pub trait SessionTokenValidator: Send + Sync + 'static {
    fn is_valid(&self, session_token: &str) -> bool;

    /// Privileged tokens bypass the per-transaction session ownership check.
    fn is_privileged(&self, _session_token: &str) -> bool {
        false
    }
}
