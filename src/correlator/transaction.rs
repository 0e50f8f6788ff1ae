use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::SessionResult;

/// Identifier correlating a request with its reply (`tid` on the wire).
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct TransactionId(Arc<str>);

impl TransactionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(self.as_str())
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

/// One outstanding call, owned by the pending table until it resolves.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub method: String,
    pub created_at: Instant,
    pub reply: oneshot::Sender<SessionResult<serde_json::Value>>,
}

pub(crate) type PendingTable = DashMap<TransactionId, Transaction, ahash::RandomState>;

/// Removes a transaction from the pending table when the waiting call goes away, whichever way
/// it ends: reply, timeout, publish error or the caller dropping the future.
pub(crate) struct PendingGuard<'a> {
    pub table: &'a PendingTable,
    pub id: TransactionId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}
