use ulid::Ulid;

use crate::model::SlotKey;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    /// The transaction runner used its whole attempt budget on aborted commits.
    Contention { attempts: u32 },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::Contention { attempts } => {
                write!(f, "transaction aborted by concurrent writers after {attempts} attempts")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// A key a transaction read or wrote. Commit locks are taken in this order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TxnKey {
    Slot(SlotKey),
    Booking(Ulid),
}

impl std::fmt::Display for TxnKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxnKey::Slot(k) => write!(f, "{}@{}", k.party, k.slot),
            TxnKey::Booking(id) => write!(f, "booking {id}"),
        }
    }
}

#[derive(Debug)]
pub enum CommitError {
    /// A key in the read set changed after it was read. Safe to retry.
    Aborted { key: TxnKey },
    Engine(EngineError),
}

impl std::fmt::Display for CommitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitError::Aborted { key } => write!(f, "stale read of {key}"),
            CommitError::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CommitError {}

impl From<EngineError> for CommitError {
    fn from(e: EngineError) -> Self {
        CommitError::Engine(e)
    }
}
