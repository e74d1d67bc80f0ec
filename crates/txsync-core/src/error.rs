//! Error types for txsync

use thiserror::Error;

use crate::types::{AccountId, NymId, ServerId, UnitId};

/// Main error type for txsync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Context has an empty nym or server id
    #[error("Invalid context: {0}")]
    InvalidContext(String),

    /// Task payload references an empty identifier
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Manager was constructed outside of a tokio runtime
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Manager is shutting down and accepts no new work
    #[error("Synchronization manager is shutting down")]
    ShuttingDown,
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

/// A requirement that must hold before a task can be attempted.
///
/// Tasks failing one of these are requeued rather than reported as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// No transaction number is available in the consensus state
    TransactionNumber,
    /// Destination account does not exist locally yet
    NoAccount(UnitId),
    /// More than one local account could receive the deposit
    AmbiguousAccount(UnitId),
    /// Named account is not registered with this endpoint
    UnknownAccount(AccountId),
    /// Recipient nym has not been downloaded yet
    UnknownNym(NymId),
    /// Endpoint contract is not known locally
    UnknownServer(ServerId),
    /// Unit definition has not been downloaded yet
    UnknownUnit(UnitId),
    /// Mint for the unit has not been downloaded yet
    MissingMint(UnitId),
}

impl std::fmt::Display for Precondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precondition::TransactionNumber => write!(f, "no transaction number available"),
            Precondition::NoAccount(unit) => write!(f, "no account for unit {unit}"),
            Precondition::AmbiguousAccount(unit) => {
                write!(f, "more than one account for unit {unit}")
            }
            Precondition::UnknownAccount(account) => write!(f, "unknown account {account}"),
            Precondition::UnknownNym(nym) => write!(f, "unknown nym {nym}"),
            Precondition::UnknownServer(server) => write!(f, "unknown server contract {server}"),
            Precondition::UnknownUnit(unit) => write!(f, "unknown unit definition {unit}"),
            Precondition::MissingMint(unit) => write!(f, "no mint for unit {unit}"),
        }
    }
}

/// Outcome classification for a task that did not succeed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// No reply was received after every allowed attempt
    #[error("Transport failure after {attempts} attempt(s)")]
    Transport { attempts: u32 },

    /// A reply was received and the endpoint refused the request
    #[error("Endpoint rejected {operation}")]
    Rejected { operation: &'static str },

    /// Local requirement missing; the task is requeued
    #[error("Precondition not met: {0}")]
    Precondition(Precondition),

    /// Local requirement that waiting will not satisfy; reported as failed
    #[error("Missing local data: {0}")]
    Missing(Precondition),

    /// Lookup skipped this cycle because the id is backing off; the task is requeued
    #[error("Lookup deferred (backoff multiplier {multiplier})")]
    Deferred { multiplier: u64 },

    /// Accepting the amounts would overflow the account balance
    #[error("Balance overflow on account {0}")]
    BalanceOverflow(AccountId),

    /// The handler panicked; the task is reported as failed
    #[error("Handler panicked")]
    Panicked,

    /// Worker was stopped while the task was in flight
    #[error("Worker shut down")]
    Shutdown,
}
