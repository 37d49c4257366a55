//! Hadron batch error abstractions.

use uuid::Uuid;

use crate::models::{MessageType, TransactionType};

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";
pub const ERR_DB_TRANSACTION: &str = "error applying database transaction";

/// Application errors returned to callers of the batch engine.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// No dispatcher is registered for the given transaction type & message type.
    #[error("no dispatcher registered for transaction type '{tx_type}' and message type '{msg_type}'")]
    UnknownDispatcher { tx_type: TransactionType, msg_type: MessageType },
    /// A required collaborator was not provided.
    #[error("the batch manager requires a {0} in order to run")]
    MissingDependency(&'static str),
    /// The batch manager has already been started.
    #[error("the batch manager has already been started")]
    AlreadyStarted,
    /// The batch manager is shutting down.
    #[error("the batch manager is shutting down")]
    ShuttingDown,
    /// The guarded bulk update bound fewer messages to a batch than expected.
    #[error("expected {expected} ready messages to be bound to batch {batch}, but {updated} were updated")]
    BatchBindMismatch { batch: Uuid, expected: u64, updated: u64 },
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
