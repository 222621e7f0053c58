// ABOUTME: Error taxonomy for replication jobs
// ABOUTME: Classifies store failures into schema, transient, and permanent errors

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Result alias used by the replication engine.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised while replicating a table.
///
/// | Variant | Retryable | Typical cause |
/// |---------|-----------|---------------|
/// | `Schema` | No | Source table missing, column or type mismatch |
/// | `TransientStore` | Yes | Connection loss, timeout, lock or serialization conflict |
/// | `Store` | No | Constraint violation or any other permanent store failure |
/// | `LeaseHeld` | Yes | Another job currently owns the table |
/// | `Config` | No | Invalid settings or identifiers |
/// | `Io` | No | Local I/O failure (config file, sockets) |
/// | `Broker` | No | Event broker (Redis) unreachable or rejected a command |
///
/// Use [`SyncError::is_retryable`] to decide whether the task queue should
/// re-invoke the job.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Schema error on {table}: {message}")]
    Schema { table: String, message: String },

    #[error("Transient store error ({operation}): {message}")]
    TransientStore { operation: String, message: String },

    #[error("Store error ({operation}): {message}")]
    Store { operation: String, message: String },

    #[error("Table {table} is leased by job {holder}")]
    LeaseHeld { table: String, holder: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event broker error: {0}")]
    Broker(String),
}

impl From<redis::RedisError> for SyncError {
    fn from(e: redis::RedisError) -> Self {
        Self::Broker(e.to_string())
    }
}

impl SyncError {
    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientStore {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Classify a PostgreSQL client error raised while running `operation`
    /// against `table`.
    pub fn from_postgres(operation: &str, table: &str, err: &tokio_postgres::Error) -> Self {
        let message = postgres_message(err);
        match err.code() {
            Some(code) if is_schema_state(code) => Self::schema(table, message),
            Some(code) if is_transient_state(code) => Self::transient(operation, message),
            Some(_) => Self::store(operation, message),
            // No SQLSTATE means the failure happened below the protocol:
            // socket closed, I/O error, TLS failure.
            None => Self::transient(operation, message),
        }
    }

    /// Whether the task queue should re-invoke the job after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientStore { .. } => true,
            Self::LeaseHeld { .. } => true,
            Self::Schema { .. } => false,
            Self::Store { .. } => false,
            Self::Config(_) => false,
            Self::Io(_) => false,
            Self::Broker(_) => false,
        }
    }
}

fn postgres_message(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => format!("{} ({})", db.message(), db.code().code()),
        None => err.to_string(),
    }
}

fn is_schema_state(code: &SqlState) -> bool {
    *code == SqlState::UNDEFINED_TABLE
        || *code == SqlState::UNDEFINED_COLUMN
        || *code == SqlState::DATATYPE_MISMATCH
        || *code == SqlState::INVALID_COLUMN_REFERENCE
        || *code == SqlState::INVALID_COLUMN_DEFINITION
}

fn is_transient_state(code: &SqlState) -> bool {
    // Class 08: connection exceptions
    code.code().starts_with("08")
        || *code == SqlState::T_R_SERIALIZATION_FAILURE
        || *code == SqlState::T_R_DEADLOCK_DETECTED
        || *code == SqlState::LOCK_NOT_AVAILABLE
        || *code == SqlState::QUERY_CANCELED
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
        || *code == SqlState::TOO_MANY_CONNECTIONS
}
