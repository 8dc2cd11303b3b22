use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::model::{ProcedureId, TableName, TableState};

/// Procedure system errors surfaced to callers of the inbound API
#[derive(Error, Debug)]
pub enum ProcedureError {
    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Configuration file error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // Procedure lifecycle errors
    #[error("Procedure not found: {proc_id}")]
    ProcedureNotFound { proc_id: ProcedureId },

    #[error("Procedure {proc_id} did not finish within {timeout:?}")]
    WaitTimeout { proc_id: ProcedureId, timeout: Duration },

    // Invalid requests, rejected before anything is persisted
    #[error("Table not found: {table}")]
    TableNotFound { table: TableName },

    #[error("Table already exists: {table}")]
    TableExists { table: TableName },

    #[error("Table {table} is {actual:?}, expected {expected:?}")]
    TableState {
        table: TableName,
        expected: TableState,
        actual: TableState,
    },

    #[error("Namespace not found: {namespace}")]
    NamespaceNotFound { namespace: String },

    #[error("Namespace already exists: {namespace}")]
    NamespaceExists { namespace: String },

    #[error("Namespace {namespace} still has {tables} tables")]
    NamespaceNotEmpty { namespace: String, tables: usize },

    #[error("Region not found: {region}")]
    RegionNotFound { region: String },

    #[error("Replication peer not found: {peer_id}")]
    PeerNotFound { peer_id: String },

    #[error("Replication peer already exists: {peer_id}")]
    PeerExists { peer_id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Cluster metadata unavailable: {0}")]
    Cluster(#[from] ActionError),

    #[error("Operation disabled: {0}")]
    OperationDisabled(String),

    // Executor errors
    #[error("Queue full: capacity {capacity} reached")]
    QueueFull { capacity: usize },

    #[error("Procedure executor is not initialized")]
    NotInitialized,

    #[error("Procedure executor stopped")]
    ExecutorStopped,

    #[error("Configuration invalid: {0}")]
    InvalidConfiguration(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcedureError {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the request was rejected because it can never succeed as issued.
    ///
    /// These are reported straight to the caller: no procedure was persisted and no
    /// nonce mapping was recorded, so fixing the request and resubmitting is safe.
    pub fn is_invalid_request(&self) -> bool {
        matches!(
            self,
            Self::TableNotFound { .. }
                | Self::TableExists { .. }
                | Self::TableState { .. }
                | Self::NamespaceNotFound { .. }
                | Self::NamespaceExists { .. }
                | Self::NamespaceNotEmpty { .. }
                | Self::RegionNotFound { .. }
                | Self::PeerNotFound { .. }
                | Self::PeerExists { .. }
                | Self::InvalidRequest(_)
                | Self::OperationDisabled(_)
        )
    }

    /// Check if the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(_)
            | Self::Database(_)
            | Self::Io(_)
            | Self::QueueFull { .. }
            | Self::NotInitialized
            | Self::WaitTimeout { .. } => true,

            Self::Cluster(e) => e.is_transient(),

            Self::Other(e) => !e.to_string().contains("fatal"),

            _ => false,
        }
    }

    /// Get suggested retry delay for this error
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            Self::QueueFull { .. } => Some(Duration::from_millis(100)),
            Self::NotInitialized => Some(Duration::from_secs(1)),
            Self::Database(_) | Self::Storage(_) => Some(Duration::from_secs(2)),
            Self::Io(_) => Some(Duration::from_secs(1)),
            _ if self.is_retryable() => Some(Duration::from_secs(3)),
            _ => None,
        }
    }
}

/// Result type alias for ProcedureError
pub type Result<T> = std::result::Result<T, ProcedureError>;

/// Failure reported by a cluster collaborator when a step invokes an action.
///
/// Steps return these as plain values; the executor decides whether the step is
/// retried or the procedure rolls back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// The action may succeed if issued again (RPC timeout, region in transition).
    #[error("transient failure in {action}: {message}")]
    Transient { action: String, message: String },

    /// The action can never succeed; the procedure must roll back.
    #[error("fatal failure in {action}: {message}")]
    Fatal { action: String, message: String },
}

impl ActionError {
    pub fn transient(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            action: action.into(),
            message: message.into(),
        }
    }

    pub fn fatal(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            action: action.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<String> for ProcedureError {
    fn from(s: String) -> Self {
        ProcedureError::Internal(s)
    }
}

impl From<&str> for ProcedureError {
    fn from(s: &str) -> Self {
        ProcedureError::Internal(s.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ProcedureError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ProcedureError::ExecutorStopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_requests_are_not_retryable() {
        let err = ProcedureError::TableNotFound {
            table: TableName::parse("t1"),
        };
        assert!(err.is_invalid_request());
        assert!(!err.is_retryable());
        assert_eq!(err.suggested_retry_delay(), None);

        let disabled = ProcedureError::OperationDisabled("split switch is off".into());
        assert!(disabled.is_invalid_request());
    }

    #[test]
    fn test_retry_delays() {
        let queue_full = ProcedureError::QueueFull { capacity: 1000 };
        assert!(queue_full.is_retryable());
        assert_eq!(
            queue_full.suggested_retry_delay(),
            Some(Duration::from_millis(100))
        );

        let io_err = ProcedureError::Io(io::Error::new(io::ErrorKind::TimedOut, "timeout"));
        assert_eq!(io_err.suggested_retry_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_error_display() {
        let err = ProcedureError::TableState {
            table: TableName::parse("ns1:orders"),
            expected: TableState::Disabled,
            actual: TableState::Enabled,
        };
        let display = err.to_string();
        assert!(display.contains("ns1:orders"));
        assert!(display.contains("Disabled"));
    }

    #[test]
    fn test_action_error_classification() {
        assert!(ActionError::transient("assign", "rpc timeout").is_transient());
        assert!(!ActionError::fatal("assign", "no servers").is_transient());
    }
}
