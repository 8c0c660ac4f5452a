use thiserror::Error;

/// Custom error types for the Round Table server
#[derive(Debug, Error)]
pub enum TableError {
    /// Session and seat management errors
    #[error("Table {0} not found")]
    TableNotFound(String),

    #[error("Invalid seat token: {0}")]
    InvalidSeat(String),

    #[error("Knight {0} already registered")]
    DuplicateKnight(String),

    #[error("Source {0} not found")]
    SourceNotFound(String),

    /// Media broker errors, opaque cause preserved
    #[error("Media broker failure: {0}")]
    Broker(String),

    /// Signaling errors
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Convenience type alias for Results using TableError
pub type Result<T> = std::result::Result<T, TableError>;

impl TableError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        TableError::Protocol(msg.into())
    }
}

impl From<crate::broker::BrokerError> for TableError {
    fn from(err: crate::broker::BrokerError) -> Self {
        TableError::Broker(err.to_string())
    }
}
