//! Error types for petsit-sync

use thiserror::Error;

/// Result type alias using petsit-sync's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the domain services
#[derive(Error, Debug)]
pub enum Error {
    /// Local persistence failed; the triggering operation did not complete
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Transient network failure (timeout, unreachable host, 5xx); safe to retry
    #[error("Network error: {0}")]
    Network(String),

    /// The server validated and refused the request; retrying will not help
    #[error("Rejected by server: {message}")]
    Rejected {
        status: Option<u16>,
        message: String,
    },

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Client configuration is unusable
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Whether the UI may offer (or perform) an automatic retry.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<ClientError> for Error {
    fn from(value: ClientError) -> Self {
        match value {
            ClientError::Network(message) => Self::Network(message),
            ClientError::Rejected { status, message } => Self::Rejected { status, message },
            ClientError::Configuration(message) => Self::Configuration(message),
        }
    }
}

/// Local store failures
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Record JSON could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A previous panic left the store lock poisoned
    #[error("Store lock poisoned")]
    Poisoned,
}

/// Failures establishing the live push connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Invalid push URL: {0}")]
    InvalidUrl(String),
    #[error("Push handshake failed: {0}")]
    Handshake(String),
    #[error("Push transport unreachable and no polling fallback is configured: {0}")]
    Unreachable(String),
}

/// Failures reported by the REST client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Rejected by server: {message}")]
    Rejected {
        status: Option<u16>,
        message: String,
    },
    #[error("Invalid client configuration: {0}")]
    Configuration(String),
}

impl ClientError {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::Network(format!("request timed out: {error}"));
        }
        if error.is_decode() {
            return Self::Rejected {
                status: error.status().map(|status| status.as_u16()),
                message: format!("malformed response body: {error}"),
            };
        }
        if error.is_builder() {
            return Self::Configuration(error.to_string());
        }
        Self::Network(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(Error::Network("timeout".to_string()).is_retryable());
        assert!(!Error::Rejected {
            status: Some(422),
            message: "text is required".to_string()
        }
        .is_retryable());
        assert!(!Error::Storage(StorageError::Poisoned).is_retryable());
    }

    #[test]
    fn client_errors_map_onto_service_errors() {
        let error: Error = ClientError::Rejected {
            status: Some(403),
            message: "forbidden".to_string(),
        }
        .into();
        assert!(matches!(error, Error::Rejected { status: Some(403), .. }));

        let error: Error = ClientError::Network("reset".to_string()).into();
        assert!(error.is_retryable());
    }
}
