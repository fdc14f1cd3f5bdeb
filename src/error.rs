/// Error handling for the PendingDNS core
use thiserror::Error;

/// Result type for PendingDNS operations
pub type Result<T> = std::result::Result<T, DnsError>;

/// Error types for the core subsystems
#[derive(Error, Debug)]
pub enum DnsError {
    /// Rejected caller input (bad domain, unknown type, invalid id)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Logical not-found (404 / NXDOMAIN-like)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Zone store / key store unreachable or misbehaving
    #[error("Storage error: {0}")]
    Storage(String),

    /// Upstream DNS or ACME refusal/timeout
    #[error("External error: {0}")]
    External(String),

    /// Response exceeded the datagram budget
    #[error("Message too large: {0} bytes")]
    MessageSize(usize),

    /// ACME order or account error
    #[error("ACME error: {0}")]
    Acme(String),

    /// Certificate parsing or TLS setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// DNS wire format error
    #[error("Protocol error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),
}

impl DnsError {
    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        DnsError::InvalidInput(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        DnsError::NotFound(msg.into())
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        DnsError::Storage(msg.into())
    }

    /// Create an external error
    pub fn external<S: Into<String>>(msg: S) -> Self {
        DnsError::External(msg.into())
    }

    /// Create an ACME error
    pub fn acme<S: Into<String>>(msg: S) -> Self {
        DnsError::Acme(msg.into())
    }

    /// Create a TLS error
    pub fn tls<S: Into<String>>(msg: S) -> Self {
        DnsError::Tls(msg.into())
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        DnsError::Configuration(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        DnsError::Timeout(msg.into())
    }
}

impl From<redis::RedisError> for DnsError {
    fn from(err: redis::RedisError) -> Self {
        DnsError::Storage(err.to_string())
    }
}

impl From<instant_acme::Error> for DnsError {
    fn from(err: instant_acme::Error) -> Self {
        DnsError::Acme(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DnsError::invalid_input("bad domain");
        assert_eq!(err.to_string(), "Invalid input: bad domain");

        let err = DnsError::storage("connection refused");
        assert!(err.to_string().contains("connection refused"));
    }
}
