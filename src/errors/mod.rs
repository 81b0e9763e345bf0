//! # Error Handling
//!
//! This module provides error handling for the trustplane control plane.
//! It defines custom error types using `thiserror` for all operations and the
//! single mapping from internal errors onto gRPC status codes.

use std::fmt;

/// Custom result type for trustplane operations
pub type Result<T> = std::result::Result<T, TrustplaneError>;

/// Main error type for the trustplane control plane
#[derive(thiserror::Error, Debug)]
pub enum TrustplaneError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Structural validation errors
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// Authentication and authorization errors
    #[error("Authentication error: {message}")]
    Auth { message: String, error_type: AuthErrorType },

    /// Certificate generation, parsing, and issuance errors
    #[error("Certificate error: {message}")]
    Certificate {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// TLS configuration and handshake errors
    #[error("TLS error: {message}")]
    Tls {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Network transport errors (gRPC dial, stream reset)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Resource not found errors
    #[error("Resource not found: {resource_type} with ID '{id}'")]
    NotFound { resource_type: String, id: String },

    /// Timeout errors
    #[error("Operation timed out: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Authentication error subtypes.
///
/// The subtype decides whether the failure surfaces as `Unauthenticated`
/// (the peer presented nothing usable) or `PermissionDenied` (the peer
/// presented a credential that was rejected).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorType {
    MissingPeerCertificate,
    MalformedIdentity,
    WrongTrustDomain,
    UnknownRole,
    RoleNotAllowed,
    IdentityMismatch,
    NotAllowlisted,
    InvalidToken,
    ExpiredToken,
    ConsumedToken,
    InvalidCredentials,
}

impl fmt::Display for AuthErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthErrorType::MissingPeerCertificate => "missing_peer_certificate",
            AuthErrorType::MalformedIdentity => "malformed_identity",
            AuthErrorType::WrongTrustDomain => "wrong_trust_domain",
            AuthErrorType::UnknownRole => "unknown_role",
            AuthErrorType::RoleNotAllowed => "role_not_allowed",
            AuthErrorType::IdentityMismatch => "identity_mismatch",
            AuthErrorType::NotAllowlisted => "not_allowlisted",
            AuthErrorType::InvalidToken => "invalid_token",
            AuthErrorType::ExpiredToken => "expired_token",
            AuthErrorType::ConsumedToken => "consumed_token",
            AuthErrorType::InvalidCredentials => "invalid_credentials",
        };
        write!(f, "{}", name)
    }
}

/// Alias used throughout the crate
pub type Error = TrustplaneError;

impl TrustplaneError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create an authentication error
    pub fn auth<S: Into<String>>(message: S, error_type: AuthErrorType) -> Self {
        Self::Auth { message: message.into(), error_type }
    }

    /// Create a certificate error
    pub fn certificate<S: Into<String>>(message: S) -> Self {
        Self::Certificate { message: message.into(), source: None }
    }

    /// Create a certificate error with source
    pub fn certificate_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Certificate { message: message.into(), source: Some(source) }
    }

    /// Create a TLS error
    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls { message: message.into(), source: None }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create a not found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::NotFound { resource_type: resource_type.into(), id: id.into() }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), duration_ms }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Create an internal error with source
    pub fn internal_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(source) }
    }

    /// The gRPC status code this error maps to when it crosses an RPC
    /// boundary.
    pub fn grpc_code(&self) -> tonic::Code {
        match self {
            TrustplaneError::Validation { .. } => tonic::Code::InvalidArgument,
            TrustplaneError::Auth { error_type, .. } => match error_type {
                AuthErrorType::MissingPeerCertificate | AuthErrorType::MalformedIdentity => {
                    tonic::Code::Unauthenticated
                }
                _ => tonic::Code::PermissionDenied,
            },
            TrustplaneError::Config { .. } => tonic::Code::FailedPrecondition,
            TrustplaneError::NotFound { .. } => tonic::Code::NotFound,
            TrustplaneError::Timeout { .. } => tonic::Code::DeadlineExceeded,
            TrustplaneError::Transport(_) => tonic::Code::Unavailable,
            TrustplaneError::Io { .. }
            | TrustplaneError::Serialization { .. }
            | TrustplaneError::Certificate { .. }
            | TrustplaneError::Tls { .. }
            | TrustplaneError::Internal { .. } => tonic::Code::Internal,
        }
    }

    /// Check if this error is worth retrying at the transport layer
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrustplaneError::Transport(_)
                | TrustplaneError::Io { .. }
                | TrustplaneError::Timeout { .. }
        )
    }
}

impl From<TrustplaneError> for tonic::Status {
    fn from(error: TrustplaneError) -> Self {
        tonic::Status::new(error.grpc_code(), error.to_string())
    }
}

// Error conversions for common external error types
impl From<std::io::Error> for TrustplaneError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_json::Error> for TrustplaneError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON serialization failed".to_string() }
    }
}

impl From<rcgen::Error> for TrustplaneError {
    fn from(error: rcgen::Error) -> Self {
        Self::certificate_with_source("Certificate generation failed", Box::new(error))
    }
}

impl From<rustls::Error> for TrustplaneError {
    fn from(error: rustls::Error) -> Self {
        Self::Tls { message: "TLS operation failed".to_string(), source: Some(Box::new(error)) }
    }
}

impl From<tonic::Status> for TrustplaneError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Unauthenticated => {
                Self::auth(status.message().to_string(), AuthErrorType::InvalidCredentials)
            }
            tonic::Code::PermissionDenied => {
                Self::auth(status.message().to_string(), AuthErrorType::InvalidToken)
            }
            tonic::Code::InvalidArgument => Self::validation(status.message().to_string()),
            _ => Self::Transport(format!("{}: {}", status.code(), status.message())),
        }
    }
}

impl From<tonic::transport::Error> for TrustplaneError {
    fn from(error: tonic::transport::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = TrustplaneError::config("Test configuration error");
        assert!(matches!(error, TrustplaneError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: Test configuration error");
    }

    #[test]
    fn test_validation_error() {
        let error = TrustplaneError::validation_field("Invalid id format", "id");
        assert!(matches!(error, TrustplaneError::Validation { .. }));
        if let TrustplaneError::Validation { field, .. } = error {
            assert_eq!(field, Some("id".to_string()));
        }
    }

    #[test]
    fn test_grpc_codes() {
        assert_eq!(TrustplaneError::validation("test").grpc_code(), tonic::Code::InvalidArgument);
        assert_eq!(
            TrustplaneError::auth("test", AuthErrorType::InvalidToken).grpc_code(),
            tonic::Code::PermissionDenied
        );
        assert_eq!(
            TrustplaneError::auth("test", AuthErrorType::MissingPeerCertificate).grpc_code(),
            tonic::Code::Unauthenticated
        );
        assert_eq!(TrustplaneError::config("test").grpc_code(), tonic::Code::FailedPrecondition);
        assert_eq!(TrustplaneError::internal("test").grpc_code(), tonic::Code::Internal);
        assert_eq!(TrustplaneError::transport("test").grpc_code(), tonic::Code::Unavailable);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TrustplaneError::timeout("dial", 1000).is_retryable());
        assert!(TrustplaneError::transport("reset").is_retryable());
        assert!(!TrustplaneError::validation("test").is_retryable());
        assert!(!TrustplaneError::auth("test", AuthErrorType::ConsumedToken).is_retryable());
    }

    #[test]
    fn test_status_round_trip() {
        let status: tonic::Status =
            TrustplaneError::auth("token already consumed", AuthErrorType::ConsumedToken).into();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
        assert!(status.message().contains("token already consumed"));
    }

    #[test]
    fn test_auth_error_type_display() {
        assert_eq!(AuthErrorType::InvalidToken.to_string(), "invalid_token");
        assert_eq!(AuthErrorType::MissingPeerCertificate.to_string(), "missing_peer_certificate");
        assert_eq!(AuthErrorType::IdentityMismatch.to_string(), "identity_mismatch");
    }
}
