//! Error types for the native Tor client
//!
//! This module provides the error taxonomy shared by every layer:
//! - Detailed error variants for different failure modes
//! - Error classification (fatal vs retryable)
//! - User-friendly messages
//! - Error codes for programmatic handling

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Connection errors (1xx)
    ConnectionFailed = 100,
    ConnectionTimeout = 101,
    ConnectionRefused = 102,

    // Protocol errors (2xx)
    ProtocolViolation = 200,
    UnexpectedCell = 201,
    DigestMismatch = 202,
    HandshakeFailed = 203,
    MalformedCell = 204,

    // Circuit errors (3xx)
    CircuitBuildFailed = 300,
    CircuitDestroyed = 301,
    CircuitExtendFailed = 302,
    StreamFailed = 303,
    StreamClosed = 304,

    // Security errors (4xx) - FATAL
    CertificateError = 400,
    EntropyError = 402,
    AuthVerificationFailed = 403,

    // Cryptographic errors (5xx)
    CryptoError = 500,
    KeyDerivationFailed = 501,

    // Directory/Consensus errors (6xx)
    DirectoryError = 600,
    DirectoryUnavailable = 601,
    NoRelaysAvailable = 602,

    // Configuration errors (8xx)
    ConfigError = 800,
    InvalidRelay = 801,

    // Internal errors (9xx)
    InternalError = 900,
    ResourceExhausted = 901,
}

/// Main error type for the Tor client
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Connection Errors =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    // ===== Protocol Errors =====
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Malformed cell: {0}")]
    MalformedCell(String),

    #[error("Unexpected cell: expected {expected}, got {got}")]
    UnexpectedCell { expected: String, got: String },

    #[error("Digest mismatch in relay cell")]
    DigestMismatch,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    // ===== Circuit Errors =====
    #[error("Failed to extend circuit at hop {hop} ({relay}): {reason}")]
    CircuitExtend {
        hop: usize,
        relay: String,
        reason: String,
    },

    #[error("Circuit build failed after {hops_built} hop(s): {source}")]
    CircuitBuild {
        hops_built: usize,
        source: Box<TorError>,
    },

    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("Circuit closed: {0}")]
    CircuitClosed(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Stream closed: {0}")]
    StreamClosed(String),

    // ===== Security Errors (FATAL) =====
    #[error("Certificate verification failed: {0}")]
    CertificateError(String),

    #[error("Entropy/RNG failure: {0}")]
    EntropyError(String),

    #[error("Auth verification failed: {0}")]
    AuthVerificationFailed(String),

    // ===== Cryptographic Errors =====
    #[error("Crypto: {0}")]
    Crypto(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    // ===== Directory/Consensus Errors =====
    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("No relays available: {0}")]
    NoRelaysAvailable(String),

    // ===== Configuration Errors =====
    #[error("Invalid relay: {0}")]
    InvalidRelay(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ===== Network Errors =====
    #[error("Network error: {0}")]
    Network(String),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl TorError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            // Connection
            TorError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            TorError::Timeout(_) => ErrorCode::ConnectionTimeout,
            TorError::ConnectionRefused(_) => ErrorCode::ConnectionRefused,

            // Protocol
            TorError::ProtocolError(_) => ErrorCode::ProtocolViolation,
            TorError::MalformedCell(_) => ErrorCode::MalformedCell,
            TorError::UnexpectedCell { .. } => ErrorCode::UnexpectedCell,
            TorError::DigestMismatch => ErrorCode::DigestMismatch,
            TorError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,

            // Circuit
            TorError::CircuitExtend { .. } => ErrorCode::CircuitExtendFailed,
            TorError::CircuitBuild { .. } => ErrorCode::CircuitBuildFailed,
            TorError::CircuitDestroyed { .. } => ErrorCode::CircuitDestroyed,
            TorError::CircuitClosed(_) => ErrorCode::CircuitDestroyed,
            TorError::Stream(_) => ErrorCode::StreamFailed,
            TorError::StreamClosed(_) => ErrorCode::StreamClosed,

            // Security (fatal)
            TorError::CertificateError(_) => ErrorCode::CertificateError,
            TorError::EntropyError(_) => ErrorCode::EntropyError,
            TorError::AuthVerificationFailed(_) => ErrorCode::AuthVerificationFailed,

            // Crypto
            TorError::Crypto(_) => ErrorCode::CryptoError,
            TorError::KeyDerivationFailed(_) => ErrorCode::KeyDerivationFailed,

            // Directory
            TorError::Directory(_) => ErrorCode::DirectoryError,
            TorError::DirectoryUnavailable(_) => ErrorCode::DirectoryUnavailable,
            TorError::NoRelaysAvailable(_) => ErrorCode::NoRelaysAvailable,

            // Config
            TorError::InvalidRelay(_) => ErrorCode::InvalidRelay,
            TorError::Config(_) | TorError::ParseError(_) => ErrorCode::ConfigError,

            // Network
            TorError::Network(_) => ErrorCode::ConnectionFailed,

            // Internal
            TorError::Internal(_) | TorError::InvalidState(_) => ErrorCode::InternalError,
            TorError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
        }
    }

    /// Whether this error is fatal (should abort the entire client)
    ///
    /// Fatal errors indicate security problems or unrecoverable states.
    pub fn is_fatal(&self) -> bool {
        match self {
            TorError::CertificateError(_)
            | TorError::EntropyError(_)
            | TorError::AuthVerificationFailed(_) => true,
            TorError::CircuitBuild { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Whether this error can be retried with different relays
    pub fn is_retryable(&self) -> bool {
        match self {
            TorError::ConnectionFailed(_)
            | TorError::Timeout(_)
            | TorError::ConnectionRefused(_)
            | TorError::CircuitExtend { .. }
            | TorError::CircuitDestroyed { .. }
            | TorError::CircuitClosed(_)
            | TorError::Network(_)
            | TorError::HandshakeFailed(_)
            | TorError::DirectoryUnavailable(_)
            | TorError::Stream(_) => true,
            TorError::CircuitBuild { source, .. } => !source.is_fatal(),
            _ => false,
        }
    }

    /// Get a user-friendly message for display
    pub fn user_message(&self) -> String {
        match self {
            TorError::ConnectionFailed(_) | TorError::Network(_) => {
                "Failed to connect to the Tor network. Please check your internet connection."
                    .into()
            }
            TorError::Timeout(_) => {
                "Operation timed out. The Tor network may be slow or unreachable.".into()
            }
            TorError::ConnectionRefused(_) => {
                "Connection was refused. The relay may be offline.".into()
            }
            TorError::ProtocolError(_)
            | TorError::MalformedCell(_)
            | TorError::UnexpectedCell { .. }
            | TorError::DigestMismatch => "Received invalid data from the Tor network.".into(),
            TorError::HandshakeFailed(_) => {
                "Failed to establish secure connection. Please try again.".into()
            }
            TorError::CircuitExtend { .. } | TorError::CircuitBuild { .. } => {
                "Failed to build a circuit. Please try again.".into()
            }
            TorError::CircuitDestroyed { reason, .. } => format!(
                "Your circuit was closed by a relay (reason {}). Please try again.",
                reason
            ),
            TorError::CircuitClosed(_) => "Your circuit was closed. Please try again.".into(),
            TorError::Stream(_) | TorError::StreamClosed(_) => {
                "Data transfer failed. Please try again.".into()
            }
            TorError::CertificateError(_) => {
                "SECURITY ERROR: Relay certificate verification failed. Do not continue!".into()
            }
            TorError::EntropyError(_) => {
                "SECURITY ERROR: Random number generation failed. Do not continue!".into()
            }
            TorError::AuthVerificationFailed(_) => {
                "SECURITY ERROR: Authentication verification failed. Do not continue!".into()
            }
            TorError::Crypto(_) | TorError::KeyDerivationFailed(_) => {
                "A cryptographic error occurred. Please try again.".into()
            }
            TorError::Directory(_) | TorError::DirectoryUnavailable(_) => {
                "Failed to fetch the Tor network directory. Please try again.".into()
            }
            TorError::NoRelaysAvailable(_) => {
                "No suitable relays are available. Please try again later.".into()
            }
            TorError::InvalidRelay(_) | TorError::Config(_) | TorError::ParseError(_) => {
                "Invalid configuration. Please check your settings.".into()
            }
            TorError::Internal(_) | TorError::InvalidState(_) => {
                "An internal error occurred. Please report this bug.".into()
            }
            TorError::ResourceExhausted(_) => {
                "Too many open streams or circuits. Please wait and try again.".into()
            }
        }
    }

    /// Create a CircuitDestroyed error with the reason name
    pub fn circuit_destroyed(reason: u8) -> Self {
        TorError::CircuitDestroyed {
            reason,
            reason_name: destroy_reason_name(reason).to_string(),
        }
    }

    /// Wrap a hop failure into a build failure
    pub fn circuit_build(hops_built: usize, source: TorError) -> Self {
        TorError::CircuitBuild {
            hops_built,
            source: Box::new(source),
        }
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        TorError::Timeout(what.into())
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            TorError::Timeout(_) => true,
            TorError::CircuitBuild { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

/// Names for DESTROY / TRUNCATED reason codes (tor-spec 5.4)
pub fn destroy_reason_name(reason: u8) -> &'static str {
    match reason {
        0 => "NONE",
        1 => "PROTOCOL",
        2 => "INTERNAL",
        3 => "REQUESTED",
        4 => "HIBERNATING",
        5 => "RESOURCELIMIT",
        6 => "CONNECTFAILED",
        7 => "OR_IDENTITY",
        8 => "CHANNEL_CLOSED",
        9 => "FINISHED",
        10 => "TIMEOUT",
        11 => "DESTROYED",
        12 => "NOSUCHSERVICE",
        _ => "UNKNOWN",
    }
}

impl From<std::io::Error> for TorError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TorError::Timeout(err.to_string()),
            ErrorKind::ConnectionRefused => TorError::ConnectionRefused(err.to_string()),
            _ => TorError::Network(err.to_string()),
        }
    }
}

impl From<TorError> for std::io::Error {
    fn from(err: TorError) -> Self {
        use std::io::ErrorKind;
        let kind = match &err {
            TorError::Timeout(_) => ErrorKind::TimedOut,
            TorError::StreamClosed(_) | TorError::CircuitClosed(_) => ErrorKind::NotConnected,
            TorError::CircuitDestroyed { .. } => ErrorKind::ConnectionAborted,
            TorError::ConnectionRefused(_) => ErrorKind::ConnectionRefused,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(TorError::CertificateError("test".into()).is_fatal());
        assert!(TorError::EntropyError("test".into()).is_fatal());
        assert!(TorError::AuthVerificationFailed("test".into()).is_fatal());

        // Non-fatal errors
        assert!(!TorError::ConnectionFailed("test".into()).is_fatal());
        assert!(!TorError::timeout("read").is_fatal());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TorError::ConnectionFailed("test".into()).is_retryable());
        assert!(TorError::timeout("hop 2").is_retryable());
        assert!(TorError::DirectoryUnavailable("all authorities".into()).is_retryable());

        // Non-retryable errors
        assert!(!TorError::CertificateError("test".into()).is_retryable());
        assert!(!TorError::MalformedCell("len".into()).is_retryable());
    }

    #[test]
    fn test_build_error_classification_follows_source() {
        let err = TorError::circuit_build(1, TorError::timeout("CREATED2"));
        assert!(err.is_retryable());
        assert!(err.is_timeout());
        assert_eq!(err.code(), ErrorCode::CircuitBuildFailed);

        let fatal = TorError::circuit_build(2, TorError::AuthVerificationFailed("auth".into()));
        assert!(fatal.is_fatal());
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TorError::ConnectionFailed("test".into()).code(),
            ErrorCode::ConnectionFailed
        );
        assert_eq!(TorError::timeout("x").code(), ErrorCode::ConnectionTimeout);
        assert_eq!(
            TorError::CircuitExtend {
                hop: 2,
                relay: "relay2".into(),
                reason: "timeout".into()
            }
            .code(),
            ErrorCode::CircuitExtendFailed
        );
    }

    #[test]
    fn test_circuit_destroyed() {
        let err = TorError::circuit_destroyed(1);
        if let TorError::CircuitDestroyed {
            reason,
            reason_name,
        } = err
        {
            assert_eq!(reason, 1);
            assert_eq!(reason_name, "PROTOCOL");
        } else {
            panic!("Expected CircuitDestroyed");
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(TorError::from(io), TorError::Timeout(_)));

        let back: std::io::Error = TorError::StreamClosed("closed".into()).into();
        assert_eq!(back.kind(), std::io::ErrorKind::NotConnected);
    }
}
