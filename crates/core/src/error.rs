use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::ConnectionId;

/// The universal error type for the purple core.
#[derive(Error, Debug)]
pub enum PurpleError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("connection handle {0} is no longer live")]
    StaleHandle(ConnectionId),

    #[error("account {0} already has a live connection")]
    AlreadyConnected(String),

    #[error("account {0} requires a password and none is available")]
    PasswordRequired(String),

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("no protocol registered for id {0}")]
    UnknownProtocol(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PurpleError {
    /// The connection error kind this failure corresponds to, if any.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            PurpleError::PasswordRequired(_) | PurpleError::Config(_) => {
                Some(ErrorKind::InvalidSettings)
            }
            PurpleError::Io(error) => Some(ErrorKind::from_io(error)),
            _ => None,
        }
    }
}

/// A specialized Result type for purple core operations.
pub type Result<T> = std::result::Result<T, PurpleError>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum EventBusError {
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),
}

/// Why a connection ended up in an error state.
///
/// Protocol crates translate their own failures into one of these kinds at
/// their boundary; the state machine never sees library-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NetworkError,
    InvalidUsername,
    AuthenticationFailed,
    AuthenticationImpossible,
    NoSslSupport,
    EncryptionError,
    NameInUse,
    InvalidSettings,
    CertNotProvided,
    CertUntrusted,
    CertExpired,
    CertNotActivated,
    CertHostnameMismatch,
    CertFingerprintMismatch,
    CertSelfSigned,
    CertOtherError,
    CustomTemporary,
    CustomFatal,
    OtherError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 19] = [
        ErrorKind::NetworkError,
        ErrorKind::InvalidUsername,
        ErrorKind::AuthenticationFailed,
        ErrorKind::AuthenticationImpossible,
        ErrorKind::NoSslSupport,
        ErrorKind::EncryptionError,
        ErrorKind::NameInUse,
        ErrorKind::InvalidSettings,
        ErrorKind::CertNotProvided,
        ErrorKind::CertUntrusted,
        ErrorKind::CertExpired,
        ErrorKind::CertNotActivated,
        ErrorKind::CertHostnameMismatch,
        ErrorKind::CertFingerprintMismatch,
        ErrorKind::CertSelfSigned,
        ErrorKind::CertOtherError,
        ErrorKind::CustomTemporary,
        ErrorKind::CustomFatal,
        ErrorKind::OtherError,
    ];

    /// Whether an error of this kind should suppress automatic reconnection.
    pub fn is_fatal(self) -> bool {
        match self {
            ErrorKind::NetworkError | ErrorKind::EncryptionError | ErrorKind::CustomTemporary => {
                false
            }
            ErrorKind::InvalidUsername
            | ErrorKind::AuthenticationFailed
            | ErrorKind::AuthenticationImpossible
            | ErrorKind::NoSslSupport
            | ErrorKind::NameInUse
            | ErrorKind::InvalidSettings
            | ErrorKind::CertNotProvided
            | ErrorKind::CertUntrusted
            | ErrorKind::CertExpired
            | ErrorKind::CertNotActivated
            | ErrorKind::CertHostnameMismatch
            | ErrorKind::CertFingerprintMismatch
            | ErrorKind::CertSelfSigned
            | ErrorKind::CertOtherError
            | ErrorKind::CustomFatal
            | ErrorKind::OtherError => true,
        }
    }

    pub fn is_certificate_error(self) -> bool {
        matches!(
            self,
            ErrorKind::CertNotProvided
                | ErrorKind::CertUntrusted
                | ErrorKind::CertExpired
                | ErrorKind::CertNotActivated
                | ErrorKind::CertHostnameMismatch
                | ErrorKind::CertFingerprintMismatch
                | ErrorKind::CertSelfSigned
                | ErrorKind::CertOtherError
        )
    }

    /// Map an I/O failure from a transport into the taxonomy.
    pub fn from_io(error: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match error.kind() {
            Io::InvalidData => ErrorKind::EncryptionError,
            Io::PermissionDenied => ErrorKind::OtherError,
            _ => ErrorKind::NetworkError,
        }
    }
}

/// An immutable connection error: what went wrong and a human-readable
/// description of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    kind: ErrorKind,
    description: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.description)
    }
}
