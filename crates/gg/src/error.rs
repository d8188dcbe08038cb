use purple_core::ErrorKind;
use thiserror::Error;

/// Why the GG server turned a login attempt down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailure {
    Password,
    /// Too many failed attempts from this address.
    Intruder,
    Unavailable,
    Connecting,
    Invalid,
    Reading,
    Writing,
    Hub,
    Proxy,
    Tls,
    Internal,
}

impl LoginFailure {
    pub fn description(self) -> &'static str {
        match self {
            LoginFailure::Password => "Incorrect password",
            LoginFailure::Intruder => "Too many failed login attempts",
            LoginFailure::Unavailable => "Service temporarily unavailable",
            LoginFailure::Connecting => "Unable to connect",
            LoginFailure::Invalid => "Server sent an invalid response",
            LoginFailure::Reading => "Error reading from socket",
            LoginFailure::Writing => "Error writing to socket",
            LoginFailure::Hub => "Unable to reach the GG hub",
            LoginFailure::Proxy => "Unable to connect through the proxy",
            LoginFailure::Tls => "Unable to establish a TLS connection",
            LoginFailure::Internal => "Internal error",
        }
    }
}

impl From<LoginFailure> for ErrorKind {
    fn from(failure: LoginFailure) -> Self {
        match failure {
            LoginFailure::Password | LoginFailure::Intruder => ErrorKind::AuthenticationFailed,
            LoginFailure::Tls => ErrorKind::EncryptionError,
            LoginFailure::Internal => ErrorKind::OtherError,
            LoginFailure::Unavailable
            | LoginFailure::Connecting
            | LoginFailure::Invalid
            | LoginFailure::Reading
            | LoginFailure::Writing
            | LoginFailure::Hub
            | LoginFailure::Proxy => ErrorKind::NetworkError,
        }
    }
}

#[derive(Debug, Error)]
pub enum GgError {
    #[error("invalid GG number: {0}")]
    InvalidUin(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} answered with status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("malformed response from {endpoint}: {reason}")]
    Malformed { endpoint: String, reason: String },

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("{}", .0.description())]
    Login(LoginFailure),

    #[error("session closed before the request completed")]
    Cancelled,
}

impl From<&GgError> for ErrorKind {
    fn from(error: &GgError) -> Self {
        match error {
            GgError::InvalidUin(_) => ErrorKind::InvalidUsername,
            GgError::Status { status: 401 | 403, .. } => ErrorKind::AuthenticationFailed,
            GgError::Login(failure) => ErrorKind::from(*failure),
            GgError::Url(_) => ErrorKind::InvalidSettings,
            GgError::Http(_)
            | GgError::Status { .. }
            | GgError::Malformed { .. }
            | GgError::Cancelled => ErrorKind::NetworkError,
        }
    }
}

pub type Result<T> = std::result::Result<T, GgError>;
