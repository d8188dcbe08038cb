use purple_core::ErrorKind;
use purple_core::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmppError {
    #[error("stanza parse failed: {0}")]
    ParseFailed(String),

    #[error("invalid JID: {0}")]
    InvalidJid(#[from] jid::Error),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("server offers no usable authentication mechanism: {0}")]
    AuthenticationImpossible(String),

    #[error("server requires encryption the transport cannot provide")]
    NoTls,

    #[error("resource conflict: {0}")]
    Conflict(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<minidom::Error> for XmppError {
    fn from(error: minidom::Error) -> Self {
        XmppError::ParseFailed(error.to_string())
    }
}

impl From<&XmppError> for ErrorKind {
    fn from(error: &XmppError) -> Self {
        match error {
            XmppError::ParseFailed(_) | XmppError::StreamError(_) => ErrorKind::NetworkError,
            XmppError::InvalidJid(_) => ErrorKind::InvalidUsername,
            XmppError::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            XmppError::AuthenticationImpossible(_) => ErrorKind::AuthenticationImpossible,
            XmppError::NoTls => ErrorKind::NoSslSupport,
            XmppError::Conflict(_) => ErrorKind::NameInUse,
            XmppError::Transport(transport) => ErrorKind::from(transport),
        }
    }
}

impl From<XmppError> for ErrorKind {
    fn from(error: XmppError) -> Self {
        ErrorKind::from(&error)
    }
}

#[derive(Debug, Error)]
pub enum CapsError {
    #[error("caps cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("caps cache is not valid XML: {0}")]
    Xml(#[from] minidom::Error),
}
