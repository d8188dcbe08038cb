use crate::error::ErrorKind;

pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub require_tls: bool,
    pub timeout_seconds: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("certificate rejected: {0}")]
    CertificateRejected(String),

    #[error("connection timeout")]
    Timeout,

    #[error("connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<&TransportError> for ErrorKind {
    fn from(error: &TransportError) -> Self {
        match error {
            TransportError::DnsResolutionFailed(_)
            | TransportError::Timeout
            | TransportError::Closed => ErrorKind::NetworkError,
            TransportError::TlsHandshakeFailed(_) => ErrorKind::EncryptionError,
            TransportError::CertificateRejected(_) => ErrorKind::CertUntrusted,
            TransportError::Io(io) => ErrorKind::from_io(io),
        }
    }
}

/// Abstract bidirectional frame stream.
///
/// The core depends only on this interface; concrete socket, TLS and
/// WebSocket implementations live with the embedding application.
pub trait Transport: Send + 'static {
    fn connect(
        config: &TransportConfig,
    ) -> impl Future<Output = Result<Self, TransportError>> + Send
    where
        Self: Sized;

    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next complete frame (for XMPP, one top-level stanza).
    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    fn start_tls(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_into_taxonomy() {
        assert_eq!(
            ErrorKind::from(&TransportError::Timeout),
            ErrorKind::NetworkError
        );
        assert_eq!(
            ErrorKind::from(&TransportError::TlsHandshakeFailed("bad record".into())),
            ErrorKind::EncryptionError
        );
        assert_eq!(
            ErrorKind::from(&TransportError::CertificateRejected("self signed".into())),
            ErrorKind::CertUntrusted
        );
    }
}
