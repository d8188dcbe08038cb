//! Hooks the core calls into the user interface and the credential store.
//!
//! All hooks are fire-and-forget: the core never consumes a return value
//! from them, so every method has an empty default body.

use crate::connection::ConnectionId;
use crate::error::ErrorKind;

pub trait ConnectionUiOps: Send + Sync {
    fn connected(&self, _connection: ConnectionId, _account: &str) {}

    fn disconnected(&self, _connection: ConnectionId, _account: &str) {}

    fn report_disconnect(
        &self,
        _connection: ConnectionId,
        _account: &str,
        _kind: ErrorKind,
        _description: &str,
    ) {
    }

    fn request_password(&self, _account: &str) {}

    fn notify_error(&self, _account: &str, _title: &str, _message: &str) {}

    /// Ask the user to pick one of `actions`.
    fn request_action(
        &self,
        _connection: ConnectionId,
        _title: &str,
        _message: &str,
        _actions: &[&str],
    ) {
    }

    /// Dismiss any dialogs or notifications scoped to this connection.
    fn close_requests(&self, _connection: ConnectionId) {}
}

/// UI ops for headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullUiOps;

impl ConnectionUiOps for NullUiOps {}

pub trait CredentialManager: Send + Sync {
    fn read_password(&self, account: &str) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialManager for NoCredentials {
    fn read_password(&self, _account: &str) -> Option<String> {
        None
    }
}
