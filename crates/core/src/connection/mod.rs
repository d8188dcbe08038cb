mod keepalive;
mod manager;

pub use keepalive::Keepalive;
pub use manager::ConnectionManager;

use std::ops::BitOr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::account::Password;
use crate::error::ErrorInfo;
use crate::protocol::ProtocolSession;

/// Opaque handle to a connection owned by the [`ConnectionManager`].
///
/// Handles may outlive the connection; lookups with a stale handle fail with
/// [`crate::PurpleError::StaleHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Capability and formatting hints a protocol sets on its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct ConnectionFlags(u32);

impl ConnectionFlags {
    pub const HTML: Self = Self(1 << 0);
    pub const NO_BGCOLOR: Self = Self(1 << 1);
    pub const AUTO_RESP: Self = Self(1 << 2);
    pub const FORMATTING_WBFO: Self = Self(1 << 3);
    pub const NO_NEWLINES: Self = Self(1 << 4);
    pub const NO_FONTSIZE: Self = Self(1 << 5);
    pub const NO_URLDESC: Self = Self(1 << 6);
    pub const NO_IMAGES: Self = Self(1 << 7);
    pub const ALLOW_CUSTOM_SMILEY: Self = Self(1 << 8);
    pub const SUPPORT_MOODS: Self = Self(1 << 9);
    pub const SUPPORT_MOOD_MESSAGES: Self = Self(1 << 10);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for ConnectionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One login attempt of one account.
pub struct Connection {
    id: ConnectionId,
    account: String,
    protocol: String,
    pub(crate) state: ConnectionState,
    pub(crate) flags: ConnectionFlags,
    pub(crate) error: Option<ErrorInfo>,
    pub(crate) wants_to_die: bool,
    pub(crate) display_name: Option<String>,
    pub(crate) password: Option<Password>,
    pub(crate) active_chats: Vec<u32>,
    pub(crate) keepalive: Option<Keepalive>,
    pub(crate) login_time: Option<DateTime<Utc>>,
    /// Set once the account's buddies were attached to the buddy list.
    pub(crate) attached_to_blist: bool,
    pub(crate) session: Option<Box<dyn ProtocolSession>>,
}

impl Connection {
    pub(crate) fn new(
        account: String,
        protocol: String,
        flags: ConnectionFlags,
        password: Option<Password>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            account,
            protocol,
            state: ConnectionState::Disconnected,
            flags,
            error: None,
            wants_to_die: false,
            display_name: None,
            password,
            active_chats: Vec::new(),
            keepalive: None,
            login_time: None,
            attached_to_blist: false,
            session: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn flags(&self) -> ConnectionFlags {
        self.flags
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    /// Whether automatic reconnection should be suppressed.
    pub fn wants_to_die(&self) -> bool {
        self.wants_to_die
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn active_chats(&self) -> &[u32] {
        &self.active_chats
    }

    pub fn keepalive(&self) -> Option<&Keepalive> {
        self.keepalive.as_ref()
    }

    pub fn login_time(&self) -> Option<DateTime<Utc>> {
        self.login_time
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("account", &self.account)
            .field("protocol", &self.protocol)
            .field("state", &self.state)
            .field("error", &self.error)
            .field("wants_to_die", &self.wants_to_die)
            .field("active_chats", &self.active_chats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_and_remove() {
        let mut flags = ConnectionFlags::HTML | ConnectionFlags::NO_BGCOLOR;
        assert!(flags.contains(ConnectionFlags::HTML));
        assert!(!flags.contains(ConnectionFlags::NO_IMAGES));

        flags.insert(ConnectionFlags::NO_IMAGES);
        flags.remove(ConnectionFlags::HTML);
        assert!(flags.contains(ConnectionFlags::NO_IMAGES | ConnectionFlags::NO_BGCOLOR));
        assert!(!flags.contains(ConnectionFlags::HTML));
    }

    #[test]
    fn new_connection_starts_disconnected() {
        let connection = Connection::new(
            "alice@example.com".into(),
            "xmpp".into(),
            ConnectionFlags::empty(),
            None,
        );
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!connection.is_live());
        assert!(connection.error().is_none());
        assert!(!connection.wants_to_die());
    }
}
