//! Decoded GG server events and the packets a session asks to have sent.
//! The binary codec sits on the other side of these channels.

use chrono::{DateTime, Utc};
use purple_core::account::Password;
use purple_core::event::BuddyState;

use crate::error::LoginFailure;

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    LoginOk,
    LoginFailed(LoginFailure),
    Status {
        uin: u32,
        state: BuddyState,
        description: Option<String>,
        /// Timestamp of the buddy's current avatar, when advertised.
        avatar_timestamp: Option<i64>,
    },
    Message {
        from: u32,
        text: String,
        time: DateTime<Utc>,
    },
    ConferenceInfo {
        id: u64,
        version: u32,
        participants: Vec<u32>,
    },
    ConferenceJoined {
        id: u64,
        uin: u32,
    },
    ConferenceLeft {
        id: u64,
        uin: u32,
    },
    ConferenceMessage {
        id: u64,
        from: u32,
        text: String,
        time: DateTime<Utc>,
    },
    /// The server is about to drop us.
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    Login { uin: u32, password: Password },
    Ping,
    Logoff,
    SendMessage { to: u32, text: String },
    CreateConference { participants: Vec<u32> },
    SendConference { id: u64, text: String },
    LeaveConference { id: u64 },
}
