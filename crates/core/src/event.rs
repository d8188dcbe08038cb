use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::connection::{ConnectionId, ConnectionState};
use crate::error::{ErrorKind, EventBusError};

const DOMAINS: [&str; 6] = ["core", "connection", "buddy", "chat", "message", "gg"];

/// A dotted event channel such as `connection.signed-on`.
///
/// Segments are lowercase ASCII letters, digits and hyphens; the first
/// segment names one of the known domains.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, EventBusError> {
        let name = name.into();
        match Self::is_valid(&name) {
            true => Ok(Self(name)),
            false => Err(EventBusError::InvalidChannel(name)),
        }
    }

    pub fn is_valid(name: &str) -> bool {
        let domain_ok = name.split('.').next().is_some_and(|d| DOMAINS.contains(&d));
        domain_ok
            && name.split('.').all(|segment| {
                !segment.is_empty()
                    && segment
                        .bytes()
                        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
            })
    }

    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// One published event. Serialized in camelCase for UI consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub channel: Channel,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel,
            source,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Which component emitted an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventSource {
    Core,
    Xmpp,
    Gg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── Global events ─────────────────────────────────────────────
    /// The first connection overall reached Connected.
    Online,
    /// The last connected connection went away.
    Offline,
    /// A connection is ready for saved chats to be joined.
    Autojoin {
        connection: ConnectionId,
        account: String,
    },

    // ── Connection lifecycle ──────────────────────────────────────
    SigningOn {
        connection: ConnectionId,
        account: String,
    },
    SignedOn {
        connection: ConnectionId,
        account: String,
    },
    SigningOff {
        connection: ConnectionId,
        account: String,
    },
    SignedOff {
        connection: ConnectionId,
        account: String,
    },
    ConnectionError {
        connection: ConnectionId,
        account: String,
        kind: ErrorKind,
        description: String,
    },
    StateChanged {
        connection: ConnectionId,
        account: String,
        state: ConnectionState,
    },

    // ── Buddy / presence events ───────────────────────────────────
    BuddyStatusChanged {
        account: String,
        jid: String,
        resource: Option<String>,
        state: BuddyState,
        status: Option<String>,
        priority: i8,
        idle_seconds: Option<u64>,
    },
    BuddyError {
        account: String,
        jid: String,
        message: String,
    },
    BuddyCapabilitiesChanged {
        account: String,
        jid: String,
        features: Vec<String>,
    },
    BuddyNicknameChanged {
        account: String,
        jid: String,
        nickname: String,
    },
    BuddyMoodChanged {
        account: String,
        jid: String,
        mood: Option<String>,
        text: Option<String>,
    },
    BuddyTuneChanged {
        account: String,
        jid: String,
        tune: Option<Tune>,
    },
    AvatarUpdateNeeded {
        account: String,
        jid: String,
        hash: Option<String>,
    },
    AvatarUpdated {
        account: String,
        buddy: String,
        size: usize,
    },
    SubscriptionRequest {
        account: String,
        from: String,
    },
    SubscriptionChanged {
        account: String,
        jid: String,
        subscribed: bool,
    },

    // ── Chat room events ──────────────────────────────────────────
    ChatJoined {
        account: String,
        chat_id: u32,
        room: String,
        nick: String,
    },
    ChatJoinFailed {
        account: String,
        room: String,
        reason: String,
    },
    ChatError {
        account: String,
        chat_id: u32,
        message: String,
    },
    ChatSignedOff {
        account: String,
        chat_id: u32,
        room: String,
    },
    ChatConfigurationRequired {
        account: String,
        chat_id: u32,
        room: String,
    },
    ChatNickChanged {
        account: String,
        chat_id: u32,
        nick: String,
    },
    ChatMemberJoined {
        account: String,
        chat_id: u32,
        member: ChatMember,
        new_arrival: bool,
    },
    ChatMemberUpdated {
        account: String,
        chat_id: u32,
        member: ChatMember,
    },
    ChatMemberRenamed {
        account: String,
        chat_id: u32,
        old_nick: String,
        new_nick: String,
    },
    ChatMemberLeft {
        account: String,
        chat_id: u32,
        nick: String,
        reason: Option<String>,
    },
    ChatTopicChanged {
        account: String,
        chat_id: u32,
        who: Option<String>,
        topic: String,
    },
    ChatSystemMessage {
        account: String,
        chat_id: u32,
        text: String,
        no_log: bool,
    },

    // ── Message events ────────────────────────────────────────────
    MessageReceived {
        account: String,
        message: ChatMessage,
    },
    MessageSent {
        account: String,
        message: ChatMessage,
    },
    ChatStateReceived {
        account: String,
        from: String,
        state: ChatState,
    },
}

/// Presence state of a buddy resource, most available first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuddyState {
    Chat,
    Online,
    Away,
    ExtendedAway,
    DoNotDisturb,
    Unavailable,
    Unknown,
    Error,
}

impl BuddyState {
    pub fn is_available(self) -> bool {
        !matches!(
            self,
            BuddyState::Unavailable | BuddyState::Unknown | BuddyState::Error
        )
    }
}

/// A chat or room message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Option<String>,
    pub from: String,
    pub to: String,
    pub body: String,
    pub html: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub delayed: bool,
    pub message_type: MessageType,
    pub thread: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Normal,
    Chat,
    Groupchat,
    Headline,
    Error,
    Event,
}

/// XEP-0085 Chat State Notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChatState {
    Active,
    Composing,
    Paused,
    Inactive,
    Gone,
}

impl ChatState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatState::Active => "active",
            ChatState::Composing => "composing",
            ChatState::Paused => "paused",
            ChatState::Inactive => "inactive",
            ChatState::Gone => "gone",
        }
    }

    pub fn from_element_name(name: &str) -> Option<Self> {
        Some(match name {
            "active" => ChatState::Active,
            "composing" => ChatState::Composing,
            "paused" => ChatState::Paused,
            "inactive" => ChatState::Inactive,
            "gone" => ChatState::Gone,
            _ => return None,
        })
    }
}

/// An occupant of a chat room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMember {
    pub nick: String,
    pub jid: Option<String>,
    pub affiliation: Affiliation,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Affiliation {
    Owner,
    Admin,
    Member,
    Outcast,
    #[default]
    None,
}

impl Affiliation {
    pub fn parse(value: &str) -> Self {
        match value {
            "owner" => Affiliation::Owner,
            "admin" => Affiliation::Admin,
            "member" => Affiliation::Member,
            "outcast" => Affiliation::Outcast,
            _ => Affiliation::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Moderator,
    Participant,
    Visitor,
    #[default]
    None,
}

impl Role {
    pub fn parse(value: &str) -> Self {
        match value {
            "moderator" => Role::Moderator,
            "participant" => Role::Participant,
            "visitor" => Role::Visitor,
            _ => Role::None,
        }
    }
}

/// XEP-0118 User Tune.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tune {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub source: Option<String>,
    pub track: Option<String>,
    pub length: Option<u32>,
    pub uri: Option<String>,
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> std::result::Result<EventSubscription, EventBusError>;
}

/// Publish `payload` on `channel_name`, logging instead of failing.
///
/// Emission is fire-and-forget: a bus without subscribers is not an error.
pub fn emit(bus: &dyn EventBus, channel_name: &str, source: EventSource, payload: EventPayload) {
    let channel = match Channel::new(channel_name) {
        Ok(channel) => channel,
        Err(error) => {
            tracing::error!(%error, "refusing to emit on invalid channel");
            return;
        }
    };
    if let Err(error) = bus.publish(Event::new(channel, source, payload)) {
        tracing::warn!(channel = channel_name, %error, "event publish failed");
    }
}

/// All events flow through one broadcast sender, so a subscriber sees them
/// in emission order no matter which domains its pattern spans.
#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        Self {
            sender: broadcast::channel(channel_capacity.max(1)).0,
        }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError> {
        if !Channel::is_valid(event.channel.as_str()) {
            return Err(EventBusError::InvalidChannel(event.channel.into()));
        }
        // No receivers is fine.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> std::result::Result<EventSubscription, EventBusError> {
        let rejected = || EventBusError::InvalidPattern(pattern.to_string());
        let domain = pattern.split('.').next().unwrap_or_default();
        let literal = !domain.contains(GLOB_META);
        if domain.is_empty() || (literal && !DOMAINS.contains(&domain)) {
            return Err(rejected());
        }
        let matcher = Glob::new(pattern).map_err(|_| rejected())?.compile_matcher();
        Ok(EventSubscription {
            matcher,
            receiver: self.sender.subscribe(),
        })
    }
}

const GLOB_META: &[char] = &['*', '?', '[', ']', '{', '}', '!'];

/// A filtered view of the bus.
pub struct EventSubscription {
    matcher: GlobMatcher,
    receiver: broadcast::Receiver<Event>,
}

impl EventSubscription {
    fn wants(&self, event: &Event) -> bool {
        self.matcher.is_match(event.channel.as_str())
    }

    pub async fn recv(&mut self) -> std::result::Result<Event, EventBusError> {
        use broadcast::error::RecvError;
        loop {
            let event = self.receiver.recv().await.map_err(|error| match error {
                RecvError::Closed => EventBusError::ChannelClosed,
                RecvError::Lagged(skipped) => EventBusError::Lagged(skipped),
            })?;
            if self.wants(&event) {
                return Ok(event);
            }
        }
    }

    /// Next matching event that is already queued, if any.
    pub fn try_recv(&mut self) -> Option<Event> {
        use broadcast::error::TryRecvError;
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber fell behind");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
