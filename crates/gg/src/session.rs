//! The GG protocol session. Server events arrive already decoded; work that
//! needs I/O is queued as [`Task`]s for the driver in [`crate::client`].

use std::any::Any;
use std::collections::HashMap;
use std::time::Duration;

use purple_core::account::{Account, Password};
use purple_core::config::GgConfig;
use purple_core::event::{
    BuddyState, ChatMember, ChatMessage, EventPayload, EventSource, MessageType,
};
use purple_core::protocol::{
    HookContext, PasswordPolicy, ProtocolError, ProtocolOptions, ProtocolPlugin, ProtocolSession,
};
use purple_core::{ConnectionFlags, ConnectionState, ErrorKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::avatar::{AvatarQueue, AvatarUpdate, FetchedAvatar, Liveness};
use crate::chat::ConferenceRegistry;
use crate::error::GgError;
use crate::oauth::Token;
use crate::packet::{ClientPacket, ServerEvent};

pub const PROTOCOL_ID: &str = "gg";

pub(crate) fn emit(ctx: &HookContext<'_>, channel: &str, payload: EventPayload) {
    ctx.emit(channel, EventSource::Gg, payload);
}

/// Parse a GG number. Zero is not a valid account.
pub fn parse_uin(username: &str) -> Result<u32, GgError> {
    match username.trim().parse::<u32>() {
        Ok(uin) if uin > 0 => Ok(uin),
        _ => Err(GgError::InvalidUin(username.to_string())),
    }
}

/// Work the session hands to its driver.
#[derive(Debug)]
pub enum Task {
    Send(ClientPacket),
    FetchAvatar {
        uin: u32,
        known: Option<i64>,
    },
    UploadAvatar {
        uin: u32,
        password: Password,
        token: Option<Token>,
        image: Vec<u8>,
    },
    /// Stop after everything queued before it.
    Close,
}

/// Finished driver work coming back to the session.
#[derive(Debug)]
pub enum Completion {
    Avatar(FetchedAvatar),
    Upload {
        token: Option<Token>,
        result: Result<(), GgError>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GgBuddy {
    pub state: BuddyState,
    pub description: Option<String>,
    pub avatar: Option<Vec<u8>>,
}

pub struct GgSession {
    uin: Option<u32>,
    account: String,
    password: Option<Password>,
    signed_in: bool,
    buddies: HashMap<u32, GgBuddy>,
    conferences: ConferenceRegistry,
    avatars: AvatarQueue,
    token: Option<Token>,
    live: Liveness,
    tasks: mpsc::UnboundedSender<Task>,
    tasks_rx: Option<mpsc::UnboundedReceiver<Task>>,
}

impl std::fmt::Debug for GgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GgSession")
            .field("uin", &self.uin)
            .field("signed_in", &self.signed_in)
            .field("buddies", &self.buddies.len())
            .field("conferences", &self.conferences.len())
            .finish_non_exhaustive()
    }
}

impl GgSession {
    pub fn new(account: &Account) -> Self {
        let uin = match parse_uin(&account.username) {
            Ok(uin) => Some(uin),
            Err(error) => {
                warn!(%error, "account name is not a GG number");
                None
            }
        };
        let (tasks, tasks_rx) = mpsc::unbounded_channel();
        Self {
            uin,
            account: account.username.clone(),
            password: None,
            signed_in: false,
            buddies: HashMap::new(),
            conferences: ConferenceRegistry::new(),
            avatars: AvatarQueue::new(),
            token: None,
            live: Liveness::new(),
            tasks,
            tasks_rx: Some(tasks_rx),
        }
    }

    pub fn uin(&self) -> Option<u32> {
        self.uin
    }

    pub fn is_signed_in(&self) -> bool {
        self.signed_in
    }

    /// The task queue; handed out once, to the driver.
    pub fn take_tasks(&mut self) -> Option<mpsc::UnboundedReceiver<Task>> {
        self.tasks_rx.take()
    }

    pub fn liveness(&self) -> Liveness {
        self.live.clone()
    }

    pub fn buddy(&self, uin: u32) -> Option<&GgBuddy> {
        self.buddies.get(&uin)
    }

    pub fn conferences(&self) -> &ConferenceRegistry {
        &self.conferences
    }

    pub fn avatars(&self) -> &AvatarQueue {
        &self.avatars
    }

    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    fn push(&self, task: Task) {
        if self.tasks.send(task).is_err() {
            debug!("driver gone, task dropped");
        }
    }

    fn send(&self, packet: ClientPacket) {
        self.push(Task::Send(packet));
    }

    pub fn handle_event(&mut self, ctx: &mut HookContext<'_>, event: ServerEvent) {
        ctx.update_last_received();
        match event {
            ServerEvent::LoginOk => self.on_login_ok(ctx),
            ServerEvent::LoginFailed(failure) => {
                warn!(account = %self.account, ?failure, "login refused");
                ctx.report_error(ErrorKind::from(failure), failure.description());
            }
            ServerEvent::Status {
                uin,
                state,
                description,
                avatar_timestamp,
            } => self.on_status(ctx, uin, state, description, avatar_timestamp),
            ServerEvent::Message { from, text, time } => {
                let own = self.uin.unwrap_or_default();
                emit(ctx, "message.received", EventPayload::MessageReceived {
                    account: self.account.clone(),
                    message: ChatMessage {
                        id: None,
                        from: from.to_string(),
                        to: own.to_string(),
                        body: text,
                        html: None,
                        timestamp: time,
                        delayed: false,
                        message_type: MessageType::Chat,
                        thread: None,
                    },
                });
            }
            ServerEvent::ConferenceInfo {
                id,
                version,
                participants,
            } => self.on_conference_info(ctx, id, version, &participants),
            ServerEvent::ConferenceJoined { id, uin } => {
                if self.conferences.add_participant(id, uin) {
                    self.announce_members(ctx, id, &[uin], &[]);
                }
            }
            ServerEvent::ConferenceLeft { id, uin } => {
                if self.conferences.remove_participant(id, uin) {
                    self.announce_members(ctx, id, &[], &[uin]);
                }
            }
            ServerEvent::ConferenceMessage { id, from, text, time } => {
                if self.conferences.get(id).is_none() {
                    debug!(conference = id, "message opens conference");
                    self.on_conference_info(ctx, id, 0, &[from]);
                }
                let Some(conference) = self.conferences.get(id) else {
                    return;
                };
                emit(ctx, "message.received", EventPayload::MessageReceived {
                    account: self.account.clone(),
                    message: ChatMessage {
                        id: None,
                        from: from.to_string(),
                        to: conference.name(),
                        body: text,
                        html: None,
                        timestamp: time,
                        delayed: false,
                        message_type: MessageType::Groupchat,
                        thread: None,
                    },
                });
            }
            ServerEvent::Disconnecting => {
                ctx.report_error(ErrorKind::NetworkError, "Server disconnected");
            }
        }
        self.dispatch_avatars();
    }

    fn on_login_ok(&mut self, ctx: &mut HookContext<'_>) {
        if self.signed_in {
            return;
        }
        self.signed_in = true;
        if let Some(uin) = self.uin {
            ctx.set_display_name(uin.to_string());
        }
        info!(account = %self.account, "GG login accepted");
        ctx.set_state(ConnectionState::Connected);
    }

    fn on_status(
        &mut self,
        ctx: &mut HookContext<'_>,
        uin: u32,
        state: BuddyState,
        description: Option<String>,
        avatar_timestamp: Option<i64>,
    ) {
        let buddy = self.buddies.entry(uin).or_insert_with(|| GgBuddy {
            state: BuddyState::Unknown,
            description: None,
            avatar: None,
        });
        buddy.state = state;
        buddy.description = description.clone();

        emit(ctx, "buddy.status.changed", EventPayload::BuddyStatusChanged {
            account: self.account.clone(),
            jid: uin.to_string(),
            resource: None,
            state,
            status: description,
            priority: 0,
            idle_seconds: None,
        });

        if let Some(timestamp) = avatar_timestamp
            && self.avatars.known(uin) != Some(timestamp)
        {
            self.request_avatar(uin);
        }
    }

    fn on_conference_info(&mut self, ctx: &mut HookContext<'_>, id: u64, version: u32, participants: &[u32]) {
        let (conference, new) = self.conferences.ensure(id);
        let local_id = conference.local_id;
        let name = conference.name();
        if new {
            ctx.add_chat(local_id);
            emit(ctx, "chat.joined", EventPayload::ChatJoined {
                account: self.account.clone(),
                chat_id: local_id,
                room: name,
                nick: self.uin.unwrap_or_default().to_string(),
            });
        }
        let changes = self.conferences.update_participants(id, version, participants);
        self.announce_members(ctx, id, &changes.joined, &changes.left);
    }

    fn announce_members(&self, ctx: &HookContext<'_>, id: u64, joined: &[u32], left: &[u32]) {
        let Some(conference) = self.conferences.get(id) else {
            return;
        };
        let own = self.uin.unwrap_or_default();
        for uin in joined.iter().filter(|u| **u != own) {
            emit(ctx, "chat.member.joined", EventPayload::ChatMemberJoined {
                account: self.account.clone(),
                chat_id: conference.local_id,
                member: ChatMember {
                    nick: uin.to_string(),
                    jid: None,
                    affiliation: Default::default(),
                    role: Default::default(),
                },
                new_arrival: conference.version > 0,
            });
        }
        for uin in left.iter().filter(|u| **u != own) {
            emit(ctx, "chat.member.left", EventPayload::ChatMemberLeft {
                account: self.account.clone(),
                chat_id: conference.local_id,
                nick: uin.to_string(),
                reason: None,
            });
        }
    }

    /// Queue an avatar check for `uin`.
    pub fn request_avatar(&mut self, uin: u32) -> bool {
        self.avatars.request(uin)
    }

    fn dispatch_avatars(&mut self) {
        while let Some((uin, known)) = self.avatars.next() {
            self.push(Task::FetchAvatar { uin, known });
        }
    }

    pub fn complete(&mut self, ctx: &mut HookContext<'_>, completion: Completion) {
        match completion {
            Completion::Avatar(fetched) => self.apply_avatar(ctx, fetched),
            Completion::Upload { token, result } => {
                if token.is_some() {
                    self.token = token;
                }
                if let Err(error) = result {
                    warn!(%error, "avatar upload failed");
                    if matches!(ErrorKind::from(&error), ErrorKind::AuthenticationFailed) {
                        self.token = None;
                    }
                    ctx.ui()
                        .notify_error(&self.account, "Unable to set avatar", &error.to_string());
                }
            }
        }
    }

    fn apply_avatar(&mut self, ctx: &mut HookContext<'_>, fetched: FetchedAvatar) {
        let FetchedAvatar { uin, result } = fetched;
        let (timestamp, image) = match result {
            Ok(AvatarUpdate::Unchanged) => {
                self.avatars.complete(uin, None);
                return;
            }
            Ok(AvatarUpdate::Removed { timestamp }) => (timestamp, None),
            Ok(AvatarUpdate::Image { timestamp, data }) => (timestamp, Some(data)),
            Err(error) => {
                warn!(uin, %error, "avatar check failed");
                self.avatars.complete(uin, None);
                return;
            }
        };
        self.avatars.complete(uin, Some(timestamp));
        let size = image.as_ref().map_or(0, Vec::len);
        if let Some(buddy) = self.buddies.get_mut(&uin) {
            buddy.avatar = image;
        }
        emit(ctx, "gg.avatar.updated", EventPayload::AvatarUpdated {
            account: self.account.clone(),
            buddy: uin.to_string(),
            size,
        });
    }

    pub fn send_message(&self, to: u32, text: &str) -> bool {
        if !self.signed_in {
            return false;
        }
        self.send(ClientPacket::SendMessage {
            to,
            text: text.to_string(),
        });
        true
    }

    /// The local chat id of a conference with exactly `participants`, or
    /// `None` after asking the server to create one.
    pub fn open_conference(&self, participants: &[u32]) -> Option<u32> {
        let own = self.uin.unwrap_or_default();
        if let Some(existing) = self.conferences.find_by_participants(participants, own) {
            return Some(existing.local_id);
        }
        if self.signed_in {
            self.send(ClientPacket::CreateConference {
                participants: participants.to_vec(),
            });
        }
        None
    }

    pub fn send_conference_message(&self, local_id: u32, text: &str) -> bool {
        let Some(conference) = self.conferences.by_local_id(local_id) else {
            return false;
        };
        self.send(ClientPacket::SendConference {
            id: conference.id,
            text: text.to_string(),
        });
        true
    }

    pub fn set_own_avatar(&self, image: Vec<u8>) -> bool {
        let (Some(uin), Some(password), true) = (self.uin, self.password.clone(), self.signed_in)
        else {
            return false;
        };
        self.push(Task::UploadAvatar {
            uin,
            password,
            token: self.token.clone(),
            image,
        });
        true
    }
}

impl Drop for GgSession {
    fn drop(&mut self) {
        self.live.kill();
    }
}

impl ProtocolSession for GgSession {
    fn login(&mut self, ctx: &mut HookContext<'_>) -> Result<(), ProtocolError> {
        let Some(uin) = self.uin else {
            return Err(ProtocolError::new(
                ErrorKind::InvalidUsername,
                format!("{} is not a valid GG number", self.account),
            ));
        };
        let Some(password) = ctx.password().map(Password::new) else {
            return Err(ProtocolError::new(ErrorKind::InvalidSettings, "Password required"));
        };
        self.password = Some(password.clone());
        ctx.set_state(ConnectionState::Connecting);
        self.send(ClientPacket::Login { uin, password });
        Ok(())
    }

    fn close(&mut self, _ctx: &mut HookContext<'_>) -> Result<(), ProtocolError> {
        if self.signed_in {
            self.send(ClientPacket::Logoff);
        }
        self.signed_in = false;
        self.live.kill();
        self.push(Task::Close);
        self.conferences.clear();
        self.avatars.clear();
        Ok(())
    }

    fn keepalive(&mut self, _ctx: &mut HookContext<'_>) {
        self.send(ClientPacket::Ping);
    }

    fn chat_leave(&mut self, ctx: &mut HookContext<'_>, chat_id: u32) {
        let Some(conference) = self.conferences.leave(chat_id) else {
            return;
        };
        debug!(conference = conference.id, "leaving conference");
        self.send(ClientPacket::LeaveConference { id: conference.id });
        ctx.remove_chat(chat_id);
        emit(ctx, "chat.signed-off", EventPayload::ChatSignedOff {
            account: self.account.clone(),
            chat_id,
            room: conference.name(),
        });
    }

    fn buddy_free(&mut self, _ctx: &mut HookContext<'_>) {
        self.buddies.clear();
        self.avatars.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct GgPlugin {
    config: GgConfig,
}

impl GgPlugin {
    pub fn new(config: GgConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GgConfig {
        &self.config
    }
}

impl ProtocolPlugin for GgPlugin {
    fn id(&self) -> &'static str {
        PROTOCOL_ID
    }

    fn options(&self) -> ProtocolOptions {
        ProtocolOptions {
            password: PasswordPolicy::Required,
            keepalive_interval: Some(Duration::from_secs(self.config.keepalive_interval_secs)),
            flags: ConnectionFlags::empty(),
        }
    }

    fn new_session(&self, account: &Account) -> Box<dyn ProtocolSession> {
        Box::new(GgSession::new(account))
    }
}
