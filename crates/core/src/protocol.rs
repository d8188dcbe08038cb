//! The seam between the connection state machine and a concrete protocol.
//!
//! A [`ProtocolPlugin`] is registered once per protocol id and creates one
//! [`ProtocolSession`] per login attempt. Session hooks never call back into
//! the state machine directly: they record requests on the [`HookContext`],
//! and the manager applies those requests once the hook has returned. This
//! keeps every state transition out of the hook's own call stack.

use std::any::Any;
use std::time::Duration;

use crate::account::{Account, Password};
use crate::connection::{ConnectionFlags, ConnectionId, ConnectionState};
use crate::error::ErrorKind;
use crate::event::{EventBus, EventPayload, EventSource, emit};
use crate::ui::ConnectionUiOps;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordPolicy {
    Required,
    /// A password is used when present but login may proceed without one.
    Optional,
    NotUsed,
}

#[derive(Debug, Clone)]
pub struct ProtocolOptions {
    pub password: PasswordPolicy,
    pub keepalive_interval: Option<Duration>,
    pub flags: ConnectionFlags,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            password: PasswordPolicy::Required,
            keepalive_interval: None,
            flags: ConnectionFlags::empty(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProtocolError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProtocolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub trait ProtocolPlugin: Send + Sync {
    fn id(&self) -> &'static str;

    fn options(&self) -> ProtocolOptions;

    fn new_session(&self, account: &Account) -> Box<dyn ProtocolSession>;
}

pub trait ProtocolSession: Any + Send {
    /// Start logging in. Network I/O happens outside the hook; the hook
    /// typically requests `Connecting` and prepares its initial output.
    fn login(&mut self, ctx: &mut HookContext<'_>) -> Result<(), ProtocolError>;

    fn close(&mut self, ctx: &mut HookContext<'_>) -> Result<(), ProtocolError>;

    fn keepalive(&mut self, _ctx: &mut HookContext<'_>) {}

    /// Leave a chat without waiting for the server to confirm.
    fn chat_leave(&mut self, _ctx: &mut HookContext<'_>, _chat_id: u32) {}

    /// Release per-buddy protocol data.
    fn buddy_free(&mut self, _ctx: &mut HookContext<'_>) {}

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A change a hook asks the connection manager to make.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreRequest {
    SetState(ConnectionState),
    ReportError(ErrorKind, String),
    UpdateLastReceived,
    SetDisplayName(String),
    SetFlags(ConnectionFlags),
    AddChat(u32),
    RemoveChat(u32),
}

pub struct HookContext<'a> {
    connection: ConnectionId,
    state: ConnectionState,
    account: &'a Account,
    password: Option<&'a Password>,
    bus: &'a dyn EventBus,
    ui: &'a dyn ConnectionUiOps,
    requests: Vec<CoreRequest>,
}

impl<'a> HookContext<'a> {
    pub fn new(
        connection: ConnectionId,
        state: ConnectionState,
        account: &'a Account,
        password: Option<&'a Password>,
        bus: &'a dyn EventBus,
        ui: &'a dyn ConnectionUiOps,
    ) -> Self {
        Self {
            connection,
            state,
            account,
            password,
            bus,
            ui,
            requests: Vec::new(),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// The connection state when the hook was entered.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn account(&self) -> &Account {
        self.account
    }

    pub fn username(&self) -> &str {
        &self.account.username
    }

    pub fn password(&self) -> Option<&str> {
        self.password.map(Password::expose)
    }

    pub fn ui(&self) -> &dyn ConnectionUiOps {
        self.ui
    }

    pub fn emit(&self, channel: &str, source: EventSource, payload: EventPayload) {
        emit(self.bus, channel, source, payload);
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.requests.push(CoreRequest::SetState(state));
    }

    pub fn report_error(&mut self, kind: ErrorKind, description: impl Into<String>) {
        self.requests
            .push(CoreRequest::ReportError(kind, description.into()));
    }

    pub fn update_last_received(&mut self) {
        self.requests.push(CoreRequest::UpdateLastReceived);
    }

    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.requests.push(CoreRequest::SetDisplayName(name.into()));
    }

    pub fn set_flags(&mut self, flags: ConnectionFlags) {
        self.requests.push(CoreRequest::SetFlags(flags));
    }

    pub fn add_chat(&mut self, chat_id: u32) {
        self.requests.push(CoreRequest::AddChat(chat_id));
    }

    pub fn remove_chat(&mut self, chat_id: u32) {
        self.requests.push(CoreRequest::RemoveChat(chat_id));
    }

    pub fn requests(&self) -> &[CoreRequest] {
        &self.requests
    }

    pub fn into_requests(self) -> Vec<CoreRequest> {
        self.requests
    }
}
