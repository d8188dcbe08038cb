//! The XMPP protocol session: owns per-account state and plugs the stanza
//! handlers into the connection state machine.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use minidom::Element;
use purple_core::account::Account;
use purple_core::config::XmppConfig;
use purple_core::event::{ChatState, EventPayload, EventSource};
use purple_core::protocol::{
    HookContext, PasswordPolicy, ProtocolError, ProtocolOptions, ProtocolPlugin, ProtocolSession,
};
use purple_core::{ConnectionFlags, ConnectionState, ErrorKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buddy::{BuddyTable, Subscription};
use crate::caps::{CapsCache, CapsCallback, CapsClientInfo, CapsLookup, CapsRequester, CapsTuple};
use crate::carbons::CarbonsManager;
use crate::chat::{ChatRegistry, JoinRequest};
use crate::error::XmppError;
use crate::outbound::{self, OutgoingMessage};
use crate::presence::{self, CapsResolved};
use crate::stanza::{self, NS_CLIENT, NS_PING, NS_ROSTER, build_iq, next_id};
use crate::stream::{Frame, StreamNegotiator, stream_error};
use crate::{disco, message, muc};

pub const PROTOCOL_ID: &str = "xmpp";

const ROSTER_IQ_ID: &str = "roster-1";

pub(crate) fn emit(ctx: &HookContext<'_>, channel: &str, payload: EventPayload) {
    ctx.emit(channel, EventSource::Xmpp, payload);
}

/// Lock the shared caps cache. A panic in another session must not take the
/// cache down with it.
///
/// This is the one lock on the session path. The cache is process-wide and
/// shared by every XMPP account, while each account's state stays owned by
/// its session. Callers hold the guard for a single cache call and never
/// across an await.
pub fn lock_caps(caps: &Mutex<CapsCache>) -> MutexGuard<'_, CapsCache> {
    caps.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the stanza handlers see of the session.
pub struct SessionState {
    id: Uuid,
    pub(crate) buddies: BuddyTable,
    pub(crate) chats: ChatRegistry,
    pub(crate) carbons: CarbonsManager,
    caps: Arc<Mutex<CapsCache>>,
    caps_tx: mpsc::UnboundedSender<CapsResolved>,
    caps_rx: mpsc::UnboundedReceiver<CapsResolved>,
    frames: mpsc::UnboundedSender<Frame>,
    own_bare: String,
    own_full: String,
}

impl SessionState {
    fn new(own_bare: String, caps: Arc<Mutex<CapsCache>>, frames: mpsc::UnboundedSender<Frame>) -> Self {
        let (caps_tx, caps_rx) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            buddies: BuddyTable::new(),
            chats: ChatRegistry::new(),
            carbons: CarbonsManager::new(),
            caps,
            caps_tx,
            caps_rx,
            frames,
            own_full: own_bare.clone(),
            own_bare,
        }
    }

    pub fn own_bare(&self) -> &str {
        &self.own_bare
    }

    /// Our bound full JID; the bare JID until binding completes.
    pub fn own_full(&self) -> &str {
        &self.own_full
    }

    pub(crate) fn send(&self, stanza: Element) {
        self.push(Frame::Stanza(stanza));
    }

    fn push(&self, frame: Frame) {
        if self.frames.send(frame).is_err() {
            debug!(account = %self.own_bare, "transport driver gone; dropping frame");
        }
    }

    /// Resolve `tuple` for one contact resource. The answer arrives through
    /// [`drain_caps`](Self::drain_caps), possibly before this returns.
    pub(crate) fn request_caps(&mut self, bare: &str, resource: &str, tuple: CapsTuple) {
        let tx = self.caps_tx.clone();
        let (owner, name, wanted) = (bare.to_string(), resource.to_string(), tuple.clone());
        let callback: CapsCallback = Box::new(move |info| {
            let _ = tx.send(CapsResolved {
                bare: owner,
                resource: name,
                tuple: wanted,
                info,
            });
        });
        let frames = self.frames.clone();
        let requester = CapsRequester {
            session: self.id,
            jid: format!("{bare}/{resource}"),
            sink: Box::new(move |iq| frames.send(Frame::Stanza(iq)).is_ok()),
        };
        let lookup = lock_caps(&self.caps).get_or_fetch(tuple, requester, callback);
        if let CapsLookup::Query(iq) = lookup {
            self.send(iq);
        }
    }

    pub(crate) fn drain_caps(&mut self, ctx: &mut HookContext<'_>) {
        while let Ok(resolved) = self.caps_rx.try_recv() {
            presence::apply_caps(self, ctx, resolved);
        }
    }

    pub fn buddies(&self) -> &BuddyTable {
        &self.buddies
    }

    pub fn chats(&self) -> &ChatRegistry {
        &self.chats
    }
}

pub struct JabberSession {
    state: SessionState,
    stream: StreamNegotiator,
    info: CapsClientInfo,
    frames_rx: Option<mpsc::UnboundedReceiver<Frame>>,
}

impl JabberSession {
    pub fn new(account: &Account, config: &XmppConfig, caps: Arc<Mutex<CapsCache>>) -> Self {
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let own_bare = stanza::Address::parse(&account.username)
            .map(|address| address.bare)
            .unwrap_or_else(|_| account.username.clone());
        let (node, domain) = own_bare
            .split_once('@')
            .map(|(node, domain)| (node.to_string(), domain.to_string()))
            .unwrap_or_default();
        let resource = account.get_string("resource", &config.default_resource).to_string();
        let require_tls = account.get_bool("require_tls", true);

        // The password is filled in by `login`, once the manager has resolved it.
        let mut stream = StreamNegotiator::new(domain, node, String::new(), resource, require_tls);
        if account.get_bool("direct_tls", false) {
            stream = stream.already_encrypted();
        }

        Self {
            state: SessionState::new(own_bare, caps, frames),
            stream,
            info: disco::own_info(),
            frames_rx: Some(frames_rx),
        }
    }

    /// Hand the outgoing frame queue to the transport driver. Only the first
    /// call gets it.
    pub fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        self.frames_rx.take()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.stream.is_ready()
    }

    /// Feed one top-level element from the transport.
    pub fn handle_frame(&mut self, ctx: &mut HookContext<'_>, raw: &[u8]) {
        let element = match stanza::parse(raw) {
            Ok(element) => element,
            Err(error) => {
                warn!(account = %ctx.username(), %error, "skipping unparseable frame");
                return;
            }
        };
        self.handle_element(ctx, &element);
    }

    pub fn handle_element(&mut self, ctx: &mut HookContext<'_>, element: &Element) {
        ctx.update_last_received();

        if !self.stream.is_ready() {
            match self.stream.handle(element) {
                Ok(frames) => {
                    for frame in frames {
                        self.state.push(frame);
                    }
                    if self.stream.is_ready() {
                        self.on_bound(ctx);
                    }
                }
                Err(error) => fail(ctx, error),
            }
            return;
        }

        if let Some(error) = stream_error(element) {
            fail(ctx, error);
            return;
        }

        let now = Utc::now();
        match element.name() {
            "presence" => presence::handle(&mut self.state, ctx, element, now),
            "message" => message::handle(&mut self.state, ctx, element, now),
            "iq" => self.handle_iq(ctx, element),
            other => debug!(name = %other, "ignoring top-level element"),
        }
        self.state.drain_caps(ctx);
    }

    fn on_bound(&mut self, ctx: &mut HookContext<'_>) {
        if let Some(jid) = self.stream.bound_jid() {
            self.state.own_full = jid.to_string();
            ctx.set_display_name(jid);
        }
        let roster = Element::builder("query", NS_ROSTER).build();
        self.state.send(build_iq("get", ROSTER_IQ_ID, None, Some(roster)));
        self.state.send(
            Element::builder("presence", NS_CLIENT)
                .append(disco::caps_element(&self.info))
                .build(),
        );
        if let Some(enable) = self.state.carbons.enable() {
            self.state.send(enable);
        }
        ctx.set_state(ConnectionState::Connected);
    }

    fn handle_iq(&mut self, ctx: &mut HookContext<'_>, iq: &Element) {
        match iq.attr("type") {
            Some("result") | Some("error") => {
                if self.state.carbons.handle_iq(iq) {
                    return;
                }
                if lock_caps(&self.state.caps).handle_disco_response(iq) {
                    return;
                }
                if iq.attr("id") == Some(ROSTER_IQ_ID) {
                    if let Some(query) = iq.get_child("query", NS_ROSTER) {
                        self.apply_roster(query);
                    }
                    self.complete_burst();
                    return;
                }
                debug!(id = ?iq.attr("id"), "unmatched IQ response");
            }
            Some("get") | Some("set") => {
                if let Some(query) = iq.get_child("query", NS_ROSTER) {
                    self.roster_push(iq, query);
                    return;
                }
                if let Some(reply) = disco::answer(iq, &self.info) {
                    self.state.send(reply);
                    return;
                }
                debug!(account = %ctx.username(), from = ?iq.attr("from"), "unsupported IQ request");
                self.state
                    .send(disco::error_reply(iq, "cancel", "service-unavailable"));
            }
            other => warn!(kind = ?other, "dropping IQ with invalid type"),
        }
    }

    fn apply_roster(&mut self, query: &Element) {
        for item in query.children().filter(|c| c.name() == "item") {
            let Some(jid) = item.attr("jid") else {
                continue;
            };
            let bare = match stanza::Address::parse(jid) {
                Ok(address) => address.bare,
                Err(error) => {
                    warn!(%jid, %error, "skipping roster item with malformed JID");
                    continue;
                }
            };
            let subscription = Subscription::parse(item.attr("subscription").unwrap_or("none"));
            self.state.buddies.set_subscription(&bare, subscription);
        }
    }

    fn roster_push(&mut self, iq: &Element, query: &Element) {
        let from_self = iq.attr("from").is_none_or(|from| {
            stanza::Address::parse(from).is_ok_and(|address| address.bare == self.state.own_bare)
        });
        if !from_self {
            warn!(from = ?iq.attr("from"), "ignoring roster push from a third party");
            self.state
                .send(disco::error_reply(iq, "cancel", "service-unavailable"));
            return;
        }
        self.apply_roster(query);
        self.state.send(build_iq(
            "result",
            iq.attr("id").unwrap_or_default(),
            iq.attr("from"),
            None,
        ));
    }

    /// The roster has arrived: replay the room joins queued behind it.
    fn complete_burst(&mut self) {
        let pending = self.state.chats.complete_burst();
        if !pending.is_empty() {
            info!(rooms = pending.len(), "joining queued rooms");
        }
        for request in pending {
            muc::send_join(&mut self.state, request);
        }
    }

    pub fn join_chat(&mut self, request: JoinRequest) {
        muc::join(&mut self.state, request);
    }

    /// Build and queue a message. Returns false when there was nothing to
    /// send.
    pub fn send_message(&mut self, message: &OutgoingMessage) -> bool {
        match outbound::build(&self.state, message) {
            Some(stanza) => {
                self.state.send(stanza);
                true
            }
            None => false,
        }
    }

    /// A bare chat-state notification, subject to the same suppression rules
    /// as states attached to messages.
    pub fn send_typing(&mut self, to: &str, state: ChatState) -> bool {
        let mut message = OutgoingMessage::chat(to, "");
        message.chat_state = Some(state);
        self.send_message(&message)
    }

    pub fn drain_caps(&mut self, ctx: &mut HookContext<'_>) {
        self.state.drain_caps(ctx);
    }
}

fn fail(ctx: &mut HookContext<'_>, error: XmppError) {
    let kind = ErrorKind::from(&error);
    warn!(account = %ctx.username(), %error, "stream failed");
    ctx.report_error(kind, error.to_string());
}

impl ProtocolSession for JabberSession {
    fn login(&mut self, ctx: &mut HookContext<'_>) -> Result<(), ProtocolError> {
        if self.stream.domain().is_empty() {
            return Err(ProtocolError::new(
                ErrorKind::InvalidUsername,
                format!("{} is not a valid XMPP address", ctx.username()),
            ));
        }
        let Some(password) = ctx.password() else {
            return Err(ProtocolError::new(ErrorKind::InvalidSettings, "Password required"));
        };
        self.stream.set_password(password);
        info!(account = %ctx.username(), "opening XMPP stream");
        ctx.set_state(ConnectionState::Connecting);
        self.state.push(self.stream.open());
        Ok(())
    }

    fn close(&mut self, ctx: &mut HookContext<'_>) -> Result<(), ProtocolError> {
        debug!(account = %ctx.username(), "closing XMPP stream");
        if self.stream.is_ready() {
            self.state.send(
                Element::builder("presence", NS_CLIENT)
                    .attr("type", "unavailable")
                    .build(),
            );
        }
        self.state.push(Frame::Close);
        lock_caps(&self.state.caps).release_session(self.state.id);
        self.state.chats.destroy_all();
        self.state.carbons.reset();
        Ok(())
    }

    fn keepalive(&mut self, _ctx: &mut HookContext<'_>) {
        if !self.stream.is_ready() {
            return;
        }
        let ping = Element::builder("ping", NS_PING).build();
        let domain = self.stream.domain().to_string();
        self.state
            .send(build_iq("get", &next_id("ping"), Some(&domain), Some(ping)));
    }

    fn chat_leave(&mut self, ctx: &mut HookContext<'_>, chat_id: u32) {
        muc::leave(&mut self.state, ctx, chat_id);
    }

    fn buddy_free(&mut self, _ctx: &mut HookContext<'_>) {
        self.state.buddies.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Registers XMPP with the connection manager. Every session it creates
/// shares one caps cache.
pub struct XmppPlugin {
    config: XmppConfig,
    caps: Arc<Mutex<CapsCache>>,
}

impl XmppPlugin {
    /// Open the persisted caps cache named by `config`.
    pub fn new(config: XmppConfig) -> Self {
        let cache = CapsCache::open(config.resolved_caps_cache_path());
        Self::with_cache(config, cache)
    }

    pub fn with_cache(config: XmppConfig, cache: CapsCache) -> Self {
        Self {
            config,
            caps: Arc::new(Mutex::new(cache)),
        }
    }

    pub fn caps(&self) -> Arc<Mutex<CapsCache>> {
        self.caps.clone()
    }

    /// Flush the caps cache. Call once at process teardown.
    pub fn shutdown(&self) {
        lock_caps(&self.caps).shutdown();
    }
}

impl ProtocolPlugin for XmppPlugin {
    fn id(&self) -> &'static str {
        PROTOCOL_ID
    }

    fn options(&self) -> ProtocolOptions {
        ProtocolOptions {
            password: PasswordPolicy::Required,
            keepalive_interval: Some(Duration::from_secs(self.config.keepalive_interval_secs)),
            flags: ConnectionFlags::HTML | ConnectionFlags::SUPPORT_MOODS,
        }
    }

    fn new_session(&self, account: &Account) -> Box<dyn ProtocolSession> {
        Box::new(JabberSession::new(account, &self.config, self.caps.clone()))
    }
}
