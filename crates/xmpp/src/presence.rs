//! Inbound `<presence/>` handling.
//!
//! Parsing fills a transient [`Presence`] from a handler table keyed by
//! `(element name, namespace)`; applying it to contacts or rooms is a
//! separate step so that room and contact logic never see raw XML.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use minidom::Element;
use purple_core::event::{Affiliation, BuddyState, EventPayload, Role};
use purple_core::protocol::HookContext;
use tracing::{debug, warn};

use crate::buddy::{Resource, Subscription};
use crate::caps::{CapsClientInfo, CapsTuple};
use crate::muc;
use crate::session::{SessionState, emit};
use crate::stanza::{
    Address, NS_CAPS, NS_CLIENT, NS_DELAY, NS_IDLE, NS_LAST, NS_LEGACY_DELAY, NS_MUC_USER,
    NS_NICK, NS_VCARD_UPDATE, StanzaError, parse_timestamp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    /// Unknown values are logged and treated as available.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            None => PresenceType::Available,
            Some("unavailable") => PresenceType::Unavailable,
            Some("subscribe") => PresenceType::Subscribe,
            Some("subscribed") => PresenceType::Subscribed,
            Some("unsubscribe") => PresenceType::Unsubscribe,
            Some("unsubscribed") => PresenceType::Unsubscribed,
            Some("probe") => PresenceType::Probe,
            Some("error") => PresenceType::Error,
            Some(other) => {
                warn!(kind = %other, "unknown presence type, treating as available");
                PresenceType::Available
            }
        }
    }
}

/// `<item/>` from a MUC user extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MucItem {
    pub affiliation: Affiliation,
    pub role: Role,
    pub jid: Option<String>,
    /// New nickname, on a 303 nick change.
    pub nick: Option<String>,
    pub actor: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MucUser {
    pub codes: BTreeSet<u16>,
    pub item: Option<MucItem>,
}

impl MucUser {
    pub fn has(&self, code: u16) -> bool {
        self.codes.contains(&code)
    }
}

/// Everything one presence stanza told us. Lives for one parse pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    pub from: Address,
    pub kind: PresenceType,
    pub state: BuddyState,
    pub status: Option<String>,
    pub priority: i8,
    pub idle_seconds: Option<u64>,
    idle_since: Option<DateTime<Utc>>,
    /// Only `jabber:iq:last` idle times are relative to the send time.
    adjust_idle: bool,
    pub delayed: bool,
    pub stamp: Option<DateTime<Utc>>,
    /// `Some("")` means the contact has no avatar.
    pub avatar_hash: Option<String>,
    pub caps: Option<CapsTuple>,
    pub nickname: Option<String>,
    pub muc: Option<MucUser>,
    pub error: Option<String>,
}

type Handler = fn(&mut Presence, &Element);

static HANDLERS: LazyLock<HashMap<(&'static str, &'static str), Handler>> = LazyLock::new(|| {
    let mut handlers: HashMap<(&'static str, &'static str), Handler> = HashMap::new();
    handlers.insert(("priority", NS_CLIENT), parse_priority);
    handlers.insert(("show", NS_CLIENT), parse_show);
    handlers.insert(("status", NS_CLIENT), parse_status);
    handlers.insert(("delay", NS_DELAY), parse_delay);
    handlers.insert(("x", NS_LEGACY_DELAY), parse_delay);
    handlers.insert(("query", NS_LAST), parse_last);
    handlers.insert(("idle", NS_IDLE), parse_idle);
    handlers.insert(("c", NS_CAPS), parse_caps);
    handlers.insert(("nick", NS_NICK), parse_nick);
    handlers.insert(("x", NS_VCARD_UPDATE), parse_vcard_update);
    handlers.insert(("x", NS_MUC_USER), parse_muc_user);
    handlers
});

/// Parse a presence stanza. A missing `from` means our own account.
pub fn parse(stanza: &Element, own_bare: &str, now: DateTime<Utc>) -> Option<Presence> {
    let from = match stanza.attr("from") {
        Some(from) => match Address::parse(from) {
            Ok(address) => address,
            Err(error) => {
                warn!(%from, %error, "dropping presence with malformed sender");
                return None;
            }
        },
        None => Address {
            bare: own_bare.to_string(),
            resource: None,
        },
    };

    let kind = PresenceType::parse(stanza.attr("type"));
    let mut presence = Presence {
        from,
        kind,
        state: match kind {
            PresenceType::Available => BuddyState::Online,
            PresenceType::Unavailable => BuddyState::Unavailable,
            PresenceType::Error => BuddyState::Error,
            _ => BuddyState::Unknown,
        },
        status: None,
        priority: 0,
        idle_seconds: None,
        idle_since: None,
        adjust_idle: false,
        delayed: false,
        stamp: None,
        avatar_hash: None,
        caps: None,
        nickname: None,
        muc: None,
        error: None,
    };

    if kind == PresenceType::Error {
        presence.error = Some(
            StanzaError::from_stanza(stanza)
                .map(|error| error.description())
                .unwrap_or_else(|| "Unknown Error in presence".to_string()),
        );
    }

    for child in stanza.children() {
        let ns = child.ns();
        if let Some(handler) = HANDLERS.get(&(child.name(), ns.as_str())) {
            handler(&mut presence, child);
        }
    }

    if let Some(since) = presence.idle_since {
        presence.idle_seconds = Some(seconds_between(since, now));
    }
    if presence.adjust_idle && presence.delayed {
        if let (Some(idle), Some(stamp)) = (presence.idle_seconds, presence.stamp) {
            presence.idle_seconds = Some(idle + seconds_between(stamp, now));
        }
    }
    Some(presence)
}

fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> u64 {
    u64::try_from((later - earlier).num_seconds()).unwrap_or(0)
}

fn parse_priority(presence: &mut Presence, element: &Element) {
    let text = element.text();
    match text.trim().parse::<i8>() {
        Ok(priority) => presence.priority = priority,
        Err(_) => warn!(value = %text, "ignoring malformed presence priority"),
    }
}

fn parse_show(presence: &mut Presence, element: &Element) {
    if presence.kind != PresenceType::Available {
        return;
    }
    presence.state = match element.text().trim() {
        "chat" => BuddyState::Chat,
        "away" => BuddyState::Away,
        "xa" => BuddyState::ExtendedAway,
        "dnd" => BuddyState::DoNotDisturb,
        other => {
            warn!(show = %other, "ignoring unknown presence show");
            return;
        }
    };
}

fn parse_status(presence: &mut Presence, element: &Element) {
    let text = element.text();
    if !text.is_empty() {
        presence.status = Some(text);
    }
}

fn parse_delay(presence: &mut Presence, element: &Element) {
    let Some(raw) = element.attr("stamp") else {
        return;
    };
    match parse_timestamp(raw) {
        Some(stamp) => {
            presence.delayed = true;
            presence.stamp = Some(stamp);
        }
        None => warn!(stamp = %raw, "ignoring malformed delay stamp"),
    }
}

fn parse_last(presence: &mut Presence, element: &Element) {
    let Some(raw) = element.attr("seconds") else {
        return;
    };
    match raw.parse::<u64>() {
        Ok(seconds) => {
            presence.idle_seconds = Some(seconds);
            presence.adjust_idle = true;
        }
        Err(_) => warn!(seconds = %raw, "ignoring malformed last-activity time"),
    }
}

fn parse_idle(presence: &mut Presence, element: &Element) {
    let Some(raw) = element.attr("since") else {
        return;
    };
    match parse_timestamp(raw) {
        Some(since) => presence.idle_since = Some(since),
        None => warn!(since = %raw, "ignoring malformed idle timestamp"),
    }
}

fn parse_caps(presence: &mut Presence, element: &Element) {
    presence.caps = CapsTuple::from_element(element);
}

fn parse_nick(presence: &mut Presence, element: &Element) {
    let text = element.text();
    if !text.is_empty() {
        presence.nickname = Some(text);
    }
}

fn parse_vcard_update(presence: &mut Presence, element: &Element) {
    if let Some(photo) = element.get_child("photo", NS_VCARD_UPDATE) {
        presence.avatar_hash = Some(photo.text().trim().to_string());
    }
}

fn parse_muc_user(presence: &mut Presence, element: &Element) {
    let mut user = MucUser::default();
    for child in element.children() {
        match child.name() {
            "status" => match child.attr("code").map(str::parse::<u16>) {
                Some(Ok(code)) => {
                    user.codes.insert(code);
                }
                _ => warn!("ignoring MUC status without a numeric code"),
            },
            "item" => {
                user.item = Some(MucItem {
                    affiliation: child.attr("affiliation").map(Affiliation::parse).unwrap_or_default(),
                    role: child.attr("role").map(Role::parse).unwrap_or_default(),
                    jid: child.attr("jid").map(str::to_string),
                    nick: child.attr("nick").map(str::to_string),
                    actor: child.get_child("actor", NS_MUC_USER).and_then(|actor| {
                        actor
                            .attr("nick")
                            .or_else(|| actor.attr("jid"))
                            .map(str::to_string)
                    }),
                    reason: child
                        .get_child("reason", NS_MUC_USER)
                        .map(Element::text)
                        .filter(|reason| !reason.is_empty()),
                });
            }
            _ => {}
        }
    }
    presence.muc = Some(user);
}

/// Capabilities resolved for one contact resource.
#[derive(Debug)]
pub struct CapsResolved {
    pub bare: String,
    pub resource: String,
    pub tuple: CapsTuple,
    pub info: Option<Arc<CapsClientInfo>>,
}

pub fn handle(state: &mut SessionState, ctx: &mut HookContext<'_>, stanza: &Element, now: DateTime<Utc>) {
    let Some(presence) = parse(stanza, state.own_bare(), now) else {
        return;
    };
    if state.chats.find_by_jid(&presence.from.bare).is_some() {
        muc::handle_presence(state, ctx, presence, now);
    } else {
        handle_contact(state, ctx, presence);
    }
}

fn handle_contact(state: &mut SessionState, ctx: &mut HookContext<'_>, presence: Presence) {
    let account = ctx.username().to_string();
    let bare = presence.from.bare.clone();
    let resource = presence.from.resource.clone().unwrap_or_default();

    match presence.kind {
        PresenceType::Subscribe => {
            debug!(from = %bare, "subscription request");
            emit(ctx, "buddy.subscription.request", EventPayload::SubscriptionRequest {
                account,
                from: bare,
            });
            return;
        }
        PresenceType::Subscribed => {
            let buddy = state.buddies.entry(&bare);
            buddy.subscription = match buddy.subscription {
                Subscription::From | Subscription::Both => Subscription::Both,
                _ => Subscription::To,
            };
            emit(ctx, "buddy.subscription.changed", EventPayload::SubscriptionChanged {
                account,
                jid: bare,
                subscribed: true,
            });
            return;
        }
        PresenceType::Unsubscribe | PresenceType::Probe => {
            debug!(from = %bare, kind = ?presence.kind, "ignoring presence");
            return;
        }
        PresenceType::Unsubscribed => {
            let buddy = state.buddies.entry(&bare);
            buddy.subscription = match buddy.subscription {
                Subscription::Both | Subscription::From => Subscription::From,
                _ => Subscription::None,
            };
            buddy.resources.remove(&resource);
            emit(ctx, "buddy.subscription.changed", EventPayload::SubscriptionChanged {
                account: account.clone(),
                jid: bare.clone(),
                subscribed: false,
            });
        }
        PresenceType::Error => {
            let message = presence.error.clone().unwrap_or_default();
            debug!(from = %bare, %message, "presence error");
            let buddy = state.buddies.entry(&bare);
            buddy.error = Some(message.clone());
            buddy.resources.remove(&resource);
            emit(ctx, "buddy.error", EventPayload::BuddyError {
                account: account.clone(),
                jid: bare.clone(),
                message,
            });
        }
        PresenceType::Unavailable => {
            if state.buddies.remove_resource(&bare, &resource).is_none() {
                debug!(from = %bare, %resource, "unavailable from a resource we were not tracking");
            }
        }
        PresenceType::Available => {
            let buddy = state.buddies.entry(&bare);
            buddy.error = None;
            let tracked = buddy
                .resources
                .entry(resource.clone())
                .or_insert_with(|| Resource::new(resource.clone()));
            tracked.state = presence.state;
            tracked.priority = presence.priority;
            tracked.status = presence.status.clone();
            tracked.idle_seconds = presence.idle_seconds;

            if let Some(nickname) = &presence.nickname {
                if buddy.nickname.as_ref() != Some(nickname) {
                    buddy.nickname = Some(nickname.clone());
                    emit(ctx, "buddy.nickname.changed", EventPayload::BuddyNicknameChanged {
                        account: account.clone(),
                        jid: bare.clone(),
                        nickname: nickname.clone(),
                    });
                }
            }

            if let Some(hash) = &presence.avatar_hash {
                if buddy.avatar_hash.as_ref() != Some(hash) {
                    buddy.avatar_hash = Some(hash.clone());
                    emit(ctx, "buddy.avatar.update-needed", EventPayload::AvatarUpdateNeeded {
                        account: account.clone(),
                        jid: bare.clone(),
                        hash: Some(hash.clone()).filter(|hash| !hash.is_empty()),
                    });
                }
            }

            if let Some(tuple) = presence.caps.clone() {
                let known = state
                    .buddies
                    .resource(&bare, &resource)
                    .and_then(|r| r.caps.as_ref());
                if known != Some(&tuple) {
                    if let Some(tracked) = state.buddies.resource_mut(&bare, &resource) {
                        tracked.caps = Some(tuple.clone());
                        tracked.info = None;
                    }
                    state.request_caps(&bare, &resource, tuple);
                }
            }
        }
    }

    publish_status(state, ctx, &bare, &presence);
}

/// Tell listeners what the contact looks like now: the top resource if any
/// remain, otherwise the state this presence left it in.
fn publish_status(state: &SessionState, ctx: &mut HookContext<'_>, bare: &str, presence: &Presence) {
    let account = ctx.username().to_string();
    let payload = match state.buddies.get(bare).and_then(|buddy| buddy.top_resource()) {
        Some(top) => EventPayload::BuddyStatusChanged {
            account,
            jid: bare.to_string(),
            resource: Some(top.name.clone()),
            state: top.state,
            status: top.status.clone(),
            priority: top.priority,
            idle_seconds: top.idle_seconds,
        },
        None => EventPayload::BuddyStatusChanged {
            account,
            jid: bare.to_string(),
            resource: None,
            state: match presence.kind {
                PresenceType::Error => BuddyState::Error,
                PresenceType::Unsubscribed => BuddyState::Unknown,
                _ => BuddyState::Unavailable,
            },
            status: presence.status.clone(),
            priority: 0,
            idle_seconds: None,
        },
    };
    emit(ctx, "buddy.status.changed", payload);
}

/// Apply a finished caps lookup if the resource still advertises that tuple.
pub fn apply_caps(state: &mut SessionState, ctx: &mut HookContext<'_>, resolved: CapsResolved) {
    let Some(resource) = state.buddies.resource_mut(&resolved.bare, &resolved.resource) else {
        debug!(jid = %resolved.bare, resource = %resolved.resource, "caps resolved for a resource that went away");
        return;
    };
    if resource.caps.as_ref() != Some(&resolved.tuple) {
        debug!(jid = %resolved.bare, "caps resolved for a tuple the resource no longer advertises");
        return;
    }
    let Some(info) = resolved.info else {
        debug!(jid = %resolved.bare, ver = %resolved.tuple.ver, "caps lookup failed");
        // Forget the tuple so the next advertisement asks again.
        resource.caps = None;
        return;
    };
    let features = info.features.clone();
    resource.info = Some(info);
    emit(ctx, "buddy.capabilities.changed", EventPayload::BuddyCapabilitiesChanged {
        account: ctx.username().to_string(),
        jid: resolved.bare,
        features,
    });
}
