//! XEP-0045 room presence: joining, occupant tracking and leaving.

use chrono::{DateTime, Utc};
use minidom::Element;
use purple_core::event::{ChatMember, EventPayload};
use purple_core::protocol::HookContext;
use tracing::{debug, warn};

use crate::chat::JoinRequest;
use crate::presence::{MucItem, MucUser, Presence, PresenceType};
use crate::session::{SessionState, emit};
use crate::stanza::{NS_CLIENT, NS_MUC};

const STATUS_SELF: u16 = 110;
const STATUS_ROOM_CREATED: u16 = 201;
const STATUS_NICK_ASSIGNED: u16 = 210;
const STATUS_BANNED: u16 = 301;
const STATUS_NICK_CHANGED: u16 = 303;
const STATUS_KICKED: u16 = 307;
const STATUS_AFFILIATION_CHANGED: u16 = 321;
const STATUS_MEMBERS_ONLY: u16 = 322;
const STATUS_SHUTDOWN: u16 = 332;

/// `<presence to='room@server/nick'><x xmlns='…/muc'/></presence>`
pub fn join_presence(request: &JoinRequest) -> Element {
    let mut x = Element::builder("x", NS_MUC);
    if let Some(password) = &request.password {
        x = x.append(
            Element::builder("password", NS_MUC)
                .append(minidom::Node::Text(password.clone()))
                .build(),
        );
    }
    Element::builder("presence", NS_CLIENT)
        .attr("to", format!("{}/{}", request.room_jid(), request.nick))
        .append(x.build())
        .build()
}

pub fn leave_presence(room_jid: &str, nick: &str) -> Element {
    Element::builder("presence", NS_CLIENT)
        .attr("to", format!("{room_jid}/{nick}"))
        .attr("type", "unavailable")
        .build()
}

/// Join now, or queue the join until the initial roster burst is done.
pub fn join(state: &mut SessionState, request: JoinRequest) {
    if !state.chats.request_join(request.clone()) {
        return;
    }
    send_join(state, request);
}

pub(crate) fn send_join(state: &mut SessionState, request: JoinRequest) {
    let chat = state
        .chats
        .find_or_create(&request.room, &request.server, &request.nick);
    if chat.left {
        debug!(room = %chat.jid(), "still waiting for the previous leave to finish");
        return;
    }
    if let Some(password) = &request.password {
        chat.components.insert("password".to_string(), password.clone());
    }
    debug!(room = %request.room_jid(), nick = %request.nick, "joining room");
    state.send(join_presence(&request));
}

/// Part from a room. The room stays around, inert, until the server echoes
/// our unavailable presence.
pub fn leave(state: &mut SessionState, ctx: &mut HookContext<'_>, chat_id: u32) {
    let Some(chat) = state.chats.find_by_id(chat_id) else {
        return;
    };
    if chat.left {
        return;
    }
    let stanza = leave_presence(&chat.jid(), &chat.handle);
    let room = chat.jid();
    state.chats.mark_left(chat_id);
    state.send(stanza);
    ctx.remove_chat(chat_id);
    emit(ctx, "chat.signed-off", EventPayload::ChatSignedOff {
        account: ctx.username().to_string(),
        chat_id,
        room,
    });
}

pub fn handle_presence(
    state: &mut SessionState,
    ctx: &mut HookContext<'_>,
    presence: Presence,
    now: DateTime<Utc>,
) {
    let own_full = state.own_full().to_string();
    let Some(chat) = state.chats.find_by_jid_mut(&presence.from.bare) else {
        return;
    };
    let chat_id = chat.id;

    let Some(nick) = presence.from.resource.clone() else {
        if presence.kind == PresenceType::Error {
            room_error(state, ctx, chat_id, &presence);
        } else {
            debug!(room = %chat.jid(), "ignoring presence from the bare room JID");
        }
        return;
    };

    let muc = presence.muc.clone().unwrap_or_default();
    let item = muc.item.clone().unwrap_or_default();
    let is_self = muc.has(STATUS_SELF)
        || nick == chat.handle
        || item.jid.as_deref() == Some(own_full.as_str());

    if chat.left {
        if is_self && presence.kind == PresenceType::Unavailable {
            debug!(room = %chat.jid(), "leave confirmed");
            state.chats.destroy(chat_id);
        } else {
            debug!(room = %chat.jid(), %nick, "ignoring presence for a room we left");
        }
        return;
    }

    match presence.kind {
        PresenceType::Error => room_error(state, ctx, chat_id, &presence),
        PresenceType::Available => {
            if is_self {
                self_available(state, ctx, chat_id, &nick, presence.muc.as_ref(), &item, now);
            } else {
                occupant_available(state, ctx, chat_id, &nick, &item, &presence);
            }
        }
        PresenceType::Unavailable => {
            if muc.has(STATUS_NICK_CHANGED) {
                if let Some(new_nick) = item.nick.clone() {
                    renamed(state, ctx, chat_id, &nick, &new_nick, is_self);
                    return;
                }
                warn!(%nick, "nick change without a new nick");
            }
            if is_self {
                self_unavailable(state, ctx, chat_id, &muc, &item, &presence);
            } else {
                occupant_unavailable(state, ctx, chat_id, &nick, &muc, &item, &presence);
            }
        }
        other => debug!(%nick, kind = ?other, "ignoring room presence"),
    }
}

fn member_from(nick: &str, item: &MucItem) -> ChatMember {
    ChatMember {
        nick: nick.to_string(),
        jid: item.jid.clone(),
        affiliation: item.affiliation,
        role: item.role,
    }
}

fn self_available(
    state: &mut SessionState,
    ctx: &mut HookContext<'_>,
    chat_id: u32,
    nick: &str,
    muc: Option<&MucUser>,
    item: &MucItem,
    now: DateTime<Utc>,
) {
    let account = ctx.username().to_string();
    let Some(chat) = state.chats.find_by_id_mut(chat_id) else {
        return;
    };
    let has = |code| muc.is_some_and(|user| user.has(code));
    if muc.is_some() {
        chat.muc = true;
    }

    if chat.handle != nick {
        if !has(STATUS_NICK_ASSIGNED) {
            debug!(room = %chat.jid(), old = %chat.handle, new = %nick, "server changed our nick");
        }
        chat.handle = nick.to_string();
        emit(ctx, "chat.nick.changed", EventPayload::ChatNickChanged {
            account: account.clone(),
            chat_id,
            nick: nick.to_string(),
        });
    }
    chat.update_member(member_from(nick, item));

    if chat.joined.is_none() {
        chat.joined = Some(now);
        ctx.add_chat(chat_id);
        emit(ctx, "chat.joined", EventPayload::ChatJoined {
            account: account.clone(),
            chat_id,
            room: chat.jid(),
            nick: nick.to_string(),
        });
    }

    if has(STATUS_ROOM_CREATED) && !chat.config_requested {
        chat.config_requested = true;
        let room = chat.jid();
        emit(ctx, "chat.configuration-required", EventPayload::ChatConfigurationRequired {
            account,
            chat_id,
            room: room.clone(),
        });
        ctx.ui().request_action(
            ctx.connection(),
            "Create New Room",
            &format!(
                "You are creating a new room {room}. Would you like to configure it, or accept the default settings?"
            ),
            &["Configure Room", "Accept Defaults"],
        );
    }
}

fn occupant_available(
    state: &mut SessionState,
    ctx: &mut HookContext<'_>,
    chat_id: u32,
    nick: &str,
    item: &MucItem,
    presence: &Presence,
) {
    let account = ctx.username().to_string();
    let Some(chat) = state.chats.find_by_id_mut(chat_id) else {
        return;
    };
    let member = member_from(nick, item);

    if let Some(known) = chat.member(nick) {
        if *known == member {
            warn!(room = %chat.jid(), %nick, "member already in room");
            return;
        }
        chat.update_member(member.clone());
        emit(ctx, "chat.member.updated", EventPayload::ChatMemberUpdated {
            account,
            chat_id,
            member,
        });
        return;
    }

    let new_arrival = chat.joined.is_some_and(|joined| {
        !(presence.delayed && presence.stamp.is_some_and(|stamp| stamp < joined))
    });
    chat.add_member(member.clone());
    emit(ctx, "chat.member.joined", EventPayload::ChatMemberJoined {
        account,
        chat_id,
        member,
        new_arrival,
    });
}

fn renamed(
    state: &mut SessionState,
    ctx: &mut HookContext<'_>,
    chat_id: u32,
    old_nick: &str,
    new_nick: &str,
    is_self: bool,
) {
    let account = ctx.username().to_string();
    let Some(chat) = state.chats.find_by_id_mut(chat_id) else {
        return;
    };
    if !chat.rename_member(old_nick, new_nick) {
        return;
    }
    emit(ctx, "chat.member.renamed", EventPayload::ChatMemberRenamed {
        account: account.clone(),
        chat_id,
        old_nick: old_nick.to_string(),
        new_nick: new_nick.to_string(),
    });
    if is_self {
        chat.handle = new_nick.to_string();
        emit(ctx, "chat.nick.changed", EventPayload::ChatNickChanged {
            account,
            chat_id,
            nick: new_nick.to_string(),
        });
    }
}

/// Why someone left, from the status codes. `who` is `None` for ourselves.
fn departure_text(who: Option<&str>, muc: &MucUser, item: &MucItem) -> Option<String> {
    let subject = who.map_or_else(|| "You have".to_string(), |nick| format!("{nick} has"));
    let mut text = if muc.has(STATUS_KICKED) {
        format!("{subject} been kicked")
    } else if muc.has(STATUS_BANNED) {
        format!("{subject} been banned")
    } else if muc.has(STATUS_AFFILIATION_CHANGED) {
        format!("{subject} been removed from the room because of an affiliation change")
    } else if muc.has(STATUS_MEMBERS_ONLY) {
        format!("{subject} been removed from the room because the room is now members-only")
    } else if muc.has(STATUS_SHUTDOWN) {
        format!("{subject} been removed from the room because of a system shutdown")
    } else {
        return None;
    };
    if muc.has(STATUS_KICKED) || muc.has(STATUS_BANNED) {
        if let Some(actor) = &item.actor {
            text.push_str(&format!(" by {actor}"));
        }
        if let Some(reason) = &item.reason {
            text.push_str(&format!(": {reason}"));
        }
    }
    Some(text)
}

fn self_unavailable(
    state: &mut SessionState,
    ctx: &mut HookContext<'_>,
    chat_id: u32,
    muc: &MucUser,
    item: &MucItem,
    presence: &Presence,
) {
    let account = ctx.username().to_string();
    let Some(chat) = state.chats.destroy(chat_id) else {
        return;
    };
    let text = departure_text(None, muc, item).unwrap_or_else(|| match &presence.status {
        Some(status) => format!("You have left the room: {status}"),
        None => "You have left the room".to_string(),
    });
    debug!(room = %chat.jid(), %text, "removed from room");

    ctx.remove_chat(chat_id);
    emit(ctx, "chat.system-message", EventPayload::ChatSystemMessage {
        account: account.clone(),
        chat_id,
        text,
        no_log: false,
    });
    emit(ctx, "chat.signed-off", EventPayload::ChatSignedOff {
        account,
        chat_id,
        room: chat.jid(),
    });
}

fn occupant_unavailable(
    state: &mut SessionState,
    ctx: &mut HookContext<'_>,
    chat_id: u32,
    nick: &str,
    muc: &MucUser,
    item: &MucItem,
    presence: &Presence,
) {
    let account = ctx.username().to_string();
    let Some(chat) = state.chats.find_by_id_mut(chat_id) else {
        return;
    };
    if chat.remove_member(nick).is_none() {
        return;
    }
    let reason = departure_text(Some(nick), muc, item).or_else(|| presence.status.clone());
    emit(ctx, "chat.member.left", EventPayload::ChatMemberLeft {
        account,
        chat_id,
        nick: nick.to_string(),
        reason,
    });
}

fn room_error(state: &mut SessionState, ctx: &mut HookContext<'_>, chat_id: u32, presence: &Presence) {
    let account = ctx.username().to_string();
    let message = presence
        .error
        .clone()
        .unwrap_or_else(|| "Unknown Error in presence".to_string());
    let Some(chat) = state.chats.find_by_id(chat_id) else {
        return;
    };
    let room = chat.jid();

    if !chat.is_open() {
        warn!(%room, %message, "failed to join room");
        state.chats.destroy(chat_id);
        emit(ctx, "chat.join-failed", EventPayload::ChatJoinFailed {
            account,
            room,
            reason: message,
        });
        return;
    }

    emit(ctx, "chat.error", EventPayload::ChatError {
        account: account.clone(),
        chat_id,
        message: message.clone(),
    });
    emit(ctx, "chat.system-message", EventPayload::ChatSystemMessage {
        account: account.clone(),
        chat_id,
        text: format!("Error in chat {room}: {message}"),
        no_log: true,
    });

    if chat.members.is_empty() {
        state.chats.destroy(chat_id);
        ctx.remove_chat(chat_id);
        emit(ctx, "chat.signed-off", EventPayload::ChatSignedOff {
            account,
            chat_id,
            room,
        });
    }
}
