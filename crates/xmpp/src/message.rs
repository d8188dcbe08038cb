//! Inbound `<message/>` pipeline: carbon unwrapping, classification, then
//! dispatch to rooms, contacts or PEP.

use chrono::{DateTime, Utc};
use minidom::Element;
use purple_core::event::{ChatMessage, ChatState, EventPayload, MessageType};
use purple_core::protocol::HookContext;
use tracing::{debug, warn};

use crate::carbons::{self, Carbon, CarbonDirection};
use crate::pep::{self, PepItem};
use crate::session::{SessionState, emit};
use crate::stanza::{
    Address, NS_CHATSTATES, NS_CLIENT, NS_DELAY, NS_LEGACY_DELAY, NS_PUBSUB_EVENT, NS_XHTML,
    NS_XHTML_IM, StanzaError, child_text, parse_timestamp,
};

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// `Sent` only for carbons of messages our other resources sent.
    pub direction: CarbonDirection,
    pub from: Address,
    pub to: Option<String>,
    pub kind: MessageType,
    pub id: Option<String>,
    pub thread: Option<String>,
    pub body: Option<String>,
    pub html: Option<String>,
    pub subject: Option<String>,
    pub chat_state: Option<ChatState>,
    pub delay: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub pep: Vec<PepItem>,
}

pub fn classify(message: &Element) -> MessageType {
    let kind = match message.attr("type") {
        Some("chat") => MessageType::Chat,
        Some("groupchat") => return MessageType::Groupchat,
        Some("headline") => MessageType::Headline,
        Some("error") => return MessageType::Error,
        _ => MessageType::Normal,
    };
    if message.get_child("event", NS_PUBSUB_EVENT).is_some() {
        MessageType::Event
    } else {
        kind
    }
}

/// Read a (possibly unwrapped) message. `carbon_delay` overrides any delay
/// on the inner message.
pub fn parse(
    message: &Element,
    direction: CarbonDirection,
    carbon_delay: Option<DateTime<Utc>>,
    own_bare: &str,
) -> Option<InboundMessage> {
    let from = match message.attr("from") {
        Some(from) => match Address::parse(from) {
            Ok(address) => address,
            Err(error) => {
                warn!(%from, %error, "dropping message with malformed sender");
                return None;
            }
        },
        None => Address {
            bare: own_bare.to_string(),
            resource: None,
        },
    };
    let kind = classify(message);

    let delay = carbon_delay.or_else(|| {
        message
            .get_child("delay", NS_DELAY)
            .or_else(|| message.get_child("x", NS_LEGACY_DELAY))
            .and_then(|delay| delay.attr("stamp"))
            .and_then(parse_timestamp)
    });

    let html = message
        .get_child("html", NS_XHTML_IM)
        .and_then(|html| html.get_child("body", NS_XHTML))
        .map(String::from);

    let chat_state = message
        .children()
        .filter(|child| child.ns() == NS_CHATSTATES)
        .find_map(|child| ChatState::from_element_name(child.name()));

    let error = (kind == MessageType::Error).then(|| {
        StanzaError::from_stanza(message)
            .map(|error| error.description())
            .unwrap_or_else(|| "Unknown Error".to_string())
    });

    Some(InboundMessage {
        direction,
        to: message.attr("to").map(str::to_string),
        kind,
        id: message.attr("id").map(str::to_string),
        thread: child_text(message, "thread", NS_CLIENT),
        body: child_text(message, "body", NS_CLIENT),
        html,
        subject: message.get_child("subject", NS_CLIENT).map(Element::text),
        chat_state,
        delay,
        error,
        pep: pep::parse_event(message),
        from,
    })
}

pub fn handle(state: &mut SessionState, ctx: &mut HookContext<'_>, stanza: &Element, now: DateTime<Utc>) {
    let own_bare = state.own_bare().to_string();
    let parsed = match carbons::unwrap(stanza, &own_bare) {
        Carbon::NotACarbon => parse(stanza, CarbonDirection::Received, None, &own_bare),
        Carbon::Spoofed => return,
        Carbon::Unwrapped(carbon) => {
            parse(&carbon.message, carbon.direction, carbon.delay, &own_bare)
        }
    };
    let Some(message) = parsed else {
        return;
    };

    match message.kind {
        MessageType::Event => {
            let items = message.pep.clone();
            pep::apply(state, ctx, &message.from.bare, items);
        }
        MessageType::Groupchat => groupchat(state, ctx, message, now),
        MessageType::Error => error(state, ctx, message, now),
        MessageType::Chat | MessageType::Normal | MessageType::Headline => {
            direct(ctx, message, now);
        }
    }
}

fn chat_message(message: &InboundMessage, body: String, now: DateTime<Utc>) -> ChatMessage {
    ChatMessage {
        id: message.id.clone(),
        from: message.from.full(),
        to: message.to.clone().unwrap_or_default(),
        body,
        html: message.html.clone(),
        timestamp: message.delay.unwrap_or(now),
        delayed: message.delay.is_some(),
        message_type: message.kind,
        thread: message.thread.clone(),
    }
}

fn direct(ctx: &mut HookContext<'_>, message: InboundMessage, now: DateTime<Utc>) {
    let account = ctx.username().to_string();
    if let (Some(state), CarbonDirection::Received) = (message.chat_state, message.direction) {
        emit(ctx, "message.chat-state", EventPayload::ChatStateReceived {
            account: account.clone(),
            from: message.from.full(),
            state,
        });
    }
    let Some(body) = message.body.clone() else {
        return;
    };
    let chat_message = chat_message(&message, body, now);
    match message.direction {
        CarbonDirection::Received => emit(ctx, "message.received", EventPayload::MessageReceived {
            account,
            message: chat_message,
        }),
        CarbonDirection::Sent => emit(ctx, "message.sent", EventPayload::MessageSent {
            account,
            message: chat_message,
        }),
    }
}

fn groupchat(state: &mut SessionState, ctx: &mut HookContext<'_>, message: InboundMessage, now: DateTime<Utc>) {
    let account = ctx.username().to_string();
    let Some(chat) = state.chats.find_by_jid(&message.from.bare) else {
        debug!(room = %message.from.bare, "groupchat message for a room we are not in");
        return;
    };
    if chat.left {
        return;
    }
    let chat_id = chat.id;

    match (&message.subject, &message.body) {
        (Some(topic), None) => {
            let who = message.from.resource.clone();
            let text = match (&who, topic.is_empty()) {
                (Some(who), false) => format!("{who} has set the topic to: {topic}"),
                (Some(who), true) => format!("{who} has cleared the topic"),
                (None, false) => format!("The topic is: {topic}"),
                (None, true) => "The topic has been cleared".to_string(),
            };
            emit(ctx, "chat.topic.changed", EventPayload::ChatTopicChanged {
                account: account.clone(),
                chat_id,
                who,
                topic: topic.clone(),
            });
            emit(ctx, "chat.system-message", EventPayload::ChatSystemMessage {
                account,
                chat_id,
                text,
                no_log: true,
            });
        }
        (_, Some(body)) => {
            let chat_message = chat_message(&message, body.clone(), now);
            emit(ctx, "message.received", EventPayload::MessageReceived {
                account,
                message: chat_message,
            });
        }
        (None, None) => debug!(room = %message.from.bare, "empty groupchat message"),
    }
}

fn error(state: &mut SessionState, ctx: &mut HookContext<'_>, message: InboundMessage, now: DateTime<Utc>) {
    let account = ctx.username().to_string();
    let reason = message.error.clone().unwrap_or_default();

    if let Some(chat) = state.chats.find_by_jid(&message.from.bare) {
        let chat_id = chat.id;
        emit(ctx, "chat.error", EventPayload::ChatError {
            account: account.clone(),
            chat_id,
            message: reason.clone(),
        });
        emit(ctx, "chat.system-message", EventPayload::ChatSystemMessage {
            account,
            chat_id,
            text: format!("Message delivery failed: {reason}"),
            no_log: true,
        });
        return;
    }

    let text = format!("Message delivery to {} failed: {reason}", message.from.full());
    let chat_message = chat_message(&message, text, now);
    emit(ctx, "message.received", EventPayload::MessageReceived {
        account,
        message: chat_message,
    });
}
