//! PEP notifications we track on contacts: XEP-0107 mood and XEP-0118 tune.

use minidom::Element;
use purple_core::event::{EventPayload, Tune};
use purple_core::protocol::HookContext;
use tracing::{debug, warn};

use crate::session::{SessionState, emit};
use crate::stanza::{NS_MOOD, NS_PUBSUB_EVENT, NS_TUNE, child_text};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PepItem {
    /// `None` when the contact cleared their mood.
    Mood(Option<(String, Option<String>)>),
    /// `None` when playback stopped.
    Tune(Option<Tune>),
}

/// Pull mood or tune items out of a `<message/>` carrying a pubsub event.
pub fn parse_event(message: &Element) -> Vec<PepItem> {
    let Some(event) = message.get_child("event", NS_PUBSUB_EVENT) else {
        return Vec::new();
    };
    let mut items = Vec::new();
    for node in event.children().filter(|c| c.name() == "items") {
        let payloads = node
            .children()
            .filter(|c| c.name() == "item")
            .filter_map(|item| item.children().next());
        match node.attr("node") {
            Some(NS_MOOD) => items.extend(payloads.filter_map(parse_mood).map(PepItem::Mood)),
            Some(NS_TUNE) => items.extend(payloads.filter_map(parse_tune).map(PepItem::Tune)),
            Some(other) => debug!(node = %other, "ignoring PEP node"),
            None => warn!("PEP items without a node"),
        }
    }
    items
}

fn parse_mood(mood: &Element) -> Option<Option<(String, Option<String>)>> {
    if !mood.is("mood", NS_MOOD) {
        return None;
    }
    let value = mood
        .children()
        .find(|c| c.ns() == NS_MOOD && c.name() != "text")
        .map(|c| c.name().to_string());
    let text = child_text(mood, "text", NS_MOOD);
    Some(value.map(|value| (value, text)))
}

fn parse_tune(tune: &Element) -> Option<Option<Tune>> {
    if !tune.is("tune", NS_TUNE) {
        return None;
    }
    let parsed = Tune {
        artist: child_text(tune, "artist", NS_TUNE),
        title: child_text(tune, "title", NS_TUNE),
        source: child_text(tune, "source", NS_TUNE),
        track: child_text(tune, "track", NS_TUNE),
        length: child_text(tune, "length", NS_TUNE).and_then(|length| length.trim().parse().ok()),
        uri: child_text(tune, "uri", NS_TUNE),
    };
    Some(Some(parsed).filter(|tune| *tune != Tune::default()))
}

/// Store PEP updates on the sender's buddy record and announce them.
pub fn apply(state: &mut SessionState, ctx: &mut HookContext<'_>, from_bare: &str, items: Vec<PepItem>) {
    let account = ctx.username().to_string();
    let buddy = state.buddies.entry(from_bare);
    for item in items {
        match item {
            PepItem::Mood(mood) => {
                buddy.mood = mood.clone();
                let (mood, text) = match mood {
                    Some((mood, text)) => (Some(mood), text),
                    None => (None, None),
                };
                emit(ctx, "buddy.mood.changed", EventPayload::BuddyMoodChanged {
                    account: account.clone(),
                    jid: from_bare.to_string(),
                    mood,
                    text,
                });
            }
            PepItem::Tune(tune) => {
                buddy.tune = tune.clone();
                emit(ctx, "buddy.tune.changed", EventPayload::BuddyTuneChanged {
                    account: account.clone(),
                    jid: from_bare.to_string(),
                    tune,
                });
            }
        }
    }
}
