//! XEP-0280 Message Carbons.

use chrono::{DateTime, Utc};
use minidom::Element;
use tracing::warn;

use crate::stanza::{Address, NS_CARBONS, NS_DELAY, NS_FORWARD, build_iq, parse_timestamp};

pub const ENABLE_IQ_ID: &str = "carbons-enable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CarbonsState {
    #[default]
    Disabled,
    Enabling,
    Enabled,
}

#[derive(Debug, Default)]
pub struct CarbonsManager {
    state: CarbonsState,
}

impl CarbonsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CarbonsState {
        self.state
    }

    /// The enable IQ, unless carbons are already on or on their way.
    pub fn enable(&mut self) -> Option<Element> {
        if self.state != CarbonsState::Disabled {
            return None;
        }
        self.state = CarbonsState::Enabling;
        Some(build_iq(
            "set",
            ENABLE_IQ_ID,
            None,
            Some(Element::builder("enable", NS_CARBONS).build()),
        ))
    }

    /// Feed an IQ response. Returns true if it answered our enable request.
    pub fn handle_iq(&mut self, iq: &Element) -> bool {
        if self.state != CarbonsState::Enabling || iq.attr("id") != Some(ENABLE_IQ_ID) {
            return false;
        }
        self.state = match iq.attr("type") {
            Some("result") => CarbonsState::Enabled,
            _ => {
                warn!("server refused to enable carbons");
                CarbonsState::Disabled
            }
        };
        true
    }

    pub fn reset(&mut self) {
        self.state = CarbonsState::Disabled;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarbonDirection {
    Received,
    Sent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnwrappedCarbon {
    pub direction: CarbonDirection,
    pub message: Element,
    /// From the `<forwarded/>` wrapper, not the inner message.
    pub delay: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Carbon {
    NotACarbon,
    /// A carbon from someone other than our own account.
    Spoofed,
    Unwrapped(UnwrappedCarbon),
}

/// Unwrap a carbon copy. Only envelopes sent by our own bare JID are
/// trusted; anything else claiming to be a carbon is flagged as spoofed.
pub fn unwrap(message: &Element, own_bare: &str) -> Carbon {
    let Some((direction, wrapper)) = message.children().find_map(|child| {
        if child.ns() != NS_CARBONS {
            return None;
        }
        match child.name() {
            "received" => Some((CarbonDirection::Received, child)),
            "sent" => Some((CarbonDirection::Sent, child)),
            _ => None,
        }
    }) else {
        return Carbon::NotACarbon;
    };

    let sender = match message.attr("from") {
        None => Some(own_bare.to_string()),
        Some(from) => Address::parse(from).ok().map(|address| address.bare),
    };
    if !sender.is_some_and(|bare| bare.eq_ignore_ascii_case(own_bare)) {
        warn!(from = ?message.attr("from"), "dropping carbon not sent by our own account");
        return Carbon::Spoofed;
    }

    let Some(forwarded) = wrapper.get_child("forwarded", NS_FORWARD) else {
        warn!("carbon without a forwarded payload");
        return Carbon::Spoofed;
    };
    let Some(inner) = forwarded.children().find(|c| c.name() == "message") else {
        warn!("carbon without a forwarded message");
        return Carbon::Spoofed;
    };
    let delay = forwarded
        .get_child("delay", NS_DELAY)
        .and_then(|delay| delay.attr("stamp"))
        .and_then(parse_timestamp);

    Carbon::Unwrapped(UnwrappedCarbon {
        direction,
        message: inner.clone(),
        delay,
    })
}
