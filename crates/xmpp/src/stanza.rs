//! Raw stanza plumbing shared by the presence, message and IQ handlers.

use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use minidom::Element;

use crate::error::XmppError;

pub const NS_CLIENT: &str = "jabber:client";
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const NS_ROSTER: &str = "jabber:iq:roster";
pub const NS_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
pub const NS_DATA_FORMS: &str = "jabber:x:data";
pub const NS_CAPS: &str = "http://jabber.org/protocol/caps";
pub const NS_DELAY: &str = "urn:xmpp:delay";
pub const NS_LEGACY_DELAY: &str = "jabber:x:delay";
pub const NS_LAST: &str = "jabber:iq:last";
pub const NS_IDLE: &str = "urn:xmpp:idle:1";
pub const NS_NICK: &str = "http://jabber.org/protocol/nick";
pub const NS_VCARD_UPDATE: &str = "vcard-temp:x:update";
pub const NS_MUC: &str = "http://jabber.org/protocol/muc";
pub const NS_MUC_USER: &str = "http://jabber.org/protocol/muc#user";
pub const NS_CHATSTATES: &str = "http://jabber.org/protocol/chatstates";
pub const NS_XHTML_IM: &str = "http://jabber.org/protocol/xhtml-im";
pub const NS_XHTML: &str = "http://www.w3.org/1999/xhtml";
pub const NS_CARBONS: &str = "urn:xmpp:carbons:2";
pub const NS_FORWARD: &str = "urn:xmpp:forward:0";
pub const NS_PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";
pub const NS_MOOD: &str = "http://jabber.org/protocol/mood";
pub const NS_TUNE: &str = "http://jabber.org/protocol/tune";
pub const NS_PING: &str = "urn:xmpp:ping";

pub fn parse(raw: &[u8]) -> Result<Element, XmppError> {
    let xml = std::str::from_utf8(raw)
        .map_err(|error| XmppError::ParseFailed(format!("invalid UTF-8 stanza bytes: {error}")))?;
    let trimmed = xml.trim();
    if trimmed.is_empty() {
        return Err(XmppError::ParseFailed("stanza payload is empty".to_string()));
    }
    Ok(Element::from_str(trimmed)?)
}

pub fn to_bytes(element: &Element) -> Result<Vec<u8>, XmppError> {
    let mut out = Vec::new();
    element
        .write_to(&mut out)
        .map_err(|error| XmppError::ParseFailed(format!("failed to serialize stanza: {error}")))?;
    Ok(out)
}

pub fn next_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

pub fn build_iq(kind: &str, id: &str, to: Option<&str>, payload: Option<Element>) -> Element {
    let mut builder = Element::builder("iq", NS_CLIENT)
        .attr("type", kind)
        .attr("id", id);
    if let Some(to) = to {
        builder = builder.attr("to", to);
    }
    if let Some(payload) = payload {
        builder = builder.append(payload);
    }
    builder.build()
}

/// A validated JID split into its bare part and resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub bare: String,
    pub resource: Option<String>,
}

impl Address {
    pub fn parse(value: &str) -> Result<Self, XmppError> {
        let jid = jid::Jid::new(value)?;
        Ok(Self {
            bare: jid.to_bare().to_string(),
            resource: jid.resource().map(|resource| resource.as_str().to_string()),
        })
    }

    pub fn full(&self) -> String {
        match &self.resource {
            Some(resource) => format!("{}/{resource}", self.bare),
            None => self.bare.clone(),
        }
    }
}

/// Text of the first child `name` in `ns`, if present and non-empty.
pub fn child_text(element: &Element, name: &str, ns: &str) -> Option<String> {
    element
        .get_child(name, ns)
        .map(Element::text)
        .filter(|text| !text.is_empty())
}

/// Parse an XEP-0082 timestamp, or the legacy XEP-0091 `CCYYMMDDThh:mm:ss`.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(stamp) = DateTime::parse_from_rfc3339(value) {
        return Some(stamp.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// The `<error/>` child of a stanza, reduced to something a person can read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    pub condition: Option<String>,
    pub text: Option<String>,
    pub code: Option<String>,
}

impl StanzaError {
    pub fn from_stanza(stanza: &Element) -> Option<Self> {
        let error = stanza.get_child("error", stanza.ns().as_str())?;
        let condition = error
            .children()
            .find(|c| c.ns() == NS_STANZAS && c.name() != "text")
            .map(|c| c.name().to_string());
        let text = child_text(error, "text", NS_STANZAS);
        let code = error.attr("code").map(str::to_string);
        Some(Self {
            condition,
            text,
            code,
        })
    }

    pub fn description(&self) -> String {
        let base = match self.condition.as_deref() {
            Some(condition) => condition_message(condition).to_string(),
            None => match self.code.as_deref() {
                Some(code) => format!("Error {code}"),
                None => "Unknown Error".to_string(),
            },
        };
        match &self.text {
            Some(text) => format!("{base}: {text}"),
            None => base,
        }
    }
}

fn condition_message(condition: &str) -> &'static str {
    match condition {
        "bad-request" => "Bad Request",
        "conflict" => "Conflict",
        "feature-not-implemented" => "Feature Not Implemented",
        "forbidden" => "Forbidden",
        "gone" => "Gone",
        "internal-server-error" => "Internal Server Error",
        "item-not-found" => "Item Not Found",
        "jid-malformed" => "Malformed XMPP ID",
        "not-acceptable" => "Not Acceptable",
        "not-allowed" => "Not Allowed",
        "not-authorized" => "Not Authorized",
        "payment-required" => "Payment Required",
        "recipient-unavailable" => "Recipient Unavailable",
        "redirect" => "Redirect",
        "registration-required" => "Registration Required",
        "remote-server-not-found" => "Remote Server Not Found",
        "remote-server-timeout" => "Remote Server Timeout",
        "resource-constraint" => "Server Overloaded",
        "service-unavailable" => "Service Unavailable",
        "subscription-required" => "Subscription Required",
        "unexpected-request" => "Unexpected Request",
        _ => "Unknown Error",
    }
}
