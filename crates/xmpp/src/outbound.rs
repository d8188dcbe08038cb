//! Building outgoing `<message/>` stanzas from UI markup.
//!
//! The UI hands us HTML-ish markup. We send a plain `<body/>` always and an
//! XHTML-IM `<html/>` alongside it only when it says more than the plain
//! text does.

use std::str::FromStr;

use minidom::Element;
use purple_core::event::{ChatState, MessageType};
use tracing::warn;

use crate::session::SessionState;
use crate::stanza::{Address, NS_CHATSTATES, NS_CLIENT, NS_XHTML, NS_XHTML_IM, next_id};

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub to: String,
    pub kind: MessageType,
    pub markup: String,
    pub chat_state: Option<ChatState>,
    pub thread: Option<String>,
}

impl OutgoingMessage {
    pub fn chat(to: impl Into<String>, markup: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            kind: MessageType::Chat,
            markup: markup.into(),
            chat_state: Some(ChatState::Active),
            thread: None,
        }
    }

    pub fn groupchat(room: impl Into<String>, markup: impl Into<String>) -> Self {
        Self {
            to: room.into(),
            kind: MessageType::Groupchat,
            markup: markup.into(),
            chat_state: None,
            thread: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub plain: String,
    /// Inner XHTML of the `<body/>`, absent when equivalent to `plain`.
    pub xhtml: Option<String>,
}

/// Drop control characters XML cannot carry, keeping tab and line breaks.
pub fn strip_unprintable(text: &str) -> String {
    text.chars()
        .filter(|&c| !(c.is_control() && !matches!(c, '\t' | '\n' | '\r')))
        .filter(|&c| !matches!(c, '\u{FFFE}' | '\u{FFFF}'))
        .collect()
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Resolve named and numeric character references. Unknown ones stay as-is.
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find(';').filter(|&end| end <= 10) else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{a0}'),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Whether an XHTML body says nothing the plain body does not: entities are
/// resolved and `<br/>` counts as one newline; any other markup differs.
pub fn equivalent(xhtml: &str, plain: &str) -> bool {
    let flattened = xhtml
        .replace("<br/>", "\n")
        .replace("<br />", "\n")
        .replace("<br>", "\n");
    if flattened.contains('<') {
        return false;
    }
    unescape(&flattened) == plain
}

struct Tag {
    name: String,
    closing: bool,
    self_closing: bool,
    attrs: Vec<(String, String)>,
}

impl Tag {
    fn parse(raw: &str) -> Option<Self> {
        let inner = raw.trim();
        let (closing, inner) = match inner.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, inner),
        };
        let (self_closing, inner) = match inner.strip_suffix('/') {
            Some(rest) => (true, rest),
            None => (false, inner),
        };
        let name_end = inner
            .find(|c: char| c.is_whitespace())
            .unwrap_or(inner.len());
        let name = inner[..name_end].to_ascii_lowercase();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(Self {
            name,
            closing,
            self_closing,
            attrs: parse_attrs(&inner[name_end..]),
        })
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn parse_attrs(mut rest: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    loop {
        rest = rest.trim_start();
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().to_ascii_lowercase();
        let after = rest[eq + 1..].trim_start();
        let (value, remainder) = match after.chars().next() {
            Some(quote @ ('"' | '\'')) => match after[1..].find(quote) {
                Some(close) => (&after[1..close + 1], &after[close + 2..]),
                None => (&after[1..], ""),
            },
            _ => {
                let end = after.find(char::is_whitespace).unwrap_or(after.len());
                (&after[..end], &after[end..])
            }
        };
        attrs.push((key, unescape(value)));
        rest = remainder;
    }
    attrs
}

fn font_style(tag: &Tag) -> String {
    let mut style = String::new();
    if let Some(color) = tag.attr("color") {
        style.push_str(&format!("color: {color}; "));
    }
    if let Some(face) = tag.attr("face") {
        style.push_str(&format!("font-family: {face}; "));
    }
    if let Some(size) = tag.attr("size") {
        let css = match size.trim() {
            "1" => "xx-small",
            "2" => "small",
            "4" => "large",
            "5" => "x-large",
            "6" | "7" => "xx-large",
            _ => "medium",
        };
        style.push_str(&format!("font-size: {css}; "));
    }
    style.trim_end().to_string()
}

/// Render UI markup into a plain body and, when it differs, an XHTML body.
pub fn render(markup: &str) -> Rendered {
    let markup = strip_unprintable(markup);
    let mut plain = String::new();
    let mut xhtml = String::new();
    // (input tag name, output closing tag)
    let mut open: Vec<(String, &'static str)> = Vec::new();

    let mut rest = markup.as_str();
    while !rest.is_empty() {
        let Some(lt) = rest.find('<') else {
            let text = unescape(rest);
            plain.push_str(&text);
            xhtml.push_str(&escape(&text));
            break;
        };
        if lt > 0 {
            let text = unescape(&rest[..lt]);
            plain.push_str(&text);
            xhtml.push_str(&escape(&text));
        }
        let after = &rest[lt + 1..];
        let Some(gt) = after.find('>') else {
            let text = unescape(&rest[lt..]);
            plain.push_str(&text);
            xhtml.push_str(&escape(&text));
            break;
        };
        rest = &after[gt + 1..];
        let Some(tag) = Tag::parse(&after[..gt]) else {
            continue;
        };

        if tag.closing {
            if let Some(position) = open.iter().rposition(|(name, _)| *name == tag.name) {
                for (_, close) in open.drain(position..).rev() {
                    xhtml.push_str(close);
                }
            }
            continue;
        }

        let opened: Option<(String, &'static str)> = match tag.name.as_str() {
            "br" => {
                plain.push('\n');
                xhtml.push_str("<br/>");
                None
            }
            "b" | "strong" => Some(("<strong>".into(), "</strong>")),
            "i" | "em" => Some(("<em>".into(), "</em>")),
            "u" => Some((
                "<span style='text-decoration: underline;'>".into(),
                "</span>",
            )),
            "s" | "strike" => Some((
                "<span style='text-decoration: line-through;'>".into(),
                "</span>",
            )),
            "a" => tag.attr("href").map(|href| {
                (format!("<a href='{}'>", escape(href)), "</a>")
            }),
            "font" => {
                let style = font_style(&tag);
                (!style.is_empty()).then(|| (format!("<span style='{}'>", escape(&style)), "</span>"))
            }
            "span" => tag
                .attr("style")
                .map(|style| (format!("<span style='{}'>", escape(style)), "</span>")),
            "p" => Some(("<p>".into(), "</p>")),
            "img" => {
                if let Some(src) = tag.attr("src") {
                    let alt = tag.attr("alt").unwrap_or(src);
                    plain.push_str(alt);
                    xhtml.push_str(&format!(
                        "<img src='{}' alt='{}'/>",
                        escape(src),
                        escape(alt)
                    ));
                }
                None
            }
            _ => None,
        };
        if let Some((start, close)) = opened {
            if tag.self_closing {
                continue;
            }
            xhtml.push_str(&start);
            open.push((tag.name.clone(), close));
        }
    }
    for (_, close) in open.into_iter().rev() {
        xhtml.push_str(close);
    }

    let xhtml = (!equivalent(&xhtml, &plain)).then_some(xhtml);
    Rendered { plain, xhtml }
}

/// Whether a typing notification to `to` is worth sending: never to a
/// contact we share no presence or subscription with, nor to a resource
/// known not to support chat states.
pub fn chat_state_allowed(state: &SessionState, to: &str) -> bool {
    let Ok(address) = Address::parse(to) else {
        return false;
    };
    if !state.buddies.has_presence_or_subscription(&address.bare) {
        return false;
    }
    let resource = match address.resource {
        Some(resource) => Some(resource),
        None => state
            .buddies
            .get(&address.bare)
            .and_then(|buddy| buddy.top_resource())
            .map(|top| top.name.clone()),
    };
    match resource {
        Some(resource) => {
            state
                .buddies
                .resource_supports(&address.bare, &resource, NS_CHATSTATES)
                != Some(false)
        }
        None => true,
    }
}

fn message_type(kind: MessageType) -> &'static str {
    match kind {
        MessageType::Chat => "chat",
        MessageType::Groupchat => "groupchat",
        MessageType::Headline => "headline",
        MessageType::Error => "error",
        MessageType::Normal | MessageType::Event => "normal",
    }
}

/// Build the stanza, or `None` when it would carry neither a body nor an
/// allowed chat state.
pub fn build(state: &SessionState, message: &OutgoingMessage) -> Option<Element> {
    let rendered = render(&message.markup);
    let chat_state = message
        .chat_state
        .filter(|_| message.kind == MessageType::Chat)
        .filter(|_| chat_state_allowed(state, &message.to));

    if rendered.plain.is_empty() && chat_state.is_none() {
        return None;
    }

    let mut builder = Element::builder("message", NS_CLIENT)
        .attr("to", message.to.as_str())
        .attr("type", message_type(message.kind))
        .attr("id", next_id("msg"));

    if !rendered.plain.is_empty() {
        builder = builder.append(
            Element::builder("body", NS_CLIENT)
                .append(minidom::Node::Text(rendered.plain.clone()))
                .build(),
        );
    }
    if let Some(thread) = &message.thread {
        builder = builder.append(
            Element::builder("thread", NS_CLIENT)
                .append(minidom::Node::Text(thread.clone()))
                .build(),
        );
    }
    if let Some(xhtml) = &rendered.xhtml {
        match Element::from_str(&format!("<body xmlns='{NS_XHTML}'>{xhtml}</body>")) {
            Ok(body) => {
                builder = builder.append(Element::builder("html", NS_XHTML_IM).append(body).build());
            }
            Err(error) => warn!(%error, "dropping XHTML body that does not parse"),
        }
    }
    if let Some(chat_state) = chat_state {
        builder = builder.append(Element::builder(chat_state.as_str(), NS_CHATSTATES).build());
    }
    Some(builder.build())
}
