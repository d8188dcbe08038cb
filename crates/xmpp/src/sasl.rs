use std::collections::HashSet;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use minidom::Element;
use sasl::client::Mechanism;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};

use crate::error::XmppError;
use crate::stanza::NS_SASL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedMechanism {
    ScramSha256,
    ScramSha1,
    Plain,
}

impl SelectedMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SelectedMechanism::ScramSha256 => "SCRAM-SHA-256",
            SelectedMechanism::ScramSha1 => "SCRAM-SHA-1",
            SelectedMechanism::Plain => "PLAIN",
        }
    }
}

impl std::fmt::Display for SelectedMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const MECHANISM_PREFERENCE: &[SelectedMechanism] = &[
    SelectedMechanism::ScramSha256,
    SelectedMechanism::ScramSha1,
    SelectedMechanism::Plain,
];

/// Pick the strongest mechanism we share with the server. PLAIN is only
/// considered once the stream is encrypted.
pub fn select_mechanism(
    server_mechanisms: &HashSet<String>,
    encrypted: bool,
) -> Option<SelectedMechanism> {
    MECHANISM_PREFERENCE
        .iter()
        .filter(|m| encrypted || **m != SelectedMechanism::Plain)
        .find(|m| server_mechanisms.contains(m.name()))
        .copied()
}

pub fn offered_mechanisms(features: &Element) -> HashSet<String> {
    features
        .get_child("mechanisms", NS_SASL)
        .map(|mechanisms| {
            mechanisms
                .children()
                .filter(|c| c.name() == "mechanism")
                .map(|c| c.text().trim().to_string())
                .collect()
        })
        .unwrap_or_default()
}

pub fn build_mechanism(
    selected: SelectedMechanism,
    username: &str,
    password: &str,
) -> Result<Box<dyn Mechanism + Send>, XmppError> {
    let credentials = Credentials::default()
        .with_username(username)
        .with_password(password)
        .with_channel_binding(ChannelBinding::Unsupported);
    let mechanism: Result<Box<dyn Mechanism + Send>, _> = match selected {
        SelectedMechanism::ScramSha256 => Scram::<Sha256>::from_credentials(credentials)
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>),
        SelectedMechanism::ScramSha1 => Scram::<Sha1>::from_credentials(credentials)
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>),
        SelectedMechanism::Plain => {
            Plain::from_credentials(credentials).map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
        }
    };
    mechanism.map_err(|e| {
        XmppError::AuthenticationImpossible(format!("failed to initialize {selected}: {e:?}"))
    })
}

fn encode(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        STANDARD.encode(data)
    }
}

pub fn decode(element: &Element) -> Result<Vec<u8>, XmppError> {
    let text = element.text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    STANDARD
        .decode(text)
        .map_err(|error| XmppError::AuthenticationFailed(format!("malformed SASL payload: {error}")))
}

pub fn auth_element(mechanism: &str, initial: &[u8]) -> Element {
    Element::builder("auth", NS_SASL)
        .attr("mechanism", mechanism)
        .append(minidom::Node::Text(encode(initial)))
        .build()
}

pub fn response_element(data: &[u8]) -> Element {
    Element::builder("response", NS_SASL)
        .append(minidom::Node::Text(encode(data)))
        .build()
}

/// Turn a `<failure/>` into an error naming its condition.
pub fn map_failure(failure: &Element) -> XmppError {
    let condition = failure
        .children()
        .find(|c| c.name() != "text")
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let text = failure
        .get_child("text", NS_SASL)
        .map(Element::text)
        .unwrap_or_default();
    if text.is_empty() {
        XmppError::AuthenticationFailed(condition)
    } else {
        XmppError::AuthenticationFailed(format!("{condition}: {text}"))
    }
}
