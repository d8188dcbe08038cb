//! Sans-IO stream negotiation: STARTTLS, SASL, stream restart and resource
//! binding. The negotiator consumes top-level elements and answers with
//! [`Frame`]s for the driver to put on the wire.

use minidom::Element;
use sasl::client::Mechanism;
use tracing::{debug, info, warn};

use crate::error::XmppError;
use crate::sasl::{
    auth_element, build_mechanism, decode, map_failure, offered_mechanisms, response_element,
    select_mechanism,
};
use crate::stanza::{NS_BIND, NS_CLIENT, NS_SASL, NS_STANZAS, NS_STREAMS, NS_TLS, build_iq};

pub const BIND_IQ_ID: &str = "bind-1";

const NS_STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// One unit of output for the transport driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Opening `<stream:stream>` tag; sent at login and after every restart.
    Header(String),
    Stanza(Element),
    /// Upgrade the transport before the next header.
    StartTls,
    /// Closing `</stream:stream>` tag.
    Close,
}

impl Frame {
    /// Wire bytes, or `None` for `StartTls` which is a transport action.
    pub fn to_bytes(&self) -> Result<Option<Vec<u8>>, XmppError> {
        match self {
            Frame::Header(header) => Ok(Some(header.clone().into_bytes())),
            Frame::Stanza(element) => crate::stanza::to_bytes(element).map(Some),
            Frame::StartTls => Ok(None),
            Frame::Close => Ok(Some(b"</stream:stream>".to_vec())),
        }
    }
}

pub fn stream_header(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{domain}' version='1.0' \
         xmlns='{NS_CLIENT}' xmlns:stream='{NS_STREAMS}'>"
    )
}

/// Map a `<stream:error/>` to an [`XmppError`]. `None` if `element` is not one.
pub fn stream_error(element: &Element) -> Option<XmppError> {
    if !element.is("error", NS_STREAMS) {
        return None;
    }
    let condition = element
        .children()
        .find(|c| c.ns() == NS_STREAM_ERRORS && c.name() != "text")
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    let text = element
        .get_child("text", NS_STREAM_ERRORS)
        .map(Element::text)
        .filter(|t| !t.is_empty());
    let message = match text {
        Some(text) => format!("{condition}: {text}"),
        None => condition.clone(),
    };
    Some(match condition.as_str() {
        "conflict" => XmppError::Conflict(message),
        "not-authorized" => XmppError::AuthenticationFailed(message),
        _ => XmppError::StreamError(message),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    AwaitFeatures,
    StartingTls,
    Authenticating,
    Binding,
    Ready,
}

pub struct StreamNegotiator {
    domain: String,
    username: String,
    password: String,
    resource: String,
    require_tls: bool,
    encrypted: bool,
    authenticated: bool,
    phase: StreamPhase,
    mechanism: Option<Box<dyn Mechanism + Send>>,
    bound: Option<String>,
}

impl std::fmt::Debug for StreamNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamNegotiator")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("resource", &self.resource)
            .field("phase", &self.phase)
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

impl StreamNegotiator {
    pub fn new(
        domain: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        resource: impl Into<String>,
        require_tls: bool,
    ) -> Self {
        Self {
            domain: domain.into(),
            username: username.into(),
            password: password.into(),
            resource: resource.into(),
            require_tls,
            encrypted: false,
            authenticated: false,
            phase: StreamPhase::AwaitFeatures,
            mechanism: None,
            bound: None,
        }
    }

    /// For transports that are encrypted from the first byte.
    pub fn already_encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// Credentials for SASL; must be set before features arrive.
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == StreamPhase::Ready
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The full JID the server bound us to.
    pub fn bound_jid(&self) -> Option<&str> {
        self.bound.as_deref()
    }

    pub fn open(&self) -> Frame {
        Frame::Header(stream_header(&self.domain))
    }

    pub fn handle(&mut self, element: &Element) -> Result<Vec<Frame>, XmppError> {
        if let Some(error) = stream_error(element) {
            return Err(error);
        }
        match self.phase {
            StreamPhase::AwaitFeatures => self.on_features(element),
            StreamPhase::StartingTls => self.on_tls(element),
            StreamPhase::Authenticating => self.on_sasl(element),
            StreamPhase::Binding => self.on_bind(element),
            StreamPhase::Ready => {
                debug!(name = %element.name(), "negotiator ignoring post-bind element");
                Ok(Vec::new())
            }
        }
    }

    fn on_features(&mut self, features: &Element) -> Result<Vec<Frame>, XmppError> {
        if !features.is("features", NS_STREAMS) {
            debug!(name = %features.name(), "waiting for stream features");
            return Ok(Vec::new());
        }

        if !self.encrypted {
            if features.get_child("starttls", NS_TLS).is_some() {
                self.phase = StreamPhase::StartingTls;
                return Ok(vec![Frame::Stanza(Element::builder("starttls", NS_TLS).build())]);
            }
            if self.require_tls {
                return Err(XmppError::NoTls);
            }
            warn!(domain = %self.domain, "continuing without encryption");
        }

        if !self.authenticated {
            let offered = offered_mechanisms(features);
            let selected = select_mechanism(&offered, self.encrypted).ok_or_else(|| {
                let mut offered: Vec<_> = offered.into_iter().collect();
                offered.sort();
                XmppError::AuthenticationImpossible(offered.join(", "))
            })?;
            let mut mechanism = build_mechanism(selected, &self.username, &self.password)?;
            debug!(mechanism = %selected, "starting SASL");
            let auth = auth_element(selected.name(), &mechanism.initial());
            self.mechanism = Some(mechanism);
            self.phase = StreamPhase::Authenticating;
            return Ok(vec![Frame::Stanza(auth)]);
        }

        if features.get_child("bind", NS_BIND).is_none() {
            return Err(XmppError::StreamError(
                "server offered no resource binding".to_string(),
            ));
        }
        let mut bind = Element::builder("bind", NS_BIND);
        if !self.resource.is_empty() {
            bind = bind.append(
                Element::builder("resource", NS_BIND)
                    .append(minidom::Node::Text(self.resource.clone()))
                    .build(),
            );
        }
        self.phase = StreamPhase::Binding;
        Ok(vec![Frame::Stanza(build_iq("set", BIND_IQ_ID, None, Some(bind.build())))])
    }

    fn on_tls(&mut self, element: &Element) -> Result<Vec<Frame>, XmppError> {
        if element.is("proceed", NS_TLS) {
            self.encrypted = true;
            self.phase = StreamPhase::AwaitFeatures;
            return Ok(vec![Frame::StartTls, self.open()]);
        }
        if element.is("failure", NS_TLS) {
            return Err(XmppError::Transport(
                purple_core::transport::TransportError::TlsHandshakeFailed(
                    "server refused STARTTLS".to_string(),
                ),
            ));
        }
        debug!(name = %element.name(), "unexpected element while starting TLS");
        Ok(Vec::new())
    }

    fn on_sasl(&mut self, element: &Element) -> Result<Vec<Frame>, XmppError> {
        if element.ns() != NS_SASL {
            debug!(name = %element.name(), "unexpected element during SASL");
            return Ok(Vec::new());
        }
        let Some(mechanism) = self.mechanism.as_mut() else {
            return Err(XmppError::AuthenticationFailed("no mechanism in progress".to_string()));
        };
        match element.name() {
            "challenge" => {
                let challenge = decode(element)?;
                let response = mechanism
                    .response(&challenge)
                    .map_err(|e| XmppError::AuthenticationFailed(format!("{e:?}")))?;
                Ok(vec![Frame::Stanza(response_element(&response))])
            }
            "success" => {
                let data = decode(element)?;
                mechanism
                    .success(&data)
                    .map_err(|e| XmppError::AuthenticationFailed(format!("{e:?}")))?;
                info!(domain = %self.domain, mechanism = %mechanism.name(), "authenticated");
                self.mechanism = None;
                self.authenticated = true;
                self.phase = StreamPhase::AwaitFeatures;
                Ok(vec![self.open()])
            }
            "failure" => Err(map_failure(element)),
            other => {
                debug!(name = %other, "ignoring SASL element");
                Ok(Vec::new())
            }
        }
    }

    fn on_bind(&mut self, iq: &Element) -> Result<Vec<Frame>, XmppError> {
        if !iq.is("iq", NS_CLIENT) || iq.attr("id") != Some(BIND_IQ_ID) {
            debug!(name = %iq.name(), "waiting for bind result");
            return Ok(Vec::new());
        }
        match iq.attr("type") {
            Some("result") => {
                let jid = iq
                    .get_child("bind", NS_BIND)
                    .and_then(|bind| bind.get_child("jid", NS_BIND))
                    .map(Element::text)
                    .ok_or_else(|| XmppError::StreamError("bind result without a JID".to_string()))?;
                let jid = jid::Jid::new(jid.trim())?.to_string();
                info!(%jid, "resource bound");
                self.bound = Some(jid);
                self.phase = StreamPhase::Ready;
                Ok(Vec::new())
            }
            _ => {
                let conflict = iq
                    .get_child("error", NS_CLIENT)
                    .is_some_and(|e| e.get_child("conflict", NS_STANZAS).is_some());
                if conflict {
                    Err(XmppError::Conflict(format!("resource {} is in use", self.resource)))
                } else {
                    Err(XmppError::StreamError("resource binding failed".to_string()))
                }
            }
        }
    }
}
