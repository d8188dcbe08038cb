//! What we advertise about ourselves: XEP-0030 disco#info answers, our own
//! XEP-0115 caps, and XEP-0199 ping replies.

use minidom::Element;

use crate::caps::{CapsClientInfo, CapsTuple, Identity, compute_hash, verification_string};
use crate::stanza::{
    NS_CAPS, NS_CHATSTATES, NS_CLIENT, NS_DISCO_INFO, NS_IDLE, NS_LAST, NS_MOOD, NS_MUC, NS_NICK,
    NS_PING, NS_STANZAS, NS_TUNE, NS_XHTML_IM, build_iq,
};

pub const CAPS_NODE: &str = "https://github.com/purple-im/purple";
pub const CAPS_HASH: &str = "sha-1";

pub fn features() -> Vec<String> {
    let mut features: Vec<String> = [
        NS_CAPS,
        NS_CHATSTATES,
        NS_DISCO_INFO,
        NS_IDLE,
        NS_LAST,
        NS_MUC,
        NS_NICK,
        NS_PING,
        NS_XHTML_IM,
        "http://jabber.org/protocol/mood+notify",
        "http://jabber.org/protocol/nick+notify",
        "http://jabber.org/protocol/tune+notify",
        NS_MOOD,
        NS_TUNE,
    ]
    .into_iter()
    .map(str::to_string)
    .collect();
    features.sort();
    features
}

/// Our own client info, with `ver` computed over it.
pub fn own_info() -> CapsClientInfo {
    let mut info = CapsClientInfo {
        identities: vec![Identity {
            category: "client".into(),
            kind: "pc".into(),
            lang: None,
            name: Some("purple".into()),
        }],
        features: features(),
        forms: Vec::new(),
        tuple: CapsTuple::new(CAPS_NODE, "", CAPS_HASH),
    };
    info.tuple.ver = compute_hash(CAPS_HASH, &verification_string(&info)).unwrap_or_default();
    info
}

/// The `<c/>` element to put in every outgoing presence.
pub fn caps_element(info: &CapsClientInfo) -> Element {
    Element::builder("c", NS_CAPS)
        .attr("hash", info.tuple.hash.as_str())
        .attr("node", info.tuple.node.as_str())
        .attr("ver", info.tuple.ver.as_str())
        .build()
}

fn info_query(info: &CapsClientInfo, node: Option<&str>) -> Element {
    let mut query = Element::builder("query", NS_DISCO_INFO);
    if let Some(node) = node {
        query = query.attr("node", node);
    }
    for identity in &info.identities {
        let mut element = Element::builder("identity", NS_DISCO_INFO)
            .attr("category", identity.category.as_str())
            .attr("type", identity.kind.as_str());
        if let Some(name) = &identity.name {
            element = element.attr("name", name.as_str());
        }
        query = query.append(element.build());
    }
    for feature in &info.features {
        query = query.append(
            Element::builder("feature", NS_DISCO_INFO)
                .attr("var", feature.as_str())
                .build(),
        );
    }
    query.build()
}

/// An `<iq type='error'/>` answering `iq` with a stanza error condition.
pub fn error_reply(iq: &Element, kind: &str, condition: &str) -> Element {
    let mut reply = Element::builder("iq", NS_CLIENT)
        .attr("type", "error")
        .attr("id", iq.attr("id").unwrap_or_default());
    if let Some(from) = iq.attr("from") {
        reply = reply.attr("to", from);
    }
    reply
        .append(
            Element::builder("error", NS_CLIENT)
                .attr("type", kind)
                .append(Element::builder(condition, NS_STANZAS).build())
                .build(),
        )
        .build()
}

/// Answer an IQ we serve ourselves. Returns `None` for IQs that are not
/// disco#info or ping requests.
pub fn answer(iq: &Element, info: &CapsClientInfo) -> Option<Element> {
    if iq.attr("type") != Some("get") {
        return None;
    }
    let id = iq.attr("id").unwrap_or_default();
    let from = iq.attr("from");

    if iq.get_child("ping", NS_PING).is_some() {
        return Some(build_iq("result", id, from, None));
    }

    let query = iq.get_child("query", NS_DISCO_INFO)?;
    let node = query.attr("node");
    match node {
        None => Some(build_iq("result", id, from, Some(info_query(info, None)))),
        Some(node) if node == info.tuple.disco_node() => {
            Some(build_iq("result", id, from, Some(info_query(info, Some(node)))))
        }
        Some(_) => Some(error_reply(iq, "cancel", "item-not-found")),
    }
}
