use std::path::Path;
use std::str::FromStr;

use minidom::Element;
use tracing::warn;

use super::{CapsClientInfo, CapsTuple, Identity};
use crate::error::CapsError;
use crate::stanza::NS_DATA_FORMS;

pub const NS_CAPS_CACHE: &str = "urn:purple:caps-cache:0";

pub fn load(path: &Path) -> Result<Vec<CapsClientInfo>, CapsError> {
    let xml = std::fs::read_to_string(path)?;
    parse_document(&xml)
}

pub fn save<'a>(
    path: &Path,
    infos: impl IntoIterator<Item = &'a CapsClientInfo>,
) -> Result<(), CapsError> {
    let document = to_document(infos);
    let mut out = Vec::new();
    document.write_to(&mut out)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("xml.tmp");
    std::fs::write(&staging, &out)?;
    std::fs::rename(&staging, path)?;
    Ok(())
}

pub fn to_document<'a>(infos: impl IntoIterator<Item = &'a CapsClientInfo>) -> Element {
    let mut root = Element::builder("capabilities", NS_CAPS_CACHE);
    for info in infos {
        let mut client = Element::builder("client", NS_CAPS_CACHE)
            .attr("node", info.tuple.node.as_str())
            .attr("ver", info.tuple.ver.as_str())
            .attr("hash", info.tuple.hash.as_str());
        for identity in &info.identities {
            let mut element = Element::builder("identity", NS_CAPS_CACHE)
                .attr("category", identity.category.as_str())
                .attr("type", identity.kind.as_str());
            if let Some(name) = &identity.name {
                element = element.attr("name", name.as_str());
            }
            if let Some(lang) = &identity.lang {
                element = element.attr("lang", lang.as_str());
            }
            client = client.append(element.build());
        }
        for feature in &info.features {
            client = client.append(
                Element::builder("feature", NS_CAPS_CACHE)
                    .attr("var", feature.as_str())
                    .build(),
            );
        }
        for form in &info.forms {
            client = client.append(form.clone());
        }
        root = root.append(client.build());
    }
    root.build()
}

/// Parse a cache document. Unknown elements are skipped, as are `<client>`
/// entries missing any part of their key.
pub fn parse_document(xml: &str) -> Result<Vec<CapsClientInfo>, CapsError> {
    let root = Element::from_str(xml)?;
    let mut infos = Vec::new();
    for client in root.children().filter(|c| c.name() == "client") {
        let (Some(node), Some(ver), Some(hash)) =
            (client.attr("node"), client.attr("ver"), client.attr("hash"))
        else {
            warn!("skipping caps cache entry without a complete key");
            continue;
        };
        let mut info = CapsClientInfo {
            identities: Vec::new(),
            features: Vec::new(),
            forms: Vec::new(),
            tuple: CapsTuple::new(node, ver, hash),
        };
        for child in client.children() {
            match child.name() {
                "identity" => {
                    if let (Some(category), Some(kind)) = (child.attr("category"), child.attr("type")) {
                        info.identities.push(Identity {
                            category: category.to_string(),
                            kind: kind.to_string(),
                            lang: child.attr("lang").map(str::to_string),
                            name: child.attr("name").map(str::to_string),
                        });
                    }
                }
                "feature" => {
                    if let Some(var) = child.attr("var") {
                        info.features.push(var.to_string());
                    }
                }
                "x" if child.ns() == NS_DATA_FORMS => info.forms.push(child.clone()),
                _ => {}
            }
        }
        infos.push(info);
    }
    Ok(infos)
}
