//! XEP-0115: Entity Capabilities
//!
//! Peers advertise a `(node, ver, hash)` tuple in presence; `ver` is a hash
//! over their disco#info identities, features and extended forms. The cache
//! maps tuples to the resolved info so each client build is queried once.
//!
//! Verification string, per XEP-0115 §5.1:
//!
//! ```text
//! category/type/lang/name<  (identities, sorted)
//! feature<                  (features, sorted)
//! FORM_TYPE<var<value<...   (forms sorted by FORM_TYPE, fields by var)
//! ```

mod cache;
mod store;

pub use cache::{CapsCache, CapsCallback, CapsLookup, CapsRequester, QuerySink};
pub use store::{load, parse_document, save, to_document};

use std::collections::HashSet;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use minidom::Element;
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha512};

use crate::stanza::{NS_CAPS, NS_DATA_FORMS, NS_DISCO_INFO};

/// Cache key. Compared structurally, field by field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapsTuple {
    pub node: String,
    pub ver: String,
    pub hash: String,
}

impl CapsTuple {
    pub fn new(node: impl Into<String>, ver: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            ver: ver.into(),
            hash: hash.into(),
        }
    }

    /// Read the `<c xmlns='http://jabber.org/protocol/caps'/>` advertisement.
    ///
    /// Legacy advertisements without a `hash` attribute are not cacheable.
    pub fn from_element(c: &Element) -> Option<Self> {
        if c.name() != "c" || c.ns() != NS_CAPS {
            return None;
        }
        Some(Self::new(c.attr("node")?, c.attr("ver")?, c.attr("hash")?))
    }

    /// The disco#info node to query: `node#ver`.
    pub fn disco_node(&self) -> String {
        format!("{}#{}", self.node, self.ver)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub category: String,
    pub kind: String,
    pub lang: Option<String>,
    pub name: Option<String>,
}

/// Everything a disco#info response told us about one client build.
#[derive(Debug, Clone, PartialEq)]
pub struct CapsClientInfo {
    pub identities: Vec<Identity>,
    pub features: Vec<String>,
    /// Extended service discovery forms, kept as raw `jabber:x:data` XML.
    pub forms: Vec<Element>,
    pub tuple: CapsTuple,
}

impl CapsClientInfo {
    /// Read identities, features and forms out of a disco#info `<query/>`.
    pub fn from_query(query: &Element, tuple: CapsTuple) -> Self {
        let mut info = Self {
            identities: Vec::new(),
            features: Vec::new(),
            forms: Vec::new(),
            tuple,
        };
        for child in query.children() {
            match (child.name(), child.ns().as_str()) {
                ("identity", NS_DISCO_INFO) => {
                    if let (Some(category), Some(kind)) = (child.attr("category"), child.attr("type")) {
                        info.identities.push(Identity {
                            category: category.to_string(),
                            kind: kind.to_string(),
                            lang: child.attr("xml:lang").map(str::to_string),
                            name: child.attr("name").map(str::to_string),
                        });
                    }
                }
                ("feature", NS_DISCO_INFO) => {
                    if let Some(var) = child.attr("var") {
                        info.features.push(var.to_string());
                    }
                }
                ("x", NS_DATA_FORMS) => info.forms.push(child.clone()),
                _ => {}
            }
        }
        info
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    /// Repeated identities, features or form types. Such a response cannot
    /// be hashed unambiguously (XEP-0115 §5.4).
    pub fn has_duplicates(&self) -> bool {
        let mut identities = HashSet::new();
        let mut features = HashSet::new();
        let mut form_types = HashSet::new();
        !self.identities.iter().all(|i| identities.insert(i))
            || !self.features.iter().all(|f| features.insert(f.as_str()))
            || !self
                .forms
                .iter()
                .filter_map(Form::from_element)
                .all(|form| form_types.insert(form.form_type))
    }

    /// Whether this info hashes to the `ver` in its tuple.
    pub fn verify(&self) -> bool {
        if self.has_duplicates() {
            return false;
        }
        match compute_hash(&self.tuple.hash, &verification_string(self)) {
            Some(ver) => ver == self.tuple.ver,
            None => false,
        }
    }
}

/// Hash `input` with the named algorithm and base64 the digest.
///
/// Returns `None` for algorithms we do not implement; such tuples are never
/// trusted.
pub fn compute_hash(algorithm: &str, input: &str) -> Option<String> {
    let digest = match algorithm {
        "sha-1" => Sha1::digest(input.as_bytes()).to_vec(),
        "sha-256" => Sha256::digest(input.as_bytes()).to_vec(),
        "sha-512" => Sha512::digest(input.as_bytes()).to_vec(),
        _ => return None,
    };
    Some(STANDARD.encode(digest))
}

pub fn verification_string(info: &CapsClientInfo) -> String {
    let mut out = String::new();

    let mut identities: Vec<&Identity> = info.identities.iter().collect();
    identities.sort_by(|a, b| {
        (&a.category, &a.kind, &a.lang).cmp(&(&b.category, &b.kind, &b.lang))
    });
    for identity in identities {
        out.push_str(&identity.category);
        out.push('/');
        out.push_str(&identity.kind);
        out.push('/');
        out.push_str(identity.lang.as_deref().unwrap_or(""));
        out.push('/');
        out.push_str(identity.name.as_deref().unwrap_or(""));
        out.push('<');
    }

    let mut features: Vec<&String> = info.features.iter().collect();
    features.sort();
    for feature in features {
        out.push_str(feature);
        out.push('<');
    }

    let mut forms: Vec<Form> = info.forms.iter().filter_map(Form::from_element).collect();
    forms.sort_by(|a, b| a.form_type.cmp(&b.form_type));
    for form in forms {
        out.push_str(&form.form_type);
        out.push('<');
        for (var, values) in form.fields {
            out.push_str(&var);
            out.push('<');
            for value in values {
                out.push_str(&value);
                out.push('<');
            }
        }
    }
    out
}

/// A data form reduced to what the verification string needs.
struct Form {
    form_type: String,
    fields: Vec<(String, Vec<String>)>,
}

impl Form {
    fn from_element(x: &Element) -> Option<Self> {
        let mut form_type = None;
        let mut fields = Vec::new();
        for field in x.children().filter(|c| c.name() == "field") {
            let Some(var) = field.attr("var") else {
                continue;
            };
            let mut values: Vec<String> = field
                .children()
                .filter(|c| c.name() == "value")
                .map(Element::text)
                .collect();
            if var == "FORM_TYPE" {
                form_type = values.into_iter().next();
                continue;
            }
            values.sort();
            fields.push((var.to_string(), values));
        }
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        // forms without FORM_TYPE are ignored for hashing
        Some(Self {
            form_type: form_type?,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    /// The complex example from XEP-0115 §5.3.
    pub(crate) const PSI_QUERY: &str = "<query xmlns='http://jabber.org/protocol/disco#info' \
        node='http://psi-im.org#q07IKJEyjvHSyhy//CH0CxmKi8w='>\
        <identity xml:lang='en' category='client' name='Psi 0.11' type='pc'/>\
        <identity xml:lang='el' category='client' name='Ψ 0.11' type='pc'/>\
        <feature var='http://jabber.org/protocol/caps'/>\
        <feature var='http://jabber.org/protocol/disco#info'/>\
        <feature var='http://jabber.org/protocol/disco#items'/>\
        <feature var='http://jabber.org/protocol/muc'/>\
        <x xmlns='jabber:x:data' type='result'>\
          <field var='FORM_TYPE' type='hidden'><value>urn:xmpp:dataforms:softwareinfo</value></field>\
          <field var='ip_version'><value>ipv4</value><value>ipv6</value></field>\
          <field var='os'><value>Mac</value></field>\
          <field var='os_version'><value>10.5.1</value></field>\
          <field var='software'><value>Psi</value></field>\
          <field var='software_version'><value>0.11</value></field>\
        </x>\
        </query>";

    pub(crate) fn psi_tuple() -> CapsTuple {
        CapsTuple::new("http://psi-im.org", "q07IKJEyjvHSyhy//CH0CxmKi8w=", "sha-1")
    }

    #[test]
    fn xep_0115_complex_example_verifies() {
        let query = Element::from_str(PSI_QUERY).unwrap();
        let info = CapsClientInfo::from_query(&query, psi_tuple());

        assert_eq!(info.identities.len(), 2);
        assert_eq!(info.features.len(), 4);
        assert_eq!(info.forms.len(), 1);
        assert_eq!(
            verification_string(&info),
            "client/pc/el/Ψ 0.11<client/pc/en/Psi 0.11<\
             http://jabber.org/protocol/caps<http://jabber.org/protocol/disco#info<\
             http://jabber.org/protocol/disco#items<http://jabber.org/protocol/muc<\
             urn:xmpp:dataforms:softwareinfo<ip_version<ipv4<ipv6<os<Mac<\
             os_version<10.5.1<software<Psi<software_version<0.11<"
        );
        assert!(info.verify());
    }

    #[test]
    fn tampered_feature_list_fails_verification() {
        let query = Element::from_str(PSI_QUERY).unwrap();
        let mut info = CapsClientInfo::from_query(&query, psi_tuple());
        info.features.push("urn:xmpp:evil".to_string());
        assert!(!info.verify());
    }

    #[test]
    fn duplicate_features_are_rejected_even_when_the_hash_matches() {
        let doubled = PSI_QUERY.replace(
            "<feature var='http://jabber.org/protocol/muc'/>",
            "<feature var='http://jabber.org/protocol/muc'/><feature var='http://jabber.org/protocol/muc'/>",
        );
        let query = Element::from_str(&doubled).unwrap();
        let mut info = CapsClientInfo::from_query(&query, psi_tuple());
        assert!(info.has_duplicates());

        // Re-hash so only the duplicate stands between the info and the cache.
        info.tuple.ver = compute_hash("sha-1", &verification_string(&info)).unwrap();
        assert!(!info.verify());
    }

    #[test]
    fn duplicate_identities_are_rejected() {
        let doubled = PSI_QUERY.replace(
            "<identity xml:lang='en' category='client' name='Psi 0.11' type='pc'/>",
            "<identity xml:lang='en' category='client' name='Psi 0.11' type='pc'/>\
             <identity xml:lang='en' category='client' name='Psi 0.11' type='pc'/>",
        );
        let query = Element::from_str(&doubled).unwrap();
        let info = CapsClientInfo::from_query(&query, psi_tuple());
        assert_eq!(info.identities.len(), 3);
        assert!(info.has_duplicates());
        assert!(!info.verify());
    }

    #[test]
    fn distinct_entries_are_not_duplicates() {
        let query = Element::from_str(PSI_QUERY).unwrap();
        assert!(!CapsClientInfo::from_query(&query, psi_tuple()).has_duplicates());
    }

    #[test]
    fn unknown_hash_algorithms_are_never_trusted() {
        let query = Element::from_str(PSI_QUERY).unwrap();
        let mut tuple = psi_tuple();
        tuple.hash = "md5".to_string();
        assert!(!CapsClientInfo::from_query(&query, tuple).verify());
        assert_eq!(compute_hash("md5", "x"), None);
    }

    #[test]
    fn legacy_caps_without_hash_are_ignored() {
        let c = Element::from_str(
            "<c xmlns='http://jabber.org/protocol/caps' node='http://pidgin.im/' ver='2.7.0' ext='voice-v1'/>",
        )
        .unwrap();
        assert_eq!(CapsTuple::from_element(&c), None);
    }
}
