//! Per-contact presence bookkeeping: one entry per bare JID, one resource
//! per full JID that has sent us available presence.

use std::collections::HashMap;
use std::sync::Arc;

use purple_core::event::{BuddyState, Tune};

use crate::caps::{CapsClientInfo, CapsTuple};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
}

impl Subscription {
    pub fn parse(value: &str) -> Self {
        match value {
            "to" => Subscription::To,
            "from" => Subscription::From,
            "both" => Subscription::Both,
            _ => Subscription::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub name: String,
    pub state: BuddyState,
    pub priority: i8,
    pub status: Option<String>,
    pub idle_seconds: Option<u64>,
    pub caps: Option<CapsTuple>,
    /// Resolved capabilities; `None` until the caps lookup completes.
    pub info: Option<Arc<CapsClientInfo>>,
}

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: BuddyState::Online,
            priority: 0,
            status: None,
            idle_seconds: None,
            caps: None,
            info: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Buddy {
    pub resources: HashMap<String, Resource>,
    pub subscription: Subscription,
    pub error: Option<String>,
    pub nickname: Option<String>,
    pub avatar_hash: Option<String>,
    pub mood: Option<(String, Option<String>)>,
    pub tune: Option<Tune>,
}

impl Buddy {
    /// Highest priority wins; ties go to the more available state.
    pub fn top_resource(&self) -> Option<&Resource> {
        self.resources.values().max_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.state.cmp(&a.state))
                .then_with(|| b.name.cmp(&a.name))
        })
    }
}

#[derive(Debug, Default)]
pub struct BuddyTable {
    buddies: HashMap<String, Buddy>,
}

impl BuddyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bare: &str) -> Option<&Buddy> {
        self.buddies.get(bare)
    }

    pub fn get_mut(&mut self, bare: &str) -> Option<&mut Buddy> {
        self.buddies.get_mut(bare)
    }

    pub fn entry(&mut self, bare: &str) -> &mut Buddy {
        self.buddies.entry(bare.to_string()).or_default()
    }

    pub fn resource(&self, bare: &str, resource: &str) -> Option<&Resource> {
        self.buddies.get(bare)?.resources.get(resource)
    }

    pub fn resource_mut(&mut self, bare: &str, resource: &str) -> Option<&mut Resource> {
        self.buddies.get_mut(bare)?.resources.get_mut(resource)
    }

    pub fn remove_resource(&mut self, bare: &str, resource: &str) -> Option<Resource> {
        self.buddies.get_mut(bare)?.resources.remove(resource)
    }

    pub fn set_subscription(&mut self, bare: &str, subscription: Subscription) {
        self.entry(bare).subscription = subscription;
    }

    /// Whether we see this contact's presence or they see ours.
    pub fn has_presence_or_subscription(&self, bare: &str) -> bool {
        self.buddies
            .get(bare)
            .is_some_and(|b| !b.resources.is_empty() || b.subscription != Subscription::None)
    }

    /// `Some(false)` only when the resource's capabilities are known and lack
    /// `feature`; unknown capabilities give `None`.
    pub fn resource_supports(&self, bare: &str, resource: &str, feature: &str) -> Option<bool> {
        let info = self.resource(bare, resource)?.info.as_ref()?;
        Some(info.has_feature(feature))
    }

    pub fn clear(&mut self) {
        self.buddies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_resource_prefers_priority_then_availability() {
        let mut buddy = Buddy::default();
        let mut desktop = Resource::new("desktop");
        desktop.priority = 5;
        desktop.state = BuddyState::Away;
        let mut phone = Resource::new("phone");
        phone.priority = 5;
        phone.state = BuddyState::Online;
        let mut laptop = Resource::new("laptop");
        laptop.priority = 1;
        laptop.state = BuddyState::Chat;

        for resource in [desktop, phone, laptop] {
            buddy.resources.insert(resource.name.clone(), resource);
        }
        assert_eq!(buddy.top_resource().unwrap().name, "phone");
    }

    #[test]
    fn subscription_or_presence_counts_as_relationship() {
        let mut table = BuddyTable::new();
        assert!(!table.has_presence_or_subscription("romeo@montague.lit"));

        table.set_subscription("romeo@montague.lit", Subscription::Both);
        assert!(table.has_presence_or_subscription("romeo@montague.lit"));

        table.set_subscription("romeo@montague.lit", Subscription::None);
        table
            .entry("romeo@montague.lit")
            .resources
            .insert("orchard".into(), Resource::new("orchard"));
        assert!(table.has_presence_or_subscription("romeo@montague.lit"));
    }

    #[test]
    fn unknown_capabilities_are_not_a_no() {
        let mut table = BuddyTable::new();
        table
            .entry("romeo@montague.lit")
            .resources
            .insert("orchard".into(), Resource::new("orchard"));
        assert_eq!(
            table.resource_supports("romeo@montague.lit", "orchard", "http://jabber.org/protocol/chatstates"),
            None
        );
    }
}
