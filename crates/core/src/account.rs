use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::AccountConfig;
use crate::connection::ConnectionId;

/// A typed per-account setting value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Setting {
    Bool(bool),
    Int(i64),
    String(String),
}

/// A secret that is overwritten when dropped and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        let mut bytes = std::mem::take(&mut self.0).into_bytes();
        bytes.fill(0);
        std::hint::black_box(&bytes);
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub username: String,
    pub protocol: String,
    pub password: Option<Password>,
    pub remember_password: bool,
    settings: BTreeMap<String, Setting>,
    /// Handle of the live connection, if any. May be stale.
    pub connection: Option<ConnectionId>,
}

impl Account {
    pub fn new(username: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            protocol: protocol.into(),
            password: None,
            remember_password: true,
            settings: BTreeMap::new(),
            connection: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Password::new(password));
        self
    }

    pub fn has_password(&self) -> bool {
        self.password.as_ref().is_some_and(|p| !p.is_empty())
    }

    pub fn setting(&self, key: &str) -> Option<&Setting> {
        self.settings.get(key)
    }

    pub fn set_setting(&mut self, key: impl Into<String>, value: Setting) {
        self.settings.insert(key.into(), value);
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.settings.get(key) {
            Some(Setting::Int(value)) => *value,
            _ => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.settings.get(key) {
            Some(Setting::Bool(value)) => *value,
            _ => default,
        }
    }

    pub fn get_string<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.settings.get(key) {
            Some(Setting::String(value)) => value,
            _ => default,
        }
    }
}

impl From<&AccountConfig> for Account {
    fn from(config: &AccountConfig) -> Self {
        Self {
            username: config.username.clone(),
            protocol: config.protocol.clone(),
            password: config.password.as_deref().map(Password::new),
            remember_password: config.remember_password,
            settings: config.settings.clone(),
            connection: None,
        }
    }
}

/// Account storage consumed by the core. Persistence is the implementor's
/// concern.
pub trait AccountStore: Send {
    fn find(&self, username: &str) -> Option<&Account>;
    fn find_mut(&mut self, username: &str) -> Option<&mut Account>;
    fn add(&mut self, account: Account);
    fn remove(&mut self, username: &str) -> Option<Account>;
    fn usernames(&self) -> Vec<String>;
}

/// Buddy list consumed by the core.
pub trait BuddyList: Send {
    /// Attach an account's buddies to the visible list.
    fn add_account(&mut self, account: &str);
    /// Detach an account's buddies (they go offline in the UI).
    fn remove_account(&mut self, account: &str);
    fn add_buddy(&mut self, account: &str, name: &str, alias: Option<&str>);
    fn remove_buddy(&mut self, account: &str, name: &str) -> bool;
    fn buddies(&self, account: &str) -> Vec<String>;
}

#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: HashMap<String, Account>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(accounts: &[AccountConfig]) -> Self {
        let mut store = Self::new();
        for config in accounts {
            store.add(Account::from(config));
        }
        store
    }
}

impl AccountStore for MemoryAccountStore {
    fn find(&self, username: &str) -> Option<&Account> {
        self.accounts.get(username)
    }

    fn find_mut(&mut self, username: &str) -> Option<&mut Account> {
        self.accounts.get_mut(username)
    }

    fn add(&mut self, account: Account) {
        self.accounts.insert(account.username.clone(), account);
    }

    fn remove(&mut self, username: &str) -> Option<Account> {
        self.accounts.remove(username)
    }

    fn usernames(&self) -> Vec<String> {
        let mut names: Vec<_> = self.accounts.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Default)]
pub struct MemoryBuddyList {
    attached: HashSet<String>,
    buddies: HashMap<String, BTreeMap<String, Option<String>>>,
    detach_count: HashMap<String, usize>,
}

impl MemoryBuddyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_attached(&self, account: &str) -> bool {
        self.attached.contains(account)
    }

    /// How many times `remove_account` has run for `account`.
    pub fn detach_count(&self, account: &str) -> usize {
        self.detach_count.get(account).copied().unwrap_or(0)
    }
}

impl BuddyList for MemoryBuddyList {
    fn add_account(&mut self, account: &str) {
        self.attached.insert(account.to_string());
    }

    fn remove_account(&mut self, account: &str) {
        self.attached.remove(account);
        *self.detach_count.entry(account.to_string()).or_default() += 1;
    }

    fn add_buddy(&mut self, account: &str, name: &str, alias: Option<&str>) {
        self.buddies
            .entry(account.to_string())
            .or_default()
            .insert(name.to_string(), alias.map(str::to_string));
    }

    fn remove_buddy(&mut self, account: &str, name: &str) -> bool {
        self.buddies
            .get_mut(account)
            .is_some_and(|list| list.remove(name).is_some())
    }

    fn buddies(&self, account: &str) -> Vec<String> {
        self.buddies
            .get(account)
            .map(|list| list.keys().cloned().collect())
            .unwrap_or_default()
    }
}
