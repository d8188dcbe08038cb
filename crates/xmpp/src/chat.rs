//! Multi-user chat rooms we are in, joining, or have just left.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use purple_core::event::ChatMember;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub room: String,
    pub server: String,
    pub nick: String,
    pub password: Option<String>,
}

impl JoinRequest {
    pub fn new(room: impl Into<String>, server: impl Into<String>, nick: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            server: server.into(),
            nick: nick.into(),
            password: None,
        }
    }

    pub fn room_jid(&self) -> String {
        chat_key(&self.room, &self.server)
    }
}

#[derive(Debug, Clone)]
pub struct Chat {
    pub id: u32,
    pub room: String,
    pub server: String,
    /// Our nickname in the room.
    pub handle: String,
    /// Settings needed to re-join (password and the like).
    pub components: HashMap<String, String>,
    pub members: BTreeMap<String, ChatMember>,
    /// Set once our own presence confirmed the join.
    pub joined: Option<DateTime<Utc>>,
    /// Parted; only `destroy` still applies.
    pub left: bool,
    /// Set once a self-presence carried the muc#user payload.
    pub muc: bool,
    pub config_requested: bool,
}

impl Chat {
    pub fn jid(&self) -> String {
        chat_key(&self.room, &self.server)
    }

    pub fn is_open(&self) -> bool {
        self.joined.is_some()
    }

    pub fn member(&self, nick: &str) -> Option<&ChatMember> {
        self.members.get(nick)
    }

    /// Track a member. Returns false, with a warning, if already tracked.
    pub fn add_member(&mut self, member: ChatMember) -> bool {
        if self.members.contains_key(&member.nick) {
            warn!(room = %self.jid(), nick = %member.nick, "member already in room");
            return false;
        }
        self.members.insert(member.nick.clone(), member);
        true
    }

    /// Replace the stored details of a member, adding it if needed.
    pub fn update_member(&mut self, member: ChatMember) {
        self.members.insert(member.nick.clone(), member);
    }

    pub fn remove_member(&mut self, nick: &str) -> Option<ChatMember> {
        let removed = self.members.remove(nick);
        if removed.is_none() {
            warn!(room = %self.jid(), %nick, "removing member that was never tracked");
        }
        removed
    }

    pub fn rename_member(&mut self, old_nick: &str, new_nick: &str) -> bool {
        let Some(mut member) = self.members.remove(old_nick) else {
            warn!(room = %self.jid(), %old_nick, %new_nick, "renaming member that was never tracked");
            return false;
        };
        member.nick = new_nick.to_string();
        self.members.insert(new_nick.to_string(), member);
        true
    }
}

/// `room@server`, lowercased.
pub fn chat_key(room: &str, server: &str) -> String {
    format!("{room}@{server}").to_lowercase()
}

#[derive(Debug, Default)]
pub struct ChatRegistry {
    chats: HashMap<String, Chat>,
    ids: HashMap<u32, String>,
    next_id: u32,
    pending_joins: Vec<JoinRequest>,
    burst_complete: bool,
}

impl ChatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    pub fn find_or_create(&mut self, room: &str, server: &str, handle: &str) -> &mut Chat {
        let key = chat_key(room, server);
        match self.chats.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.next_id = self.next_id.wrapping_add(1);
                let id = self.next_id;
                debug!(room = %entry.key(), id, "tracking chat");
                self.ids.insert(id, entry.key().clone());
                entry.insert(Chat {
                    id,
                    room: room.to_string(),
                    server: server.to_string(),
                    handle: handle.to_string(),
                    components: HashMap::new(),
                    members: BTreeMap::new(),
                    joined: None,
                    left: false,
                    muc: false,
                    config_requested: false,
                })
            }
        }
    }

    pub fn find(&self, room: &str, server: &str) -> Option<&Chat> {
        self.chats.get(&chat_key(room, server))
    }

    /// Look up by bare room JID (`room@server`).
    pub fn find_by_jid(&self, jid: &str) -> Option<&Chat> {
        self.chats.get(&jid.to_lowercase())
    }

    pub fn find_by_jid_mut(&mut self, jid: &str) -> Option<&mut Chat> {
        self.chats.get_mut(&jid.to_lowercase())
    }

    pub fn find_by_id(&self, id: u32) -> Option<&Chat> {
        self.chats.get(self.ids.get(&id)?)
    }

    pub fn find_by_id_mut(&mut self, id: u32) -> Option<&mut Chat> {
        let key = self.ids.get(&id)?;
        self.chats.get_mut(key)
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.ids.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns true when the join may proceed now; before the initial burst
    /// has completed the request is queued instead.
    pub fn request_join(&mut self, request: JoinRequest) -> bool {
        if self.burst_complete {
            return true;
        }
        debug!(room = %request.room_jid(), "queueing join until the initial burst completes");
        if !self.pending_joins.contains(&request) {
            self.pending_joins.push(request);
        }
        false
    }

    /// Mark the startup burst as done and hand back queued joins, oldest first.
    pub fn complete_burst(&mut self) -> Vec<JoinRequest> {
        self.burst_complete = true;
        std::mem::take(&mut self.pending_joins)
    }

    pub fn burst_complete(&self) -> bool {
        self.burst_complete
    }

    pub fn mark_left(&mut self, id: u32) -> bool {
        match self.find_by_id_mut(id) {
            Some(chat) => {
                chat.left = true;
                true
            }
            None => false,
        }
    }

    pub fn destroy(&mut self, id: u32) -> Option<Chat> {
        let key = self.ids.remove(&id)?;
        let chat = self.chats.remove(&key);
        debug!(room = %key, id, "destroyed chat");
        chat
    }

    /// Drop every room, e.g. at connection teardown.
    pub fn destroy_all(&mut self) -> Vec<Chat> {
        self.ids.clear();
        self.pending_joins.clear();
        self.burst_complete = false;
        self.chats.drain().map(|(_, chat)| chat).collect()
    }
}
