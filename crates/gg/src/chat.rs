//! GG conferences: server-side ids mapped to the local chat ids the
//! connection tracks.

use std::collections::BTreeSet;

use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conference {
    /// Server-assigned id.
    pub id: u64,
    pub local_id: u32,
    pub participants: BTreeSet<u32>,
    /// Version of the participant list last seen from the server.
    pub version: u32,
}

impl Conference {
    pub fn name(&self) -> String {
        format!("conference-{}", self.id)
    }
}

/// Participants added and removed by a conference update.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParticipantChanges {
    pub joined: Vec<u32>,
    pub left: Vec<u32>,
}

#[derive(Debug)]
pub struct ConferenceRegistry {
    conferences: Vec<Conference>,
    next_local_id: u32,
}

impl Default for ConferenceRegistry {
    fn default() -> Self {
        Self {
            conferences: Vec::new(),
            next_local_id: 1,
        }
    }
}

impl ConferenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.conferences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conferences.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conference> {
        self.conferences.iter()
    }

    pub fn get(&self, id: u64) -> Option<&Conference> {
        self.conferences.iter().find(|c| c.id == id)
    }

    pub fn by_local_id(&self, local_id: u32) -> Option<&Conference> {
        self.conferences.iter().find(|c| c.local_id == local_id)
    }

    /// The conference with exactly these participants, in any order.
    /// `own_uin` is ignored on both sides.
    pub fn find_by_participants(&self, participants: &[u32], own_uin: u32) -> Option<&Conference> {
        let wanted: BTreeSet<u32> = participants.iter().copied().filter(|u| *u != own_uin).collect();
        self.conferences.iter().find(|c| {
            c.participants
                .iter()
                .copied()
                .filter(|u| *u != own_uin)
                .eq(wanted.iter().copied())
        })
    }

    /// Register conference `id` or return the existing one. The flag says
    /// whether it was new.
    pub fn ensure(&mut self, id: u64) -> (&mut Conference, bool) {
        if let Some(index) = self.conferences.iter().position(|c| c.id == id) {
            return (&mut self.conferences[index], false);
        }
        let local_id = self.next_local_id;
        self.next_local_id += 1;
        debug!(conference = id, local_id, "new conference");
        self.conferences.push(Conference {
            id,
            local_id,
            participants: BTreeSet::new(),
            version: 0,
        });
        let index = self.conferences.len() - 1;
        (&mut self.conferences[index], true)
    }

    /// Replace the participant list of conference `id`. Updates older than
    /// the one already applied are ignored.
    pub fn update_participants(&mut self, id: u64, version: u32, participants: &[u32]) -> ParticipantChanges {
        let Some(conference) = self.conferences.iter_mut().find(|c| c.id == id) else {
            return ParticipantChanges::default();
        };
        if version != 0 && version < conference.version {
            debug!(conference = id, version, current = conference.version, "stale participant list");
            return ParticipantChanges::default();
        }
        conference.version = version;

        let updated: BTreeSet<u32> = participants.iter().copied().collect();
        let changes = ParticipantChanges {
            joined: updated.difference(&conference.participants).copied().collect(),
            left: conference.participants.difference(&updated).copied().collect(),
        };
        conference.participants = updated;
        changes
    }

    pub fn add_participant(&mut self, id: u64, uin: u32) -> bool {
        self.conferences
            .iter_mut()
            .find(|c| c.id == id)
            .is_some_and(|c| c.participants.insert(uin))
    }

    pub fn remove_participant(&mut self, id: u64, uin: u32) -> bool {
        self.conferences
            .iter_mut()
            .find(|c| c.id == id)
            .is_some_and(|c| c.participants.remove(&uin))
    }

    /// Forget the conference behind `local_id`.
    pub fn leave(&mut self, local_id: u32) -> Option<Conference> {
        let index = self.conferences.iter().position(|c| c.local_id == local_id)?;
        Some(self.conferences.remove(index))
    }

    pub fn clear(&mut self) {
        self.conferences.clear();
    }
}
