use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use minidom::Element;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CapsClientInfo, CapsTuple, store};
use crate::error::CapsError;
use crate::stanza::{NS_DISCO_INFO, build_iq, next_id};

/// Invoked once with the resolved info, or `None` when the lookup failed or
/// the response did not verify.
pub type CapsCallback = Box<dyn FnOnce(Option<Arc<CapsClientInfo>>) + Send>;

/// Puts a query on a session's stream. Returns false once that session is gone.
pub type QuerySink = Box<dyn Fn(Element) -> bool + Send>;

/// The session asking for caps and the entity it would ask.
pub struct CapsRequester {
    pub session: Uuid,
    pub jid: String,
    /// Used when a query started by another session has to be re-sent
    /// through this one.
    pub sink: QuerySink,
}

#[derive(Debug)]
pub enum CapsLookup {
    /// Known tuple; the callback already ran.
    Hit,
    /// Unknown tuple; send this disco#info query.
    Query(Element),
    /// A query for the same tuple is already in flight; the callback joined it.
    Pending,
}

struct Waiter {
    requester: CapsRequester,
    callback: CapsCallback,
}

struct PendingQuery {
    id: String,
    session: Uuid,
    jid: String,
    deadline: Instant,
    waiters: Vec<Waiter>,
}

fn fail(waiters: Vec<Waiter>) {
    for waiter in waiters {
        (waiter.callback)(None);
    }
}

fn disco_query(tuple: &CapsTuple, jid: &str) -> (String, Element) {
    let id = next_id("disco");
    let query = Element::builder("query", NS_DISCO_INFO)
        .attr("node", tuple.disco_node())
        .build();
    let iq = build_iq("get", &id, Some(jid), Some(query));
    (id, iq)
}

/// Shared by every XMPP session of the process. Sessions reach it through
/// `Arc<Mutex<_>>`; each lock is held for one synchronous call only.
pub struct CapsCache {
    entries: HashMap<CapsTuple, Arc<CapsClientInfo>>,
    pending: HashMap<CapsTuple, PendingQuery>,
    by_id: HashMap<String, CapsTuple>,
    path: Option<PathBuf>,
    save_deadline: Option<Instant>,
}

impl CapsCache {
    pub const SAVE_DEBOUNCE: Duration = Duration::from_secs(5);
    pub const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

    /// A cache that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            entries: HashMap::new(),
            pending: HashMap::new(),
            by_id: HashMap::new(),
            path: None,
            save_deadline: None,
        }
    }

    /// Load the persisted cache at `path`. A missing or unreadable file
    /// yields an empty cache.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut cache = Self::in_memory();
        match store::load(&path) {
            Ok(infos) => {
                info!(path = %path.display(), entries = infos.len(), "loaded caps cache");
                for info in infos {
                    cache.entries.insert(info.tuple.clone(), Arc::new(info));
                }
            }
            Err(CapsError::Io(error)) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no caps cache on disk yet");
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "ignoring unreadable caps cache");
            }
        }
        cache.path = Some(path);
        cache
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, tuple: &CapsTuple) -> Option<Arc<CapsClientInfo>> {
        self.entries.get(tuple).cloned()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CapsClientInfo> {
        self.entries.values().map(Arc::as_ref)
    }

    /// Number of tuples with a query in flight.
    pub fn pending_queries(&self) -> usize {
        self.pending.len()
    }

    pub fn get_or_fetch(
        &mut self,
        tuple: CapsTuple,
        requester: CapsRequester,
        callback: CapsCallback,
    ) -> CapsLookup {
        if let Some(info) = self.entries.get(&tuple) {
            callback(Some(info.clone()));
            return CapsLookup::Hit;
        }

        if let Some(pending) = self.pending.get_mut(&tuple) {
            debug!(node = %tuple.node, ver = %tuple.ver, "joining in-flight caps query");
            pending.waiters.push(Waiter { requester, callback });
            return CapsLookup::Pending;
        }

        let (id, iq) = disco_query(&tuple, &requester.jid);
        debug!(jid = %requester.jid, node = %tuple.node, ver = %tuple.ver, "querying caps");
        self.by_id.insert(id.clone(), tuple.clone());
        self.pending.insert(
            tuple,
            PendingQuery {
                id,
                session: requester.session,
                jid: requester.jid.clone(),
                deadline: Instant::now() + Self::QUERY_TIMEOUT,
                waiters: vec![Waiter { requester, callback }],
            },
        );
        CapsLookup::Query(iq)
    }

    /// Insert `info` if it verifies against its own tuple.
    pub fn insert(&mut self, info: CapsClientInfo) -> Option<Arc<CapsClientInfo>> {
        if info.has_duplicates() {
            warn!(
                node = %info.tuple.node,
                ver = %info.tuple.ver,
                "caps response repeats identities or features; discarding"
            );
            return None;
        }
        if !info.verify() {
            warn!(
                node = %info.tuple.node,
                ver = %info.tuple.ver,
                hash = %info.tuple.hash,
                "caps verification hash mismatch; discarding"
            );
            return None;
        }
        let info = Arc::new(info);
        self.entries.insert(info.tuple.clone(), info.clone());
        self.schedule_save();
        Some(info)
    }

    /// Feed an IQ result or error. Returns false if the IQ is not one of our
    /// caps queries.
    pub fn handle_disco_response(&mut self, iq: &Element) -> bool {
        let Some(id) = iq.attr("id") else {
            return false;
        };
        let Some(tuple) = self.by_id.get(id).cloned() else {
            return false;
        };
        let Some(pending) = self.pending.get(&tuple) else {
            self.by_id.remove(id);
            return false;
        };
        if iq.attr("from") != Some(pending.jid.as_str()) {
            // Left pending; the query still times out.
            warn!(
                from = iq.attr("from").unwrap_or_default(),
                expected = %pending.jid,
                "caps response from unexpected sender; ignoring"
            );
            return false;
        }

        self.by_id.remove(id);
        let Some(pending) = self.pending.remove(&tuple) else {
            return false;
        };

        let resolved = match (iq.attr("type"), iq.get_child("query", NS_DISCO_INFO)) {
            (Some("result"), Some(query)) => {
                self.insert(CapsClientInfo::from_query(query, tuple.clone()))
            }
            _ => {
                debug!(node = %tuple.node, ver = %tuple.ver, "caps query failed");
                None
            }
        };

        for waiter in pending.waiters {
            (waiter.callback)(resolved.clone());
        }
        true
    }

    /// A session is going away. Its own lookups fail; queries it was
    /// carrying for other sessions are re-sent through one of them.
    pub fn release_session(&mut self, session: Uuid) {
        let tuples: Vec<CapsTuple> = self.pending.keys().cloned().collect();
        for tuple in tuples {
            let Some(mut pending) = self.pending.remove(&tuple) else {
                continue;
            };
            let (gone, waiters): (Vec<Waiter>, Vec<Waiter>) = pending
                .waiters
                .into_iter()
                .partition(|w| w.requester.session == session);
            fail(gone);

            if pending.session != session {
                pending.waiters = waiters;
                self.pending.insert(tuple, pending);
                continue;
            }
            self.by_id.remove(&pending.id);
            self.reissue(tuple, waiters);
        }
    }

    /// Send a fresh query for `tuple` through the first waiter whose session
    /// still accepts it.
    fn reissue(&mut self, tuple: CapsTuple, mut waiters: Vec<Waiter>) {
        while let Some(carrier) = waiters.first() {
            let session = carrier.requester.session;
            let jid = carrier.requester.jid.clone();
            let (id, iq) = disco_query(&tuple, &jid);
            if (carrier.requester.sink)(iq) {
                debug!(%jid, node = %tuple.node, ver = %tuple.ver, "caps query moved to another session");
                self.by_id.insert(id.clone(), tuple.clone());
                self.pending.insert(
                    tuple,
                    PendingQuery {
                        id,
                        session,
                        jid,
                        deadline: Instant::now() + Self::QUERY_TIMEOUT,
                        waiters,
                    },
                );
                return;
            }
            let (gone, rest): (Vec<Waiter>, Vec<Waiter>) = waiters
                .into_iter()
                .partition(|w| w.requester.session == session);
            fail(gone);
            waiters = rest;
        }
    }

    /// The earliest moment an outstanding query times out.
    pub fn query_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Fail every query older than [`QUERY_TIMEOUT`](Self::QUERY_TIMEOUT).
    /// Returns how many were dropped.
    pub fn expire_queries(&mut self, now: Instant) -> usize {
        let expired: Vec<CapsTuple> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(tuple, _)| tuple.clone())
            .collect();
        for tuple in &expired {
            if let Some(pending) = self.pending.remove(tuple) {
                debug!(jid = %pending.jid, node = %tuple.node, ver = %tuple.ver, "caps query timed out");
                self.by_id.remove(&pending.id);
                fail(pending.waiters);
            }
        }
        expired.len()
    }

    /// When the next debounced save is due, if one is scheduled.
    pub fn save_deadline(&self) -> Option<Instant> {
        self.save_deadline
    }

    /// Save if the debounce window has elapsed. Returns whether it saved.
    pub fn poll_save(&mut self, now: Instant) -> Result<bool, CapsError> {
        match self.save_deadline {
            Some(deadline) if now >= deadline => {
                self.flush()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Write any unsaved entries now.
    pub fn flush(&mut self) -> Result<(), CapsError> {
        if self.save_deadline.take().is_none() {
            return Ok(());
        }
        let Some(path) = &self.path else {
            return Ok(());
        };
        let infos: Vec<&CapsClientInfo> = self.entries.values().map(Arc::as_ref).collect();
        store::save(path, infos)?;
        debug!(path = %path.display(), entries = self.entries.len(), "saved caps cache");
        Ok(())
    }

    /// Flush to disk and fail every outstanding lookup.
    pub fn shutdown(&mut self) {
        if let Err(error) = self.flush() {
            warn!(%error, "failed to save caps cache at shutdown");
        }
        self.by_id.clear();
        for (_, pending) in self.pending.drain() {
            debug!(id = %pending.id, "dropping outstanding caps query");
            fail(pending.waiters);
        }
    }

    fn schedule_save(&mut self) {
        if self.save_deadline.is_none() {
            self.save_deadline = Some(Instant::now() + Self::SAVE_DEBOUNCE);
        }
    }
}

impl Default for CapsCache {
    fn default() -> Self {
        Self::in_memory()
    }
}
