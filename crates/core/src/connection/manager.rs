use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Connection, ConnectionId, ConnectionState, Keepalive};
use crate::account::{Account, AccountStore, BuddyList, MemoryAccountStore, MemoryBuddyList, Password};
use crate::error::{ErrorInfo, ErrorKind, PurpleError, Result};
use crate::event::{EventBus, EventPayload, EventSource, emit};
use crate::protocol::{
    CoreRequest, HookContext, PasswordPolicy, ProtocolPlugin, ProtocolSession,
};
use crate::ui::{ConnectionUiOps, CredentialManager, NoCredentials, NullUiOps};

/// Work postponed to the next event-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferred {
    Disconnect(ConnectionId),
}

/// Sole owner of every connection and of the process-wide online state.
///
/// All mutation happens through `&mut self` on the event-loop task. Protocol
/// hooks run with the session temporarily taken out of its connection and
/// hand their requests back through [`HookContext`]; the manager applies them
/// after the hook returns.
pub struct ConnectionManager {
    bus: Arc<dyn EventBus>,
    ui: Arc<dyn ConnectionUiOps>,
    credentials: Arc<dyn CredentialManager>,
    accounts: Box<dyn AccountStore>,
    buddy_list: Box<dyn BuddyList>,
    protocols: HashMap<String, Arc<dyn ProtocolPlugin>>,
    connections: HashMap<ConnectionId, Connection>,
    online_accounts: Vec<String>,
    /// Connections that reached Connected, in arrival order.
    connected: Vec<ConnectionId>,
    deferred: VecDeque<Deferred>,
}

impl ConnectionManager {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            bus,
            ui: Arc::new(NullUiOps),
            credentials: Arc::new(NoCredentials),
            accounts: Box::new(MemoryAccountStore::new()),
            buddy_list: Box::new(MemoryBuddyList::new()),
            protocols: HashMap::new(),
            connections: HashMap::new(),
            online_accounts: Vec::new(),
            connected: Vec::new(),
            deferred: VecDeque::new(),
        }
    }

    pub fn with_ui(mut self, ui: Arc<dyn ConnectionUiOps>) -> Self {
        self.ui = ui;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialManager>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_accounts(mut self, accounts: Box<dyn AccountStore>) -> Self {
        self.accounts = accounts;
        self
    }

    pub fn with_buddy_list(mut self, buddy_list: Box<dyn BuddyList>) -> Self {
        self.buddy_list = buddy_list;
        self
    }

    pub fn register_protocol(&mut self, plugin: Arc<dyn ProtocolPlugin>) {
        debug!(protocol = plugin.id(), "registered protocol");
        self.protocols.insert(plugin.id().to_string(), plugin);
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn accounts(&self) -> &dyn AccountStore {
        self.accounts.as_ref()
    }

    pub fn accounts_mut(&mut self) -> &mut dyn AccountStore {
        self.accounts.as_mut()
    }

    pub fn buddy_list(&self) -> &dyn BuddyList {
        self.buddy_list.as_ref()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// The registered connection of `account`, in any state.
    pub fn connection_for(&self, account: &str) -> Option<&Connection> {
        self.connections.values().find(|c| c.account() == account)
    }

    pub fn online_accounts(&self) -> &[String] {
        &self.online_accounts
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    pub fn keepalive_deadline(&self, id: ConnectionId) -> Option<Instant> {
        self.connections
            .get(&id)
            .and_then(|c| c.keepalive.as_ref())
            .map(Keepalive::next_fire)
    }

    /// Start a login attempt for `username`.
    ///
    /// The new connection stays in `Disconnected` until the protocol's login
    /// hook asks for a transition.
    pub fn connect(&mut self, username: &str) -> Result<ConnectionId> {
        let account = self
            .accounts
            .find(username)
            .ok_or_else(|| PurpleError::UnknownAccount(username.to_string()))?;
        let protocol = self
            .protocols
            .get(&account.protocol)
            .cloned()
            .ok_or_else(|| PurpleError::UnknownProtocol(account.protocol.clone()))?;

        if self.connections.values().any(|c| c.account() == username) {
            return Err(PurpleError::AlreadyConnected(username.to_string()));
        }

        let options = protocol.options();
        let password = match options.password {
            PasswordPolicy::NotUsed => None,
            PasswordPolicy::Optional => account.password.clone().filter(|p| !p.is_empty()),
            PasswordPolicy::Required => {
                let stored = account.password.clone().filter(|p| !p.is_empty()).or_else(|| {
                    self.credentials
                        .read_password(username)
                        .filter(|p| !p.is_empty())
                        .map(Password::new)
                });
                match stored {
                    Some(password) => Some(password),
                    None => {
                        warn!(account = username, "cannot connect: no password available");
                        self.ui.request_password(username);
                        return Err(PurpleError::PasswordRequired(username.to_string()));
                    }
                }
            }
        };

        let mut connection =
            Connection::new(username.to_string(), protocol.id().to_string(), options.flags, password);
        connection.session = Some(protocol.new_session(account));
        let id = connection.id();
        self.connections.insert(id, connection);
        if let Some(account) = self.accounts.find_mut(username) {
            account.connection = Some(id);
        }

        info!(account = username, protocol = protocol.id(), connection = %id, "connecting");
        emit(
            self.bus.as_ref(),
            "connection.signing-on",
            EventSource::Core,
            EventPayload::SigningOn {
                connection: id,
                account: username.to_string(),
            },
        );

        if let Some(Err(error)) = self.run_hook(id, |session, ctx| session.login(ctx)) {
            warn!(connection = %id, %error, "login hook failed");
            self.report_error(id, error.kind, error.message)?;
        }
        Ok(id)
    }

    pub fn set_state(&mut self, id: ConnectionId, state: ConnectionState) -> Result<()> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(PurpleError::StaleHandle(id))?;
        let previous = connection.state;
        if previous == state {
            return Ok(());
        }
        connection.state = state;
        let account = connection.account().to_string();

        debug!(connection = %id, from = ?previous, to = ?state, "connection state changed");
        emit(
            self.bus.as_ref(),
            "connection.state-changed",
            EventSource::Core,
            EventPayload::StateChanged {
                connection: id,
                account: account.clone(),
                state,
            },
        );

        match state {
            ConnectionState::Connected => self.enter_connected(id, &account),
            ConnectionState::Disconnected => self.ui.disconnected(id, &account),
            ConnectionState::Connecting | ConnectionState::Disconnecting => {}
        }
        Ok(())
    }

    fn enter_connected(&mut self, id: ConnectionId, account: &str) {
        let interval = self
            .connections
            .get(&id)
            .and_then(|c| self.protocols.get(c.protocol()))
            .and_then(|p| p.options().keepalive_interval);

        if let Some(connection) = self.connections.get_mut(&id) {
            connection.login_time = Some(Utc::now());
        }
        self.ui.connected(id, account);

        if !self.online_accounts.iter().any(|a| a == account) {
            self.online_accounts.push(account.to_string());
        }
        self.buddy_list.add_account(account);
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.attached_to_blist = true;
        }

        info!(account, connection = %id, "signed on");
        emit(
            self.bus.as_ref(),
            "connection.signed-on",
            EventSource::Core,
            EventPayload::SignedOn {
                connection: id,
                account: account.to_string(),
            },
        );
        emit(
            self.bus.as_ref(),
            "core.autojoin",
            EventSource::Core,
            EventPayload::Autojoin {
                connection: id,
                account: account.to_string(),
            },
        );

        if let Some(interval) = interval
            && let Some(connection) = self.connections.get_mut(&id)
        {
            connection.keepalive = Some(Keepalive::start(interval, Instant::now()));
        }

        if !self.connected.contains(&id) {
            self.connected.push(id);
            if self.connected.len() == 1 {
                emit(
                    self.bus.as_ref(),
                    "core.online",
                    EventSource::Core,
                    EventPayload::Online,
                );
            }
        }
    }

    /// Tear the connection down. Returns `Ok(false)` when the protocol's
    /// close hook failed; teardown still completes in that case.
    pub fn disconnect(&mut self, id: ConnectionId) -> Result<bool> {
        let Some(connection) = self.connections.get(&id) else {
            return Err(PurpleError::StaleHandle(id));
        };
        let account = connection.account().to_string();
        info!(account = %account, connection = %id, "disconnecting");

        self.set_state(id, ConnectionState::Disconnecting)?;
        emit(
            self.bus.as_ref(),
            "connection.signing-off",
            EventSource::Core,
            EventPayload::SigningOff {
                connection: id,
                account: account.clone(),
            },
        );

        let chats = self
            .connections
            .get_mut(&id)
            .map(|c| std::mem::take(&mut c.active_chats))
            .unwrap_or_default();
        for chat_id in chats {
            self.run_hook(id, |session, ctx| session.chat_leave(ctx, chat_id));
        }
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.active_chats.clear();
            connection.keepalive = None;
        }

        let closed_cleanly = match self.run_hook(id, |session, ctx| session.close(ctx)) {
            Some(Err(error)) => {
                warn!(connection = %id, %error, "protocol close hook failed");
                false
            }
            _ => true,
        };
        self.run_hook(id, |session, ctx| session.buddy_free(ctx));

        let Some(mut connection) = self.connections.remove(&id) else {
            return Err(PurpleError::StaleHandle(id));
        };
        connection.session = None;
        self.online_accounts.retain(|a| *a != account);
        if let Some(stored) = self.accounts.find_mut(&account)
            && stored.connection == Some(id)
        {
            stored.connection = None;
        }
        let was_connected = self.connected.contains(&id);
        self.connected.retain(|c| *c != id);

        connection.state = ConnectionState::Disconnected;
        emit(
            self.bus.as_ref(),
            "connection.state-changed",
            EventSource::Core,
            EventPayload::StateChanged {
                connection: id,
                account: account.clone(),
                state: ConnectionState::Disconnected,
            },
        );
        self.ui.disconnected(id, &account);

        if connection.attached_to_blist {
            self.buddy_list.remove_account(&account);
        }

        info!(account = %account, connection = %id, "signed off");
        emit(
            self.bus.as_ref(),
            "connection.signed-off",
            EventSource::Core,
            EventPayload::SignedOff {
                connection: id,
                account,
            },
        );
        self.ui.close_requests(id);

        if was_connected && self.connected.is_empty() {
            emit(
                self.bus.as_ref(),
                "core.offline",
                EventSource::Core,
                EventPayload::Offline,
            );
        }
        Ok(closed_cleanly)
    }

    /// Record a connection error and schedule the disconnect for the next
    /// [`run_deferred`](Self::run_deferred). Only the first error is kept.
    pub fn report_error(
        &mut self,
        id: ConnectionId,
        kind: ErrorKind,
        description: impl Into<String>,
    ) -> Result<()> {
        let description = description.into();
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(PurpleError::StaleHandle(id))?;

        if let Some(existing) = &connection.error {
            debug!(
                connection = %id,
                existing = %existing,
                dropped = ?kind,
                "connection already has an error; ignoring"
            );
            return Ok(());
        }

        connection.wants_to_die = kind.is_fatal();
        connection.error = Some(ErrorInfo::new(kind, description.clone()));
        let account = connection.account().to_string();

        warn!(
            account = %account,
            connection = %id,
            ?kind,
            fatal = kind.is_fatal(),
            %description,
            "connection error"
        );
        self.ui.report_disconnect(id, &account, kind, &description);
        emit(
            self.bus.as_ref(),
            "connection.error",
            EventSource::Core,
            EventPayload::ConnectionError {
                connection: id,
                account,
                kind,
                description,
            },
        );
        self.deferred.push_back(Deferred::Disconnect(id));
        Ok(())
    }

    /// Replace (or clear) the stored error without disconnecting.
    pub fn set_error_info(&mut self, id: ConnectionId, info: Option<ErrorInfo>) -> Result<()> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(PurpleError::StaleHandle(id))?;
        connection.error = info;
        Ok(())
    }

    pub fn update_last_received(&mut self, id: ConnectionId) -> Result<()> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(PurpleError::StaleHandle(id))?;
        if let Some(keepalive) = connection.keepalive.as_mut() {
            keepalive.reschedule(Instant::now());
        }
        Ok(())
    }

    pub fn next_keepalive_deadline(&self) -> Option<Instant> {
        self.connections
            .values()
            .filter_map(|c| c.keepalive.as_ref().map(Keepalive::next_fire))
            .min()
    }

    /// Fire every keepalive due at `now`. Returns how many fired.
    pub fn poll_keepalives(&mut self, now: Instant) -> usize {
        let due: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.keepalive.as_ref().is_some_and(|k| k.is_due(now)))
            .map(Connection::id)
            .collect();

        for id in &due {
            if let Some(keepalive) = self
                .connections
                .get_mut(id)
                .and_then(|c| c.keepalive.as_mut())
            {
                keepalive.reschedule(now);
            }
            debug!(connection = %id, "keepalive");
            self.run_hook(*id, |session, ctx| session.keepalive(ctx));
        }
        due.len()
    }

    /// Drain the deferred-work queue in FIFO order.
    pub fn run_deferred(&mut self) -> usize {
        let mut ran = 0;
        while let Some(work) = self.deferred.pop_front() {
            match work {
                Deferred::Disconnect(id) => match self.disconnect(id) {
                    Ok(_) => ran += 1,
                    Err(PurpleError::StaleHandle(_)) => {
                        debug!(connection = %id, "deferred disconnect for a connection already gone");
                    }
                    Err(error) => warn!(connection = %id, %error, "deferred disconnect failed"),
                },
            }
        }
        ran
    }

    /// Disconnect everything. Called once at process teardown.
    pub fn shutdown(&mut self) {
        self.deferred.clear();
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            if let Err(error) = self.disconnect(id) {
                debug!(connection = %id, %error, "shutdown disconnect skipped");
            }
        }
    }

    /// Run `f` against the concrete session type of a connection.
    ///
    /// Returns `Ok(None)` when the session is not an `S` or is currently
    /// inside another hook.
    pub fn with_session<S, R>(
        &mut self,
        id: ConnectionId,
        f: impl FnOnce(&mut S, &mut HookContext<'_>) -> R,
    ) -> Result<Option<R>>
    where
        S: ProtocolSession,
    {
        if !self.connections.contains_key(&id) {
            return Err(PurpleError::StaleHandle(id));
        }
        Ok(self
            .run_hook(id, |session, ctx| {
                session.as_any_mut().downcast_mut::<S>().map(|s| f(s, ctx))
            })
            .flatten())
    }

    fn run_hook<R>(
        &mut self,
        id: ConnectionId,
        hook: impl FnOnce(&mut dyn ProtocolSession, &mut HookContext<'_>) -> R,
    ) -> Option<R> {
        let connection = self.connections.get_mut(&id)?;
        let mut session = connection.session.take()?;
        let state = connection.state;
        let username = connection.account().to_string();
        let protocol = connection.protocol().to_string();
        let password = connection.password.clone();

        let fallback: Account;
        let account = match self.accounts.find(&username) {
            Some(account) => account,
            None => {
                fallback = Account::new(username, protocol);
                &fallback
            }
        };

        let mut ctx = HookContext::new(
            id,
            state,
            account,
            password.as_ref(),
            self.bus.as_ref(),
            self.ui.as_ref(),
        );
        let result = hook(session.as_mut(), &mut ctx);
        let requests = ctx.into_requests();

        if let Some(connection) = self.connections.get_mut(&id) {
            connection.session = Some(session);
        }
        self.apply_requests(id, requests);
        Some(result)
    }

    fn apply_requests(&mut self, id: ConnectionId, requests: Vec<CoreRequest>) {
        for request in requests {
            let Some(connection) = self.connections.get_mut(&id) else {
                return;
            };
            let tearing_down = connection.state == ConnectionState::Disconnecting;
            match request {
                CoreRequest::SetState(_) | CoreRequest::ReportError(..) if tearing_down => {
                    debug!(connection = %id, ?request, "ignoring hook request during teardown");
                }
                CoreRequest::SetState(state) => {
                    if let Err(error) = self.set_state(id, state) {
                        debug!(connection = %id, %error, "state request dropped");
                    }
                }
                CoreRequest::ReportError(kind, description) => {
                    if let Err(error) = self.report_error(id, kind, description) {
                        debug!(connection = %id, %error, "error report dropped");
                    }
                }
                CoreRequest::UpdateLastReceived => {
                    if let Some(keepalive) = connection.keepalive.as_mut() {
                        keepalive.reschedule(Instant::now());
                    }
                }
                CoreRequest::SetDisplayName(name) => connection.display_name = Some(name),
                CoreRequest::SetFlags(flags) => connection.flags = flags,
                CoreRequest::AddChat(chat_id) => {
                    if !connection.active_chats.contains(&chat_id) {
                        connection.active_chats.push(chat_id);
                    }
                }
                CoreRequest::RemoveChat(chat_id) => {
                    connection.active_chats.retain(|c| *c != chat_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::Mutex;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tracing_test::traced_test;

    use super::*;
    use crate::event::{BroadcastEventBus, EventSubscription};
    use crate::protocol::{ProtocolError, ProtocolOptions};

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Login {
        StayConnecting,
        Connect,
        Fail(ErrorKind),
    }

    struct MockPlugin {
        log: Log,
        options: ProtocolOptions,
        login: Login,
        fail_close: bool,
    }

    impl ProtocolPlugin for MockPlugin {
        fn id(&self) -> &'static str {
            "mock"
        }

        fn options(&self) -> ProtocolOptions {
            self.options.clone()
        }

        fn new_session(&self, _account: &Account) -> Box<dyn ProtocolSession> {
            Box::new(MockSession {
                log: self.log.clone(),
                login: self.login,
                fail_close: self.fail_close,
                keepalives: 0,
            })
        }
    }

    struct MockSession {
        log: Log,
        login: Login,
        fail_close: bool,
        keepalives: usize,
    }

    impl MockSession {
        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    impl ProtocolSession for MockSession {
        fn login(&mut self, ctx: &mut HookContext<'_>) -> std::result::Result<(), ProtocolError> {
            self.record(format!("login {}", ctx.username()));
            ctx.set_state(ConnectionState::Connecting);
            match self.login {
                Login::StayConnecting => Ok(()),
                Login::Connect => {
                    ctx.add_chat(7);
                    ctx.set_state(ConnectionState::Connected);
                    Ok(())
                }
                Login::Fail(kind) => Err(ProtocolError::new(kind, "login refused")),
            }
        }

        fn close(&mut self, _ctx: &mut HookContext<'_>) -> std::result::Result<(), ProtocolError> {
            self.record("close".into());
            if self.fail_close {
                Err(ProtocolError::new(ErrorKind::NetworkError, "socket gone"))
            } else {
                Ok(())
            }
        }

        fn keepalive(&mut self, _ctx: &mut HookContext<'_>) {
            self.keepalives += 1;
            self.record("keepalive".into());
        }

        fn chat_leave(&mut self, ctx: &mut HookContext<'_>, chat_id: u32) {
            self.record(format!("leave {chat_id}"));
            ctx.set_state(ConnectionState::Connected);
        }

        fn buddy_free(&mut self, _ctx: &mut HookContext<'_>) {
            self.record("buddy_free".into());
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct RecordingUi {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingUi {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ConnectionUiOps for RecordingUi {
        fn connected(&self, _connection: ConnectionId, account: &str) {
            self.calls.lock().unwrap().push(format!("connected {account}"));
        }

        fn disconnected(&self, _connection: ConnectionId, account: &str) {
            self.calls.lock().unwrap().push(format!("disconnected {account}"));
        }

        fn report_disconnect(
            &self,
            _connection: ConnectionId,
            account: &str,
            kind: ErrorKind,
            _description: &str,
        ) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("report_disconnect {account} {kind:?}"));
        }

        fn request_password(&self, account: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("request_password {account}"));
        }

        fn close_requests(&self, _connection: ConnectionId) {
            self.calls.lock().unwrap().push("close_requests".into());
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuddyList(Arc<Mutex<MemoryBuddyList>>);

    impl BuddyList for SharedBuddyList {
        fn add_account(&mut self, account: &str) {
            self.0.lock().unwrap().add_account(account);
        }

        fn remove_account(&mut self, account: &str) {
            self.0.lock().unwrap().remove_account(account);
        }

        fn add_buddy(&mut self, account: &str, name: &str, alias: Option<&str>) {
            self.0.lock().unwrap().add_buddy(account, name, alias);
        }

        fn remove_buddy(&mut self, account: &str, name: &str) -> bool {
            self.0.lock().unwrap().remove_buddy(account, name)
        }

        fn buddies(&self, account: &str) -> Vec<String> {
            self.0.lock().unwrap().buddies(account)
        }
    }

    struct StaticCredentials(&'static str);

    impl CredentialManager for StaticCredentials {
        fn read_password(&self, _account: &str) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    struct Harness {
        manager: ConnectionManager,
        events: EventSubscription,
        log: Log,
        ui: Arc<RecordingUi>,
        blist: SharedBuddyList,
    }

    impl Harness {
        fn event_names(&mut self) -> Vec<String> {
            self.events
                .drain()
                .into_iter()
                .map(|e| e.channel.to_string())
                .collect()
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn harness_with(login: Login, options: ProtocolOptions, fail_close: bool) -> Harness {
        build_harness(login, options, fail_close, Arc::new(NoCredentials))
    }

    fn build_harness(
        login: Login,
        options: ProtocolOptions,
        fail_close: bool,
        credentials: Arc<dyn CredentialManager>,
    ) -> Harness {
        let bus = Arc::new(BroadcastEventBus::default());
        let events = bus.subscribe("**").unwrap();
        let log = Log::default();
        let ui = Arc::new(RecordingUi::default());
        let blist = SharedBuddyList::default();

        let mut accounts = MemoryAccountStore::new();
        accounts.add(Account::new("alice", "mock").with_password("secret"));
        accounts.add(Account::new("bob", "mock").with_password("secret"));
        accounts.add(Account::new("carol", "mock"));

        let mut manager = ConnectionManager::new(bus)
            .with_ui(ui.clone())
            .with_credentials(credentials)
            .with_accounts(Box::new(accounts))
            .with_buddy_list(Box::new(blist.clone()));
        manager.register_protocol(Arc::new(MockPlugin {
            log: log.clone(),
            options,
            login,
            fail_close,
        }));

        Harness {
            manager,
            events,
            log,
            ui,
            blist,
        }
    }

    fn harness(login: Login) -> Harness {
        harness_with(login, ProtocolOptions::default(), false)
    }

    #[tokio::test]
    async fn connect_emits_signing_on_and_runs_login() {
        let mut h = harness(Login::StayConnecting);
        let id = h.manager.connect("alice").unwrap();

        assert_eq!(
            h.manager.connection(id).unwrap().state(),
            ConnectionState::Connecting
        );
        assert_eq!(h.log(), vec!["login alice"]);
        assert_eq!(
            h.event_names(),
            vec!["connection.signing-on", "connection.state-changed"]
        );
        assert_eq!(h.manager.accounts().find("alice").unwrap().connection, Some(id));
    }

    #[tokio::test]
    async fn second_connect_for_same_account_is_rejected() {
        let mut h = harness(Login::StayConnecting);
        h.manager.connect("alice").unwrap();
        assert_matches!(
            h.manager.connect("alice"),
            Err(PurpleError::AlreadyConnected(account)) if account == "alice"
        );
    }

    #[tokio::test]
    async fn unknown_account_and_protocol_are_errors() {
        let mut h = harness(Login::StayConnecting);
        assert_matches!(h.manager.connect("nobody"), Err(PurpleError::UnknownAccount(_)));

        h.manager
            .accounts_mut()
            .add(Account::new("dave", "irc").with_password("x"));
        assert_matches!(h.manager.connect("dave"), Err(PurpleError::UnknownProtocol(p)) if p == "irc");
    }

    #[tokio::test]
    async fn connect_without_password_does_no_io() {
        let mut h = harness(Login::Connect);
        let result = h.manager.connect("carol");

        assert_matches!(result, Err(PurpleError::PasswordRequired(_)));
        assert!(h.manager.connection_for("carol").is_none());
        assert!(h.log().is_empty(), "login hook must not run");
        assert!(h.event_names().is_empty());
        assert_eq!(h.ui.calls(), vec!["request_password carol"]);
        assert_eq!(
            PurpleError::PasswordRequired("carol".into()).error_kind(),
            Some(ErrorKind::InvalidSettings)
        );
    }

    #[tokio::test]
    async fn credential_manager_supplies_missing_password() {
        let mut h = build_harness(
            Login::StayConnecting,
            ProtocolOptions::default(),
            false,
            Arc::new(StaticCredentials("from-keyring")),
        );

        let id = h.manager.connect("carol").unwrap();
        let seen = h
            .manager
            .with_session::<MockSession, _>(id, |_, ctx| ctx.password().map(str::to_string))
            .unwrap()
            .flatten();
        assert_eq!(seen.as_deref(), Some("from-keyring"));
    }

    #[tokio::test]
    async fn optional_password_policy_connects_without_one() {
        let options = ProtocolOptions {
            password: PasswordPolicy::Optional,
            ..ProtocolOptions::default()
        };
        let mut h = harness_with(Login::StayConnecting, options, false);
        assert!(h.manager.connect("carol").is_ok());
    }

    #[tokio::test]
    async fn set_state_to_current_state_is_a_no_op() {
        let mut h = harness(Login::StayConnecting);
        let id = h.manager.connect("alice").unwrap();
        h.event_names();
        let ui_before = h.ui.calls();

        h.manager.set_state(id, ConnectionState::Connecting).unwrap();

        assert!(h.event_names().is_empty());
        assert_eq!(h.ui.calls(), ui_before);
    }

    #[tokio::test]
    async fn entering_connected_signs_on_and_goes_online_once() {
        let mut h = harness(Login::StayConnecting);
        let alice = h.manager.connect("alice").unwrap();
        let bob = h.manager.connect("bob").unwrap();
        h.event_names();

        h.manager.set_state(alice, ConnectionState::Connected).unwrap();
        h.manager.set_state(bob, ConnectionState::Connected).unwrap();

        let names = h.event_names();
        assert_eq!(names.iter().filter(|n| *n == "core.online").count(), 1);
        assert_eq!(names.iter().filter(|n| *n == "connection.signed-on").count(), 2);
        assert_eq!(names.iter().filter(|n| *n == "core.autojoin").count(), 2);
        assert_eq!(h.manager.online_accounts(), ["alice", "bob"]);
        assert_eq!(h.manager.connected_count(), 2);
        assert!(h.manager.connection(alice).unwrap().login_time().is_some());
        assert!(h.blist.0.lock().unwrap().is_attached("alice"));

        h.manager.disconnect(alice).unwrap();
        assert!(!h.event_names().contains(&"core.offline".to_string()));
        h.manager.disconnect(bob).unwrap();
        let names = h.event_names();
        assert_eq!(names.last().map(String::as_str), Some("core.offline"));
    }

    #[tokio::test]
    async fn disconnect_runs_full_teardown_in_order() {
        let mut h = harness(Login::Connect);
        let id = h.manager.connect("alice").unwrap();
        assert_eq!(h.manager.connection(id).unwrap().active_chats(), &[7]);
        h.event_names();

        assert!(h.manager.disconnect(id).unwrap());

        assert_eq!(
            h.log(),
            vec!["login alice", "leave 7", "close", "buddy_free"]
        );
        assert_eq!(
            h.event_names(),
            vec![
                "connection.state-changed",
                "connection.signing-off",
                "connection.state-changed",
                "connection.signed-off",
                "core.offline",
            ]
        );
        assert!(h.manager.connection(id).is_none());
        assert!(h.manager.online_accounts().is_empty());
        assert_eq!(h.manager.accounts().find("alice").unwrap().connection, None);
        assert_eq!(h.blist.0.lock().unwrap().detach_count("alice"), 1);
        assert_eq!(
            h.ui.calls().last().map(String::as_str),
            Some("close_requests")
        );
    }

    #[tokio::test]
    async fn second_disconnect_is_stale_and_side_effect_free() {
        let mut h = harness(Login::Connect);
        let id = h.manager.connect("alice").unwrap();
        h.manager.disconnect(id).unwrap();
        h.event_names();
        let ui_before = h.ui.calls();

        assert_matches!(h.manager.disconnect(id), Err(PurpleError::StaleHandle(stale)) if stale == id);
        assert!(h.event_names().is_empty());
        assert_eq!(h.ui.calls(), ui_before);
        assert_eq!(h.blist.0.lock().unwrap().detach_count("alice"), 1);
    }

    #[tokio::test]
    async fn buddies_stay_attached_when_never_connected() {
        let mut h = harness(Login::StayConnecting);
        let id = h.manager.connect("alice").unwrap();
        h.manager.disconnect(id).unwrap();
        assert_eq!(h.blist.0.lock().unwrap().detach_count("alice"), 0);
        assert!(!h.event_names().contains(&"core.offline".to_string()));
    }

    #[tokio::test]
    async fn failed_close_hook_still_reaches_disconnected() {
        let mut h = harness_with(Login::Connect, ProtocolOptions::default(), true);
        let id = h.manager.connect("alice").unwrap();

        assert!(!h.manager.disconnect(id).unwrap());
        assert!(h.manager.connection(id).is_none());
        assert!(h.event_names().contains(&"connection.signed-off".to_string()));
    }

    #[tokio::test]
    async fn first_error_wins_and_disconnect_is_deferred() {
        let mut h = harness(Login::StayConnecting);
        let id = h.manager.connect("alice").unwrap();

        h.manager
            .report_error(id, ErrorKind::NetworkError, "read error")
            .unwrap();
        h.manager
            .report_error(id, ErrorKind::AuthenticationFailed, "not authorized")
            .unwrap();

        let connection = h.manager.connection(id).unwrap();
        let error = connection.error().unwrap();
        assert_eq!(error.kind(), ErrorKind::NetworkError);
        assert_eq!(error.description(), "read error");
        assert!(!connection.wants_to_die());
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert_eq!(h.manager.pending_deferred(), 1);
        assert_eq!(
            h.event_names()
                .iter()
                .filter(|n| *n == "connection.error")
                .count(),
            1
        );

        assert_eq!(h.manager.run_deferred(), 1);
        assert!(h.manager.connection(id).is_none());
    }

    #[tokio::test]
    async fn fatal_login_failure_sets_wants_to_die() {
        let mut h = harness(Login::Fail(ErrorKind::AuthenticationFailed));
        let id = h.manager.connect("alice").unwrap();

        let connection = h.manager.connection(id).unwrap();
        assert!(connection.wants_to_die());
        assert_eq!(
            h.ui.calls(),
            vec!["report_disconnect alice AuthenticationFailed"]
        );
        h.manager.run_deferred();
        assert!(h.manager.connection_for("alice").is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_login_hook_is_logged() {
        let mut h = harness(Login::Fail(ErrorKind::NetworkError));
        h.manager.connect("bob").unwrap();
        assert!(logs_contain("login hook failed"));
    }

    #[tokio::test]
    async fn set_error_info_replaces_without_disconnecting() {
        let mut h = harness(Login::StayConnecting);
        let id = h.manager.connect("alice").unwrap();
        h.manager
            .report_error(id, ErrorKind::NetworkError, "reset")
            .unwrap();
        h.manager
            .set_error_info(id, Some(ErrorInfo::new(ErrorKind::InvalidSettings, "fixed port")))
            .unwrap();

        assert_eq!(
            h.manager.connection(id).unwrap().error().unwrap().kind(),
            ErrorKind::InvalidSettings
        );
        h.manager.set_error_info(id, None).unwrap();
        assert!(h.manager.connection(id).unwrap().error().is_none());
    }

    #[tokio::test]
    async fn deferred_disconnect_tolerates_manual_teardown() {
        let mut h = harness(Login::StayConnecting);
        let id = h.manager.connect("alice").unwrap();
        h.manager
            .report_error(id, ErrorKind::NetworkError, "reset")
            .unwrap();
        h.manager.disconnect(id).unwrap();
        assert_eq!(h.manager.run_deferred(), 0);
    }

    #[tokio::test]
    async fn stale_handles_are_rejected() {
        let mut h = harness(Login::StayConnecting);
        let stale = ConnectionId::new();
        assert_matches!(
            h.manager.set_state(stale, ConnectionState::Connected),
            Err(PurpleError::StaleHandle(_))
        );
        assert_matches!(
            h.manager.report_error(stale, ErrorKind::OtherError, "x"),
            Err(PurpleError::StaleHandle(_))
        );
        assert_matches!(
            h.manager.with_session::<MockSession, _>(stale, |_, _| ()),
            Err(PurpleError::StaleHandle(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_fires_and_reschedules_on_traffic() {
        let options = ProtocolOptions {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..ProtocolOptions::default()
        };
        let mut h = harness_with(Login::Connect, options, false);
        let id = h.manager.connect("alice").unwrap();
        let first = h.manager.keepalive_deadline(id).unwrap();
        assert_eq!(h.manager.next_keepalive_deadline(), Some(first));

        tokio::time::advance(Duration::from_secs(20)).await;
        h.manager.update_last_received(id).unwrap();
        let rescheduled = h.manager.keepalive_deadline(id).unwrap();
        assert_eq!(rescheduled, Instant::now() + Duration::from_secs(30));
        assert!(rescheduled > first);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(h.manager.poll_keepalives(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(h.manager.poll_keepalives(Instant::now()), 1);
        assert_eq!(
            h.manager.keepalive_deadline(id),
            Some(Instant::now() + Duration::from_secs(30))
        );
        let fired = h
            .manager
            .with_session::<MockSession, _>(id, |session, _| session.keepalives)
            .unwrap();
        assert_eq!(fired, Some(1));

        h.manager.disconnect(id).unwrap();
        assert_eq!(h.manager.next_keepalive_deadline(), None);
    }

    #[tokio::test]
    async fn hook_requests_during_teardown_are_ignored() {
        let mut h = harness(Login::Connect);
        let id = h.manager.connect("alice").unwrap();
        h.event_names();

        // chat_leave asks for Connected; teardown must not honour it
        h.manager.disconnect(id).unwrap();
        assert_eq!(
            h.event_names()
                .iter()
                .filter(|n| *n == "connection.signed-on")
                .count(),
            0
        );
    }

    #[tokio::test]
    async fn shutdown_disconnects_everything() {
        let mut h = harness(Login::Connect);
        h.manager.connect("alice").unwrap();
        h.manager.connect("bob").unwrap();
        h.manager.shutdown();
        assert_eq!(h.manager.connections().count(), 0);
        assert_eq!(h.manager.connected_count(), 0);
    }
}
