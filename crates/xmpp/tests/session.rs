use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use minidom::Element;
use purple_core::account::{Account, AccountStore, MemoryAccountStore, Setting};
use purple_core::config::XmppConfig;
use purple_core::event::{BroadcastEventBus, EventBus, EventSubscription};
use purple_core::{ConnectionId, ConnectionManager, ConnectionState, ErrorKind, EventPayload};
use purple_test_support::fixtures;
use purple_test_support::ui::{RecordingUiOps, StaticCredentials, UiCall};
use purple_xmpp::stanza::NS_DISCO_INFO;
use purple_xmpp::{CapsCache, Frame, JabberSession, JoinRequest, OutgoingMessage, XmppPlugin};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing_test::traced_test;

const ACCOUNT: &str = "hag66@shakespeare.lit";

fn xmpp_account(jid: &str) -> Account {
    let mut account = Account::new(jid, "xmpp");
    account.set_setting("resource", Setting::String("pda".into()));
    account.set_setting("direct_tls", Setting::Bool(true));
    account
}

fn take_frames(manager: &mut ConnectionManager, id: ConnectionId) -> UnboundedReceiver<Frame> {
    manager
        .with_session::<JabberSession, _>(id, |session, _| session.take_frames())
        .unwrap()
        .flatten()
        .unwrap()
}

/// A second account signed in on the same manager.
struct Peer {
    id: ConnectionId,
    frames: UnboundedReceiver<Frame>,
}

impl Peer {
    fn sent_stanzas(&mut self) -> Vec<Element> {
        std::iter::from_fn(|| self.frames.try_recv().ok())
            .filter_map(|frame| match frame {
                Frame::Stanza(stanza) => Some(stanza),
                _ => None,
            })
            .collect()
    }
}

struct Harness {
    manager: ConnectionManager,
    id: ConnectionId,
    frames: UnboundedReceiver<Frame>,
    events: EventSubscription,
    ui: RecordingUiOps,
    caps: Arc<Mutex<CapsCache>>,
}

impl Harness {
    fn connect() -> Self {
        Self::connect_with(xmpp_account(ACCOUNT).with_password("cauldron"), |manager| manager)
    }

    fn connect_with(
        account: Account,
        setup: impl FnOnce(ConnectionManager) -> ConnectionManager,
    ) -> Self {
        let bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let events = bus.subscribe("**").unwrap();
        let ui = RecordingUiOps::new();

        let mut accounts = MemoryAccountStore::new();
        accounts.add(account);

        let plugin = XmppPlugin::with_cache(XmppConfig::default(), CapsCache::in_memory());
        let caps = plugin.caps();
        let mut manager = setup(
            ConnectionManager::new(bus)
                .with_ui(Arc::new(ui.clone()))
                .with_accounts(Box::new(accounts)),
        );
        manager.register_protocol(Arc::new(plugin));

        let id = manager.connect(ACCOUNT).unwrap();
        let frames = take_frames(&mut manager, id);

        Self {
            manager,
            id,
            frames,
            events,
            ui,
            caps,
        }
    }

    fn signed_in() -> Self {
        let mut harness = Self::bound();
        harness.load_roster(harness.id);
        harness.sent();
        harness.events.drain();
        harness
    }

    fn bound() -> Self {
        let mut harness = Self::connect();
        harness.negotiate(harness.id, "hag66@shakespeare.lit/pda");
        harness
    }

    /// Sign `jid` in on the same manager and caps cache.
    fn sign_in_peer(&mut self, jid: &str) -> Peer {
        self.manager
            .accounts_mut()
            .add(xmpp_account(jid).with_password("cauldron"));
        let id = self.manager.connect(jid).unwrap();
        let frames = take_frames(&mut self.manager, id);
        self.negotiate(id, &format!("{jid}/pda"));
        self.load_roster(id);
        let mut peer = Peer { id, frames };
        peer.sent_stanzas();
        self.events.drain();
        peer
    }

    fn negotiate(&mut self, id: ConnectionId, full_jid: &str) {
        self.feed_to(
            id,
            "<features xmlns='http://etherx.jabber.org/streams'>\
               <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
             </features>",
        );
        self.feed_to(id, "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>");
        self.feed_to(
            id,
            "<features xmlns='http://etherx.jabber.org/streams'>\
               <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
             </features>",
        );
        self.feed_to(
            id,
            &format!(
                "<iq xmlns='jabber:client' type='result' id='bind-1'>\
                   <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>{full_jid}</jid></bind>\
                 </iq>"
            ),
        );
    }

    fn load_roster(&mut self, id: ConnectionId) {
        self.feed_to(
            id,
            "<iq xmlns='jabber:client' type='result' id='roster-1'>\
               <query xmlns='jabber:iq:roster'>\
                 <item jid='romeo@montague.lit' subscription='both'/>\
               </query>\
             </iq>",
        );
    }

    fn feed(&mut self, xml: &str) {
        self.feed_to(self.id, xml);
    }

    fn feed_to(&mut self, id: ConnectionId, xml: &str) {
        self.manager
            .with_session::<JabberSession, _>(id, |session, ctx| {
                session.handle_frame(ctx, xml.as_bytes())
            })
            .unwrap()
            .unwrap();
    }

    fn session<R>(&mut self, f: impl FnOnce(&mut JabberSession) -> R) -> R {
        self.manager
            .with_session::<JabberSession, _>(self.id, |session, _| f(session))
            .unwrap()
            .unwrap()
    }

    fn sent(&mut self) -> Vec<Frame> {
        std::iter::from_fn(|| self.frames.try_recv().ok()).collect()
    }

    fn sent_stanzas(&mut self) -> Vec<Element> {
        self.sent()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Stanza(stanza) => Some(stanza),
                _ => None,
            })
            .collect()
    }

    fn payloads(&mut self) -> Vec<EventPayload> {
        self.events.drain().into_iter().map(|e| e.payload).collect()
    }

    fn state(&self) -> Option<ConnectionState> {
        self.manager.connection(self.id).map(|c| c.state())
    }
}

fn disco_query(stanzas: &[Element]) -> Option<&Element> {
    stanzas
        .iter()
        .find(|s| s.get_child("query", NS_DISCO_INFO).is_some())
}

fn join_coven(harness: &mut Harness) {
    harness.session(|s| {
        s.join_chat(JoinRequest::new("coven", "chat.shakespeare.lit", "thirdwitch"))
    });
}

#[test]
fn login_negotiates_and_connects() {
    let mut harness = Harness::connect();
    assert_eq!(harness.state(), Some(ConnectionState::Connecting));
    assert_matches!(harness.sent().as_slice(), [Frame::Header(header)] if header.contains("to='shakespeare.lit'"));

    let mut harness = Harness::bound();
    assert_eq!(harness.state(), Some(ConnectionState::Connected));
    assert_eq!(
        harness.manager.connection(harness.id).and_then(|c| c.display_name()),
        Some("hag66@shakespeare.lit/pda")
    );

    let stanzas = harness.sent_stanzas();
    let names: Vec<&str> = stanzas.iter().map(|s| s.name()).collect();
    assert!(names.contains(&"presence"));
    assert!(stanzas.iter().any(|s| s.attr("id") == Some("roster-1")));
    assert!(stanzas.iter().any(|s| s.attr("id") == Some("carbons-enable")));
    assert_eq!(harness.ui.count(|c| matches!(c, UiCall::Connected(_))), 1);
}

#[test]
fn authentication_failure_is_fatal() {
    let mut harness = Harness::connect();
    harness.feed(
        "<features xmlns='http://etherx.jabber.org/streams'>\
           <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
         </features>",
    );
    harness.feed("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>");

    let error = harness
        .manager
        .connection(harness.id)
        .and_then(|c| c.error().cloned())
        .unwrap();
    assert_eq!(error.kind(), ErrorKind::AuthenticationFailed);
    assert!(error.is_fatal());

    harness.manager.run_deferred();
    assert!(harness.manager.connection(harness.id).is_none());
    assert_eq!(
        harness.ui.count(|c| matches!(
            c,
            UiCall::ReportDisconnect { kind: ErrorKind::AuthenticationFailed, .. }
        )),
        1
    );
}

#[test]
fn joins_wait_for_the_roster() {
    let mut harness = Harness::bound();
    harness.sent();

    join_coven(&mut harness);
    assert!(harness.sent_stanzas().is_empty());

    harness.feed("<iq xmlns='jabber:client' type='result' id='roster-1'><query xmlns='jabber:iq:roster'/></iq>");
    let stanzas = harness.sent_stanzas();
    let join = stanzas
        .iter()
        .find(|s| s.name() == "presence")
        .expect("queued join should be sent");
    assert_eq!(join.attr("to"), Some("coven@chat.shakespeare.lit/thirdwitch"));
}

#[test]
fn own_kick_leaves_the_room_exactly_once() {
    let mut harness = Harness::signed_in();
    join_coven(&mut harness);
    harness.feed(&fixtures::stanza("presence-room-self.xml"));
    harness.feed(&fixtures::stanza("presence-room-occupant.xml"));

    let payloads = harness.payloads();
    let chat_id = payloads
        .iter()
        .find_map(|p| match p {
            EventPayload::ChatJoined { chat_id, nick, .. } if nick == "thirdwitch" => Some(*chat_id),
            _ => None,
        })
        .expect("joined");
    assert!(payloads.iter().any(|p| matches!(
        p,
        EventPayload::ChatMemberJoined { member, new_arrival: true, .. } if member.nick == "firstwitch"
    )));
    assert_eq!(
        harness.manager.connection(harness.id).map(|c| c.active_chats().to_vec()),
        Some(vec![chat_id])
    );

    harness.feed(&fixtures::stanza("presence-kicked.xml"));
    let payloads = harness.payloads();
    assert!(payloads.iter().any(|p| matches!(
        p,
        EventPayload::ChatSystemMessage { text, .. }
            if text == "You have been kicked by Fluellen: Avaunt, you cullion!"
    )));
    let signed_off = |payloads: &[EventPayload]| {
        payloads
            .iter()
            .filter(|p| matches!(p, EventPayload::ChatSignedOff { .. }))
            .count()
    };
    assert_eq!(signed_off(&payloads), 1);
    assert!(harness.session(|s| s.state().chats().is_empty()));
    assert_eq!(
        harness.manager.connection(harness.id).map(|c| c.active_chats().len()),
        Some(0)
    );

    harness.manager.disconnect(harness.id).unwrap();
    assert_eq!(signed_off(&harness.payloads()), 0);
}

#[test]
fn room_is_marked_muc_by_the_muc_user_self_presence() {
    let mut harness = Harness::signed_in();
    join_coven(&mut harness);
    let is_muc = |harness: &mut Harness| {
        harness.session(|s| {
            s.state()
                .chats()
                .find("coven", "chat.shakespeare.lit")
                .map(|chat| chat.muc)
        })
    };
    assert_eq!(is_muc(&mut harness), Some(false));

    // A groupchat service without MUC answers with a bare presence.
    harness.feed(
        "<presence xmlns='jabber:client' from='coven@chat.shakespeare.lit/thirdwitch' \
           to='hag66@shakespeare.lit/pda'/>",
    );
    assert_eq!(is_muc(&mut harness), Some(false));

    harness.feed(&fixtures::stanza("presence-room-self.xml"));
    assert_eq!(is_muc(&mut harness), Some(true));
}

#[test]
#[traced_test]
fn repeated_occupant_presence_is_not_a_second_join() {
    let mut harness = Harness::signed_in();
    join_coven(&mut harness);
    harness.feed(&fixtures::stanza("presence-room-self.xml"));
    harness.feed(&fixtures::stanza("presence-room-occupant.xml"));
    harness.payloads();

    harness.feed(&fixtures::stanza("presence-room-occupant.xml"));
    assert!(!harness.payloads().iter().any(|p| matches!(
        p,
        EventPayload::ChatMemberJoined { .. } | EventPayload::ChatMemberUpdated { .. }
    )));
    assert!(logs_contain("member already in room"));

    // A role change is still an update.
    let promoted = fixtures::stanza("presence-room-occupant.xml").replace("moderator", "visitor");
    harness.feed(&promoted);
    assert!(harness.payloads().iter().any(|p| matches!(
        p,
        EventPayload::ChatMemberUpdated { member, .. } if member.nick == "firstwitch"
    )));
}

#[test]
fn leaving_signs_off_before_the_server_confirms() {
    let mut harness = Harness::signed_in();
    join_coven(&mut harness);
    harness.feed(&fixtures::stanza("presence-room-self.xml"));
    harness.sent();
    harness.payloads();

    harness.manager.disconnect(harness.id).unwrap();
    let payloads = harness.payloads();
    assert_eq!(
        payloads
            .iter()
            .filter(|p| matches!(p, EventPayload::ChatSignedOff { room, .. } if room == "coven@chat.shakespeare.lit"))
            .count(),
        1
    );
    let frames = harness.sent();
    assert!(frames.iter().any(|f| matches!(
        f,
        Frame::Stanza(s) if s.attr("to") == Some("coven@chat.shakespeare.lit/thirdwitch")
            && s.attr("type") == Some("unavailable")
    )));
    assert_matches!(frames.last(), Some(Frame::Close));
}

#[test]
fn room_topic_is_announced_without_logging() {
    let mut harness = Harness::signed_in();
    join_coven(&mut harness);
    harness.feed(&fixtures::stanza("presence-room-self.xml"));
    harness.payloads();

    harness.feed(&fixtures::stanza("message-topic.xml"));
    let payloads = harness.payloads();
    assert!(payloads.iter().any(|p| matches!(
        p,
        EventPayload::ChatTopicChanged { topic, who: Some(who), .. }
            if topic == "Fire Burn and Cauldron Bubble!" && who == "secondwitch"
    )));
    assert!(payloads.iter().any(|p| matches!(
        p,
        EventPayload::ChatSystemMessage { no_log: true, text, .. }
            if text == "secondwitch has set the topic to: Fire Burn and Cauldron Bubble!"
    )));
    assert!(!payloads.iter().any(|p| matches!(p, EventPayload::MessageReceived { .. })));
}

#[test]
fn caps_are_queried_once_and_shared() {
    let mut harness = Harness::signed_in();
    harness.feed(&fixtures::stanza("presence-caps.xml"));

    let stanzas = harness.sent_stanzas();
    let query = stanzas
        .iter()
        .find(|s| s.get_child("query", NS_DISCO_INFO).is_some())
        .expect("disco#info query");
    assert_eq!(query.attr("to"), Some("romeo@montague.lit/orchard"));
    let id = query.attr("id").unwrap().to_string();

    harness.feed(&fixtures::stanza("disco-exodus.xml").replace("{id}", &id));
    let payloads = harness.payloads();
    assert!(payloads.iter().any(|p| matches!(
        p,
        EventPayload::BuddyCapabilitiesChanged { jid, features, .. }
            if jid == "romeo@montague.lit" && features.iter().any(|f| f == "http://jabber.org/protocol/muc")
    )));
    assert_eq!(purple_xmpp::session::lock_caps(&harness.caps).len(), 1);

    // Another resource on the same client build is answered from the cache.
    let second = fixtures::stanza("presence-caps.xml").replace("orchard", "balcony");
    harness.feed(&second);
    assert!(
        harness
            .sent_stanzas()
            .iter()
            .all(|s| s.get_child("query", NS_DISCO_INFO).is_none())
    );
    assert!(harness.payloads().iter().any(|p| matches!(
        p,
        EventPayload::BuddyCapabilitiesChanged { .. }
    )));
}

#[test]
fn forged_caps_are_not_applied() {
    let mut harness = Harness::signed_in();
    harness.feed(&fixtures::stanza("presence-caps.xml"));
    let id = harness
        .sent_stanzas()
        .iter()
        .find(|s| s.get_child("query", NS_DISCO_INFO).is_some())
        .and_then(|s| s.attr("id").map(str::to_string))
        .unwrap();

    let forged = fixtures::stanza("disco-exodus.xml")
        .replace("{id}", &id)
        .replace("Exodus 0.9.1", "Exodus 0.9.2");
    harness.feed(&forged);
    assert!(!harness.payloads().iter().any(|p| matches!(
        p,
        EventPayload::BuddyCapabilitiesChanged { .. }
    )));
    assert!(purple_xmpp::session::lock_caps(&harness.caps).is_empty());
}

#[test]
fn caps_query_is_not_orphaned_when_its_account_signs_off() {
    let mut harness = Harness::signed_in();
    let mut hecate = harness.sign_in_peer("hecate@shakespeare.lit");

    harness.feed(&fixtures::stanza("presence-caps.xml"));
    assert!(disco_query(&harness.sent_stanzas()).is_some());
    assert_eq!(purple_xmpp::session::lock_caps(&harness.caps).pending_queries(), 1);

    harness.manager.disconnect(harness.id).unwrap();
    assert_eq!(purple_xmpp::session::lock_caps(&harness.caps).pending_queries(), 0);

    // The other account sees the same client build and has to ask itself.
    harness.feed_to(hecate.id, &fixtures::stanza("presence-caps.xml"));
    let stanzas = hecate.sent_stanzas();
    let query = disco_query(&stanzas).expect("disco#info query from the remaining account");
    assert_eq!(query.attr("to"), Some("romeo@montague.lit/orchard"));
}

#[test]
fn waiting_account_takes_over_the_caps_query() {
    let mut harness = Harness::signed_in();
    let mut hecate = harness.sign_in_peer("hecate@shakespeare.lit");

    harness.feed(&fixtures::stanza("presence-caps.xml"));
    assert!(disco_query(&harness.sent_stanzas()).is_some());
    harness.feed_to(hecate.id, &fixtures::stanza("presence-caps.xml"));
    assert!(disco_query(&hecate.sent_stanzas()).is_none());

    harness.manager.disconnect(harness.id).unwrap();
    harness.events.drain();

    let stanzas = hecate.sent_stanzas();
    let query = disco_query(&stanzas).expect("query re-sent on the waiting account");
    assert_eq!(query.attr("to"), Some("romeo@montague.lit/orchard"));
    let id = query.attr("id").unwrap().to_string();

    harness.feed_to(hecate.id, &fixtures::stanza("disco-exodus.xml").replace("{id}", &id));
    assert!(harness.payloads().iter().any(|p| matches!(
        p,
        EventPayload::BuddyCapabilitiesChanged { account, jid, .. }
            if account == "hecate@shakespeare.lit" && jid == "romeo@montague.lit"
    )));
    assert_eq!(purple_xmpp::session::lock_caps(&harness.caps).len(), 1);
}

#[test]
fn sasl_uses_the_password_from_the_credential_manager() {
    let mut harness = Harness::connect_with(xmpp_account(ACCOUNT), |manager| {
        manager.with_credentials(Arc::new(StaticCredentials(vec![(
            ACCOUNT.into(),
            "cauldron".into(),
        )])))
    });
    assert_eq!(harness.state(), Some(ConnectionState::Connecting));
    harness.sent();

    harness.feed(
        "<features xmlns='http://etherx.jabber.org/streams'>\
           <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
         </features>",
    );
    let stanzas = harness.sent_stanzas();
    let auth = stanzas.iter().find(|s| s.name() == "auth").expect("SASL auth");
    assert_eq!(auth.attr("mechanism"), Some("PLAIN"));
    assert_eq!(
        purple_xmpp::sasl::decode(auth).unwrap(),
        b"\0hag66\0cauldron".to_vec()
    );
}

#[test]
fn sent_carbons_surface_as_sent_messages() {
    let mut harness = Harness::signed_in();
    harness.feed(&fixtures::stanza("message-carbon-sent.xml"));
    let payloads = harness.payloads();
    assert!(payloads.iter().any(|p| matches!(
        p,
        EventPayload::MessageSent { message, .. }
            if message.body == "Fair is foul, and foul is fair" && message.delayed
    )));
}

#[test]
fn outgoing_messages_carry_xhtml_only_when_it_differs() {
    let mut harness = Harness::signed_in();
    assert!(harness.session(|s| s.send_message(&OutgoingMessage::chat(
        "romeo@montague.lit",
        "plain &amp; simple"
    ))));
    assert!(harness.session(|s| s.send_message(&OutgoingMessage::chat(
        "romeo@montague.lit",
        "<b>bold</b> move"
    ))));
    let stanzas = harness.sent_stanzas();
    assert_eq!(stanzas.len(), 2);
    assert!(stanzas[0].get_child("html", "http://jabber.org/protocol/xhtml-im").is_none());
    assert!(stanzas[1].get_child("html", "http://jabber.org/protocol/xhtml-im").is_some());
}

#[test]
fn typing_is_suppressed_for_strangers() {
    let mut harness = Harness::signed_in();
    assert!(!harness.session(|s| {
        s.send_typing("stranger@elsewhere.lit", purple_core::event::ChatState::Composing)
    }));
    assert!(harness.session(|s| {
        s.send_typing("romeo@montague.lit", purple_core::event::ChatState::Composing)
    }));
}

#[test]
fn keepalive_pings_the_server() {
    let mut harness = Harness::signed_in();
    let fired = harness
        .manager
        .poll_keepalives(Instant::now() + Duration::from_secs(3600));
    assert_eq!(fired, 1);
    let stanzas = harness.sent_stanzas();
    assert!(stanzas.iter().any(|s| s.attr("to") == Some("shakespeare.lit")
        && s.get_child("ping", "urn:xmpp:ping").is_some()));
}

#[test]
fn unknown_iq_requests_get_service_unavailable() {
    let mut harness = Harness::signed_in();
    harness.feed(
        "<iq xmlns='jabber:client' type='get' id='v1' from='romeo@montague.lit/orchard'>\
           <query xmlns='jabber:iq:version'/>\
         </iq>",
    );
    let reply = harness.sent_stanzas().pop().unwrap();
    assert_eq!(reply.attr("type"), Some("error"));
    let error = reply.get_child("error", "jabber:client").unwrap();
    assert!(
        error
            .get_child("service-unavailable", "urn:ietf:params:xml:ns:xmpp-stanzas")
            .is_some()
    );
}
