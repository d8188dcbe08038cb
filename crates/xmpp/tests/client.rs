use std::sync::Arc;

use purple_core::account::{Account, AccountStore, MemoryAccountStore, Setting};
use purple_core::config::XmppConfig;
use purple_core::event::{BroadcastEventBus, EventBus};
use purple_core::{ConnectionManager, ErrorKind};
use purple_test_support::transport::ScriptedTransport;
use purple_test_support::ui::{RecordingUiOps, UiCall};
use purple_xmpp::{CapsCache, XmppPlugin, client};

const SCRIPT: &[&str] = &[
    "<features xmlns='http://etherx.jabber.org/streams'>\
       <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>\
     </features>",
    "<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>",
    "<features xmlns='http://etherx.jabber.org/streams'>\
       <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
     </features>",
    "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>",
    "<features xmlns='http://etherx.jabber.org/streams'>\
       <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
     </features>",
    "<iq xmlns='jabber:client' type='result' id='bind-1'>\
       <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>hag66@shakespeare.lit/pda</jid></bind>\
     </iq>",
    "<iq xmlns='jabber:client' type='result' id='roster-1'><query xmlns='jabber:iq:roster'/></iq>",
];

#[tokio::test]
async fn driver_runs_a_session_until_the_peer_hangs_up() {
    let bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
    let ui = RecordingUiOps::new();
    let mut account = Account::new("hag66@shakespeare.lit", "xmpp").with_password("cauldron");
    account.set_setting("resource", Setting::String("pda".into()));
    let mut accounts = MemoryAccountStore::new();
    accounts.add(account);

    let plugin = XmppPlugin::with_cache(XmppConfig::default(), CapsCache::in_memory());
    let caps = plugin.caps();
    let mut manager = ConnectionManager::new(bus)
        .with_ui(Arc::new(ui.clone()))
        .with_accounts(Box::new(accounts));
    manager.register_protocol(Arc::new(plugin));

    let id = manager.connect("hag66@shakespeare.lit").unwrap();
    let transport = ScriptedTransport::new(SCRIPT.iter().copied());
    let wire = transport.log();

    client::run(&mut manager, id, transport, caps).await.unwrap();

    assert!(manager.connection(id).is_none());
    assert!(wire.tls_started());
    assert!(wire.closed());

    let sent = wire.sent();
    assert!(sent[0].starts_with("<?xml"));
    assert_eq!(sent.iter().filter(|s| s.contains("<stream:stream")).count(), 3);
    assert!(sent.iter().any(|s| s.contains("mechanism=\"PLAIN\"") || s.contains("mechanism='PLAIN'")));
    assert_eq!(sent.last().map(String::as_str), Some("</stream:stream>"));

    let calls = ui.calls();
    assert!(calls.contains(&UiCall::Connected("hag66@shakespeare.lit".into())));
    assert!(calls.iter().any(|c| matches!(
        c,
        UiCall::ReportDisconnect { kind: ErrorKind::NetworkError, .. }
    )));
}
