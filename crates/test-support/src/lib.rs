pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    pub fn stanza(name: &str) -> String {
        read_or_panic(Path::new("stanzas").join(name))
    }

    pub fn caps(name: &str) -> String {
        read_or_panic(Path::new("caps").join(name))
    }

    pub fn config(name: &str) -> String {
        read_or_panic(Path::new("config").join(name))
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}

pub mod ui {
    use std::sync::{Arc, Mutex};

    use purple_core::ErrorKind;
    use purple_core::connection::ConnectionId;
    use purple_core::ui::{ConnectionUiOps, CredentialManager};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum UiCall {
        Connected(String),
        Disconnected(String),
        ReportDisconnect {
            account: String,
            kind: ErrorKind,
            description: String,
        },
        RequestPassword(String),
        NotifyError {
            account: String,
            title: String,
        },
        RequestAction {
            title: String,
            actions: Vec<String>,
        },
        CloseRequests(ConnectionId),
    }

    /// UI ops that remember every call, in order.
    #[derive(Debug, Default, Clone)]
    pub struct RecordingUiOps {
        calls: Arc<Mutex<Vec<UiCall>>>,
    }

    impl RecordingUiOps {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn calls(&self) -> Vec<UiCall> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        pub fn count(&self, matches: impl Fn(&UiCall) -> bool) -> usize {
            self.calls().iter().filter(|c| matches(c)).count()
        }

        fn record(&self, call: UiCall) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
        }
    }

    impl ConnectionUiOps for RecordingUiOps {
        fn connected(&self, _connection: ConnectionId, account: &str) {
            self.record(UiCall::Connected(account.to_string()));
        }

        fn disconnected(&self, _connection: ConnectionId, account: &str) {
            self.record(UiCall::Disconnected(account.to_string()));
        }

        fn report_disconnect(
            &self,
            _connection: ConnectionId,
            account: &str,
            kind: ErrorKind,
            description: &str,
        ) {
            self.record(UiCall::ReportDisconnect {
                account: account.to_string(),
                kind,
                description: description.to_string(),
            });
        }

        fn request_password(&self, account: &str) {
            self.record(UiCall::RequestPassword(account.to_string()));
        }

        fn notify_error(&self, account: &str, title: &str, _message: &str) {
            self.record(UiCall::NotifyError {
                account: account.to_string(),
                title: title.to_string(),
            });
        }

        fn request_action(
            &self,
            _connection: ConnectionId,
            title: &str,
            _message: &str,
            actions: &[&str],
        ) {
            self.record(UiCall::RequestAction {
                title: title.to_string(),
                actions: actions.iter().map(|a| a.to_string()).collect(),
            });
        }

        fn close_requests(&self, connection: ConnectionId) {
            self.record(UiCall::CloseRequests(connection));
        }
    }

    /// Credential store backed by a fixed list.
    #[derive(Debug, Default, Clone)]
    pub struct StaticCredentials(pub Vec<(String, String)>);

    impl CredentialManager for StaticCredentials {
        fn read_password(&self, account: &str) -> Option<String> {
            self.0
                .iter()
                .find(|(name, _)| name == account)
                .map(|(_, password)| password.clone())
        }
    }
}

pub mod transport {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use purple_core::transport::{Transport, TransportConfig, TransportError};

    #[derive(Debug, Default)]
    struct Wire {
        sent: Vec<Vec<u8>>,
        tls: bool,
        closed: bool,
    }

    /// Handle for inspecting what a [`ScriptedTransport`] was asked to do.
    #[derive(Debug, Default, Clone)]
    pub struct WireLog(Arc<Mutex<Wire>>);

    impl WireLog {
        pub fn sent(&self) -> Vec<String> {
            self.0
                .lock()
                .map(|w| {
                    w.sent
                        .iter()
                        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                        .collect()
                })
                .unwrap_or_default()
        }

        pub fn tls_started(&self) -> bool {
            self.0.lock().is_ok_and(|w| w.tls)
        }

        pub fn closed(&self) -> bool {
            self.0.lock().is_ok_and(|w| w.closed)
        }
    }

    /// Plays back canned frames, then reports the peer closing the stream.
    #[derive(Debug, Default)]
    pub struct ScriptedTransport {
        incoming: VecDeque<Vec<u8>>,
        log: WireLog,
    }

    impl ScriptedTransport {
        pub fn new<I, S>(frames: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                incoming: frames.into_iter().map(|f| f.into().into_bytes()).collect(),
                log: WireLog::default(),
            }
        }

        pub fn log(&self) -> WireLog {
            self.log.clone()
        }
    }

    impl Transport for ScriptedTransport {
        async fn connect(_config: &TransportConfig) -> Result<Self, TransportError> {
            Ok(Self::default())
        }

        async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
            let mut wire = self.log.0.lock().map_err(|_| TransportError::Closed)?;
            if wire.closed {
                return Err(TransportError::Closed);
            }
            wire.sent.push(data.to_vec());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
            tokio::task::yield_now().await;
            self.incoming.pop_front().ok_or(TransportError::Closed)
        }

        async fn start_tls(&mut self) -> Result<(), TransportError> {
            if let Ok(mut wire) = self.log.0.lock() {
                wire.tls = true;
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            if let Ok(mut wire) = self.log.0.lock() {
                wire.closed = true;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use purple_core::transport::Transport;

    use super::fixtures;
    use super::transport::ScriptedTransport;

    #[test]
    fn fixture_root_exists() {
        assert!(fixtures::root().is_dir());
    }

    #[test]
    fn loads_stanza_fixture() {
        let stanza = fixtures::stanza("presence-kicked.xml");
        assert!(stanza.contains("<presence"));
    }

    #[test]
    fn loads_config_fixture() {
        let config = fixtures::config("minimal-config.toml");
        let toml: toml::Value =
            toml::from_str(&config).expect("minimal-config.toml should be valid toml");
        assert!(toml.is_table());
    }

    #[tokio::test]
    async fn scripted_transport_plays_back_then_closes() {
        let mut transport = ScriptedTransport::new(["<a/>"]);
        let log = transport.log();
        assert_eq!(transport.recv().await.unwrap(), b"<a/>".to_vec());
        assert!(transport.recv().await.is_err());

        transport.send(b"<b/>").await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(log.sent(), vec!["<b/>".to_string()]);
        assert!(log.closed());
        assert!(transport.send(b"<c/>").await.is_err());
    }
}
