//! Async driver for a [`GgSession`]: forwards packets to the codec, runs
//! avatar and OAuth requests, and feeds server events and request results
//! back into the session.

use purple_core::config::GgConfig;
use purple_core::{ConnectionId, ConnectionManager, ErrorKind, PurpleError};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::avatar::{AvatarApi, FetchedAvatar, Liveness};
use crate::error::{GgError, Result};
use crate::oauth::{self, OAuthEndpoints};
use crate::packet::{ClientPacket, ServerEvent};
use crate::session::{Completion, GgSession, Task};

/// HTTP endpoints used next to the GG server link.
#[derive(Debug, Clone)]
pub struct GgHttp {
    pub client: Client,
    pub avatars: AvatarApi,
    pub oauth: OAuthEndpoints,
}

impl GgHttp {
    pub fn new(config: &GgConfig) -> Result<Self> {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: &GgConfig) -> Result<Self> {
        Ok(Self {
            avatars: AvatarApi::new(client.clone(), &config.api_base, &config.avatar_base)?,
            oauth: OAuthEndpoints::from_api_base(&config.api_base)?,
            client,
        })
    }
}

/// Check one buddy's avatar in the background. The result is delivered only
/// if the session is still alive when the request finishes.
pub fn spawn_avatar_fetch(
    api: AvatarApi,
    uin: u32,
    known: Option<i64>,
    live: Liveness,
    done: mpsc::UnboundedSender<Completion>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = api.fetch(uin, known).await;
        if !live.is_alive() {
            debug!(uin, "session gone, avatar result dropped");
            return;
        }
        let _ = done.send(Completion::Avatar(FetchedAvatar { uin, result }));
    })
}

fn spawn_upload(
    http: GgHttp,
    task: Task,
    live: Liveness,
    done: mpsc::UnboundedSender<Completion>,
) -> Option<JoinHandle<()>> {
    let Task::UploadAvatar {
        uin,
        password,
        token,
        image,
    } = task
    else {
        return None;
    };
    Some(tokio::spawn(async move {
        let (token, result) = match token {
            Some(token) => (Some(token), Ok(())),
            None => match oauth::request_access_token(&http.client, &http.oauth, uin, password.expose()).await {
                Ok(token) => (Some(token), Ok(())),
                Err(error) => (None, Err(error)),
            },
        };
        let result = match (&token, result) {
            (Some(token), Ok(())) => {
                http.avatars
                    .upload(uin, password.expose(), token, &image)
                    .await
            }
            (_, result) => result,
        };
        if live.is_alive() {
            let _ = done.send(Completion::Upload { token, result });
        }
    }))
}

enum Wake {
    Event(Option<ServerEvent>),
    Done(Option<Completion>),
    Keepalive,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Run queued tasks. Returns false once the session asked to stop.
fn dispatch(
    tasks: &mut mpsc::UnboundedReceiver<Task>,
    http: &GgHttp,
    outbound: &mpsc::UnboundedSender<ClientPacket>,
    live: &Liveness,
    done: &mpsc::UnboundedSender<Completion>,
) -> std::result::Result<bool, GgError> {
    while let Ok(task) = tasks.try_recv() {
        match task {
            Task::Send(packet) => {
                if outbound.send(packet).is_err() {
                    return Err(GgError::Cancelled);
                }
            }
            Task::FetchAvatar { uin, known } => {
                spawn_avatar_fetch(http.avatars.clone(), uin, known, live.clone(), done.clone());
            }
            upload @ Task::UploadAvatar { .. } => {
                spawn_upload(http.clone(), upload, live.clone(), done.clone());
            }
            Task::Close => return Ok(false),
        }
    }
    Ok(true)
}

/// Drive connection `id` until it is torn down. `events` carries decoded
/// server events, `outbound` takes packets for the codec to write.
pub async fn run(
    manager: &mut ConnectionManager,
    id: ConnectionId,
    http: GgHttp,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    outbound: mpsc::UnboundedSender<ClientPacket>,
) -> purple_core::Result<()> {
    let (mut tasks, live) = manager
        .with_session::<GgSession, _>(id, |session, _| {
            session.take_tasks().map(|tasks| (tasks, session.liveness()))
        })?
        .flatten()
        .ok_or_else(|| PurpleError::Protocol("connection has no GG session to drive".into()))?;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut server_open = true;

    loop {
        let open = match dispatch(&mut tasks, &http, &outbound, &live, &done_tx) {
            Ok(open) => open,
            Err(_) => {
                report(manager, id, ErrorKind::NetworkError, "Connection to the server lost");
                true
            }
        };
        manager.run_deferred();
        if !open || manager.connection(id).is_none() {
            break;
        }

        let keepalive = manager.keepalive_deadline(id);
        let wake = tokio::select! {
            event = events.recv(), if server_open => Wake::Event(event),
            done = done_rx.recv() => Wake::Done(done),
            _ = sleep_until(keepalive) => Wake::Keepalive,
        };

        match wake {
            Wake::Event(Some(event)) => {
                manager.with_session::<GgSession, _>(id, |session, ctx| {
                    session.handle_event(ctx, event);
                })?;
            }
            Wake::Event(None) => {
                server_open = false;
                report(manager, id, ErrorKind::NetworkError, "Server closed the connection");
            }
            Wake::Done(Some(completion)) => {
                manager.with_session::<GgSession, _>(id, |session, ctx| {
                    session.complete(ctx, completion);
                })?;
            }
            Wake::Done(None) => {}
            Wake::Keepalive => {
                manager.poll_keepalives(Instant::now());
            }
        }
    }

    // Logoff queued by the close hook.
    if let Err(error) = dispatch(&mut tasks, &http, &outbound, &live, &done_tx) {
        debug!(%error, "could not send logoff");
    }
    info!(connection = %id, "GG driver stopped");
    Ok(())
}

fn report(manager: &mut ConnectionManager, id: ConnectionId, kind: ErrorKind, description: &str) {
    if let Err(stale) = manager.report_error(id, kind, description) {
        debug!(%stale, "error for a connection already gone");
    }
}
