//! Async driver tying a [`Transport`] to a connection's [`JabberSession`].
//!
//! The session itself never does I/O. This loop moves frames between the
//! transport and the session, fires keepalives, debounces caps persistence,
//! times out caps queries and runs the manager's deferred work after every
//! wake-up. Frames queued from elsewhere, such as a caps query handed over by
//! another account, wake the loop too.

use std::sync::{Arc, Mutex};

use purple_core::transport::{Transport, TransportError};
use purple_core::{ConnectionId, ConnectionManager, ErrorKind, PurpleError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::caps::CapsCache;
use crate::session::{JabberSession, lock_caps};
use crate::stream::Frame;

enum Wake {
    Received(Result<Vec<u8>, TransportError>),
    Queued(Option<Frame>),
    Keepalive,
    SaveCaps,
    ExpireCaps,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Put one frame on the wire. Returns false for the stream close.
async fn write<T: Transport>(transport: &mut T, frame: Frame) -> Result<bool, TransportError> {
    match frame {
        Frame::StartTls => transport.start_tls().await?,
        Frame::Close => {
            transport.send(b"</stream:stream>").await?;
            return Ok(false);
        }
        other => match other.to_bytes() {
            Ok(Some(bytes)) => transport.send(&bytes).await?,
            Ok(None) => {}
            Err(error) => warn!(%error, "dropping frame that does not serialize"),
        },
    }
    Ok(true)
}

/// Write queued frames. Returns false once the stream has been closed.
async fn flush<T: Transport>(
    transport: &mut T,
    frames: &mut mpsc::UnboundedReceiver<Frame>,
) -> Result<bool, TransportError> {
    while let Ok(frame) = frames.try_recv() {
        if !write(transport, frame).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Drive connection `id` until it is torn down.
///
/// Transport failures are reported to the manager, which disconnects on the
/// next deferred pass; the loop ends once the connection is gone.
pub async fn run<T: Transport>(
    manager: &mut ConnectionManager,
    id: ConnectionId,
    mut transport: T,
    caps: Arc<Mutex<CapsCache>>,
) -> purple_core::Result<()> {
    let mut frames = manager
        .with_session::<JabberSession, _>(id, |session, _| session.take_frames())?
        .flatten()
        .ok_or_else(|| PurpleError::Protocol("connection has no XMPP session to drive".into()))?;

    let mut pending: Option<Frame> = None;
    loop {
        let written = match pending.take() {
            Some(frame) => write(&mut transport, frame).await,
            None => Ok(true),
        };
        let flushed = match written {
            Ok(true) => flush(&mut transport, &mut frames).await,
            other => other,
        };
        let open = match flushed {
            Ok(open) => open,
            Err(error) => {
                report(manager, id, &error);
                true
            }
        };
        manager.run_deferred();
        if !open || manager.connection(id).is_none() {
            break;
        }

        let keepalive = manager.keepalive_deadline(id);
        let (save, expire) = {
            let cache = lock_caps(&caps);
            (cache.save_deadline(), cache.query_deadline())
        };
        let wake = tokio::select! {
            received = transport.recv() => Wake::Received(received),
            frame = frames.recv() => Wake::Queued(frame),
            _ = sleep_until(keepalive) => Wake::Keepalive,
            _ = sleep_until(save) => Wake::SaveCaps,
            _ = sleep_until(expire) => Wake::ExpireCaps,
        };

        match wake {
            Wake::Received(Ok(raw)) => {
                manager.with_session::<JabberSession, _>(id, |session, ctx| {
                    session.handle_frame(ctx, &raw);
                })?;
            }
            Wake::Received(Err(error)) => report(manager, id, &error),
            Wake::Queued(frame) => pending = frame,
            Wake::Keepalive => {
                manager.poll_keepalives(Instant::now());
            }
            Wake::SaveCaps => {
                if let Err(error) = lock_caps(&caps).poll_save(Instant::now()) {
                    warn!(%error, "saving caps cache failed");
                }
            }
            Wake::ExpireCaps => {
                let expired = lock_caps(&caps).expire_queries(Instant::now());
                debug!(expired, "caps queries timed out");
            }
        }
    }

    // Frames queued by the close hook after the last flush.
    if let Some(frame) = pending.take()
        && let Err(error) = write(&mut transport, frame).await
    {
        debug!(%error, "could not write queued frame");
    }
    if let Err(error) = flush(&mut transport, &mut frames).await {
        debug!(%error, "could not send stream close");
    }
    if let Err(error) = transport.close().await {
        debug!(%error, "transport close failed");
    }
    info!(connection = %id, "XMPP driver stopped");
    Ok(())
}

fn report(manager: &mut ConnectionManager, id: ConnectionId, error: &TransportError) {
    if let Err(stale) = manager.report_error(id, ErrorKind::from(error), error.to_string()) {
        debug!(%stale, "transport error for a connection already gone");
    }
}
