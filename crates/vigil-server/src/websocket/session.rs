//! Per-connection reader and writer tasks.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use vigil_core::Envelope;

use super::connection::{ClientConnection, DisconnectReason};
use super::connection_log;
use super::handler::{SessionContext, handle_text};

type WsSink = SplitSink<WebSocket, Message>;

/// Writer timing.
#[derive(Clone, Copy, Debug)]
pub struct SessionTiming {
    /// Deadline for a single frame write.
    pub write_timeout: Duration,
    /// Ping and credential-check period.
    pub tick: Duration,
    /// Pause between the reauthentication notice and the close frame.
    pub reauth_grace: Duration,
}

/// Drive one upgraded socket until it closes.
///
/// Registers `conn`, runs the writer as a separate task, reads client frames
/// on this task, and unregisters on the way out.
#[instrument(skip_all, fields(conn_id = %conn.id, user_id = %conn.principal.user_id))]
pub async fn run_session(
    socket: WebSocket,
    conn: Arc<ClientConnection>,
    rx: mpsc::Receiver<Arc<String>>,
    ctx: SessionContext,
    timing: SessionTiming,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let _ = ctx.registry.register(Arc::clone(&conn));

    let writer = tokio::spawn(write_loop(ws_tx, rx, Arc::clone(&conn), ctx.clone(), timing));

    let reason = loop {
        let next = tokio::select! {
            () = conn.closed() => break None,
            next = ws_rx.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                let _ = handle_text(text.as_str(), &conn, &ctx).await;
            }
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => {
                    let _ = handle_text(text, &conn, &ctx).await;
                }
                Err(_) => debug!(len = data.len(), "ignoring non-UTF8 binary frame"),
            },
            Some(Ok(Message::Pong(_))) => conn.mark_alive(),
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(_))) | None => break Some(DisconnectReason::ClientClosed),
            Some(Err(e)) => {
                ctx.metrics.record_connection_error();
                connection_log::connection_error(&conn, &e);
                break Some(DisconnectReason::ReadError);
            }
        }
    };

    if let Some(reason) = reason {
        let _ = conn.close(reason);
    }
    let reason = conn.close_reason().unwrap_or(DisconnectReason::ClientClosed);
    let _ = ctx.registry.unregister(conn.id.clone(), reason);
    let _ = writer.await;
    debug!(reason = %reason, "session ended");
}

async fn write_loop(
    mut ws_tx: WsSink,
    mut rx: mpsc::Receiver<Arc<String>>,
    conn: Arc<ClientConnection>,
    ctx: SessionContext,
    timing: SessionTiming,
) {
    let mut tick = time::interval_at(Instant::now() + timing.tick, timing.tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = conn.closed() => {
                if let Some((code, reason)) = conn.close_reason().and_then(DisconnectReason::close_frame) {
                    let frame = Message::Close(Some(CloseFrame { code, reason: reason.into() }));
                    let _ = time::timeout(timing.write_timeout, ws_tx.send(frame)).await;
                }
                break;
            }
            next = rx.recv() => {
                let Some(text) = next else { break };
                if let Err(e) = write(&mut ws_tx, Message::Text(text.as_str().into()), timing.write_timeout).await {
                    fail_write(&conn, &ctx, &e);
                    break;
                }
            }
            _ = tick.tick() => {
                if conn.credential_expired(Utc::now()) {
                    expire(&mut ws_tx, &conn, &ctx, timing).await;
                    break;
                }
                if let Err(e) = write(&mut ws_tx, Message::Ping(Vec::new().into()), timing.write_timeout).await {
                    fail_write(&conn, &ctx, &e);
                    break;
                }
            }
        }
    }
    let _ = ws_tx.close().await;
}

async fn write(ws_tx: &mut WsSink, message: Message, deadline: Duration) -> Result<(), String> {
    match time::timeout(deadline, ws_tx.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("write timed out after {deadline:?}")),
    }
}

fn fail_write(conn: &ClientConnection, ctx: &SessionContext, error: &str) {
    ctx.metrics.record_connection_error();
    connection_log::connection_error(conn, &error);
    if conn.close(DisconnectReason::WriteError) {
        let _ = ctx.registry.unregister(conn.id.clone(), DisconnectReason::WriteError);
    }
}

/// Credential expired: notify, wait the grace period, close with 1008.
async fn expire(ws_tx: &mut WsSink, conn: &ClientConnection, ctx: &SessionContext, timing: SessionTiming) {
    info!(expires_at = %conn.credential_expires_at, "credential expired, closing connection");
    ctx.metrics.record_auth_error("authentication");
    connection_log::authentication_error(
        Some(&conn.principal.user_id),
        conn.remote_addr.as_deref(),
        &"token expired",
    );

    match Envelope::reauthentication_required().to_json() {
        Ok(json) => {
            if let Err(e) = write(ws_tx, Message::Text(json.into()), timing.write_timeout).await {
                warn!(error = %e, "failed to send reauthentication notice");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize reauthentication notice"),
    }
    time::sleep(timing.reauth_grace).await;

    if conn.close(DisconnectReason::TokenExpired) {
        if let Some((code, reason)) = DisconnectReason::TokenExpired.close_frame() {
            let frame = Message::Close(Some(CloseFrame { code, reason: reason.into() }));
            let _ = write(ws_tx, frame, timing.write_timeout).await;
        }
        let _ = ctx.registry.unregister(conn.id.clone(), DisconnectReason::TokenExpired);
    }
}
