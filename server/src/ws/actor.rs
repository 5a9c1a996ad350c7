use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

use crate::state::AppState;
use crate::ws::connection::Connection;
use crate::ws::handshake::{self, HandshakeError};
use crate::ws::registry::ConnectionHandle;

/// Close code sent when the first message is not a valid registration
/// or does not arrive in time.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Close code sent when the peer stops answering pings, or on shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// How long a queued close frame gets to reach the peer before the socket is dropped.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Run the actor-per-connection pattern for an accepted WebSocket.
///
/// - Writer task: owns the sink, forwards frames from the bounded queue
/// - Handshake: waits for exactly one registration message
/// - Reader loop: logs inbound traffic until close, error, keepalive failure or shutdown
///
/// Cleanup on exit only removes the registry entry if it still belongs to
/// this connection. Pings from the peer are answered by the WebSocket layer.
pub async fn run_connection(socket: WebSocket, state: AppState) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (handle, rx) = state.registry.open_channel(state.ws.outbound_queue_capacity);
    let mut connection = Connection::new(state.registry.clone(), handle.clone());

    tracing::info!(
        connection_id = %connection.id(),
        "Client connected, awaiting registration"
    );

    let mut writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    let handshake_timeout = state.ws.handshake_timeout();
    let registration = tokio::select! {
        result = timeout(handshake_timeout, await_registration(&mut ws_receiver)) => {
            result.unwrap_or(Err(HandshakeError::Timeout(handshake_timeout)))
        }
        _ = state.shutdown.cancelled() => {
            tracing::info!(
                connection_id = %connection.id(),
                "Server shutting down before registration"
            );
            connection.close();
            close_and_flush(handle, writer_handle, CLOSE_GOING_AWAY, "server shutting down").await;
            return;
        }
    };

    let user_id = match registration {
        Ok(user_id) => user_id,
        Err(err) if err.is_protocol_violation() => {
            tracing::warn!(
                connection_id = %connection.id(),
                error = %err,
                "Invalid registration, closing connection"
            );
            connection.reject();
            drop(connection);
            close_and_flush(handle, writer_handle, CLOSE_POLICY_VIOLATION, "invalid registration")
                .await;
            return;
        }
        Err(err) => {
            tracing::info!(
                connection_id = %connection.id(),
                error = %err,
                "Connection ended during handshake"
            );
            connection.close();
            writer_handle.abort();
            return;
        }
    };

    if let Err(err) = connection.register(user_id.clone()) {
        // The handshake runs once per actor, so this is unreachable in practice.
        tracing::error!(error = %err, "Registration transition refused");
        connection.close();
        writer_handle.abort();
        return;
    }

    let (pong_tx, pong_rx) = watch::channel(());
    let mut keepalive_handle = tokio::spawn(keepalive_task(
        handle.clone(),
        pong_rx,
        state.ws.ping_interval(),
        state.ws.pong_timeout(),
    ));

    let mut shutting_down = false;
    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(msg)) => match msg {
                    Message::Text(text) => {
                        tracing::debug!(
                            user_id = %user_id,
                            "Received message: {}",
                            text.chars().take(100).collect::<String>()
                        );
                    }
                    Message::Binary(data) => {
                        tracing::debug!(
                            user_id = %user_id,
                            bytes = data.len(),
                            "Received binary message"
                        );
                    }
                    Message::Pong(_) => {
                        pong_tx.send_replace(());
                    }
                    Message::Ping(_) => {}
                    Message::Close(frame) => {
                        tracing::info!(
                            user_id = %user_id,
                            reason = ?frame,
                            "Client initiated close"
                        );
                        break;
                    }
                },
                Some(Err(e)) => {
                    tracing::warn!(
                        user_id = %user_id,
                        error = %e,
                        "WebSocket receive error"
                    );
                    break;
                }
                None => {
                    tracing::info!(user_id = %user_id, "WebSocket stream ended");
                    break;
                }
            },
            _ = &mut keepalive_handle => {
                tracing::warn!(user_id = %user_id, "Keepalive failed, closing connection");
                break;
            }
            _ = &mut writer_handle => {
                tracing::warn!(user_id = %user_id, "WebSocket send failed, closing connection");
                break;
            }
            _ = state.shutdown.cancelled() => {
                tracing::info!(user_id = %user_id, "Server shutting down, closing connection");
                shutting_down = true;
                break;
            }
        }
    }

    connection.close();
    keepalive_handle.abort();
    if shutting_down {
        close_and_flush(handle, writer_handle, CLOSE_GOING_AWAY, "server shutting down").await;
    } else {
        writer_handle.abort();
    }
}

/// Queue a close frame, give the writer a moment to send it, then drop the socket.
async fn close_and_flush(
    handle: ConnectionHandle,
    mut writer_handle: JoinHandle<()>,
    code: u16,
    reason: &'static str,
) {
    let _ = handle.try_send(Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    })));
    drop(handle);
    if timeout(CLOSE_FLUSH_TIMEOUT, &mut writer_handle).await.is_err() {
        writer_handle.abort();
    }
}

/// Wait for the first data frame and decode it as a registration.
/// Control frames received meanwhile are not the first message.
async fn await_registration(
    ws_receiver: &mut SplitStream<WebSocket>,
) -> Result<String, HandshakeError> {
    loop {
        let msg = match ws_receiver.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Err(HandshakeError::Transport(e)),
            None => return Err(HandshakeError::Disconnected),
        };

        if let Some(result) = handshake::registration_from_frame(&msg) {
            return result;
        }
    }
}

/// Writer task: receives frames from the queue and forwards them to the sink.
/// Stops after forwarding a close frame or when the sink fails.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() {
            break;
        }
        if is_close {
            break;
        }
    }
}

/// Periodic ping with pong deadline. Returns when the peer misses a pong
/// or the connection's queue is gone.
///
/// Only a pong seen after the current ping counts: anything the peer sent
/// earlier is marked seen before the ping goes out.
async fn keepalive_task(
    handle: ConnectionHandle,
    mut pong_rx: watch::Receiver<()>,
    ping_interval: Duration,
    pong_timeout: Duration,
) {
    let mut ping_timer = interval(ping_interval);
    // Skip the first immediate tick
    ping_timer.tick().await;

    loop {
        ping_timer.tick().await;

        if !handle.is_open() {
            return;
        }
        let _ = pong_rx.borrow_and_update();
        // A full queue means the peer is not draining; the pong deadline below covers it.
        let _ = handle.try_send(Message::Ping(vec![1, 2, 3, 4].into()));

        match timeout(pong_timeout, pong_rx.changed()).await {
            Ok(Ok(())) => {}
            _ => {
                let _ = handle.try_send(Message::Close(Some(CloseFrame {
                    code: CLOSE_GOING_AWAY,
                    reason: "Pong timeout".into(),
                })));
                return;
            }
        }
    }
}
