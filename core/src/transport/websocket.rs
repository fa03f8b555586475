//! WebSocket accept loop, outbound dial, and the per-connection task

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::{ConnectionHandle, FrameHandler, Outbound, TransportError};

/// Strip a `ws://` / `wss://` scheme and trailing slash so one node has one address key.
pub fn normalize_address(address: &str) -> String {
    address
        .trim()
        .trim_start_matches("ws://")
        .trim_start_matches("wss://")
        .trim_end_matches('/')
        .to_string()
}

pub(crate) fn dial_url(address: &str) -> String {
    if address.starts_with("ws://") || address.starts_with("wss://") {
        address.to_string()
    } else {
        format!("ws://{}", address)
    }
}

/// Socket limits for one link; tungstenite refuses to buffer anything larger.
fn socket_config(max_frame_bytes: usize) -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(max_frame_bytes),
        max_frame_size: Some(max_frame_bytes),
        ..Default::default()
    }
}

/// Accept inbound client and peer connections forever.
pub async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn FrameHandler>,
    max_frame_bytes: usize,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // e.g. fd exhaustion; back off instead of spinning
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let config = socket_config(max_frame_bytes);
            match tokio_tungstenite::accept_async_with_config(stream, Some(config)).await {
                Ok(ws) => {
                    let (handle, outbound) = ConnectionHandle::new(remote.to_string());
                    debug!(conn = %handle.id(), %remote, "Accepted connection");
                    drive_connection(ws, handle, outbound, handler).await;
                }
                Err(e) => debug!(%remote, "WebSocket handshake failed: {}", e),
            }
        });
    }
}

/// Open an outbound link and start its connection task.
pub async fn dial(
    address: &str,
    handler: Arc<dyn FrameHandler>,
    max_frame_bytes: usize,
) -> Result<ConnectionHandle, TransportError> {
    let config = socket_config(max_frame_bytes);
    let (ws, _response) =
        tokio_tungstenite::connect_async_with_config(dial_url(address), Some(config), false)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let (handle, outbound) = ConnectionHandle::new(normalize_address(address));
    info!(conn = %handle.id(), address, "Dialed");

    tokio::spawn(drive_connection(ws, handle.clone(), outbound, handler));
    Ok(handle)
}

/// Pump one connection: inbound text frames go to `handler`, queued
/// [`Outbound`] frames go to the socket. Returns after the socket closes.
///
/// The frame size limit lives in the socket's [`WebSocketConfig`]; a peer
/// that exceeds it gets its link closed.
pub async fn drive_connection<S>(
    ws: WebSocketStream<S>,
    handle: ConnectionHandle,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    handler: Arc<dyn FrameHandler>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => handler.on_frame(&handle, &text),
                    Some(Ok(Message::Binary(bytes))) => {
                        match String::from_utf8(bytes) {
                            Ok(text) => handler.on_frame(&handle, &text),
                            Err(_) => debug!(conn = %handle.id(), "Dropping non-UTF-8 binary frame"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(conn = %handle.id(), "Remote closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(WsError::Capacity(e))) => {
                        warn!(conn = %handle.id(), "Closing link after oversized frame: {}", e);
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(conn = %handle.id(), "Read error: {}", e);
                        break;
                    }
                }
            }
            queued = outbound.recv() => {
                match queued {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = write.send(Message::Text(frame)).await {
                            debug!(conn = %handle.id(), "Write error: {}", e);
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    // Drop the receiver first so senders observe the close immediately
    drop(outbound);
    handler.on_close(&handle);
}
