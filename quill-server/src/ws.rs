//! WebSocket connection driver.
//!
//! One task per connection, selecting between the socket and the session's
//! outbound queue. Control events travel as JSON text frames, sync payloads
//! as binary frames (see `quill_collab::protocol`). Unauthenticated
//! connections are dropped after a bounded window.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use quill_collab::{ClientCommand, Outbound, ServerEvent, SyncEngine};

pub struct ServerCtx {
    pub engine: Arc<SyncEngine>,
    pub auth_timeout: Duration,
}

/// Accept loop. Runs until the listener fails.
pub async fn run(
    listener: TcpListener,
    ctx: Arc<ServerCtx>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        let (stream, addr) = listener.accept().await?;
        log::debug!("new TCP connection from {addr}");
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, ctx).await {
                log::warn!("connection error from {addr}: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ServerCtx>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut socket) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    let (tx, mut outbound) = mpsc::unbounded_channel::<Outbound>();
    let mut session = ctx.engine.open_session(Arc::new(tx));
    let auth_deadline = tokio::time::Instant::now() + ctx.auth_timeout;

    loop {
        tokio::select! {
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientCommand>(text.as_str()) {
                            Ok(cmd) => ctx.engine.handle_command(&mut session, cmd).await,
                            Err(e) => {
                                log::warn!("conn {}: bad command from {addr}: {e}", session.conn_id());
                                session.send(ServerEvent::Error {
                                    message: "malformed command".into(),
                                });
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        // State-machine violations (unauthenticated or
                        // unjoined senders) drop the connection.
                        if ctx.engine.handle_frame(&mut session, &bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        sink.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            out = outbound.recv() => {
                match out {
                    Some(Outbound::Event(event)) => {
                        let json = serde_json::to_string(&event)?;
                        sink.send(Message::Text(json.into())).await?;
                    }
                    Some(Outbound::Frame(bytes)) => {
                        sink.send(Message::Binary(bytes.as_ref().clone().into())).await?;
                    }
                    None => break,
                }
            }

            _ = tokio::time::sleep_until(auth_deadline), if !session.is_authenticated() => {
                log::warn!("conn {}: authentication timeout from {addr}", session.conn_id());
                let event = ServerEvent::Error {
                    message: "authentication timed out".into(),
                };
                let _ = sink.send(Message::Text(serde_json::to_string(&event)?.into())).await;
                break;
            }
        }
    }

    // Pending sends die with the queue; applied CRDT changes are retained.
    ctx.engine.disconnect(&mut session).await;
    Ok(())
}
