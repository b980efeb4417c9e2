//! HTTP surface: subscriber WebSocket and health introspection.
//!
//! - `GET /ws`: subscriber stream of `connection_status`, `ai_detection` and
//!   `ping` messages. Client text is echoed back.
//! - `GET /health`: running flag, subscriber count, queue and relay counters.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::app::AppContext;
use crate::broadcast::{ServerMessage, SubscriberSink};
use crate::error::{Error, Result};
use crate::pipeline::QueueStats;
use crate::relay::RelayStats;

/// Subscriber transport over the write half of an axum WebSocket
pub struct WsSink {
    tx: SplitSink<WebSocket, Message>,
}

impl WsSink {
    pub fn new(tx: SplitSink<WebSocket, Message>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl SubscriberSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.tx
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| Error::Transmit(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx
            .close()
            .await
            .map_err(|e| Error::Transmit(e.to_string()))
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub running: bool,
    pub subscribers: usize,
    pub queue: QueueStats,
    pub relay: RelayStats,
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(ctx)
}

/// Bind `server.bind_addr` and serve until the context shuts down.
pub async fn serve(ctx: Arc<AppContext>) -> Result<()> {
    let addr = ctx.config().server.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Initialization(format!("failed to bind {addr}: {e}")))?;
    serve_on(listener, ctx).await
}

/// Serve on an already bound listener until the context shuts down.
pub async fn serve_on(listener: TcpListener, ctx: Arc<AppContext>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Subscriber server listening on http://{}", addr);
    }

    let shutdown = ctx.shutdown_token();
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Initialization(format!("server error: {e}")))?;

    info!("Subscriber server stopped");
    Ok(())
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<HealthReport> {
    Json(HealthReport {
        running: ctx.is_running(),
        subscribers: ctx.subscriber_count(),
        queue: ctx.queue_stats(),
        relay: ctx.relay_stats(),
    })
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(ctx): State<Arc<AppContext>>) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, ctx))
}

/// One subscriber connection, from greeting to eviction or close.
pub async fn handle_ws(socket: WebSocket, ctx: Arc<AppContext>) {
    let (ws_tx, mut ws_rx) = socket.split();
    let broadcaster = ctx.broadcaster().clone();

    let id = match broadcaster.connect(Box::new(WsSink::new(ws_tx))).await {
        Ok(id) => id,
        Err(e) => {
            warn!("WebSocket subscriber rejected: {}", e);
            return;
        }
    };
    // Evicted before we got here
    let Some(closed) = broadcaster.subscriber(&id).map(|s| s.closed()) else {
        return;
    };
    let shutdown = ctx.shutdown_token();

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                debug!("Subscriber {} evicted", id);
                break;
            }
            _ = shutdown.cancelled() => break,
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let echo = ServerMessage::echo(text.as_str());
                        if broadcaster.send_to(id, &echo).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Subscriber {} read error: {}", id, e);
                        break;
                    }
                    // Pings are answered by the websocket layer
                    _ => {}
                }
            }
        }
    }

    broadcaster.disconnect(id).await;
}
