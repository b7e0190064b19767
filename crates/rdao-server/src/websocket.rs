//! WebSocket gateway.
//!
//! Each upgraded socket becomes one [`Link`] handed to the server. Text
//! frames carry protocol messages; binary frames are accepted when they hold
//! UTF-8.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use rdao_core::Link;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::server::ReactiveServer;

/// Router serving the gateway at the configured path plus `/health`.
pub fn ws_router(server: Arc<ReactiveServer>) -> Router {
    let path = server.settings().path.clone();
    Router::new()
        .route(&path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(server)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Running listener started by [`serve`].
pub struct ServerHandle {
    /// Bound address; the port is resolved when settings asked for port 0.
    pub local_addr: SocketAddr,
    path: String,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// `ws://` URL of the gateway.
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.local_addr, self.path)
    }

    /// Token that stops the listener when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close every session and wait for the listener to exit.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(error) = self.task.await {
            warn!(%error, "server task failed");
        }
    }
}

/// Bind `server.settings()` host and port and serve [`ws_router`].
pub async fn serve(server: Arc<ReactiveServer>) -> io::Result<ServerHandle> {
    let settings = server.settings().clone();
    let listener = TcpListener::bind((settings.host.as_str(), settings.port)).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, path = %settings.path, "reactive-dao server listening");

    let router = ws_router(server.clone());
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let task = tokio::spawn(async move {
        let stopping = async move {
            signal.cancelled().await;
            server.close_all();
        };
        if let Err(error) = axum::serve(listener, router).with_graceful_shutdown(stopping).await {
            warn!(%error, "server stopped with error");
        }
        info!("reactive-dao server stopped");
    });

    Ok(ServerHandle {
        local_addr,
        path: settings.path,
        shutdown,
        task,
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<Arc<ReactiveServer>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| bridge(socket, server))
}

async fn health_handler(State(server): State<Arc<ReactiveServer>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "sessions": server.session_count(),
    }))
}

/// Shuttle frames between the socket and a fresh session until either side
/// closes.
async fn bridge(socket: WebSocket, server: Arc<ReactiveServer>) {
    let (ours, theirs) = Link::pair();
    let session = server.handle_link(theirs);
    let session_id = *session.id();
    debug!(%session_id, "websocket accepted");

    let Link {
        sender: inbound,
        receiver: mut outbound,
    } = ours;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer = async move {
        while let Some(text) = outbound.recv().await {
            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    };

    let reader = async move {
        while let Some(Ok(frame)) = ws_rx.next().await {
            let text = match frame {
                WsMessage::Text(text) => text.as_str().to_owned(),
                WsMessage::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(len = data.len(), "dropping non-UTF8 binary frame");
                        continue;
                    }
                },
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            };
            if inbound.send(text).is_err() {
                break;
            }
        }
    };

    tokio::select! {
        () = writer => {},
        () = reader => {},
    }
    session.close();
    debug!(%session_id, "websocket closed");
}
