//! Live view over WebSocket

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::AppState;

/// Upgrade to a WebSocket that receives every flushed line as text
pub async fn live_stream(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let lines = state.service.subscribe();
    ws.on_upgrade(move |socket| forward_lines(socket, lines))
}

async fn forward_lines(mut socket: WebSocket, mut lines: broadcast::Receiver<String>) {
    debug!("Live viewer connected");
    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Ok(line) => {
                    if socket.send(Message::Text(line)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Live viewer fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Live viewer disconnected");
}
