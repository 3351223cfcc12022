//! WebSocket ingest endpoint.
//!
//! Each upgraded socket becomes one connection attempt at the session gate.
//! Binary messages are the stream; everything else ends the connection.

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    response::IntoResponse,
    routing::get,
};
use push_relay::{ConnectionId, RelayError};

use crate::api::AppState;

pub fn stream_router() -> Router<AppState> {
    Router::new().route("/stream", get(stream_upgrade))
}

async fn stream_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.stream.max_message_size)
        .on_upgrade(move |socket| handle_stream(socket, state))
}

/// Why the receive loop ended.
enum StreamEnd {
    /// Close frame from the client or the socket went away.
    Closed(String),
    IdleTimeout,
    TextMessage,
    Shutdown,
    Transport(axum::Error),
    /// The gate already terminated the session.
    Terminated(RelayError),
}

async fn handle_stream(mut socket: WebSocket, state: AppState) {
    let id = ConnectionId::next();
    log::info!("Stream: connection {} established", id);

    if let Err(e) = state.gate.on_open(id).await {
        if e.is_admission_conflict() {
            close_with(&mut socket, close_code::POLICY, "Only one client is allowed").await;
        } else {
            close_with(&mut socket, close_code::ERROR, "Encoder unavailable").await;
        }
        return;
    }

    match receive_loop(&mut socket, id, &state).await {
        StreamEnd::Closed(reason) => {
            state.gate.on_close(id, reason).await;
        }
        StreamEnd::IdleTimeout => {
            log::warn!("Stream: {} idle, closing", id);
            close_with(&mut socket, close_code::NORMAL, "Idle timeout").await;
            state.gate.on_close(id, "idle timeout").await;
        }
        StreamEnd::TextMessage => {
            close_with(
                &mut socket,
                close_code::UNSUPPORTED,
                "Text messages not supported",
            )
            .await;
            state.gate.on_close(id, "text message").await;
        }
        StreamEnd::Shutdown => {
            close_with(&mut socket, close_code::AWAY, "Server shutting down").await;
            state.gate.on_close(id, "server shutdown").await;
        }
        StreamEnd::Transport(e) => {
            state.gate.on_transport_error(id, &e).await;
            close_with(&mut socket, close_code::ERROR, "Transport error").await;
        }
        StreamEnd::Terminated(e) => {
            log::error!("Stream: {} terminated: {}", id, e);
            close_with(&mut socket, close_code::ERROR, "Encoder failure").await;
        }
    }
    log::info!("Stream: connection {} finished", id);
}

async fn receive_loop(socket: &mut WebSocket, id: ConnectionId, state: &AppState) -> StreamEnd {
    loop {
        let next = tokio::select! {
            _ = state.cancel.cancelled() => return StreamEnd::Shutdown,
            next = recv_within(socket, state.stream.idle_timeout) => next,
        };
        let Some(next) = next else {
            return StreamEnd::IdleTimeout;
        };

        match next {
            Some(Ok(Message::Binary(chunk))) => {
                if let Err(e) = state.gate.on_data(id, chunk).await {
                    return StreamEnd::Terminated(e);
                }
            }
            Some(Ok(Message::Text(_))) => return StreamEnd::TextMessage,
            Some(Ok(Message::Close(frame))) => {
                let reason = match frame {
                    Some(frame) => format!("client closed with {} {}", frame.code, frame.reason.as_str()),
                    None => "client closed".to_string(),
                };
                return StreamEnd::Closed(reason);
            }
            // pings are answered by axum
            Some(Ok(_)) => {}
            Some(Err(e)) => return StreamEnd::Transport(e),
            None => return StreamEnd::Closed("connection dropped".to_string()),
        }
    }
}

/// `None` when the idle timeout expired first.
async fn recv_within(
    socket: &mut WebSocket,
    idle_timeout: Option<std::time::Duration>,
) -> Option<Option<Result<Message, axum::Error>>> {
    match idle_timeout {
        Some(idle) => tokio::time::timeout(idle, socket.recv()).await.ok(),
        None => Some(socket.recv().await),
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        log::debug!("Stream: close frame not delivered: {}", e);
    }
}

#[cfg(test)]
#[path = "stream_test.rs"]
mod stream_test;
