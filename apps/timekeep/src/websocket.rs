use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::auth::token_from_headers;
use crate::registry::{ClientChannel, Outbound};
use crate::state::AppState;
use crate::storage::User;

const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// Upgrade an authenticated request to the timer sync websocket.
///
/// The session token comes from the `sessionId` cookie, or from `?token=` for
/// clients that cannot set cookies. Anonymous callers never get a socket.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = token_from_headers(&headers).or(query.token);
    match state.sessions().resolve_by_token(token.as_deref()).await {
        Ok(Some(user)) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, user))
            .into_response(),
        Ok(None) => {
            counter!("timekeep_ws_rejected_total", 1, "reason" => "unauthenticated");
            debug!("rejecting anonymous websocket upgrade");
            (
                StatusCode::UNAUTHORIZED,
                [(header::CONNECTION, "close")],
            )
                .into_response()
        }
        Err(err) => {
            counter!("timekeep_ws_rejected_total", 1, "reason" => "storage");
            warn!(error = %err, "session lookup failed during upgrade");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, user: User) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (channel, mut rx) = ClientChannel::new();
    let connection_id = channel.connection_id();

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let frame = match outbound {
                Outbound::Message(message) => match serde_json::to_string(&message) {
                    Ok(text) => Message::Text(text),
                    Err(err) => {
                        warn!(kind = message.kind(), error = %err, "failed to encode message");
                        continue;
                    }
                },
                Outbound::Close(reason) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_NORMAL,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    let scope = match state.engine().connect(user.id, channel).await {
        Ok(scope) => scope,
        Err(err) => {
            warn!(
                user_id = user.id,
                connection_id = %connection_id,
                error = %err,
                "failed to load initial timers; closing connection"
            );
            writer.abort();
            return;
        }
    };
    counter!("timekeep_connections_total", 1);
    gauge!("timekeep_registered_channels", state.registry().len() as f64);
    info!(
        user_id = user.id,
        username = %user.username,
        connection_id = %connection_id,
        "websocket connection established"
    );

    loop {
        let message = tokio::select! {
            message = ws_rx.next() => message,
            // Writer is gone after a close request or a dead socket.
            _ = &mut writer => {
                debug!(connection_id = %connection_id, "writer finished; ending connection");
                break;
            }
        };
        let Some(message) = message else {
            break;
        };
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    counter!("timekeep_malformed_messages_total", 1);
                    debug!(connection_id = %connection_id, "dropping non-utf8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(
                    connection_id = %connection_id,
                    error = %err,
                    "error receiving message"
                );
                break;
            }
        };

        if let Err(err) = scope.dispatch(&text).await {
            counter!("timekeep_command_failures_total", 1);
            warn!(
                user_id = user.id,
                connection_id = %connection_id,
                error = %err,
                "command failed"
            );
        }
        if scope.channel().is_closed() {
            break;
        }
    }

    drop(scope);
    writer.abort();
    gauge!("timekeep_registered_channels", state.registry().len() as f64);
    info!(
        user_id = user.id,
        connection_id = %connection_id,
        "websocket connection closed"
    );
}
