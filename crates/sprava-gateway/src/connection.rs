use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use crate::Gateway;
use crate::session::SessionDispatcher;

/// Close code sent when the connect token does not resolve to a user.
pub const AUTH_FAILED_CLOSE_CODE: u16 = 4008;

/// Drive one WebSocket from handshake to close.
///
/// The token is resolved first; an unknown token gets a 4008 close frame and
/// never reaches the registry. Otherwise a writer task drains the session's
/// outbound queue into the socket while this task reads frames and hands
/// them to the dispatcher one at a time.
pub async fn handle_connection(mut socket: WebSocket, gateway: Gateway, token: String) {
    let Some(user_id) = gateway.authenticate(&token).await else {
        warn!("WebSocket token rejected, closing");
        let close = Message::Close(Some(CloseFrame {
            code: AUTH_FAILED_CLOSE_CODE,
            reason: "authentication failed".into(),
        }));
        let _ = socket.send(close).await;
        return;
    };

    let (mut sender, mut receiver) = socket.split();
    let (session, mut outbound) = SessionDispatcher::open(gateway, user_id).await;
    info!("User {} connected to gateway", user_id);

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode outbound event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => {
                debug!("Writer for user {} stopped", user_id);
                break;
            }
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("Read error for user {}: {}", user_id, e);
                    break;
                }
                // Ping/Pong are answered by the transport; binary frames are not part of the protocol.
                Some(Ok(_)) => {}
            },
        }
    }

    send_task.abort();
    session.close().await;
    info!("User {} disconnected from gateway", user_id);
}
