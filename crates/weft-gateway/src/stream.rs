use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};

/// `GET /ws/{channel}`: stream events of `run:<id>` or `team:<uuid>`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(channel): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, channel, state))
}

async fn handle_socket(socket: WebSocket, channel: String, state: Arc<AppState>) {
    let mut subscription = state.events.subscribe(channel.clone()).await;
    let subscriber = subscription.id;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    info!(channel = %channel, subscriber = %subscriber, "Event stream opened");

    let welcome = serde_json::json!({
        "type": "subscribed",
        "channel": channel,
        "subscriber_id": subscriber,
    });
    if ws_sender
        .send(Message::Text(welcome.to_string().into()))
        .await
        .is_err()
    {
        state.events.unsubscribe(&channel, subscriber).await;
        return;
    }

    let send_task = tokio::spawn(async move {
        while let Some(event) = subscription.rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "Cannot serialize event");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Clients only listen; drain until they close.
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.events.unsubscribe(&channel, subscriber).await;
    info!(channel = %channel, subscriber = %subscriber, "Event stream closed");
}
