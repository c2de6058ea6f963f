use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use cabot_proto::{ObserverFrame, ObserverRequest};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::state::AppState;

pub async fn observer_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_observer(socket, state))
}

async fn handle_observer(socket: WebSocket, state: AppState) {
    let (observer_id, mut frames) = state.hub().register();
    let (mut sender, mut receiver) = socket.split();
    info!(observer_id, "observer connected");

    // frames stop when the hub drops this observer
    let writer = tokio::spawn(async move {
        while let Some(text) = frames.recv().await {
            if sender.send(Message::Text(text.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
        debug!(observer_id, "observer writer ended");
    });

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                debug!(observer_id, error = %err, "observer socket error");
                break;
            }
        };
        let reply = match msg {
            Message::Text(text) => match serde_json::from_str::<ObserverRequest>(&text) {
                Ok(request) => {
                    debug!(observer_id, kind = request.kind(), "observer request");
                    state.handle_observer_request(&request).await
                }
                Err(err) => {
                    warn!(observer_id, error = %err, "unparseable observer frame");
                    ObserverFrame::Error {
                        message: format!("invalid request: {err}"),
                    }
                }
            },
            Message::Close(_) => break,
            _ => continue,
        };
        if !state.hub().reply(observer_id, &reply) {
            break;
        }
    }

    state.hub().unregister(observer_id);
    writer.abort();
    info!(observer_id, "observer disconnected");
}
