//! WebSocket event stream
//!
//! Clients connect to `/ws` and optionally send a subscribe frame
//! `{type: "subscribe", target?, workflowId?, types?, groups?}`.
//! Every matching bus event arrives as one JSON line. A client with no
//! filter receives everything; send failures evict the client.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::{ClientFilter, EventGroup};

use super::AppState;

#[derive(Debug, Deserialize)]
struct SubscribeFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default, rename = "workflowId")]
    workflow_id: Option<String>,
    #[serde(default)]
    types: Option<Vec<String>>,
    #[serde(default)]
    groups: Option<Vec<String>>,
}

impl SubscribeFrame {
    fn into_filter(self) -> ClientFilter {
        ClientFilter {
            types: self.types,
            groups: self
                .groups
                .map(|names| names.iter().filter_map(|n| EventGroup::parse(n)).collect()),
            session_id: self.target,
            workflow_id: self.workflow_id,
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| client_loop(socket, state))
}

async fn client_loop(mut socket: WebSocket, state: Arc<AppState>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let client_id = state.bus.register_ws_client(tx, ClientFilter::default());
    debug!(client_id, "websocket client connected");

    loop {
        tokio::select! {
            line = rx.recv() => {
                let Some(line) = line else { break };
                if socket.send(Message::Text(line)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SubscribeFrame>(&text) {
                            Ok(frame) if frame.frame_type == "subscribe" => {
                                debug!(client_id, "subscription updated");
                                state.bus.update_ws_filter(client_id, frame.into_filter());
                            }
                            Ok(frame) => {
                                warn!(client_id, frame_type = %frame.frame_type, "ignoring unknown frame");
                            }
                            Err(e) => {
                                warn!(client_id, error = %e, "unparseable client frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    state.bus.unregister_ws_client(client_id);
    debug!(client_id, "websocket client disconnected");
}
