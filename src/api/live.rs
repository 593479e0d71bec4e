//! `/ws/{project_id}`: pushes reload events to connected clients.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use crate::project::ProjectId;
use crate::reload::ReloadHub;

use super::AppState;

pub async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Response {
    let project_id = ProjectId::from(project_id);
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| forward(socket, hub, project_id))
}

/// Forwards the project's events until either side goes away.
async fn forward(socket: WebSocket, hub: ReloadHub, project_id: ProjectId) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = hub.subscribe(&project_id);
    tracing::info!(project = %project_id, "live client connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to encode live event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(project = %project_id, skipped, "live client lagging");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                // clients only keep the connection alive
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::info!(project = %project_id, "live client disconnected");
}
