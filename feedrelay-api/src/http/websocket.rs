//! Subscriber WebSocket: `GET /ws?resourceId=<id>`
//!
//! Each delivery is one text frame carrying the snapshot's data JSON.
//! Client frames are read only to notice close/errors.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use feedrelay_core::models::ResourceId;
use feedrelay_hub::{BroadcastEngine, ConnectOutcome};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::http::{AppError, AppResult, AppState};

/// Clients only send control frames, keep the limit small
const MAX_CLIENT_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "resourceId")]
    pub resource_id: Option<String>,
}

/// Validate the resource id, then upgrade
///
/// The id is checked before the upgrade extractor is consulted so a
/// missing or empty id is always answered with 400.
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    let resource_id = query
        .resource_id
        .ok_or_else(|| AppError::bad_request("Missing resourceId query parameter"))
        .and_then(|id| ResourceId::parse(id).map_err(AppError::from))?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let engine = Arc::clone(&state.engine);
    Ok(ws
        .max_message_size(MAX_CLIENT_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, engine, resource_id)))
}

async fn handle_socket(socket: WebSocket, engine: Arc<BroadcastEngine>, resource_id: ResourceId) {
    let (session, mut deliveries) = engine.open_session(resource_id.clone());
    let session_id = session.id().clone();

    match engine.connect(&session) {
        Ok(ConnectOutcome::Closed) => return,
        Ok(outcome) => {
            info!(
                resource_id = %resource_id,
                session_id = %session_id,
                outcome = ?outcome,
                "WebSocket subscriber connected"
            );
        }
        Err(e) => {
            warn!(resource_id = %resource_id, error = %e, "Failed to register subscriber");
            return;
        }
    }

    let (mut ws_sink, mut ws_stream) = socket.split();

    let writer_session = session.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(snapshot) = deliveries.recv().await {
            let frame = Message::Text(snapshot.encode_data().into());
            if let Err(e) = ws_sink.send(frame).await {
                debug!(error = %e, "WebSocket send failed");
                break;
            }
        }
        writer_session.mark_closed();
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = ws_stream.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!(error = %e, "WebSocket receive failed");
                    break;
                }
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    session.mark_closed();
    engine.disconnect(&session_id);

    info!(
        resource_id = %resource_id,
        session_id = %session_id,
        duration = ?session.duration(),
        "WebSocket subscriber disconnected"
    );
}
