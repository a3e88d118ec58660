// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_derive::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::consts::CLIENT_OUTBOX_CAPACITY;
use crate::error::BridgeError;
use crate::session::{Session, SessionRegistry};
use hostbridge_protocol::{CommandEnvelope, ServerEvent};

#[derive(Deserialize, Debug, Default)]
pub struct ConnectQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(rename = "timeout")]
    pub idle_timeout_ms: Option<u64>,
}

pub async fn upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(registry): State<Arc<SessionRegistry>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, registry, query))
}

#[instrument(skip(socket, registry))]
async fn handle_socket(socket: WebSocket, registry: Arc<SessionRegistry>, query: ConnectQuery) {
    let (mut sink, mut stream) = socket.split();

    let session = match resolve_session(&registry, &query) {
        Ok(session) => session,
        Err(e) => {
            let event = ServerEvent::Error { message: e.to_string() };
            if let Ok(payload) = serde_json::to_string(&event) {
                let _ = sink.send(Message::Text(payload)).await;
            }
            let _ = sink.close().await;
            return;
        }
    };

    let (outbox_tx, mut outbox_rx) = mpsc::channel(CLIENT_OUTBOX_CAPACITY);
    let resumed = session.state() == crate::session::SessionState::Detached;
    session.attach(outbox_tx);
    if resumed {
        session.notify_resumed();
    } else {
        session.notify_created();
    }

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "websocket receive error, detaching session");
                break;
            }
        };
        match msg {
            Message::Text(text) => handle_command_text(&session, &text),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    session.detach();
    writer.abort();
}

fn resolve_session(registry: &Arc<SessionRegistry>, query: &ConnectQuery) -> anyhow::Result<Arc<Session>> {
    match &query.session_id {
        Some(id) => registry
            .resume(id)
            .ok_or_else(|| BridgeError::SessionNotFound(id.clone()).into()),
        None => {
            let idle_timeout = query.idle_timeout_ms.map(Duration::from_millis);
            Ok(registry.create(idle_timeout))
        }
    }
}

fn handle_command_text(session: &Arc<Session>, text: &str) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v @ serde_json::Value::Object(_)) => v,
        Ok(_) => {
            return reject(session, BridgeError::InvalidFormat("message must be a JSON object".to_string()))
        }
        Err(e) => return reject(session, BridgeError::InvalidFormat(e.to_string())),
    };

    match serde_json::from_value::<CommandEnvelope>(value) {
        Ok(cmd) => session.submit(cmd),
        Err(e) => reject(session, BridgeError::ParseError(e.to_string())),
    }
}

/// A malformed frame is a per-frame error, not a session-level one: the
/// connection stays open (spec.md §7's propagation policy).
fn reject(session: &Arc<Session>, err: BridgeError) {
    warn!(session = %session.id, error = %err, "rejecting malformed frame");
    session.send_error_event(err.to_string());
}
