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

//! Wire types shared between the WebSocket front-end, the host channel, and
//! anything that wants to talk to hostbridge from the outside.
//!
//! Every struct here is a bare data carrier; behavior lives in
//! `libhostbridge`. Field names are `camelCase` on the wire because the
//! client side of this protocol is JavaScript.

use std::fmt;

use serde_derive::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default loopback port the WebSocket front-end listens on.
pub const DEFAULT_WS_PORT: u16 = 9000;

/// Default idle timeout for a session that doesn't override it on connect.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Default per-request deadline used by clients; the bridge has no
/// symmetric watchdog by default (see DESIGN.md open question).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// How long before `expiresAt` the `sessionTimeout` warning is sent.
pub const SESSION_WARNING_LEAD_MS: u64 = 60_000;

/// Serialized replies at or under this size are sent whole; above it they
/// are split into chunks.
pub const CHUNK_THRESHOLD_BYTES: usize = 1024 * 1024;

/// A command submitted by a client on an established session.
///
/// `requestId` is opaque to the bridge; the client is responsible for
/// choosing unique values within one session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub request_id: String,
}

/// A structured error attached to a reply, either bridge-owned (see
/// [`error_code`]) or passed through verbatim from the host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReplyError {
    pub code: String,
    pub message: String,
}

impl ReplyError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ReplyError { code: code.into(), message: message.into() }
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Bridge-owned error codes from spec §7. Host-originated codes (e.g.
/// `TAB_NOT_FOUND`) are not enumerated here; they are relayed verbatim.
pub mod error_code {
    pub const INVALID_FORMAT: &str = "INVALID_FORMAT";
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
    pub const NATIVE_HOST_ERROR: &str = "NATIVE_HOST_ERROR";
    pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
}

/// A whole (unchunked) reply to a single request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WholeReply {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl WholeReply {
    pub fn ok(request_id: impl Into<String>, result: serde_json::Value) -> Self {
        WholeReply { request_id: request_id.into(), result: Some(result), error: None }
    }

    pub fn err(request_id: impl Into<String>, error: ReplyError) -> Self {
        WholeReply { request_id: request_id.into(), result: None, error: Some(error) }
    }
}

/// One slice of a reply that exceeded [`CHUNK_THRESHOLD_BYTES`] once
/// serialized. `chunk` is a slice of the base64 encoding of the whole
/// serialized [`WholeReply`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEnvelope {
    pub request_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub chunk: String,
}

/// Either outcome a client can observe for a given `requestId`: a whole
/// reply, or one chunk of a chunked reply. Never both for the same id.
///
/// `Chunk` is listed first because it carries fields `WholeReply` does not;
/// serde's untagged matching tries variants in order and this ordering
/// keeps the two unambiguous without a discriminant field on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ReplyEnvelope {
    Chunk(ChunkEnvelope),
    Whole(WholeReply),
}

/// Unsolicited messages the bridge sends a client outside of a request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    SessionCreated { session_id: String },
    SessionResumed { session_id: String },
    /// Warning sent sixty seconds (by default) before `expiresAt`.
    SessionTimeout { remaining_time: u64 },
    SessionExpired,
    TabUpdate { event: String, tab: serde_json::Value },
    Error { message: String },
}

/// Which direction a relayed host log line traveled.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogDirection {
    Request,
    Response,
}

/// Frames exchanged on the length-prefixed stdio channel between the
/// bridge and the privileged native host (spec §3, §4.4).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostEnvelope {
    /// Bridge -> host: dispatch a client command.
    Command { session_id: String, command: CommandEnvelope },
    /// Host -> bridge: a reply to a previously dispatched command.
    Response {
        session_id: String,
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ReplyError>,
    },
    /// Host -> bridge: an echo of traffic for a session's forensic log.
    Log { session_id: String, direction: LogDirection, data: serde_json::Value },
    /// Host -> bridge: an unsolicited browser-tab lifecycle event, fanned
    /// out to every attached session.
    TabUpdate { event: String, tab: serde_json::Value },
    /// Host -> bridge: the host itself expired a session.
    SessionExpired { session_id: String },
    /// Host -> bridge: liveness/handshake signal. `bridge_only` is set by
    /// the bridge itself when reporting degraded (port-contention) mode;
    /// the host never sends it.
    Ready {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bridge_only: Option<bool>,
    },
}

/// An append-only log entry, one JSON object per line, as described in
/// spec §6 ("Persisted state").
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: i64,
    pub event: EventKind,
    pub data: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SessionCreated,
    Request,
    Response,
    RequestHost,
    ResponseHost,
    SessionExpired,
    WsError,
    /// The bridge tore this session down as part of process shutdown,
    /// rather than idle expiry or explicit removal.
    Shutdown,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_envelope_round_trip() {
        let cmd = CommandEnvelope {
            action: "listTabs".to_string(),
            params: serde_json::json!({}),
            request_id: "r1".to_string(),
        };
        let s = serde_json::to_string(&cmd).unwrap();
        assert!(s.contains("\"requestId\":\"r1\""));
        let back: CommandEnvelope = serde_json::from_str(&s).unwrap();
        assert_eq!(cmd, back);
    }

    #[test]
    fn reply_envelope_whole_vs_chunk() {
        let whole = ReplyEnvelope::Whole(WholeReply::ok("r1", serde_json::json!({"tabs": []})));
        let s = serde_json::to_string(&whole).unwrap();
        match serde_json::from_str::<ReplyEnvelope>(&s).unwrap() {
            ReplyEnvelope::Whole(w) => assert_eq!(w.request_id, "r1"),
            ReplyEnvelope::Chunk(_) => panic!("expected whole reply"),
        }

        let chunk = ReplyEnvelope::Chunk(ChunkEnvelope {
            request_id: "r2".to_string(),
            chunk_index: 0,
            total_chunks: 3,
            chunk: "YWJj".to_string(),
        });
        let s = serde_json::to_string(&chunk).unwrap();
        match serde_json::from_str::<ReplyEnvelope>(&s).unwrap() {
            ReplyEnvelope::Chunk(c) => {
                assert_eq!(c.request_id, "r2");
                assert_eq!(c.total_chunks, 3);
            }
            ReplyEnvelope::Whole(_) => panic!("expected chunk"),
        }
    }

    #[test]
    fn host_envelope_tag_matches_wire_contract() {
        let env = HostEnvelope::Command {
            session_id: "abc".to_string(),
            command: CommandEnvelope {
                action: "executeJS".to_string(),
                params: serde_json::json!({"code": "1+1"}),
                request_id: "r1".to_string(),
            },
        };
        let v: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "command");
        assert_eq!(v["sessionId"], "abc");
    }

    #[test]
    fn ready_envelope_omits_unset_fields() {
        let env = HostEnvelope::Ready { port: None, bridge_only: Some(true) };
        let v: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert!(v.get("port").is_none());
        assert_eq!(v["bridgeOnly"], true);
    }
}
