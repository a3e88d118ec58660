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

//! Per-client session state machine (spec.md §3, §4.2).

mod registry;

pub use registry::SessionRegistry;

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use hostbridge_protocol::{
    CommandEnvelope, LogEntry, ReplyError, ServerEvent, WholeReply, DEFAULT_REQUEST_TIMEOUT_MS,
    SESSION_WARNING_LEAD_MS,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::chunk;
use crate::error::BridgeError;
use crate::host::HostChannel;

/// A session's place in its lifecycle, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A client is connected over a live WebSocket.
    Attached,
    /// No client is connected, but the session hasn't expired yet: queued
    /// commands still drain and host-originated events still log, just
    /// with nowhere live to deliver them.
    Detached,
    /// Expired or explicitly removed. Terminal sessions never transition
    /// back; resuming one is a `SESSION_NOT_FOUND` error, same as an id
    /// the registry never saw.
    Terminal,
}

/// Waits on a single request's eventual reply from the host.
struct PendingRequest {
    reply_tx: oneshot::Sender<Result<serde_json::Value, ReplyError>>,
    submitted_at: Instant,
}

/// One client's session: its queue, its pending requests, its live socket
/// (if attached), and its append-only log.
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    idle_timeout: Duration,

    state: std::sync::Mutex<SessionState>,
    last_activity_at: std::sync::Mutex<Instant>,
    socket: std::sync::Mutex<Option<mpsc::Sender<Message>>>,
    pending: std::sync::Mutex<HashMap<String, PendingRequest>>,
    log: std::sync::Mutex<Vec<LogEntry>>,
    /// The on-disk mirror of `log`, one JSON object per line, for human
    /// forensics (spec.md §6, "Persisted state"). `None` if the log
    /// directory couldn't be created or opened; logging failures never
    /// fail the session itself.
    log_file: std::sync::Mutex<Option<std::fs::File>>,
    warned: std::sync::atomic::AtomicBool,

    /// The command queue and the "a dispatch loop is already running" flag
    /// live behind one lock so a `submit()` racing the drain loop's
    /// emptiness check can never be missed: either it lands before the
    /// loop observes an empty queue (so the loop keeps going) or after the
    /// loop has already cleared `running` under this same lock (so
    /// `submit()` spawns a fresh loop itself). Neither side can observe a
    /// state where the queue is non-empty and nothing is set to drain it
    /// (spec.md §4.2, §8 "unique delivery").
    dispatch: std::sync::Mutex<DispatchQueue>,

    host: Arc<HostChannel>,
}

#[derive(Default)]
struct DispatchQueue {
    queue: VecDeque<CommandEnvelope>,
    running: bool,
}

impl Session {
    pub(crate) fn new_internal(
        id: String,
        idle_timeout: Duration,
        host: Arc<HostChannel>,
        log_dir: &Path,
    ) -> Arc<Self> {
        let now = Instant::now();
        let created_at = Utc::now();
        let log_file = Self::open_log_file(log_dir, &id, created_at);
        Arc::new(Session {
            id,
            created_at,
            idle_timeout,
            state: std::sync::Mutex::new(SessionState::Attached),
            last_activity_at: std::sync::Mutex::new(now),
            socket: std::sync::Mutex::new(None),
            pending: std::sync::Mutex::new(HashMap::new()),
            log: std::sync::Mutex::new(Vec::new()),
            log_file: std::sync::Mutex::new(log_file),
            warned: std::sync::atomic::AtomicBool::new(false),
            dispatch: std::sync::Mutex::new(DispatchQueue::default()),
            host,
        })
    }

    /// One file per session instance, named so a human scanning the log
    /// directory can tell instances of the same session id apart
    /// (spec.md §6).
    fn open_log_file(log_dir: &Path, id: &str, created_at: DateTime<Utc>) -> Option<std::fs::File> {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            warn!(error = %e, dir = %log_dir.display(), "could not create session log directory");
            return None;
        }
        let path = log_dir.join(format!("session-{id}-{}.log", created_at.timestamp()));
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "could not open session log file");
                None
            }
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_expired(&self) -> bool {
        if self.state() == SessionState::Terminal {
            return true;
        }
        self.last_activity_at.lock().unwrap().elapsed() >= self.idle_timeout
    }

    /// Milliseconds until this session would expire if left idle, or `0`
    /// if it already has.
    pub fn remaining_ms(&self) -> u64 {
        let elapsed = self.last_activity_at.lock().unwrap().elapsed();
        self.idle_timeout.saturating_sub(elapsed).as_millis() as u64
    }

    pub fn should_warn(&self) -> bool {
        self.remaining_ms() > 0 && self.remaining_ms() <= SESSION_WARNING_LEAD_MS
    }

    /// Any activity (a command, a reconnect) rearms the idle timer.
    fn touch(&self) {
        *self.last_activity_at.lock().unwrap() = Instant::now();
        self.warned.store(false, std::sync::atomic::Ordering::Relaxed);
    }

    /// Attaches a freshly upgraded WebSocket's outbound half, transitioning
    /// `Detached` -> `Attached`. A session already `Attached` has its old
    /// socket replaced; the registry's caller is responsible for only
    /// calling this once per connection.
    pub fn attach(&self, tx: mpsc::Sender<Message>) {
        *self.socket.lock().unwrap() = Some(tx);
        *self.state.lock().unwrap() = SessionState::Attached;
        self.touch();
    }

    /// Drops the live socket, transitioning `Attached` -> `Detached`. The
    /// session and its queue persist until expiry or explicit removal.
    pub fn detach(&self) {
        *self.socket.lock().unwrap() = None;
        let mut state = self.state.lock().unwrap();
        if *state == SessionState::Attached {
            *state = SessionState::Detached;
        }
    }

    fn mark_terminal(&self) {
        *self.state.lock().unwrap() = SessionState::Terminal;
        *self.socket.lock().unwrap() = None;
    }

    /// Best-effort delivery: a client lagging more than
    /// [`crate::consts::CLIENT_OUTBOX_CAPACITY`] messages behind loses the
    /// overflow rather than stalling the dispatcher for every other
    /// session sharing the writer task's runtime. A closed outbox means the
    /// socket write side has already died; detach so the session becomes
    /// resumable instead of staying `Attached` forever (spec.md §4.2).
    fn send(&self, msg: Message) {
        let err = {
            let socket = self.socket.lock().unwrap();
            let Some(tx) = socket.as_ref() else { return };
            tx.try_send(msg).err()
        };
        match err {
            Some(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %self.id, "client outbox full, dropping message");
            }
            Some(mpsc::error::TrySendError::Closed(_)) => {
                warn!(session = %self.id, "client outbox closed, detaching");
                self.detach();
            }
            None => {}
        }
    }

    fn send_event(&self, event: ServerEvent) {
        let payload = serde_json::to_string(&event).expect("ServerEvent always serializes");
        self.send(Message::Text(payload));
    }

    fn send_reply(&self, reply: &WholeReply) {
        match chunk::encode(reply) {
            Ok(envelopes) => {
                for env in envelopes {
                    let payload = serde_json::to_string(&env).expect("ReplyEnvelope always serializes");
                    self.send(Message::Text(payload));
                }
            }
            Err(e) => warn!(session = %self.id, error = %e, "failed to encode reply"),
        }
    }

    fn record(&self, entry: LogEntry) {
        if let Some(file) = self.log_file.lock().unwrap().as_mut() {
            match serde_json::to_vec(&entry) {
                Ok(mut line) => {
                    line.push(b'\n');
                    if let Err(e) = file.write_all(&line) {
                        warn!(session = %self.id, error = %e, "failed writing session log line");
                    }
                }
                Err(e) => warn!(session = %self.id, error = %e, "failed to serialize log entry"),
            }
        }
        self.log.lock().unwrap().push(entry);
    }

    pub fn log_snapshot(&self) -> Vec<LogEntry> {
        self.log.lock().unwrap().clone()
    }

    /// Appends a request/response line relayed by the host for forensic
    /// logging (spec.md §6, "Persisted state").
    pub fn record_host_log(&self, direction: hostbridge_protocol::LogDirection, data: serde_json::Value) {
        let event = match direction {
            hostbridge_protocol::LogDirection::Request => hostbridge_protocol::EventKind::RequestHost,
            hostbridge_protocol::LogDirection::Response => hostbridge_protocol::EventKind::ResponseHost,
        };
        self.record(LogEntry { timestamp: Utc::now().timestamp_millis(), event, data });
    }

    /// Enqueues a client command and kicks the dispatcher, unless a drain
    /// loop is already running, in which case that loop will pick this
    /// item up itself. Ordering within a session is FIFO; ordering across
    /// sessions is unspecified, per spec.md §4.2.
    #[instrument(skip(self, cmd), fields(session = %self.id, request_id = %cmd.request_id))]
    pub fn submit(self: &Arc<Self>, cmd: CommandEnvelope) {
        self.touch();
        let mut dispatch = self.dispatch.lock().unwrap();
        dispatch.queue.push_back(cmd);
        if dispatch.running {
            return;
        }
        dispatch.running = true;
        drop(dispatch);

        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch().await });
    }

    /// Drains the queue one command at a time, dispatching each to the
    /// host channel and waiting for its reply before starting the next.
    /// The pop and the "nothing left to drain" decision happen under the
    /// same lock `submit()` uses, so a command enqueued the instant this
    /// loop would otherwise exit is never stranded (see the `dispatch`
    /// field's doc comment).
    async fn dispatch(self: Arc<Self>) {
        loop {
            let cmd = {
                let mut dispatch = self.dispatch.lock().unwrap();
                match dispatch.queue.pop_front() {
                    Some(cmd) => cmd,
                    None => {
                        dispatch.running = false;
                        break;
                    }
                }
            };

            if self.is_expired() {
                self.expire().await;
                let mut dispatch = self.dispatch.lock().unwrap();
                dispatch.queue.clear();
                dispatch.running = false;
                break;
            }

            let result = self.dispatch_one(cmd).await;
            if let Ok(reply) = &result {
                self.send_reply(reply);
            } else if let Err(e) = result {
                warn!(session = %self.id, error = %e, "command dispatch failed");
            }
        }
    }

    async fn dispatch_one(&self, cmd: CommandEnvelope) -> anyhow::Result<WholeReply> {
        let request_id = cmd.request_id.clone();

        self.record(LogEntry {
            timestamp: Utc::now().timestamp_millis(),
            event: hostbridge_protocol::EventKind::Request,
            data: serde_json::to_value(&cmd)?,
        });

        // Fail fast rather than queue a command the host has never
        // acknowledged being alive for (spec.md §4.2, §4.4).
        if !self.host.is_connected() {
            let reply =
                WholeReply::err(request_id.clone(), BridgeError::NativeHostError("not connected".to_string()).into());
            self.record(LogEntry {
                timestamp: Utc::now().timestamp_millis(),
                event: hostbridge_protocol::EventKind::Response,
                data: serde_json::to_value(&reply)?,
            });
            return Ok(reply);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), PendingRequest { reply_tx, submitted_at: Instant::now() });

        if let Err(e) = self.host.dispatch(&self.id, cmd) {
            self.pending.lock().unwrap().remove(&request_id);
            return Err(e);
        }

        let deadline = Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS);
        let reply = match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(Ok(result))) => WholeReply::ok(request_id.clone(), result),
            Ok(Ok(Err(err))) => WholeReply::err(request_id.clone(), err),
            Ok(Err(_)) | Err(_) => {
                self.pending.lock().unwrap().remove(&request_id);
                WholeReply::err(request_id.clone(), BridgeError::RequestTimeout.into())
            }
        };

        self.record(LogEntry {
            timestamp: Utc::now().timestamp_millis(),
            event: hostbridge_protocol::EventKind::Response,
            data: serde_json::to_value(&reply)?,
        });

        Ok(reply)
    }

    /// Resolves a pending request once the host's response arrives.
    pub fn resolve(&self, request_id: &str, result: Option<serde_json::Value>, error: Option<ReplyError>) {
        let pending = self.pending.lock().unwrap().remove(request_id);
        let Some(pending) = pending else {
            debug!(session = %self.id, request_id, "response for unknown/expired request");
            return;
        };
        debug!(session = %self.id, request_id, elapsed = ?pending.submitted_at.elapsed(), "resolved pending request");
        let outcome = match error {
            Some(e) => Err(e),
            None => Ok(result.unwrap_or(serde_json::Value::Null)),
        };
        let _ = pending.reply_tx.send(outcome);
    }

    /// Sends a per-frame error to the attached client without touching
    /// session state; the connection stays open.
    pub fn send_error_event(&self, message: String) {
        self.send_event(ServerEvent::Error { message });
    }

    pub fn broadcast_tab_update(&self, event: String, tab: serde_json::Value) {
        self.send_event(ServerEvent::TabUpdate { event, tab });
    }

    pub fn notify_created(&self) {
        self.send_event(ServerEvent::SessionCreated { session_id: self.id.clone() });
    }

    pub fn notify_resumed(&self) {
        self.send_event(ServerEvent::SessionResumed { session_id: self.id.clone() });
    }

    fn notify_timeout_warning(&self) {
        self.send_event(ServerEvent::SessionTimeout { remaining_time: self.remaining_ms() });
    }

    /// Transitions to `Terminal`, tells any live client, and frees the
    /// socket. Idempotent.
    pub async fn expire(&self) {
        if self.state() == SessionState::Terminal {
            return;
        }
        self.send_event(ServerEvent::SessionExpired);
        self.mark_terminal();
        for (_, pending) in self.pending.lock().unwrap().drain() {
            let _ = pending.reply_tx.send(Err(BridgeError::SessionExpired.into()));
        }
        self.record(LogEntry {
            timestamp: Utc::now().timestamp_millis(),
            event: hostbridge_protocol::EventKind::SessionExpired,
            data: serde_json::Value::Null,
        });
    }

    /// Tears the session down as part of process shutdown: every pending
    /// request fails with `NATIVE_HOST_ERROR`, the attached client (if
    /// any) is told, and the session becomes terminal. Distinct from
    /// [`Session::expire`] only in the error it surfaces and the log
    /// event it records (spec.md §4.4, §5 "Shutdown").
    pub async fn cancel_for_shutdown(&self) {
        if self.state() == SessionState::Terminal {
            return;
        }
        self.send_event(ServerEvent::Error { message: "native host channel closed; shutting down".to_string() });
        self.mark_terminal();
        for (_, pending) in self.pending.lock().unwrap().drain() {
            let _ = pending.reply_tx.send(Err(BridgeError::NativeHostError("host channel closed".to_string()).into()));
        }
        self.record(LogEntry {
            timestamp: Utc::now().timestamp_millis(),
            event: hostbridge_protocol::EventKind::Shutdown,
            data: serde_json::Value::Null,
        });
    }

    /// Called once per sweep tick for every live session; sends the
    /// pre-expiry warning exactly once per approach to expiry (rearmed by
    /// `touch()` on the next activity).
    pub fn maybe_warn(&self) {
        use std::sync::atomic::Ordering;
        if self.state() == SessionState::Terminal || !self.should_warn() {
            return;
        }
        if self.warned.swap(true, Ordering::Relaxed) {
            return;
        }
        self.notify_timeout_warning();
    }
}
