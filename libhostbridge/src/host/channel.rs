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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use anyhow::Context;
use hostbridge_protocol::{CommandEnvelope, HostEnvelope};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, instrument, warn};

use crate::framing;
use crate::session::SessionRegistry;

/// The bridge's side of the framed stdio conversation with the native
/// host. Holds only a weak back-reference to the session registry so the
/// two can be wired together after both exist (spec.md §9: "centralize
/// shared resources in a single owner value").
pub struct HostChannel {
    writer_tx: mpsc::UnboundedSender<HostEnvelope>,
    connected: AtomicBool,
    registry: OnceLock<Weak<SessionRegistry>>,
    closed_tx: Mutex<Option<oneshot::Sender<()>>>,
    closed_rx: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
}

impl HostChannel {
    /// Spawns `command` with stdio piped and wires up its reader/writer
    /// tasks. The child is kept alive for the lifetime of the returned
    /// `HostChannel`; if the task driving it ever exits the channel is
    /// considered permanently disconnected.
    #[instrument(skip_all, fields(command))]
    pub fn spawn(command: &str, args: &[String]) -> anyhow::Result<Arc<Self>> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning native host `{command}`"))?;

        let stdin = child.stdin.take().context("child stdin not piped")?;
        let stdout = child.stdout.take().context("child stdout not piped")?;

        Ok(Self::wire(stdin, stdout, Some(child)))
    }

    /// Builds a channel around an already-open pair of async streams.
    /// Used in tests and by the `serve` entry point when the bridge's own
    /// stdio is the host channel rather than a spawned child's.
    pub fn from_io<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::wire(writer, reader, None)
    }

    fn wire<R, W>(writer: W, reader: R, _keepalive: Option<Child>) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        let channel = Arc::new(HostChannel {
            writer_tx,
            connected: AtomicBool::new(false),
            registry: OnceLock::new(),
            closed_tx: Mutex::new(Some(closed_tx)),
            closed_rx: tokio::sync::Mutex::new(Some(closed_rx)),
        });

        tokio::spawn(Self::run_writer(Arc::clone(&channel), writer, writer_rx));
        tokio::spawn(Self::run_reader(Arc::clone(&channel), reader));
        if let Some(child) = _keepalive {
            tokio::spawn(Self::reap(child));
        }

        channel
    }

    /// Fires the first time either the reader or the writer task ends,
    /// i.e. the host channel is dead for good (spec.md §4.4, §5: "stdin
    /// EOF terminates the bridge cleanly").
    pub async fn closed(&self) {
        let rx = self.closed_rx.lock().await.take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }

    fn mark_closed(&self) {
        if let Some(tx) = self.closed_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    async fn reap(mut child: Child) {
        match child.wait().await {
            Ok(status) => warn!(?status, "native host process exited"),
            Err(e) => error!(error = %e, "error waiting on native host process"),
        }
    }

    async fn run_writer<W>(channel: Arc<HostChannel>, mut writer: W, mut rx: mpsc::UnboundedReceiver<HostEnvelope>)
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(env) = rx.recv().await {
            if let Err(e) = framing::encode_to(&env, &mut writer).await {
                error!(error = %e, "failed writing frame to host channel; terminating writer");
                break;
            }
        }
        channel.mark_closed();
    }

    async fn run_reader<R>(channel: Arc<HostChannel>, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame: Option<HostEnvelope> = match framing::decode_from(&mut reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    error!(error = %e, "host channel framing error; terminating reader");
                    break;
                }
            };
            let Some(env) = frame else {
                info!("host channel reached EOF");
                break;
            };

            // Resolved Open Question: hostConnected flips true on the
            // first inbound message of any type, not just `ready`.
            channel.connected.store(true, Ordering::Relaxed);
            channel.handle_inbound(env);
        }
        channel.connected.store(false, Ordering::Relaxed);
        channel.mark_closed();
    }

    fn handle_inbound(&self, env: HostEnvelope) {
        let Some(registry) = self.registry.get().and_then(Weak::upgrade) else {
            warn!("host channel received a frame before the session registry was attached");
            return;
        };

        match env {
            HostEnvelope::Response { session_id, request_id, result, error } => {
                if let Some(session) = registry.get(&session_id) {
                    session.resolve(&request_id, result, error);
                } else {
                    warn!(session = %session_id, request_id, "response for unknown session");
                }
            }
            HostEnvelope::Log { session_id, direction, data } => {
                if let Some(session) = registry.get(&session_id) {
                    session.record_host_log(direction, data);
                }
            }
            HostEnvelope::TabUpdate { event, tab } => {
                registry.broadcast(|s| s.broadcast_tab_update(event.clone(), tab.clone()));
            }
            HostEnvelope::SessionExpired { session_id } => {
                registry.remove(&session_id);
            }
            HostEnvelope::Ready { .. } => {
                info!("native host signaled ready");
            }
            HostEnvelope::Command { .. } => {
                warn!("native host sent a command frame; bridge-to-host direction violated, ignoring");
            }
        }
    }

    pub fn set_registry(&self, registry: &Arc<SessionRegistry>) {
        let _ = self.registry.set(Arc::downgrade(registry));
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Sends a command for `session_id` to the host. Returns an error only
    /// if the writer task has already shut down; a slow or wedged host is
    /// not an error here; it shows up later as a `REQUEST_TIMEOUT`.
    pub fn dispatch(&self, session_id: &str, command: CommandEnvelope) -> anyhow::Result<()> {
        self.writer_tx
            .send(HostEnvelope::Command { session_id: session_id.to_string(), command })
            .context("host channel writer task has shut down")
    }

    #[cfg(test)]
    pub fn new_detached_for_test() -> Arc<Self> {
        let (reader, writer) = tokio::io::duplex(64 * 1024);
        Self::from_io(reader, writer)
    }
}
