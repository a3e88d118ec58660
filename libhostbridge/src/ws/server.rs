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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::handlers;
use crate::session::SessionRegistry;

fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new().route("/", get(handlers::upgrade)).with_state(registry)
}

/// Whether the WebSocket front-end actually bound a port, or the bridge is
/// running host-channel-only because something else already owns it
/// (spec.md §4.3, §6: port contention is not a fatal error).
pub enum BindOutcome {
    Bound(SocketAddr),
    PortInUse,
}

/// Binds the WebSocket listener and serves it until the process is
/// cancelled. On `AddrInUse`, returns `Ok(BindOutcome::PortInUse)` instead
/// of erroring, so the caller can keep the bridge alive in host-channel-
/// only mode and report degraded status via the host `ready` signal.
pub async fn serve(port: u16, registry: Arc<SessionRegistry>) -> anyhow::Result<BindOutcome> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            warn!(port, "port already in use, continuing in host-channel-only mode");
            return Ok(BindOutcome::PortInUse);
        }
        Err(e) => return Err(e.into()),
    };

    info!(%addr, "websocket front-end listening");
    axum::serve(listener, router(registry)).await?;
    Ok(BindOutcome::Bound(addr))
}

/// Binds an ephemeral loopback port and returns its address along with a
/// future that serves on it. Split out from [`serve`] so tests (and
/// anything else that wants to know the bound port before traffic starts
/// flowing) don't have to guess a free port up front.
pub async fn bind_ephemeral(
    registry: Arc<SessionRegistry>,
) -> anyhow::Result<(SocketAddr, impl std::future::Future<Output = anyhow::Result<()>>)> {
    let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
    let addr = listener.local_addr()?;
    let serving = async move { Ok(axum::serve(listener, router(registry)).await?) };
    Ok((addr, serving))
}
