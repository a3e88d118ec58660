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

//! Top-level wiring for `hostbridge serve`: reads config, spawns the
//! native host, builds the session registry around it, and runs the
//! WebSocket front-end and the idle-sweep loop until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::config::Config;
use crate::consts::SWEEP_INTERVAL;
use crate::host::HostChannel;
use crate::session::SessionRegistry;
use crate::ws::{self, BindOutcome};

pub async fn run(config: Config) -> anyhow::Result<()> {
    let host = match &config.host_command {
        Some(command) => {
            let args = config.host_args.clone().unwrap_or_default();
            HostChannel::spawn(command, &args).context("spawning native host")?
        }
        None => {
            warn!("no host_command configured; running with stdin/stdout as the host channel");
            HostChannel::from_io(tokio::io::stdin(), tokio::io::stdout())
        }
    };

    let log_dir = config.log_dir().context("resolving session log directory")?;
    let registry =
        SessionRegistry::new(Duration::from_millis(config.idle_timeout_ms()), Arc::clone(&host), log_dir);
    host.set_registry(&registry);

    let sweep_registry = Arc::clone(&registry);
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweep_registry.sweep().await;
        }
    });

    let port = config.port();
    let ws_task = tokio::spawn(ws::serve(port, Arc::clone(&registry)));

    tokio::select! {
        res = ws_task => {
            match res {
                Ok(Ok(BindOutcome::Bound(addr))) => info!(%addr, "websocket front-end exited"),
                Ok(Ok(BindOutcome::PortInUse)) => info!("running host-channel-only; no websocket front-end"),
                Ok(Err(e)) => return Err(e).context("websocket front-end failed"),
                Err(e) => return Err(e).context("websocket front-end task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        _ = host.closed() => {
            warn!("native host channel closed; cancelling every session");
            registry.shutdown_all().await;
        }
    }

    sweep_task.abort();
    Ok(())
}
