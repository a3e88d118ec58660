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

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use hostbridge_protocol::{DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_WS_PORT};
use serde_derive::Deserialize;
use tracing::{info, instrument};

use super::user;

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else {
        let user_info = user::info()?;
        let mut config_path = PathBuf::from(user_info.home_dir);
        config_path.push(".config");
        config_path.push("hostbridge");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// Port the WebSocket front-end listens on. Defaults to
    /// [`hostbridge_protocol::DEFAULT_WS_PORT`].
    pub port: Option<u16>,

    /// Default idle timeout applied to a session that doesn't request its
    /// own `idleTimeout` on connect, in milliseconds.
    pub idle_timeout_ms: Option<u64>,

    /// Path to the native host binary to spawn. If unset, hostbridge
    /// expects the host to already be reachable some other way (tests
    /// wire it up directly) and will fail to start in `serve` mode.
    pub host_command: Option<String>,

    /// Extra arguments passed to `host_command`.
    pub host_args: Option<Vec<String>>,

    /// Directory session logs are appended to. Defaults to
    /// `~/.local/share/hostbridge/sessions`.
    pub log_dir: Option<String>,

    /// If set, the bridge tries this port first and, on a bind conflict,
    /// assumes another bridge instance already owns it and runs in
    /// degraded bridge-only mode instead of a hard failure (spec §9).
    pub allow_port_fallback: Option<bool>,
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_WS_PORT)
    }

    pub fn idle_timeout_ms(&self) -> u64 {
        self.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS)
    }

    /// Resolves the directory per-session log files are written under,
    /// falling back to `~/.local/share/hostbridge/sessions` (spec.md §6).
    pub fn log_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.log_dir {
            return Ok(PathBuf::from(dir));
        }
        let user_info = user::info()?;
        let mut path = PathBuf::from(user_info.home_dir);
        path.push(".local");
        path.push("share");
        path.push("hostbridge");
        path.push("sessions");
        Ok(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(30000)]
    fn parse() -> anyhow::Result<()> {
        let cases = vec![
            r#"
            port = 9001
            "#,
            r#"
            idle_timeout_ms = 120000
            host_command = "/usr/local/bin/native-host"
            host_args = ["--foo"]
            "#,
            r#"
            allow_port_fallback = true
            "#,
        ];

        for case in cases.into_iter() {
            let _: Config = toml::from_str(case)?;
        }

        Ok(())
    }

    #[test]
    fn defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.port(), DEFAULT_WS_PORT);
        assert_eq!(config.idle_timeout_ms(), DEFAULT_IDLE_TIMEOUT_MS);
    }

    #[test]
    fn explicit_log_dir_is_used_verbatim() {
        let config = Config { log_dir: Some("/tmp/hostbridge-logs".to_string()), ..Config::default() };
        assert_eq!(config.log_dir().unwrap(), PathBuf::from("/tmp/hostbridge-logs"));
    }
}
