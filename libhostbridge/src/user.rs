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

use std::env;

use anyhow::{anyhow, Context};

#[derive(Debug)]
pub struct Info {
    pub home_dir: String,
}

/// Resolves the information we need about the invoking user. hostbridge
/// runs as a long lived daemon rather than forking shells, so unlike its
/// ancestor it has no need to sniff the user's default shell or uid.
pub fn info() -> anyhow::Result<Info> {
    let home_dir = env::var("HOME").context("no HOME in environment")?;
    if home_dir.is_empty() {
        return Err(anyhow!("HOME is set but empty"));
    }
    Ok(Info { home_dir })
}
