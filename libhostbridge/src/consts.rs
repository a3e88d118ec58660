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

use std::time::Duration;

/// Max size in bytes of a single frame on the host channel, independent of
/// the client-facing chunk threshold. Guards against a misbehaving host
/// sending a length prefix that would exhaust memory.
pub const HOST_FRAME_MAX_BYTES: usize = 64 * 1024 * 1024;

/// How often the registry sweeps for expired sessions.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Bound on the outbound mpsc channel feeding a client's WebSocket writer
/// task. A slow client can only ever lag this far behind before messages
/// are dropped for it specifically; it never blocks other sessions.
pub const CLIENT_OUTBOX_CAPACITY: usize = 256;
