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

//! Typed errors that can end up on the wire, as opposed to the `anyhow`
//! errors used for startup/IO failures that never reach a client.

use hostbridge_protocol::{error_code, ReplyError};
use thiserror::Error;

/// The six bridge-owned error conditions from the external interface
/// design, plus a catch-all for relaying a host-reported error verbatim.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("message was not valid JSON or not an object: {0}")]
    InvalidFormat(String),

    #[error("could not parse command: {0}")]
    ParseError(String),

    #[error("native host reported an error: {0}")]
    NativeHostError(String),

    #[error("request timed out waiting for the native host")]
    RequestTimeout,

    #[error("session has expired")]
    SessionExpired,

    #[error("no session with id {0}")]
    SessionNotFound(String),

    /// A host-originated error whose code isn't one the bridge defines.
    /// Carried through unchanged rather than coerced into one of the
    /// above variants.
    #[error("{0}")]
    HostPassthrough(ReplyError),
}

impl BridgeError {
    /// The wire error code for this condition, per the error taxonomy.
    pub fn code(&self) -> &str {
        match self {
            BridgeError::InvalidFormat(_) => error_code::INVALID_FORMAT,
            BridgeError::ParseError(_) => error_code::PARSE_ERROR,
            BridgeError::NativeHostError(_) => error_code::NATIVE_HOST_ERROR,
            BridgeError::RequestTimeout => error_code::REQUEST_TIMEOUT,
            BridgeError::SessionExpired => error_code::SESSION_EXPIRED,
            BridgeError::SessionNotFound(_) => error_code::SESSION_NOT_FOUND,
            BridgeError::HostPassthrough(e) => &e.code,
        }
    }
}

impl From<BridgeError> for ReplyError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::HostPassthrough(inner) => inner,
            other => ReplyError::new(other.code().to_string(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(BridgeError::RequestTimeout.code(), "REQUEST_TIMEOUT");
        assert_eq!(BridgeError::SessionExpired.code(), "SESSION_EXPIRED");
        assert_eq!(
            BridgeError::SessionNotFound("abc".into()).code(),
            "SESSION_NOT_FOUND"
        );
    }

    #[test]
    fn passthrough_preserves_host_code() {
        let e = BridgeError::HostPassthrough(ReplyError::new("TAB_NOT_FOUND", "no such tab"));
        assert_eq!(e.code(), "TAB_NOT_FOUND");
        let reply: ReplyError = e.into();
        assert_eq!(reply.code, "TAB_NOT_FOUND");
    }
}
