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

//! The length-prefixed JSON framing used on the native host's stdio
//! channel (spec §4.4). Every frame is a 4 byte little endian length
//! prefix followed by exactly that many bytes of UTF-8 JSON.

use anyhow::{anyhow, Context};
use byteorder::{LittleEndian, ByteOrder, ReadBytesExt as _};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::consts::HOST_FRAME_MAX_BYTES;

/// The centralized encoding function that should be used for all host
/// channel writes.
pub async fn encode_to<T, W>(d: &T, w: &mut W) -> anyhow::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(d).context("serializing host frame")?;
    if body.len() > HOST_FRAME_MAX_BYTES {
        return Err(anyhow!(
            "outbound host frame of {} bytes exceeds limit of {}",
            body.len(),
            HOST_FRAME_MAX_BYTES
        ));
    }
    let mut prefix = [0u8; 4];
    LittleEndian::write_u32(&mut prefix, body.len() as u32);
    w.write_all(&prefix).await.context("writing host frame length prefix")?;
    w.write_all(&body).await.context("writing host frame body")?;
    w.flush().await.context("flushing host frame")?;
    Ok(())
}

/// The centralized decoding function that should be used for all host
/// channel reads. Returns `Ok(None)` on clean EOF between frames.
pub async fn decode_from<T, R>(r: &mut R) -> anyhow::Result<Option<T>>
where
    for<'de> T: Deserialize<'de>,
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match r.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("reading host frame length prefix"),
    };
    let len = (&prefix[..]).read_u32::<LittleEndian>().expect("4 byte buffer always has enough data") as usize;
    if len > HOST_FRAME_MAX_BYTES {
        return Err(anyhow!("inbound host frame of {} bytes exceeds limit of {}", len, HOST_FRAME_MAX_BYTES));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await.context("reading host frame body")?;
    let d: T = serde_json::from_slice(&body).context("deserializing host frame")?;
    Ok(Some(d))
}

#[cfg(test)]
mod test {
    use hostbridge_protocol::{CommandEnvelope, HostEnvelope};

    use super::*;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let env = HostEnvelope::Command {
            session_id: "s1".to_string(),
            command: CommandEnvelope {
                action: "listTabs".to_string(),
                params: serde_json::json!({}),
                request_id: "r1".to_string(),
            },
        };

        let mut buf: Vec<u8> = Vec::new();
        encode_to(&env, &mut buf).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: HostEnvelope = decode_from(&mut cursor).await.unwrap().unwrap();
        match decoded {
            HostEnvelope::Command { session_id, .. } => assert_eq!(session_id, "s1"),
            _ => panic!("unexpected variant"),
        }
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let decoded: Option<HostEnvelope> = decode_from(&mut cursor).await.unwrap();
        assert!(decoded.is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(&((HOST_FRAME_MAX_BYTES as u32) + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let decoded: anyhow::Result<Option<HostEnvelope>> = decode_from(&mut cursor).await;
        assert!(decoded.is_err());
    }
}
