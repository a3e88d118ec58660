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

//! Splits an oversized reply into wire-sized chunks and reassembles them.
//! Mirrors the length-prefix discipline the host channel uses, but at the
//! granularity of whole base64 slices rather than raw bytes, since these
//! chunks ride inside JSON messages on the client WebSocket (spec §4.5).

use anyhow::{anyhow, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hostbridge_protocol::{ChunkEnvelope, ReplyEnvelope, WholeReply, CHUNK_THRESHOLD_BYTES};

/// Encodes `reply` into the envelope(s) that should be sent to the client:
/// a single [`ReplyEnvelope::Whole`] if it serializes at or under the
/// chunk threshold, otherwise a sequence of [`ReplyEnvelope::Chunk`]s that
/// together carry the base64 of the serialized whole reply.
pub fn encode(reply: &WholeReply) -> anyhow::Result<Vec<ReplyEnvelope>> {
    let body = serde_json::to_vec(reply).context("serializing reply")?;
    if body.len() <= CHUNK_THRESHOLD_BYTES {
        return Ok(vec![ReplyEnvelope::Whole(reply.clone())]);
    }

    let encoded = BASE64.encode(&body);
    let chunks: Vec<&[u8]> = encoded.as_bytes().chunks(CHUNK_THRESHOLD_BYTES).collect();
    let total_chunks = chunks.len() as u32;
    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(i, slice)| {
            ReplyEnvelope::Chunk(ChunkEnvelope {
                request_id: reply.request_id.clone(),
                chunk_index: i as u32,
                total_chunks,
                // `encoded` is ASCII base64, so any byte-aligned slice is
                // still valid UTF-8.
                chunk: std::str::from_utf8(slice).expect("base64 alphabet is ASCII").to_string(),
            })
        })
        .collect())
}

/// Accumulates chunks for a single in-flight chunked reply and produces
/// the reassembled [`WholeReply`] once the last one has arrived.
///
/// Kept mainly so the bridge's own tests can verify round-trips; real
/// clients perform the equivalent reassembly themselves.
#[derive(Default)]
pub struct Assembler {
    request_id: Option<String>,
    total_chunks: Option<u32>,
    received: Vec<Option<String>>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk in. Returns the reassembled reply once every chunk
    /// for its `requestId` has arrived, in any order.
    pub fn push(&mut self, chunk: ChunkEnvelope) -> anyhow::Result<Option<WholeReply>> {
        match &self.request_id {
            Some(id) if *id != chunk.request_id => {
                return Err(anyhow!(
                    "chunk for request {} arrived mid-assembly of request {}",
                    chunk.request_id,
                    id
                ));
            }
            Some(_) => {}
            None => {
                self.request_id = Some(chunk.request_id.clone());
                self.total_chunks = Some(chunk.total_chunks);
                self.received = vec![None; chunk.total_chunks as usize];
            }
        }

        if chunk.total_chunks != self.total_chunks.unwrap() {
            return Err(anyhow!("totalChunks changed mid-assembly"));
        }
        let idx = chunk.chunk_index as usize;
        if idx >= self.received.len() {
            return Err(anyhow!("chunkIndex {} out of range", idx));
        }
        self.received[idx] = Some(chunk.chunk);

        if self.received.iter().any(Option::is_none) {
            return Ok(None);
        }

        let encoded: String = self.received.iter().map(|c| c.as_ref().unwrap().as_str()).collect();
        let body = BASE64.decode(encoded.as_bytes()).context("decoding reassembled base64")?;
        let reply: WholeReply = serde_json::from_slice(&body).context("decoding reassembled reply")?;

        self.request_id = None;
        self.total_chunks = None;
        self.received.clear();

        Ok(Some(reply))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn small_reply_is_sent_whole() {
        let reply = WholeReply::ok("r1", serde_json::json!({"ok": true}));
        let envs = encode(&reply).unwrap();
        assert_eq!(envs.len(), 1);
        assert!(matches!(envs[0], ReplyEnvelope::Whole(_)));
    }

    #[test]
    fn oversized_reply_round_trips_through_chunks() {
        let big = "x".repeat(CHUNK_THRESHOLD_BYTES * 3);
        let reply = WholeReply::ok("r2", serde_json::json!({"blob": big}));
        let envs = encode(&reply).unwrap();
        assert!(envs.len() > 1);

        let mut assembler = Assembler::new();
        let mut result = None;
        for env in envs {
            let ReplyEnvelope::Chunk(c) = env else { panic!("expected chunk") };
            result = assembler.push(c).unwrap();
        }
        assert_eq!(result.unwrap(), reply);
    }
}
