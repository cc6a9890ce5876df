//! Wire Codec & Chunk Assembler (spec.md §4.1, §6). Frames/reassembles
//! textual messages on the bidirectional channel and defines the JSON
//! message grammar exchanged over it.

use indexmap::IndexMap;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::diff::RecordOp;
use crate::error::{IncompatibilityReason, SyncError};
use crate::records::RecordId;
use crate::schema::SchemaVersions;

pub type RecordOpMap = IndexMap<RecordId, RecordOp>;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Connect {
        connect_request_id: String,
        protocol_version: u32,
        schema: SchemaVersions,
        last_server_clock: u64,
    },
    Push {
        client_clock: u64,
        #[serde(default)]
        diff: Option<RecordOpMap>,
        #[serde(default)]
        presence: Option<RecordOp>,
    },
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HydrationType {
    WipeAll,
    WipePresence,
}

/// The `push_result.action` field: `"commit" | "discard" | {rebase_with_diff:
/// diff}` (spec.md §6). Hand-written `Serialize` since the three cases mix a
/// bare string with a single-key object, which no serde enum representation
/// produces directly.
#[derive(Debug, Clone)]
pub enum PushAction {
    Commit,
    Discard,
    RebaseWithDiff(RecordOpMap),
}

impl Serialize for PushAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PushAction::Commit => serializer.serialize_str("commit"),
            PushAction::Discard => serializer.serialize_str("discard"),
            PushAction::RebaseWithDiff(diff) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("rebase_with_diff", diff)?;
                map.end()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connect {
        connect_request_id: String,
        hydration_type: HydrationType,
        protocol_version: u32,
        schema: SchemaVersions,
        server_clock: u64,
        diff: RecordOpMap,
    },
    Patch {
        diff: RecordOpMap,
        server_clock: u64,
    },
    PushResult {
        client_clock: u64,
        server_clock: u64,
        action: PushAction,
    },
    Pong,
    IncompatibilityError {
        reason: IncompatibilityReason,
    },
    /// A debounce-batched envelope carrying one or more originally-separate
    /// `patch`/`push_result` messages (spec.md §4.2's outstanding buffer).
    Data {
        data: Vec<ServerMessage>,
    },
    Error {
        error: String,
    },
}

enum AssemblerState {
    Idle,
    Assembling {
        expected_remaining: u32,
        buffer: String,
    },
}

/// Inbound chunk reassembly state machine (spec.md §4.1). One instance per
/// connected socket.
pub struct ChunkAssembler {
    state: AssemblerState,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self {
            state: AssemblerState::Idle,
        }
    }

    /// Feed one frame. Returns `Ok(Some(message))` once a full message has
    /// been assembled, `Ok(None)` while still waiting on more chunks, and
    /// `Err` on any protocol violation (never partially emits, per spec.md
    /// §4.1's contract).
    pub fn feed(&mut self, frame: &str) -> Result<Option<ClientMessage>, SyncError> {
        match self.feed_raw(frame)? {
            Some(joined) => parse_message(&joined),
            None => Ok(None),
        }
    }

    /// Drives the same chunk-reassembly state machine as [`Self::feed`] but
    /// returns the joined JSON text instead of parsing it as a
    /// [`ClientMessage`]. Lets callers reassemble frames regardless of which
    /// message type they decode to (e.g. verifying outbound `ServerMessage`
    /// chunking end-to-end).
    fn feed_raw(&mut self, frame: &str) -> Result<Option<String>, SyncError> {
        match &mut self.state {
            AssemblerState::Idle => {
                if frame.starts_with('{') {
                    Ok(Some(frame.to_string()))
                } else {
                    let (remaining, rest) = parse_chunk_prefix(frame)?;
                    if remaining == 0 {
                        return Err(SyncError::Protocol(
                            "chunk sequence cannot start at 0 remaining".into(),
                        ));
                    }
                    self.state = AssemblerState::Assembling {
                        expected_remaining: remaining - 1,
                        buffer: rest.to_string(),
                    };
                    Ok(None)
                }
            }
            AssemblerState::Assembling {
                expected_remaining,
                buffer,
            } => {
                let (remaining, rest) = match parse_chunk_prefix(frame) {
                    Ok(v) => v,
                    Err(e) => {
                        self.state = AssemblerState::Idle;
                        return Err(e);
                    }
                };
                if remaining != *expected_remaining {
                    self.state = AssemblerState::Idle;
                    return Err(SyncError::Protocol(format!(
                        "out-of-order chunk: expected {expected_remaining} remaining, got {remaining}"
                    )));
                }
                buffer.push_str(rest);
                if remaining == 0 {
                    let joined = std::mem::take(buffer);
                    self.state = AssemblerState::Idle;
                    Ok(Some(joined))
                } else {
                    *expected_remaining -= 1;
                    Ok(None)
                }
            }
        }
    }
}

/// Joins a full sequence of frames produced by [`encode_outbound`] back into
/// the original JSON text, without assuming which message type it decodes
/// to. Used to verify chunking round-trips for messages the host never
/// parses as a [`ClientMessage`] (i.e. anything server-to-client).
pub fn reassemble_frames(frames: &[String]) -> Result<String, SyncError> {
    let mut assembler = ChunkAssembler::new();
    let mut joined = None;
    for frame in frames {
        joined = assembler.feed_raw(frame)?;
    }
    joined.ok_or_else(|| SyncError::Protocol("frame sequence did not complete a message".into()))
}

fn parse_message(text: &str) -> Result<Option<ClientMessage>, SyncError> {
    let msg = serde_json::from_str(text)
        .map_err(|e| SyncError::Protocol(format!("invalid JSON message: {e}")))?;
    Ok(Some(msg))
}

fn parse_chunk_prefix(frame: &str) -> Result<(u32, &str), SyncError> {
    let (n_str, rest) = frame.split_once('_').ok_or_else(|| {
        SyncError::Protocol(format!(
            "frame is neither a JSON object nor a chunk prefix: {frame:?}"
        ))
    })?;
    let n: u32 = n_str
        .parse()
        .map_err(|_| SyncError::Protocol(format!("invalid chunk-remaining prefix: {n_str:?}")))?;
    Ok((n, rest))
}

/// Outbound framing (spec.md §4.1): serialize, and chunk if the payload
/// exceeds `max_safe_message_size` chars.
pub fn encode_outbound(msg: &ServerMessage, max_safe_message_size: usize) -> Vec<String> {
    let payload = serde_json::to_string(msg).expect("ServerMessage always serializes");
    if payload.chars().count() <= max_safe_message_size {
        return vec![payload];
    }
    let chars: Vec<char> = payload.chars().collect();
    let total_chunks = chars.len().div_ceil(max_safe_message_size);
    let mut frames = Vec::with_capacity(total_chunks);
    for i in 0..total_chunks {
        let start = i * max_safe_message_size;
        let end = (start + max_safe_message_size).min(chars.len());
        let remaining = total_chunks - 1 - i;
        let chunk: String = chars[start..end].iter().collect();
        frames.push(format!("{remaining}_{chunk}"));
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_frame_starting_with_brace_parses_immediately() {
        let mut assembler = ChunkAssembler::new();
        let msg = assembler.feed(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, Some(ClientMessage::Ping)));
    }

    #[test]
    fn chunked_message_reassembles_in_order() {
        let mut assembler = ChunkAssembler::new();
        assert!(assembler.feed(r#"1_{"type":"#).unwrap().is_none());
        let msg = assembler.feed(r#"0_"ping"}"#).unwrap();
        assert!(matches!(msg, Some(ClientMessage::Ping)));
    }

    #[test]
    fn out_of_order_chunk_is_protocol_error() {
        let mut assembler = ChunkAssembler::new();
        assembler.feed(r#"2_{"type":"#).unwrap();
        let err = assembler.feed(r#"2_oops"#).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn encode_outbound_chunks_large_payloads() {
        let msg = ServerMessage::Pong;
        let small = encode_outbound(&msg, 1024);
        assert_eq!(small.len(), 1);
        assert!(!small[0].starts_with(char::is_numeric));

        let large = encode_outbound(&msg, 3);
        assert!(large.len() > 1);
        for (i, frame) in large.iter().enumerate() {
            let expected_remaining = large.len() - 1 - i;
            assert!(frame.starts_with(&format!("{expected_remaining}_")));
        }
    }

    #[test]
    fn reassemble_frames_round_trips_encode_outbound() {
        let msg = ServerMessage::Patch { diff: RecordOpMap::new(), server_clock: 7 };
        let original = serde_json::to_string(&msg).unwrap();
        let frames = encode_outbound(&msg, 5);
        assert!(frames.len() > 1);
        let joined = reassemble_frames(&frames).unwrap();
        assert_eq!(joined, original);
    }

    #[test]
    fn push_action_rebase_serializes_as_object() {
        let action = PushAction::RebaseWithDiff(RecordOpMap::new());
        let s = serde_json::to_string(&action).unwrap();
        assert_eq!(s, r#"{"rebase_with_diff":{}}"#);
        assert_eq!(serde_json::to_string(&PushAction::Commit).unwrap(), r#""commit""#);
    }
}
