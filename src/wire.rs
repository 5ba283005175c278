//! # Wire Protocol
//!
//! Every peer link carries a bidirectional stream of newline-delimited UTF-8
//! JSON objects, tagged by a `"type"` field:
//!
//! | Tag | Message | Authentication |
//! |-----|---------|----------------|
//! | `HEARTBEAT` | [`Heartbeat`] | PoW nonce + signature over `"seq:"+seq` |
//! | `LEAVE` | [`Leave`] | signature over `"type:LEAVE:"+hex(id)` |
//! | `CHAT` | [`Chat`] | GLOBAL scope: signature over `"chat:"+hex(id)` |
//!
//! ## Decoder Discipline
//!
//! Untrusted input is decoded in two steps: parse into a `serde_json::Value`,
//! dispatch on the tag, then convert into a typed struct with
//! `deny_unknown_fields`. This enforces an exact per-tag field allowlist:
//! unknown tags and frames carrying extra or mistyped fields are rejected.
//! Total frame length is bounded by the configured maximum on both encode
//! and decode, and the frame reader discards oversized lines without ever
//! buffering more than the limit.
//!
//! Binary values (ids, signatures) travel as lowercase hex strings.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;

use crate::identity::NodeId;

/// Default bound on the total encoded size of one frame, newline included.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;

/// Maximum chat content length in characters.
pub const MAX_CHAT_CONTENT_CHARS: usize = 140;

/// Error type for wire encode/decode failures.
///
/// Every variant is a silent drop at the protocol level; the engine only
/// counts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Frame exceeds the configured maximum size.
    Oversized,
    /// Not valid UTF-8 JSON, not an object, or a field failed its type check.
    Malformed,
    /// The `type` tag is missing or not one of the known tags.
    UnknownType,
    /// A field violated a protocol bound (e.g. chat content too long).
    InvalidField,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Oversized => write!(f, "frame exceeds maximum message size"),
            WireError::Malformed => write!(f, "frame is not a well-formed message object"),
            WireError::UnknownType => write!(f, "unknown or missing message type"),
            WireError::InvalidField => write!(f, "field violates protocol bounds"),
        }
    }
}

impl std::error::Error for WireError {}

/// A 64-byte Ed25519 signature, hex-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SigBytes(pub [u8; 64]);

impl SigBytes {
    pub fn from_signature(sig: ed25519_dalek::Signature) -> Self {
        Self(sig.to_bytes())
    }
}

impl std::fmt::Debug for SigBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigBytes({}..)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for SigBytes {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for SigBytes {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
        Ok(Self(arr))
    }
}

/// Content address of a GLOBAL chat message:
/// `SHA-256(hex(sender) || content || decimal(timestamp))`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatId(pub [u8; 32]);

impl ChatId {
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChatId({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for ChatId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for ChatId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("chat id must be 32 bytes"))?;
        Ok(Self(arr))
    }
}

/// Chat dissemination scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChatScope {
    /// Accepted only from a directly connected author, never relayed.
    Local,
    /// Content-addressed, signed, and flooded under the hop budget.
    Global,
}

impl std::str::FromStr for ChatScope {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOCAL" => Ok(ChatScope::Local),
            "GLOBAL" => Ok(ChatScope::Global),
            _ => Err(WireError::InvalidField),
        }
    }
}

/// Signed liveness announcement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Heartbeat {
    pub id: NodeId,
    pub seq: u64,
    pub hops: u8,
    pub nonce: u64,
    pub sig: SigBytes,
}

/// Signed graceful-departure announcement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Leave {
    pub id: NodeId,
    pub hops: u8,
    pub sig: SigBytes,
}

/// Short chat message riding the relay fabric.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Chat {
    pub sender: NodeId,
    pub content: String,
    pub timestamp: u64,
    pub scope: ChatScope,
    pub hops: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ChatId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<SigBytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<NodeId>,
}

/// A decoded wire message.
#[derive(Clone, Debug, PartialEq)]
pub enum WireMessage {
    Heartbeat(Heartbeat),
    Leave(Leave),
    Chat(Chat),
}

impl WireMessage {
    fn tag(&self) -> &'static str {
        match self {
            WireMessage::Heartbeat(_) => "HEARTBEAT",
            WireMessage::Leave(_) => "LEAVE",
            WireMessage::Chat(_) => "CHAT",
        }
    }

    /// Encode as one newline-terminated JSON frame.
    ///
    /// # Errors
    /// Returns [`WireError::Oversized`] if the encoded frame would exceed
    /// `max_len` bytes (newline included).
    pub fn encode_line(&self, max_len: usize) -> Result<Vec<u8>, WireError> {
        let mut value = match self {
            WireMessage::Heartbeat(m) => serde_json::to_value(m),
            WireMessage::Leave(m) => serde_json::to_value(m),
            WireMessage::Chat(m) => serde_json::to_value(m),
        }
        .map_err(|_| WireError::Malformed)?;

        let obj = value.as_object_mut().ok_or(WireError::Malformed)?;
        obj.insert(
            "type".to_string(),
            serde_json::Value::String(self.tag().to_string()),
        );

        let mut line = serde_json::to_vec(&value).map_err(|_| WireError::Malformed)?;
        line.push(b'\n');
        if line.len() > max_len {
            return Err(WireError::Oversized);
        }
        Ok(line)
    }

    /// Decode one frame (without the trailing newline).
    ///
    /// Enforces the size bound, the `type` tag, the exact per-tag field
    /// allowlist, field types, and the chat content length.
    pub fn decode_line(line: &[u8], max_len: usize) -> Result<WireMessage, WireError> {
        if line.len() >= max_len {
            return Err(WireError::Oversized);
        }
        let text = std::str::from_utf8(line).map_err(|_| WireError::Malformed)?;
        let mut value: serde_json::Value =
            serde_json::from_str(text).map_err(|_| WireError::Malformed)?;
        let obj = value.as_object_mut().ok_or(WireError::Malformed)?;

        let tag = match obj.remove("type") {
            Some(serde_json::Value::String(s)) => s,
            _ => return Err(WireError::UnknownType),
        };

        match tag.as_str() {
            "HEARTBEAT" => {
                let msg: Heartbeat =
                    serde_json::from_value(value).map_err(|_| WireError::Malformed)?;
                Ok(WireMessage::Heartbeat(msg))
            }
            "LEAVE" => {
                let msg: Leave = serde_json::from_value(value).map_err(|_| WireError::Malformed)?;
                Ok(WireMessage::Leave(msg))
            }
            "CHAT" => {
                let msg: Chat = serde_json::from_value(value).map_err(|_| WireError::Malformed)?;
                if msg.content.chars().count() > MAX_CHAT_CONTENT_CHARS {
                    return Err(WireError::InvalidField);
                }
                Ok(WireMessage::Chat(msg))
            }
            _ => Err(WireError::UnknownType),
        }
    }
}

// ============================================================================
// Signing payloads
// ============================================================================
//
// The ASCII prefixes ("seq:", "type:LEAVE:", "chat:") double as domain
// separation: a signature over one payload kind can never be replayed as
// another.

/// Payload signed by a heartbeat: `"seq:" + decimal(seq)`.
pub fn heartbeat_signing_payload(seq: u64) -> Vec<u8> {
    format!("seq:{}", seq).into_bytes()
}

/// Payload signed by a leave: `"type:LEAVE:" + hex(id)`.
pub fn leave_signing_payload(id: &NodeId) -> Vec<u8> {
    format!("type:LEAVE:{}", id.to_hex()).into_bytes()
}

/// Payload signed by a GLOBAL chat: `"chat:" + hex(chat_id)`.
pub fn chat_signing_payload(id: &ChatId) -> Vec<u8> {
    format!("chat:{}", id.to_hex()).into_bytes()
}

/// Compute the content address of a chat message.
pub fn chat_content_id(sender: &NodeId, content: &str, timestamp: u64) -> ChatId {
    let mut hasher = Sha256::new();
    hasher.update(sender.to_hex().as_bytes());
    hasher.update(content.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    ChatId(hasher.finalize().into())
}

// ============================================================================
// Frame reading
// ============================================================================

/// Outcome of one frame-read attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameRead {
    /// One complete line, newline stripped.
    Frame(Vec<u8>),
    /// A line longer than the limit was discarded up to its newline.
    Oversized,
    /// The stream ended. A trailing partial line is dropped.
    Eof,
}

/// Read one newline-delimited frame, buffering at most `max_len` bytes.
///
/// Oversized lines are consumed and reported without ever holding more
/// than `max_len` bytes of them in memory.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> std::io::Result<FrameRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    let mut discarding = false;

    loop {
        let (consumed, newline) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(FrameRead::Eof);
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let fits = !discarding && line.len() + pos <= max_len;
                    if fits {
                        line.extend_from_slice(&buf[..pos]);
                    }
                    (pos + 1, Some(fits))
                }
                None => {
                    if !discarding {
                        if line.len() + buf.len() > max_len {
                            discarding = true;
                            line.clear();
                        } else {
                            line.extend_from_slice(buf);
                        }
                    }
                    (buf.len(), None)
                }
            }
        };
        reader.consume(consumed);
        match newline {
            Some(true) => return Ok(FrameRead::Frame(line)),
            Some(false) => return Ok(FrameRead::Oversized),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use tokio::io::{AsyncWriteExt, BufReader};

    fn sample_sig() -> SigBytes {
        SigBytes([7u8; 64])
    }

    fn sample_heartbeat() -> Heartbeat {
        Heartbeat {
            id: NodeId::from_bytes([1u8; 32]),
            seq: 42,
            hops: 1,
            nonce: 77,
            sig: sample_sig(),
        }
    }

    fn roundtrip(msg: WireMessage) -> WireMessage {
        let line = msg.encode_line(DEFAULT_MAX_MESSAGE_SIZE).expect("encode failed");
        assert_eq!(*line.last().unwrap(), b'\n');
        WireMessage::decode_line(&line[..line.len() - 1], DEFAULT_MAX_MESSAGE_SIZE)
            .expect("decode failed")
    }

    #[test]
    fn heartbeat_roundtrip() {
        let msg = WireMessage::Heartbeat(sample_heartbeat());
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn leave_roundtrip() {
        let msg = WireMessage::Leave(Leave {
            id: NodeId::from_bytes([2u8; 32]),
            hops: 0,
            sig: sample_sig(),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn chat_roundtrip_global() {
        let sender = NodeId::from_bytes([3u8; 32]);
        let id = chat_content_id(&sender, "hello mesh", 1_700_000_000_000);
        let msg = WireMessage::Chat(Chat {
            sender,
            content: "hello mesh".to_string(),
            timestamp: 1_700_000_000_000,
            scope: ChatScope::Global,
            hops: 2,
            id: Some(id),
            sig: Some(sample_sig()),
            target: None,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn chat_roundtrip_local_omits_optional_fields() {
        let msg = WireMessage::Chat(Chat {
            sender: NodeId::from_bytes([4u8; 32]),
            content: "hi".to_string(),
            timestamp: 5,
            scope: ChatScope::Local,
            hops: 0,
            id: None,
            sig: None,
            target: None,
        });
        let line = msg.encode_line(DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let text = std::str::from_utf8(&line).unwrap();
        assert!(!text.contains("\"id\""));
        assert!(!text.contains("\"sig\""));
        assert!(!text.contains("\"target\""));
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn unknown_type_rejected() {
        let line = br#"{"type":"GOSSIP","id":"00"}"#;
        assert_eq!(
            WireMessage::decode_line(line, DEFAULT_MAX_MESSAGE_SIZE),
            Err(WireError::UnknownType)
        );
    }

    #[test]
    fn missing_type_rejected() {
        let line = br#"{"id":"00","seq":1}"#;
        assert_eq!(
            WireMessage::decode_line(line, DEFAULT_MAX_MESSAGE_SIZE),
            Err(WireError::UnknownType)
        );
    }

    #[test]
    fn non_object_rejected() {
        assert_eq!(
            WireMessage::decode_line(b"[1,2,3]", DEFAULT_MAX_MESSAGE_SIZE),
            Err(WireError::Malformed)
        );
        assert_eq!(
            WireMessage::decode_line(b"not json at all", DEFAULT_MAX_MESSAGE_SIZE),
            Err(WireError::Malformed)
        );
    }

    #[test]
    fn extra_field_violates_allowlist() {
        let msg = WireMessage::Heartbeat(sample_heartbeat());
        let line = msg.encode_line(DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let mut value: serde_json::Value =
            serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("extra".into(), serde_json::Value::Bool(true));
        let tampered = serde_json::to_vec(&value).unwrap();

        assert_eq!(
            WireMessage::decode_line(&tampered, DEFAULT_MAX_MESSAGE_SIZE),
            Err(WireError::Malformed)
        );
    }

    #[test]
    fn missing_required_field_rejected() {
        // Heartbeat without `sig`.
        let line = format!(
            r#"{{"type":"HEARTBEAT","id":"{}","seq":1,"hops":0,"nonce":0}}"#,
            "11".repeat(32)
        );
        assert_eq!(
            WireMessage::decode_line(line.as_bytes(), DEFAULT_MAX_MESSAGE_SIZE),
            Err(WireError::Malformed)
        );
    }

    #[test]
    fn mistyped_field_rejected() {
        let line = format!(
            r#"{{"type":"HEARTBEAT","id":"{}","seq":"one","hops":0,"nonce":0,"sig":"{}"}}"#,
            "11".repeat(32),
            "22".repeat(64)
        );
        assert_eq!(
            WireMessage::decode_line(line.as_bytes(), DEFAULT_MAX_MESSAGE_SIZE),
            Err(WireError::Malformed)
        );
    }

    #[test]
    fn hops_out_of_u8_range_rejected() {
        let line = format!(
            r#"{{"type":"HEARTBEAT","id":"{}","seq":1,"hops":300,"nonce":0,"sig":"{}"}}"#,
            "11".repeat(32),
            "22".repeat(64)
        );
        assert_eq!(
            WireMessage::decode_line(line.as_bytes(), DEFAULT_MAX_MESSAGE_SIZE),
            Err(WireError::Malformed)
        );
    }

    #[test]
    fn bad_signature_length_rejected() {
        let line = format!(
            r#"{{"type":"HEARTBEAT","id":"{}","seq":1,"hops":0,"nonce":0,"sig":"{}"}}"#,
            "11".repeat(32),
            "22".repeat(16)
        );
        assert_eq!(
            WireMessage::decode_line(line.as_bytes(), DEFAULT_MAX_MESSAGE_SIZE),
            Err(WireError::Malformed)
        );
    }

    #[test]
    fn chat_content_boundary() {
        let make = |len: usize| {
            WireMessage::Chat(Chat {
                sender: NodeId::from_bytes([5u8; 32]),
                content: "x".repeat(len),
                timestamp: 1,
                scope: ChatScope::Local,
                hops: 0,
                id: None,
                sig: None,
                target: None,
            })
        };

        let at_limit = make(MAX_CHAT_CONTENT_CHARS)
            .encode_line(DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap();
        assert!(WireMessage::decode_line(
            &at_limit[..at_limit.len() - 1],
            DEFAULT_MAX_MESSAGE_SIZE
        )
        .is_ok());

        let over = make(MAX_CHAT_CONTENT_CHARS + 1)
            .encode_line(DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap();
        assert_eq!(
            WireMessage::decode_line(&over[..over.len() - 1], DEFAULT_MAX_MESSAGE_SIZE),
            Err(WireError::InvalidField)
        );
    }

    #[test]
    fn oversized_frame_rejected() {
        let msg = WireMessage::Heartbeat(sample_heartbeat());
        let line = msg.encode_line(DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(
            WireMessage::decode_line(&line[..line.len() - 1], 32),
            Err(WireError::Oversized)
        );
        assert_eq!(msg.encode_line(32), Err(WireError::Oversized));
    }

    #[test]
    fn content_id_is_deterministic_and_binding() {
        let sender = Keypair::generate().node_id();
        let a = chat_content_id(&sender, "hello", 1000);
        let b = chat_content_id(&sender, "hello", 1000);
        assert_eq!(a, b);

        assert_ne!(a, chat_content_id(&sender, "hello!", 1000));
        assert_ne!(a, chat_content_id(&sender, "hello", 1001));
        let other = Keypair::generate().node_id();
        assert_ne!(a, chat_content_id(&other, "hello", 1000));
    }

    #[test]
    fn signing_payloads_are_domain_separated() {
        let id = NodeId::from_bytes([9u8; 32]);
        let chat = ChatId([9u8; 32]);

        let hb = heartbeat_signing_payload(7);
        let lv = leave_signing_payload(&id);
        let ch = chat_signing_payload(&chat);

        assert!(hb.starts_with(b"seq:"));
        assert!(lv.starts_with(b"type:LEAVE:"));
        assert!(ch.starts_with(b"chat:"));
        assert_ne!(hb, lv);
        assert_ne!(lv, ch);
    }

    #[tokio::test]
    async fn read_frame_splits_lines() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(rx);

        tx.write_all(b"first\nsecond\n").await.unwrap();
        drop(tx);

        assert_eq!(
            read_frame(&mut reader, 64).await.unwrap(),
            FrameRead::Frame(b"first".to_vec())
        );
        assert_eq!(
            read_frame(&mut reader, 64).await.unwrap(),
            FrameRead::Frame(b"second".to_vec())
        );
        assert_eq!(read_frame(&mut reader, 64).await.unwrap(), FrameRead::Eof);
    }

    #[tokio::test]
    async fn read_frame_discards_oversized_line() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut reader = BufReader::new(rx);

        let long = vec![b'x'; 200];
        tx.write_all(&long).await.unwrap();
        tx.write_all(b"\nok\n").await.unwrap();
        drop(tx);

        assert_eq!(read_frame(&mut reader, 64).await.unwrap(), FrameRead::Oversized);
        assert_eq!(
            read_frame(&mut reader, 64).await.unwrap(),
            FrameRead::Frame(b"ok".to_vec())
        );
    }

    #[tokio::test]
    async fn read_frame_drops_trailing_partial_line() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(rx);

        tx.write_all(b"complete\npartial").await.unwrap();
        drop(tx);

        assert_eq!(
            read_frame(&mut reader, 64).await.unwrap(),
            FrameRead::Frame(b"complete".to_vec())
        );
        assert_eq!(read_frame(&mut reader, 64).await.unwrap(), FrameRead::Eof);
    }
}
