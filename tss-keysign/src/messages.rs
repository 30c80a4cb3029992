#![forbid(unsafe_code)]

//! Wire envelopes and control frames. Everything on the wire is
//! self-describing JSON; raw byte fields travel base64-encoded.

use std::fmt;

use serde::{Deserialize, Serialize};

use tss_core::PeerId;

use crate::error::Result;
use crate::party::PartyId;

/// Frame type, used together with the message id to route a frame to the
/// right session channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    TSSKeyGenMsg,
    TSSKeySignMsg,
    TSSKeyGenVerMsg,
    TSSKeySignVerMsg,
    TSSControlMsg,
    TSSTaskDone,
    Unknown,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::TSSKeyGenMsg => "TSSKeyGenMsg",
            MessageType::TSSKeySignMsg => "TSSKeySignMsg",
            MessageType::TSSKeyGenVerMsg => "TSSKeyGenVerMsg",
            MessageType::TSSKeySignVerMsg => "TSSKeySignVerMsg",
            MessageType::TSSControlMsg => "TSSControlMsg",
            MessageType::TSSTaskDone => "TSSTaskDone",
            MessageType::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// The outer frame every session payload travels in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WrappedMessage {
    pub message_type: MessageType,
    pub msg_id: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl WrappedMessage {
    pub fn new(message_type: MessageType, msg_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            msg_id: msg_id.into(),
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(buf)?)
    }
}

/// A frame as delivered by the transport: who it came from plus the
/// serialized [`WrappedMessage`].
#[derive(Clone, Debug)]
pub struct Message {
    pub peer_id: PeerId,
    pub payload: Vec<u8>,
}

/// Outbound frame plus its explicit target set.
#[derive(Clone, Debug)]
pub struct BroadcastEnvelope {
    pub wrapped: WrappedMessage,
    pub peers: Vec<PeerId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRouting {
    pub from: PartyId,
    pub to: Vec<PartyId>,
    pub is_broadcast: bool,
}

/// One round message produced by the signing engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMessage {
    pub routing: MessageRouting,
    pub round_info: String,
    #[serde(with = "base64_bytes")]
    pub message: Vec<u8>,
}

impl WireMessage {
    /// Cache key, unique per (sender, round).
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.routing.from.id, self.round_info)
    }
}

/// Hash echo for a broadcast message: "this is what I saw from `key`".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastConfirmMessage {
    pub party_id: String,
    pub key: String,
    pub hash: String,
}

/// Broadcast by a peer once its signing parties have all finished.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TssTaskNotifier {
    pub task_done: bool,
}

/// Session control frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TssControlMsg {
    /// Ask the original sender to re-send the cached frame under `key`
    /// directly to the requester.
    MsgRequest { key: String },
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}
