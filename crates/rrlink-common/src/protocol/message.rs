//! Logical messages carried inside frames.
//!
//! RPC payloads travel in a `dps` envelope keyed by the protocol number:
//!
//! ```text
//! {"dps": {"101": "{\"id\":1,\"method\":\"get_status\",\"params\":[]}"}, "t": 1700000000}
//! ```
//!
//! Protocols without an RPC body (map data, hello exchanges, ...) keep their
//! decrypted bytes untouched.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::error::{Result, RrError};
use super::{Request, RequestId, Response};

/// Protocol number stored in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// 101: controller-to-device RPC request
    RpcRequest,
    /// 102: device-to-controller RPC response or push
    RpcResponse,
    /// Any other protocol number, decoded as raw bytes
    Other(u16),
}

impl Protocol {
    pub const fn code(self) -> u16 {
        match self {
            Protocol::RpcRequest => 101,
            Protocol::RpcResponse => 102,
            Protocol::Other(code) => code,
        }
    }

    pub const fn from_code(code: u16) -> Self {
        match code {
            101 => Protocol::RpcRequest,
            102 => Protocol::RpcResponse,
            other => Protocol::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Request(Request),
    Response(Response),
    Raw(Vec<u8>),
}

/// The decrypted, decoded content of one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Frame sequence number
    pub seq: u32,
    /// Per-frame random value
    pub random: u32,
    /// Unix timestamp (seconds); also feeds key derivation
    pub timestamp: u32,
    pub protocol: Protocol,
    pub body: MessageBody,
}

#[derive(Serialize, Deserialize)]
struct DpsEnvelope {
    dps: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    t: u32,
}

impl Message {
    pub fn request(seq: u32, request: Request) -> Self {
        Self::new(seq, Protocol::RpcRequest, MessageBody::Request(request))
    }

    pub fn response(seq: u32, response: Response) -> Self {
        Self::new(seq, Protocol::RpcResponse, MessageBody::Response(response))
    }

    pub fn raw(seq: u32, protocol: Protocol, payload: Vec<u8>) -> Self {
        Self::new(seq, protocol, MessageBody::Raw(payload))
    }

    fn new(seq: u32, protocol: Protocol, body: MessageBody) -> Self {
        Message {
            seq,
            random: rand::random(),
            timestamp: unix_timestamp(),
            protocol,
            body,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_random(mut self, random: u32) -> Self {
        self.random = random;
        self
    }

    /// Request identifier of the RPC body, if there is one.
    pub fn id(&self) -> Option<RequestId> {
        match &self.body {
            MessageBody::Request(request) => Some(request.id),
            MessageBody::Response(response) => Some(response.id),
            MessageBody::Raw(_) => None,
        }
    }

    /// Serializes the body into the plaintext carried by the frame.
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let inner = match &self.body {
            MessageBody::Request(request) => serde_json::to_string(request)?,
            MessageBody::Response(response) => serde_json::to_string(response)?,
            MessageBody::Raw(bytes) => return Ok(bytes.clone()),
        };

        let mut dps = BTreeMap::new();
        dps.insert(
            self.protocol.code().to_string(),
            serde_json::Value::String(inner),
        );
        let envelope = DpsEnvelope {
            dps,
            t: self.timestamp,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Parses a decrypted payload for the given protocol.
    ///
    /// Any structural mismatch is reported as [`RrError::FrameCorrupt`].
    pub fn decode_payload(protocol: Protocol, plaintext: &[u8]) -> Result<MessageBody> {
        if !matches!(protocol, Protocol::RpcRequest | Protocol::RpcResponse) {
            return Ok(MessageBody::Raw(plaintext.to_vec()));
        }

        let envelope: DpsEnvelope = serde_json::from_slice(plaintext)
            .map_err(|e| RrError::FrameCorrupt(format!("invalid dps envelope: {}", e)))?;

        let key = protocol.code().to_string();
        let value = envelope.dps.get(&key).ok_or_else(|| {
            RrError::FrameCorrupt(format!("dps envelope has no entry for protocol {}", key))
        })?;

        // Devices send the inner object as a JSON string; tolerate a bare object too
        let inner = match value {
            serde_json::Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
                .map_err(|e| RrError::FrameCorrupt(format!("invalid dps body: {}", e)))?,
            other => other.clone(),
        };

        let body = match protocol {
            Protocol::RpcRequest => serde_json::from_value(inner).map(MessageBody::Request),
            _ => serde_json::from_value(inner).map(MessageBody::Response),
        };
        body.map_err(|e| RrError::FrameCorrupt(format!("invalid rpc body: {}", e)))
    }
}

/// Current Unix time in whole seconds.
pub fn unix_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
