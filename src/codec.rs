use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// Magic number identifying a gingle-rpc session.
pub const MAGIC_NUMBER: u64 = 0x3bef5c;

/// Trait for encoding and decoding header and body payloads
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Encode a serializable value into bytes
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode bytes into a deserializable value
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// Default codec (Bincode codec)
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| RpcError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

/// JSON codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| RpcError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

/// Body encoding negotiated in the session preamble, named on the wire by
/// its MIME-like string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecType {
    #[serde(rename = "application/bincode")]
    Bincode,
    #[serde(rename = "application/json")]
    Json,
}

impl CodecType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "application/bincode" => Some(CodecType::Bincode),
            "application/json" => Some(CodecType::Json),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CodecType::Bincode => "application/bincode",
            CodecType::Json => "application/json",
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecType::Bincode => BincodeCodec.encode(value),
            CodecType::Json => JsonCodec.encode(value),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecType::Bincode => BincodeCodec.decode(bytes),
            CodecType::Json => JsonCodec.decode(bytes),
        }
    }
}

impl Default for CodecType {
    fn default() -> Self {
        CodecType::Bincode
    }
}

/// Session preamble, encoded as JSON in the first frame of every
/// connection and never retransmitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    pub magic_number: u64,
    pub codec_type: CodecType,
    /// Bound on dial plus handshake on the client side. Zero means
    /// unbounded.
    #[serde(with = "duration_nanos")]
    pub connect_timeout: Duration,
    /// Bound on per-request handling on the server side. Zero means
    /// unbounded.
    #[serde(with = "duration_nanos")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::default(),
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    pub fn with_codec_type(mut self, codec_type: CodecType) -> Self {
        self.codec_type = codec_type;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }
}

/// Request and response header, one per frame pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    pub service_method: String,
    pub sequence_number: u64,
    /// Empty on requests and successful responses.
    pub error: String,
}

/// Durations travel as integer nanoseconds, matching the JSON shape of
/// the session preamble.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}
