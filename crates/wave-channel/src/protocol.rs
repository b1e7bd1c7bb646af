//! Wire protocol: typed messages and the JSON envelope that carries them.
//!
//! Every frame on the wire is one JSON object:
//!
//! ```json
//! {"sequenceNumber": 7, "messageType": "SubmitDeltaRequest", "message": { ... }}
//! ```
//!
//! Responses reuse the sequence number of the request they answer. A
//! streaming request receives any number of `OpenWaveletChannelStream`
//! messages under its sequence number; the one carrying a `terminator` ends
//! the stream.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use wave_core::{
    HashedVersion, RawFragment, ReturnStatus, SegmentId, TransformedWaveletDelta, WaveId,
    WaveletDelta, WaveletId,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWaveViewRequest {
    pub wave_id: WaveId,
}

/// One wavelet of a wave view: its head and a fragment per segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveletView {
    pub wavelet_id: WaveletId,
    pub version: HashedVersion,
    pub fragments: BTreeMap<SegmentId, RawFragment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWaveViewResponse {
    #[serde(default)]
    pub status: ReturnStatus,
    #[serde(default)]
    pub wavelets: Vec<WaveletView>,
}

/// Fetch segments of one wavelet over the window `(start, end_version]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFragmentsRequest {
    pub wavelet_id: WaveletId,
    /// Per segment, the version the caller already holds.
    pub start_versions: BTreeMap<SegmentId, u64>,
    pub end_version: u64,
    pub min_reply_size: usize,
    pub max_reply_size: usize,
    pub max_blips: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFragmentsResponse {
    #[serde(default)]
    pub status: ReturnStatus,
    #[serde(default)]
    pub fragments: BTreeMap<SegmentId, RawFragment>,
    /// The wavelet head when the reply was built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<HashedVersion>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenWaveletChannelRequest {
    pub wavelet_id: WaveletId,
    /// Replay every delta applied after this version before live updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_version: Option<HashedVersion>,
}

/// One message of an open wavelet channel: the channel-open event, an
/// incremental update, or the terminator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenWaveletChannelStream {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<TransformedWaveletDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_version: Option<HashedVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminator: Option<ReturnStatus>,
}

impl OpenWaveletChannelStream {
    pub fn opened(channel_id: impl Into<String>, version: HashedVersion) -> Self {
        Self {
            channel_id: Some(channel_id.into()),
            commit_version: Some(version),
            ..Default::default()
        }
    }

    pub fn update(delta: TransformedWaveletDelta) -> Self {
        Self {
            commit_version: Some(delta.resulting_version.clone()),
            delta: Some(delta),
            ..Default::default()
        }
    }

    pub fn terminated(status: ReturnStatus) -> Self {
        Self {
            terminator: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitDeltaRequest {
    pub channel_id: String,
    pub wavelet_id: WaveletId,
    pub delta: WaveletDelta,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitDeltaResponse {
    #[serde(default)]
    pub status: ReturnStatus,
    #[serde(default)]
    pub operations_applied: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_version_after_application: Option<HashedVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_after_application: Option<i64>,
}

impl SubmitDeltaResponse {
    pub fn failed(status: ReturnStatus) -> Self {
        Self {
            status,
            operations_applied: 0,
            hashed_version_after_application: None,
            timestamp_after_application: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseWaveletChannelRequest {
    pub channel_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyResponse {
    #[serde(default)]
    pub status: ReturnStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportAuthenticationRequest {
    pub token: String,
}

/// Unsolicited, session-fatal notice from the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFinished {
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

/// Every message type that can appear in an envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    FetchWaveViewRequest(FetchWaveViewRequest),
    FetchWaveViewResponse(FetchWaveViewResponse),
    FetchFragmentsRequest(FetchFragmentsRequest),
    FetchFragmentsResponse(FetchFragmentsResponse),
    OpenWaveletChannelRequest(OpenWaveletChannelRequest),
    OpenWaveletChannelStream(OpenWaveletChannelStream),
    SubmitDeltaRequest(SubmitDeltaRequest),
    SubmitDeltaResponse(SubmitDeltaResponse),
    CloseWaveletChannelRequest(CloseWaveletChannelRequest),
    EmptyResponse(EmptyResponse),
    TransportAuthenticationRequest(TransportAuthenticationRequest),
    RpcFinished(RpcFinished),
}

impl Message {
    /// The `messageType` string used on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::FetchWaveViewRequest(_) => "FetchWaveViewRequest",
            Message::FetchWaveViewResponse(_) => "FetchWaveViewResponse",
            Message::FetchFragmentsRequest(_) => "FetchFragmentsRequest",
            Message::FetchFragmentsResponse(_) => "FetchFragmentsResponse",
            Message::OpenWaveletChannelRequest(_) => "OpenWaveletChannelRequest",
            Message::OpenWaveletChannelStream(_) => "OpenWaveletChannelStream",
            Message::SubmitDeltaRequest(_) => "SubmitDeltaRequest",
            Message::SubmitDeltaResponse(_) => "SubmitDeltaResponse",
            Message::CloseWaveletChannelRequest(_) => "CloseWaveletChannelRequest",
            Message::EmptyResponse(_) => "EmptyResponse",
            Message::TransportAuthenticationRequest(_) => "TransportAuthenticationRequest",
            Message::RpcFinished(_) => "RpcFinished",
        }
    }

    /// Whether several messages may answer one request.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Message::OpenWaveletChannelStream(_))
    }

    /// Whether this is the last message for its sequence number.
    pub fn is_terminal(&self) -> bool {
        match self {
            Message::OpenWaveletChannelStream(stream) => stream.terminator.is_some(),
            _ => true,
        }
    }

    fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Message::FetchWaveViewRequest(m) => serde_json::to_value(m),
            Message::FetchWaveViewResponse(m) => serde_json::to_value(m),
            Message::FetchFragmentsRequest(m) => serde_json::to_value(m),
            Message::FetchFragmentsResponse(m) => serde_json::to_value(m),
            Message::OpenWaveletChannelRequest(m) => serde_json::to_value(m),
            Message::OpenWaveletChannelStream(m) => serde_json::to_value(m),
            Message::SubmitDeltaRequest(m) => serde_json::to_value(m),
            Message::SubmitDeltaResponse(m) => serde_json::to_value(m),
            Message::CloseWaveletChannelRequest(m) => serde_json::to_value(m),
            Message::EmptyResponse(m) => serde_json::to_value(m),
            Message::TransportAuthenticationRequest(m) => serde_json::to_value(m),
            Message::RpcFinished(m) => serde_json::to_value(m),
        }
    }

    fn from_payload(type_name: &str, payload: Value) -> Result<Self, ProtocolError> {
        let message = match type_name {
            "FetchWaveViewRequest" => Message::FetchWaveViewRequest(serde_json::from_value(payload)?),
            "FetchWaveViewResponse" => Message::FetchWaveViewResponse(serde_json::from_value(payload)?),
            "FetchFragmentsRequest" => Message::FetchFragmentsRequest(serde_json::from_value(payload)?),
            "FetchFragmentsResponse" => {
                Message::FetchFragmentsResponse(serde_json::from_value(payload)?)
            }
            "OpenWaveletChannelRequest" => {
                Message::OpenWaveletChannelRequest(serde_json::from_value(payload)?)
            }
            "OpenWaveletChannelStream" => {
                Message::OpenWaveletChannelStream(serde_json::from_value(payload)?)
            }
            "SubmitDeltaRequest" => Message::SubmitDeltaRequest(serde_json::from_value(payload)?),
            "SubmitDeltaResponse" => Message::SubmitDeltaResponse(serde_json::from_value(payload)?),
            "CloseWaveletChannelRequest" => {
                Message::CloseWaveletChannelRequest(serde_json::from_value(payload)?)
            }
            "EmptyResponse" => Message::EmptyResponse(serde_json::from_value(payload)?),
            "TransportAuthenticationRequest" => {
                Message::TransportAuthenticationRequest(serde_json::from_value(payload)?)
            }
            "RpcFinished" => Message::RpcFinished(serde_json::from_value(payload)?),
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(message)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    sequence_number: i32,
    message_type: String,
    message: Value,
}

/// A message tagged with the sequence number that correlates it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub sequence_number: i32,
    pub message: Message,
}

impl Envelope {
    pub fn new(sequence_number: i32, message: Message) -> Self {
        Self {
            sequence_number,
            message,
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let raw = RawEnvelope {
            sequence_number: self.sequence_number,
            message_type: self.message.type_name().to_string(),
            message: self.message.to_payload()?,
        };
        Ok(serde_json::to_string(&raw)?)
    }

    /// Parse a text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(frame)?;
        Ok(Self {
            sequence_number: raw.sequence_number,
            message: Message::from_payload(&raw.message_type, raw.message)?,
        })
    }
}
