use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    SdpOffer,
    SdpAnswer,
    IceCandidate,
    /// Anything else the channel sends (`STATUS_RESPONSE`, `GO_AWAY`, ...).
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::SdpOffer => "SDP_OFFER",
            Action::SdpAnswer => "SDP_ANSWER",
            Action::IceCandidate => "ICE_CANDIDATE",
            Action::Other(name) => name,
        }
    }

    pub fn from_wire(name: &str) -> Self {
        match name {
            "SDP_OFFER" => Action::SdpOffer,
            "SDP_ANSWER" => Action::SdpAnswer,
            "ICE_CANDIDATE" => Action::IceCandidate,
            other => Action::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpKind::Offer,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpKind::Answer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Payload of one wire message, typed by its action.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
    Raw(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalingMessage {
    pub action: Action,
    pub payload: SignalPayload,
    pub sender_id: Option<String>,
    pub recipient_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("{0} message without messagePayload")]
    MissingPayload(Action),
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("malformed {action} payload: {source}")]
    Payload {
        action: Action,
        #[source]
        source: serde_json::Error,
    },
    #[error("{action} payload carries a {found:?} description")]
    DescriptionKind { action: Action, found: SdpKind },
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("payload cannot be sent as {0}")]
    PayloadMismatch(Action),
    #[error("payload serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundEnvelope<'a> {
    action: &'a str,
    message_payload: String,
    recipient_client_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundEnvelope {
    #[serde(alias = "messageType")]
    action: String,
    #[serde(default)]
    message_payload: Option<String>,
    #[serde(default)]
    sender_client_id: Option<String>,
    #[serde(default)]
    recipient_client_id: Option<String>,
}

/// Serializes one outbound message. An empty `recipient_id` lets the channel
/// route to the sole counterpart.
pub fn encode(
    action: &Action,
    payload: &SignalPayload,
    recipient_id: &str,
) -> Result<String, EncodeError> {
    let inner = match (action, payload) {
        (Action::SdpOffer, SignalPayload::Description(desc)) if desc.kind == SdpKind::Offer => {
            serde_json::to_vec(desc)?
        }
        (Action::SdpAnswer, SignalPayload::Description(desc)) if desc.kind == SdpKind::Answer => {
            serde_json::to_vec(desc)?
        }
        (Action::IceCandidate, SignalPayload::Candidate(candidate)) => {
            serde_json::to_vec(candidate)?
        }
        (Action::Other(_), SignalPayload::Raw(value)) => serde_json::to_vec(value)?,
        _ => return Err(EncodeError::PayloadMismatch(action.clone())),
    };
    let envelope = OutboundEnvelope {
        action: action.as_str(),
        message_payload: BASE64_STANDARD.encode(inner),
        recipient_client_id: recipient_id,
    };
    Ok(serde_json::to_string(&envelope)?)
}

pub fn decode(wire: &str) -> Result<SignalingMessage, DecodeError> {
    if wire.trim().is_empty() {
        return Err(DecodeError::Empty);
    }
    let envelope: InboundEnvelope = serde_json::from_str(wire).map_err(DecodeError::Envelope)?;
    let action = Action::from_wire(&envelope.action);

    let payload = match &action {
        Action::SdpOffer | Action::SdpAnswer => {
            let bytes = payload_bytes(&action, envelope.message_payload.as_deref())?;
            let desc: SessionDescription = parse_payload(&action, &bytes)?;
            let expected = if action == Action::SdpOffer {
                SdpKind::Offer
            } else {
                SdpKind::Answer
            };
            if desc.kind != expected {
                return Err(DecodeError::DescriptionKind {
                    action,
                    found: desc.kind,
                });
            }
            SignalPayload::Description(desc)
        }
        Action::IceCandidate => {
            let bytes = payload_bytes(&action, envelope.message_payload.as_deref())?;
            SignalPayload::Candidate(parse_payload(&action, &bytes)?)
        }
        Action::Other(_) => SignalPayload::Raw(raw_payload(envelope.message_payload.as_deref())),
    };

    Ok(SignalingMessage {
        action,
        payload,
        sender_id: envelope.sender_client_id,
        recipient_id: envelope.recipient_client_id,
    })
}

fn payload_bytes(action: &Action, encoded: Option<&str>) -> Result<Vec<u8>, DecodeError> {
    match encoded.map(str::trim) {
        Some(encoded) if !encoded.is_empty() => Ok(BASE64_STANDARD.decode(encoded)?),
        _ => Err(DecodeError::MissingPayload(action.clone())),
    }
}

fn parse_payload<T: for<'de> Deserialize<'de>>(
    action: &Action,
    bytes: &[u8],
) -> Result<T, DecodeError> {
    serde_json::from_slice(bytes).map_err(|source| DecodeError::Payload {
        action: action.clone(),
        source,
    })
}

// Unknown actions are never fatal; keep whatever can be recovered.
fn raw_payload(encoded: Option<&str>) -> Value {
    let Some(encoded) = encoded.filter(|s| !s.trim().is_empty()) else {
        return Value::Null;
    };
    BASE64_STANDARD
        .decode(encoded.trim())
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_else(|| Value::String(encoded.to_string()))
}
