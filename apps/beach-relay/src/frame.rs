//! Wire messages exchanged between peers and the relay.
//!
//! Both messages are JSON objects. Over a peer's WebSocket a binary frame always
//! carries a [`CallRequest`] and a text frame always carries a [`CallResponse`];
//! the frame type, not the payload, decides how an inbound frame is dispatched.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Outcome code carried by a [`CallResponse`]. Values follow the gRPC status
/// code numbering so existing peers can reuse their client libraries. A reply
/// that omits the code is `Ok`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum CallStatus {
    #[default]
    Ok,
    InvalidArgument,
    DeadlineExceeded,
    Unavailable,
    /// Any other code a peer chose to answer with; forwarded untouched.
    Unknown(i32),
}

impl CallStatus {
    pub fn code(self) -> i32 {
        match self {
            CallStatus::Ok => 0,
            CallStatus::InvalidArgument => 3,
            CallStatus::DeadlineExceeded => 4,
            CallStatus::Unavailable => 14,
            CallStatus::Unknown(code) => code,
        }
    }
}

impl From<i32> for CallStatus {
    fn from(code: i32) -> Self {
        match code {
            0 => CallStatus::Ok,
            3 => CallStatus::InvalidArgument,
            4 => CallStatus::DeadlineExceeded,
            14 => CallStatus::Unavailable,
            other => CallStatus::Unknown(other),
        }
    }
}

impl From<CallStatus> for i32 {
    fn from(status: CallStatus) -> Self {
        status.code()
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("invalid frame payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Reasons a decoded [`CallRequest`] is refused before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid peer id")]
    InvalidPeerId,
    #[error("invalid call id")]
    InvalidCallId,
    #[error("invalid method")]
    InvalidMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    /// Identity of the peer the call is addressed to.
    #[serde(default)]
    pub peer_id: String,
    /// Caller-chosen correlation key, echoed by the response.
    #[serde(default)]
    pub call_id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl CallRequest {
    pub fn new(
        peer_id: impl Into<String>,
        call_id: impl Into<String>,
        method: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            call_id: call_id.into(),
            method: method.into(),
            data: data.into(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.peer_id.is_empty() {
            return Err(ValidationError::InvalidPeerId);
        }
        if self.call_id.is_empty() {
            return Err(ValidationError::InvalidCallId);
        }
        if self.method.is_empty() {
            return Err(ValidationError::InvalidMethod);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    #[serde(default)]
    pub call_id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub status: CallStatus,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl CallResponse {
    pub fn ok(call_id: impl Into<String>, method: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            call_id: call_id.into(),
            method: method.into(),
            status: CallStatus::Ok,
            data,
        }
    }

    /// Fixed reply for a request frame that could not be decoded or validated.
    /// It carries no call id because none could be trusted.
    pub fn malformed() -> Self {
        Self {
            call_id: String::new(),
            method: String::new(),
            status: CallStatus::InvalidArgument,
            data: Vec::new(),
        }
    }

    pub fn peer_offline(call_id: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            method: method.into(),
            status: CallStatus::Unavailable,
            data: Vec::new(),
        }
    }

    pub fn call_timeout(call_id: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            method: method.into(),
            status: CallStatus::DeadlineExceeded,
            data: Vec::new(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    /// JSON text for a WebSocket text frame.
    pub fn to_text(&self) -> String {
        String::from_utf8(self.to_bytes()).unwrap_or_default()
    }
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    // Only plain strings, integers and base64 text are serialized here.
    serde_json::to_vec(value).unwrap_or_default()
}

/// Opaque payloads travel as standard base64 text. `null` and a missing key
/// both decode to an empty payload.
mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(text) if !text.is_empty() => STANDARD
                .decode(text.as_bytes())
                .map_err(serde::de::Error::custom),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn decodes_request_with_base64_payload() {
        let raw = json!({
            "peerId": "peer-a",
            "callId": "c1",
            "method": "ping",
            "data": "aGVsbG8="
        })
        .to_string();

        let request = CallRequest::from_bytes(raw.as_bytes()).unwrap();
        assert_eq!(request.peer_id, "peer-a");
        assert_eq!(request.call_id, "c1");
        assert_eq!(request.method, "ping");
        assert_eq!(request.data, b"hello");
        assert!(request.validate().is_ok());
    }

    #[test_timeout::timeout]
    fn null_or_missing_data_normalizes_to_empty() {
        let with_null = br#"{"peerId":"a","callId":"c","method":"m","data":null}"#;
        let missing = br#"{"peerId":"a","callId":"c","method":"m"}"#;

        assert!(CallRequest::from_bytes(with_null).unwrap().data.is_empty());
        assert!(CallRequest::from_bytes(missing).unwrap().data.is_empty());
    }

    #[test_timeout::timeout]
    fn validation_fails_closed_in_field_order() {
        let mut request = CallRequest::new("", "", "", Vec::new());
        assert_eq!(request.validate(), Err(ValidationError::InvalidPeerId));

        request.peer_id = "a".into();
        assert_eq!(request.validate(), Err(ValidationError::InvalidCallId));

        request.call_id = "c".into();
        assert_eq!(request.validate(), Err(ValidationError::InvalidMethod));

        request.method = "m".into();
        assert_eq!(request.validate(), Ok(()));
    }

    #[test_timeout::timeout]
    fn empty_and_garbage_frames_are_rejected() {
        assert!(matches!(CallRequest::from_bytes(b""), Err(FrameError::Empty)));
        assert!(matches!(
            CallRequest::from_bytes(b"not json"),
            Err(FrameError::InvalidJson(_))
        ));
        assert!(matches!(
            CallResponse::from_bytes(br#"{"callId":"c","status":"ok"}"#),
            Err(FrameError::InvalidJson(_))
        ));
    }

    #[test_timeout::timeout]
    fn status_is_a_small_integer_on_the_wire() {
        let response = CallResponse::peer_offline("c9", "ping");
        let value: serde_json::Value = serde_json::from_slice(&response.to_bytes()).unwrap();
        assert_eq!(value["status"], 14);
        assert_eq!(value["callId"], "c9");
        assert_eq!(value["data"], "");

        assert_eq!(CallResponse::call_timeout("c", "m").status.code(), 4);
        assert_eq!(CallResponse::malformed().status.code(), 3);
        assert_eq!(CallStatus::from(7), CallStatus::Unknown(7));
    }

    #[test_timeout::timeout]
    fn response_text_frame_decodes_back() {
        let response = CallResponse::ok("c1", "ping", b"pong".to_vec());
        let decoded = CallResponse::from_bytes(response.to_text().as_bytes()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test_timeout::timeout]
    fn reply_without_status_decodes_as_ok() {
        let response =
            CallResponse::from_bytes(br#"{"callId":"c1","method":"ping","data":""}"#).unwrap();
        assert_eq!(response.status, CallStatus::Ok);
        assert_eq!(response, CallResponse::ok("c1", "ping", Vec::new()));
    }
}
