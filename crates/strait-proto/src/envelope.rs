use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Endpoint id used for relay-level messages that belong to no endpoint.
pub const RELAY_LEVEL_ID: i64 = -1;

/// Keys that may carry an endpoint id, in lookup order.
const ENDPOINT_ID_KEYS: [&str; 3] = ["id", "player_id", "app_id"];

const KNOWN_TYPES: &[&str] = &[
    "offer",
    "answer",
    "iceCandidate",
    "id",
    "role",
    "playerConnected",
    "playerDisconnected",
    "serverDisconnected",
    "playerCount",
    "config",
    "control",
    "buffer",
    "error",
    "ping",
    "pong",
    "ok",
    "todo",
    "bridge",
];

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope has no string `type` field")]
    MissingType,
    #[error("unknown envelope type `{0}`")]
    UnknownType(String),
    #[error("malformed `{kind}` envelope: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("envelope text is not JSON: {0}")]
    Syntax(#[from] serde_json::Error),
}

/// ICE candidate as carried inside an `iceCandidate` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BufferFormat {
    #[default]
    Raw,
    Base64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BufferState {
    Start,
    Transit,
    Stop,
}

/// Body of a `buffer` envelope.
///
/// The sender uses `start`/`size`/`format` and `stop`; the receiver answers
/// every step with an acknowledgement carrying `name`/`state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BufferControl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<BufferFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<BufferState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
}

impl BufferControl {
    pub fn start(name: impl Into<String>, size: u64, format: BufferFormat) -> Self {
        Self {
            start: Some(name.into()),
            size: Some(size),
            format: Some(format),
            ..Self::default()
        }
    }

    pub fn stop(name: impl Into<String>) -> Self {
        Self {
            stop: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn ack(name: impl Into<String>, state: BufferState, amount: Option<u64>) -> Self {
        Self {
            name: Some(name.into()),
            state: Some(state),
            amount,
            ..Self::default()
        }
    }
}

/// A JSON envelope, discriminated by its `type` field.
///
/// Relay metadata (`id`, `rpc`) rides alongside the variant fields and is
/// ignored here; use [`endpoint_id`] and [`stamp_endpoint_id`] on the raw
/// value for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: CandidatePayload,
    },
    Id {
        id: i64,
    },
    Role {
        role: String,
    },
    PlayerConnected {},
    PlayerDisconnected {},
    ServerDisconnected {},
    PlayerCount {
        #[serde(default)]
        count: u32,
    },
    Config {
        #[serde(rename = "peerConnectionOptions", default)]
        peer_connection_options: Value,
    },
    Control {
        message: String,
    },
    Buffer(BufferControl),
    Error {
        message: String,
    },
    Ping {},
    Pong {},
    Ok {},
    Todo {},
    Bridge {
        port: u16,
        session: u64,
    },
}

impl Envelope {
    /// Parses a JSON value, telling unknown types apart from malformed known ones.
    pub fn from_value(value: &Value) -> Result<Self, EnvelopeError> {
        let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;
        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingType)?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(EnvelopeError::UnknownType(kind.to_string()));
        }
        Envelope::deserialize(value).map_err(|source| EnvelopeError::Malformed {
            kind: kind.to_string(),
            source,
        })
    }

    pub fn from_text(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    pub fn to_value(&self) -> Value {
        // Every variant serializes to a plain JSON object.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::IceCandidate { .. } => "iceCandidate",
            Envelope::Id { .. } => "id",
            Envelope::Role { .. } => "role",
            Envelope::PlayerConnected {} => "playerConnected",
            Envelope::PlayerDisconnected {} => "playerDisconnected",
            Envelope::ServerDisconnected {} => "serverDisconnected",
            Envelope::PlayerCount { .. } => "playerCount",
            Envelope::Config { .. } => "config",
            Envelope::Control { .. } => "control",
            Envelope::Buffer(_) => "buffer",
            Envelope::Error { .. } => "error",
            Envelope::Ping {} => "ping",
            Envelope::Pong {} => "pong",
            Envelope::Ok {} => "ok",
            Envelope::Todo {} => "todo",
            Envelope::Bridge { .. } => "bridge",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error {
            message: message.into(),
        }
    }
}

/// `type` field of a raw envelope, if present.
pub fn envelope_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// Endpoint id carried by a relayed envelope.
///
/// Looks at `id`, `player_id` and `app_id` in that order and accepts both
/// integers and numeric strings, since signaling servers disagree on which
/// they send.
pub fn endpoint_id(value: &Value) -> Option<i64> {
    ENDPOINT_ID_KEYS.iter().find_map(|key| match value.get(*key)? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    })
}

/// Writes `id` into a relayed envelope. Non-objects are left untouched.
pub fn stamp_endpoint_id(value: &mut Value, id: i64) -> bool {
    match value.as_object_mut() {
        Some(object) => {
            object.insert("id".to_string(), Value::from(id));
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ice_candidate_uses_browser_field_names() {
        let value = json!({
            "type": "iceCandidate",
            "candidate": {
                "candidate": "candidate:1 1 UDP 2122252543 10.0.0.2 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        });
        let envelope = Envelope::from_value(&value).expect("parse");
        match &envelope {
            Envelope::IceCandidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected envelope {other:?}"),
        }
        assert_eq!(envelope.to_value(), value);
    }

    #[test]
    fn relay_fields_do_not_disturb_parsing() {
        let value = json!({"type": "control", "message": "hello", "id": 4, "rpc": 9});
        assert_eq!(
            Envelope::from_value(&value).unwrap(),
            Envelope::Control {
                message: "hello".into()
            }
        );
        assert_eq!(endpoint_id(&value), Some(4));
    }

    #[test]
    fn unknown_and_malformed_types_are_distinguished() {
        assert!(matches!(
            Envelope::from_value(&json!({"type": "teleport"})),
            Err(EnvelopeError::UnknownType(kind)) if kind == "teleport"
        ));
        assert!(matches!(
            Envelope::from_value(&json!({"type": "offer"})),
            Err(EnvelopeError::Malformed { kind, .. }) if kind == "offer"
        ));
        assert!(matches!(
            Envelope::from_value(&json!({"sdp": "v=0"})),
            Err(EnvelopeError::MissingType)
        ));
        assert!(matches!(
            Envelope::from_value(&json!([1, 2])),
            Err(EnvelopeError::NotAnObject)
        ));
    }

    #[test]
    fn buffer_control_serializes_only_present_fields() {
        let start = Envelope::Buffer(BufferControl::start("points", 96, BufferFormat::Base64));
        assert_eq!(
            start.to_value(),
            json!({"type": "buffer", "start": "points", "size": 96, "format": "base64"})
        );
        let stop = Envelope::Buffer(BufferControl::stop("points"));
        assert_eq!(stop.to_value(), json!({"type": "buffer", "stop": "points"}));
    }

    #[test]
    fn endpoint_id_falls_back_through_alias_keys() {
        assert_eq!(endpoint_id(&json!({"player_id": "17"})), Some(17));
        assert_eq!(endpoint_id(&json!({"app_id": 3})), Some(3));
        assert_eq!(endpoint_id(&json!({"id": 1, "app_id": 3})), Some(1));
        assert_eq!(endpoint_id(&json!({"type": "ping"})), None);

        let mut value = json!({"type": "ping"});
        assert!(stamp_endpoint_id(&mut value, RELAY_LEVEL_ID));
        assert_eq!(endpoint_id(&value), Some(-1));
        assert!(!stamp_endpoint_id(&mut json!("text"), 2));
    }
}
