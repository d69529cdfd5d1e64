//! Cross-context message vocabulary shared by host page, chat frame and sign-in popup.
//!
//! Every message is an [`Envelope`] (`{ type, payload? }`). Inbound envelopes are decoded into the
//! closed [`InboundMessage`] union so dispatch can match exhaustively.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    WidgetReady,
    UserSignedIn,
    UserSignedOut,
    Resize,
    Error,
    UpdateConfig,
    SignOut,
    WidgetAuthSuccess,
    WidgetAuthError,
}

impl MessageType {
    pub const ALL: [MessageType; 9] = [
        Self::WidgetReady,
        Self::UserSignedIn,
        Self::UserSignedOut,
        Self::Resize,
        Self::Error,
        Self::UpdateConfig,
        Self::SignOut,
        Self::WidgetAuthSuccess,
        Self::WidgetAuthError,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WidgetReady => "WIDGET_READY",
            Self::UserSignedIn => "USER_SIGNED_IN",
            Self::UserSignedOut => "USER_SIGNED_OUT",
            Self::Resize => "RESIZE",
            Self::Error => "ERROR",
            Self::UpdateConfig => "UPDATE_CONFIG",
            Self::SignOut => "SIGN_OUT",
            Self::WidgetAuthSuccess => "WIDGET_AUTH_SUCCESS",
            Self::WidgetAuthError => "WIDGET_AUTH_ERROR",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|message_type| message_type.as_str() == raw)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message data is not an object")]
    NotAnObject,
    #[error("message has no string `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("invalid {message_type} payload: {reason}")]
    InvalidPayload {
        message_type: MessageType,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    #[must_use]
    pub fn new(message_type: MessageType, payload: Option<Value>) -> Self {
        Self {
            message_type: message_type.as_str().to_string(),
            payload,
        }
    }

    #[must_use]
    pub fn update_config(patch: Value) -> Self {
        Self::new(MessageType::UpdateConfig, Some(patch))
    }

    #[must_use]
    pub fn sign_out() -> Self {
        Self::new(MessageType::SignOut, None)
    }

    pub fn decode(data: &Value) -> Result<Self, DecodeError> {
        let object = data.as_object().ok_or(DecodeError::NotAnObject)?;
        let message_type = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?;
        Ok(Self {
            message_type: message_type.to_string(),
            payload: object.get("payload").filter(|value| !value.is_null()).cloned(),
        })
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("type".to_string(), Value::String(self.message_type.clone()));
        if let Some(payload) = &self.payload {
            object.insert("payload".to_string(), payload.clone());
        }
        Value::Object(object)
    }

    fn payload_or_null(&self) -> &Value {
        self.payload.as_ref().unwrap_or(&Value::Null)
    }
}

/// Identity delivered by the sign-in popup or the chat frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    #[serde(alias = "userId")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AuthUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            name: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameMessage {
    Ready,
    UserSignedIn(AuthUser),
    UserSignedOut,
    Resize { height: f64 },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthHandshake {
    Success(AuthUser),
    Failure { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Frame(FrameMessage),
    Auth(AuthHandshake),
    /// A host→frame type seen on the inbound channel (for example our own post reflected back).
    HostBound(MessageType),
}

impl InboundMessage {
    pub fn decode(envelope: &Envelope) -> Result<Self, DecodeError> {
        let message_type = MessageType::parse(&envelope.message_type)
            .ok_or_else(|| DecodeError::UnknownType(envelope.message_type.clone()))?;
        let payload = envelope.payload_or_null();
        let message = match message_type {
            MessageType::WidgetReady => Self::Frame(FrameMessage::Ready),
            MessageType::UserSignedIn => {
                Self::Frame(FrameMessage::UserSignedIn(decode_user(message_type, payload)?))
            }
            MessageType::UserSignedOut => Self::Frame(FrameMessage::UserSignedOut),
            MessageType::Resize => {
                let height = payload
                    .get("height")
                    .and_then(Value::as_f64)
                    .filter(|height| height.is_finite())
                    .ok_or_else(|| DecodeError::InvalidPayload {
                        message_type,
                        reason: "height must be a finite number".to_string(),
                    })?;
                Self::Frame(FrameMessage::Resize { height })
            }
            MessageType::Error => Self::Frame(FrameMessage::Error {
                message: string_field(payload, "message")
                    .unwrap_or_else(|| "chat frame reported an error".to_string()),
            }),
            MessageType::WidgetAuthSuccess => {
                Self::Auth(AuthHandshake::Success(decode_user(message_type, payload)?))
            }
            MessageType::WidgetAuthError => Self::Auth(AuthHandshake::Failure {
                error: string_field(payload, "error")
                    .unwrap_or_else(|| "authentication failed".to_string()),
            }),
            MessageType::UpdateConfig | MessageType::SignOut => Self::HostBound(message_type),
        };
        Ok(message)
    }
}

fn decode_user(message_type: MessageType, payload: &Value) -> Result<AuthUser, DecodeError> {
    serde_json::from_value(payload.clone()).map_err(|error| DecodeError::InvalidPayload {
        message_type,
        reason: error.to_string(),
    })
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(data: Value) -> Result<InboundMessage, DecodeError> {
        InboundMessage::decode(&Envelope::decode(&data)?)
    }

    #[test]
    fn message_type_names_match_wire_strings() {
        for message_type in MessageType::ALL {
            let wire = serde_json::to_value(message_type).expect("encode type");
            assert_eq!(wire, Value::String(message_type.as_str().to_string()));
            assert_eq!(MessageType::parse(message_type.as_str()), Some(message_type));
        }
        assert_eq!(MessageType::parse("widget_ready"), None);
    }

    #[test]
    fn envelope_requires_object_with_string_type() {
        assert_eq!(
            Envelope::decode(&json!("WIDGET_READY")),
            Err(DecodeError::NotAnObject)
        );
        assert_eq!(
            Envelope::decode(&json!({ "type": 7 })),
            Err(DecodeError::MissingType)
        );
        assert_eq!(
            Envelope::decode(&json!({ "payload": {} })),
            Err(DecodeError::MissingType)
        );
        let envelope = Envelope::decode(&json!({ "type": "WIDGET_READY", "payload": null }))
            .expect("decode envelope");
        assert_eq!(envelope.payload, None);
    }

    #[test]
    fn decodes_frame_messages() {
        assert_eq!(
            decode(json!({ "type": "WIDGET_READY" })),
            Ok(InboundMessage::Frame(FrameMessage::Ready))
        );
        assert_eq!(
            decode(json!({ "type": "RESIZE", "payload": { "height": 512 } })),
            Ok(InboundMessage::Frame(FrameMessage::Resize { height: 512.0 }))
        );
        assert_eq!(
            decode(json!({ "type": "ERROR", "payload": { "message": "quota exceeded" } })),
            Ok(InboundMessage::Frame(FrameMessage::Error {
                message: "quota exceeded".to_string()
            }))
        );

        let Ok(InboundMessage::Frame(FrameMessage::UserSignedIn(user))) = decode(json!({
            "type": "USER_SIGNED_IN",
            "payload": { "id": "user-1", "email": "ada@example.com", "plan": "pro" }
        })) else {
            panic!("expected signed-in message");
        };
        assert_eq!(user.id, "user-1");
        assert_eq!(user.email.as_deref(), Some("ada@example.com"));
        assert_eq!(user.extra.get("plan"), Some(&json!("pro")));
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(
            decode(json!({ "type": "RESIZE", "payload": { "height": "tall" } })),
            Err(DecodeError::InvalidPayload {
                message_type: MessageType::Resize,
                ..
            })
        ));
        assert!(matches!(
            decode(json!({ "type": "WIDGET_AUTH_SUCCESS", "payload": { "email": "x@y.z" } })),
            Err(DecodeError::InvalidPayload { .. })
        ));
        assert_eq!(
            decode(json!({ "type": "CUSTOM_THING" })),
            Err(DecodeError::UnknownType("CUSTOM_THING".to_string()))
        );
    }

    #[test]
    fn decodes_auth_handshake() {
        assert_eq!(
            decode(json!({ "type": "WIDGET_AUTH_ERROR", "payload": { "error": "denied" } })),
            Ok(InboundMessage::Auth(AuthHandshake::Failure {
                error: "denied".to_string()
            }))
        );
        assert_eq!(
            decode(json!({ "type": "WIDGET_AUTH_SUCCESS", "payload": { "userId": "u-9" } })),
            Ok(InboundMessage::Auth(AuthHandshake::Success(AuthUser::new("u-9"))))
        );
    }

    #[test]
    fn outbound_envelopes_serialize_with_type_field() {
        assert_eq!(Envelope::sign_out().to_value(), json!({ "type": "SIGN_OUT" }));
        assert_eq!(
            Envelope::update_config(json!({ "theme": "dark" })).to_value(),
            json!({ "type": "UPDATE_CONFIG", "payload": { "theme": "dark" } })
        );
    }
}
