//! RDV JSON envelope parsing and construction.
//!
//! Every wire message is a JSON object carrying a string `type`
//! discriminator plus type-specific fields. Inbound envelopes keep the
//! complete field map so a forwarded message round-trips every field the
//! relay does not interpret.

use crate::types::{ConnectionId, Role};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Field carrying opaque key material on `SET_ADMIN_KEY` and
/// `ADMIN_KEY_RESPONSE`.
pub const FIELD_KEY: &str = "key";
/// Field naming the routing target on admin-originated forwards.
pub const FIELD_TARGET_ID: &str = "targetId";
/// Field injected by the relay on every forwarded envelope.
pub const FIELD_SENDER_ID: &str = "senderId";

/// Wire `type` discriminator values.
///
/// Variants map 1:1 to the strings carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Admin caches its long-term public key on the relay.
    SetAdminKey,
    /// Any peer asks for the cached admin key.
    RequestAdminKey,
    /// Forwarded key-material envelope.
    PublicKey,
    /// Forwarded application message.
    Message,
    /// Relay-originated status notice.
    Status,
    /// Relay response carrying the cached admin key.
    AdminKeyResponse,
    /// Relay-originated error notice.
    Error,
    /// Notice to the admin that a user connected.
    NewUser,
    /// Notice to the admin that a user disconnected.
    UserLeft,
}

impl MessageType {
    /// Wire string for this message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SetAdminKey => "SET_ADMIN_KEY",
            Self::RequestAdminKey => "REQUEST_ADMIN_KEY",
            Self::PublicKey => "PUBLIC_KEY",
            Self::Message => "MESSAGE",
            Self::Status => "STATUS",
            Self::AdminKeyResponse => "ADMIN_KEY_RESPONSE",
            Self::Error => "ERROR",
            Self::NewUser => "NEW_USER",
            Self::UserLeft => "USER_LEFT",
        }
    }

    /// Parses a wire string into a message type.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "SET_ADMIN_KEY" => Some(Self::SetAdminKey),
            "REQUEST_ADMIN_KEY" => Some(Self::RequestAdminKey),
            "PUBLIC_KEY" => Some(Self::PublicKey),
            "MESSAGE" => Some(Self::Message),
            "STATUS" => Some(Self::Status),
            "ADMIN_KEY_RESPONSE" => Some(Self::AdminKeyResponse),
            "ERROR" => Some(Self::Error),
            "NEW_USER" => Some(Self::NewUser),
            "USER_LEFT" => Some(Self::UserLeft),
            _ => None,
        }
    }
}

/// Errors that can occur while parsing an inbound envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The text was not valid JSON.
    #[error("invalid json: {0}")]
    Syntax(#[from] serde_json::Error),
    /// The JSON value was not an object.
    #[error("envelope is not a json object")]
    NotAnObject,
    /// The object has no string `type` field.
    #[error("envelope has no type field")]
    MissingType,
    /// The `type` value matches no known message type.
    #[error("unknown message type {0:?}")]
    UnknownType(String),
}

/// A parsed inbound envelope.
///
/// Keeps the full field map so forwarding preserves fields the relay does
/// not recognize.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Parsed `type` discriminator.
    pub msg_type: MessageType,
    fields: Map<String, Value>,
}

impl Inbound {
    /// Parses a raw text frame into an envelope.
    ///
    /// # Errors
    ///
    /// Returns an [`EnvelopeError`] when the text is not a JSON object
    /// with a recognized string `type` field.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(fields) = value else {
            return Err(EnvelopeError::NotAnObject);
        };
        let type_str = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingType)?;
        let msg_type = MessageType::from_wire(type_str)
            .ok_or_else(|| EnvelopeError::UnknownType(type_str.to_owned()))?;
        Ok(Self { msg_type, fields })
    }

    /// Routing target for admin-originated forwards, when present.
    #[must_use]
    pub fn target_id(&self) -> Option<ConnectionId> {
        self.fields.get(FIELD_TARGET_ID).and_then(Value::as_u64)
    }

    /// Opaque key material, when present.
    #[must_use]
    pub fn key(&self) -> Option<&Value> {
        self.fields.get(FIELD_KEY)
    }

    /// Stamps the sender's identifier into the envelope and serializes it
    /// for delivery. A client-supplied `senderId` is overwritten.
    #[must_use]
    pub fn stamp_sender(mut self, sender: ConnectionId) -> String {
        self.fields.insert(FIELD_SENDER_ID.to_owned(), json!(sender));
        Value::Object(self.fields).to_string()
    }
}

/// `STATUS` greeting carrying the assigned role, sent once after connect.
#[must_use]
pub fn role_status(role: Role) -> String {
    json!({ "type": MessageType::Status.as_str(), "role": role.as_str() }).to_string()
}

/// `STATUS` notice with a human-readable message.
#[must_use]
pub fn status(message: &str) -> String {
    json!({ "type": MessageType::Status.as_str(), "message": message }).to_string()
}

/// `ERROR` notice with a human-readable message.
#[must_use]
pub fn error(message: &str) -> String {
    json!({ "type": MessageType::Error.as_str(), "message": message }).to_string()
}

/// `ADMIN_KEY_RESPONSE` carrying the cached admin key.
#[must_use]
pub fn admin_key_response(key: &Value) -> String {
    json!({ "type": MessageType::AdminKeyResponse.as_str(), "key": key }).to_string()
}

/// `NEW_USER` notice delivered to the admin when a user connects.
#[must_use]
pub fn new_user(user_id: ConnectionId) -> String {
    json!({ "type": MessageType::NewUser.as_str(), "userId": user_id }).to_string()
}

/// `USER_LEFT` notice delivered to the admin when a user disconnects.
#[must_use]
pub fn user_left(user_id: ConnectionId) -> String {
    json!({ "type": MessageType::UserLeft.as_str(), "userId": user_id }).to_string()
}
