//! Schema-tagged JSON codec
//!
//! A payload is the message's JSON object with one extra member, `@type`,
//! holding the message's [`Message::TYPE_TAG`]. Object keys are emitted in
//! sorted order, so the same message always encodes to the same bytes.

use super::messages::Message;
use serde_json::{Map, Value};
use thiserror::Error;

/// Member carrying the type tag in every payload
pub const TYPE_FIELD: &str = "@type";

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Message {0} did not serialize to a JSON object")]
    NotAnObject(&'static str),
    #[error("Failed to serialize {message_type}")]
    Serialize {
        message_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("Payload is not a JSON object")]
    NotAnObject,
    #[error("Payload has no '{TYPE_FIELD}' tag")]
    MissingTypeTag,
    #[error("Expected message type {expected}, payload is tagged {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("Payload does not match schema of {message_type}: {source}")]
    Schema {
        message_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode a message into its wire payload
pub fn encode<M: Message>(message: &M) -> Result<Vec<u8>, EncodeError> {
    let value = serde_json::to_value(message).map_err(|source| EncodeError::Serialize {
        message_type: M::TYPE_TAG,
        source,
    })?;

    let Value::Object(mut object) = value else {
        return Err(EncodeError::NotAnObject(M::TYPE_TAG));
    };
    object.insert(TYPE_FIELD.to_string(), Value::String(M::TYPE_TAG.to_string()));

    serde_json::to_vec(&Value::Object(object)).map_err(|source| EncodeError::Serialize {
        message_type: M::TYPE_TAG,
        source,
    })
}

/// Decode a payload as `M`, checking its type tag first
pub fn decode<M: Message>(payload: &[u8]) -> Result<M, DecodeError> {
    let value: Value = serde_json::from_slice(payload).map_err(DecodeError::Malformed)?;
    let Value::Object(mut object) = value else {
        return Err(DecodeError::NotAnObject);
    };

    check_type_tag(&mut object, M::TYPE_TAG)?;

    serde_json::from_value(Value::Object(object)).map_err(|source| DecodeError::Schema {
        message_type: M::TYPE_TAG,
        source,
    })
}

/// Read the type tag of a payload without decoding the rest
pub fn peek_type_tag(payload: &[u8]) -> Result<String, DecodeError> {
    let value: Value = serde_json::from_slice(payload).map_err(DecodeError::Malformed)?;
    match value {
        Value::Object(object) => match object.get(TYPE_FIELD) {
            Some(Value::String(tag)) => Ok(tag.clone()),
            _ => Err(DecodeError::MissingTypeTag),
        },
        _ => Err(DecodeError::NotAnObject),
    }
}

fn check_type_tag(object: &mut Map<String, Value>, expected: &'static str) -> Result<(), DecodeError> {
    match object.remove(TYPE_FIELD) {
        Some(Value::String(tag)) if tag == expected => Ok(()),
        Some(Value::String(found)) => Err(DecodeError::TypeMismatch { expected, found }),
        Some(other) => Err(DecodeError::TypeMismatch {
            expected,
            found: other.to_string(),
        }),
        None => Err(DecodeError::MissingTypeTag),
    }
}
