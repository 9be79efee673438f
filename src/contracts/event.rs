use serde::de::DeserializeOwned;
use serde_json::Value;

/// Stable routing keys published on the projects exchange.
pub mod routing_key {
    pub const PROJECT_DRAFT_CREATED: &str = "project.draft-created";
    pub const PROJECT_UPDATED: &str = "project.updated";
    pub const PROJECT_DELETED: &str = "project.deleted";

    // Forwarded to the CRM as connect events.
    pub const USER_CREATED: &str = "identity.notification.create";
    pub const USER_TRAIT_UPDATED: &str = "member.action.profile.trait.update";
    pub const RESOURCE_BOOKING_CREATED: &str = "taas.resourcebooking.created";
    pub const RESOURCE_BOOKING_UPDATED: &str = "taas.resourcebooking.updated";
    pub const PROJECT_ACTION_CREATE: &str = "project.action.create";
    pub const PROJECT_ACTION_UPDATE: &str = "project.action.update";
    pub const PROJECT_ACTION_DELETE: &str = "project.action.delete";

    /// Reserved suffix for dead-letter names. Redrive keeps the original key.
    pub const FAILED_SUFFIX: &str = ".failed";
}

/// Parsed message body. The core enforces only that it is a JSON object;
/// the exact shape belongs to the handler.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent(Value);

impl DecodedEvent {
    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Deserializes the payload into a handler-specific shape.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.0)
    }
}

impl From<Value> for DecodedEvent {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Parses raw delivery content. A failure here is terminal for the message.
pub fn decode(content: &[u8]) -> Result<DecodedEvent, DecodeError> {
    if content.is_empty() {
        return Err(DecodeError::Empty);
    }

    let value: Value =
        serde_json::from_slice(content).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    if !value.is_object() {
        return Err(DecodeError::NotAnObject(json_kind(&value)));
    }

    Ok(DecodedEvent(value))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Message content is empty")]
    Empty,

    #[error("Message content is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Message content must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_decode_object() {
        let event = decode(br#"{"id": 42, "members": []}"#).unwrap();
        assert_eq!(event.value()["id"], json!(42));
    }

    #[test]
    fn test_decode_rejects_malformed_content() {
        for raw in [
            &b"not json"[..],
            &b"{\"id\":"[..],
            &b"\xff\xfe\x00"[..],
            &b"{'single': 'quotes'}"[..],
        ] {
            assert!(
                matches!(decode(raw), Err(DecodeError::InvalidJson(_))),
                "expected invalid JSON for {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_decode_rejects_empty_and_non_objects() {
        assert_eq!(decode(b""), Err(DecodeError::Empty));
        assert_eq!(decode(b"[1,2]"), Err(DecodeError::NotAnObject("array")));
        assert_eq!(decode(b"\"foo\""), Err(DecodeError::NotAnObject("string")));
        assert_eq!(decode(b"null"), Err(DecodeError::NotAnObject("null")));
    }

    #[test]
    fn test_parse_typed_payload() {
        #[derive(Deserialize)]
        struct Project {
            id: i64,
        }

        let event = decode(br#"{"id": 7, "name": "demo"}"#).unwrap();
        let project: Project = event.parse().unwrap();
        assert_eq!(project.id, 7);
        assert!(event.parse::<Vec<String>>().is_err());
    }
}
