//! Request/reply wire envelope
//!
//! Every request body carries at least `{"fcn": <verb>, "id": <caller>}`.
//! Replies are a closed union: an ack that echoes the verb and may carry
//! extra payload fields at the top level, or a nack with a human-readable
//! description of the exact precondition that failed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{LinkError, LinkResult};

/// Reply envelope, tagged by the `fcn` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fcn", rename_all = "snake_case")]
pub enum Reply {
    Ack {
        call: String,
        #[serde(flatten)]
        data: Map<String, Value>,
    },
    Nack {
        call: String,
        description: String,
    },
}

impl Reply {
    /// Plain ack for the given verb
    pub fn ack(call: impl Into<String>) -> Self {
        Self::Ack {
            call: call.into(),
            data: Map::new(),
        }
    }

    /// Ack carrying extra top-level payload fields
    ///
    /// `data` must serialize to a JSON object.
    pub fn ack_with(call: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".into(), other);
                map
            }
        };
        Self::Ack {
            call: call.into(),
            data,
        }
    }

    /// Nack with the description of the failed precondition
    pub fn nack(call: impl Into<String>, description: impl ToString) -> Self {
        Self::Nack {
            call: call.into(),
            description: description.to_string(),
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack { .. })
    }

    /// The verb this reply answers
    pub fn call(&self) -> &str {
        match self {
            Self::Ack { call, .. } | Self::Nack { call, .. } => call,
        }
    }

    /// Payload field lookup on an ack; `None` on nacks and missing keys
    pub fn field(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Ack { data, .. } => data.get(key),
            Self::Nack { .. } => None,
        }
    }

    /// The refusal description on a nack
    pub fn description(&self) -> Option<&str> {
        match self {
            Self::Ack { .. } => None,
            Self::Nack { description, .. } => Some(description),
        }
    }

    /// Ack payload, or `LinkError::Nack` carrying the description
    pub fn into_result(self) -> LinkResult<Map<String, Value>> {
        match self {
            Self::Ack { data, .. } => Ok(data),
            Self::Nack { description, .. } => Err(LinkError::Nack(description)),
        }
    }
}

/// Parse a reply body received over the wire
pub fn parse_reply(value: Value) -> LinkResult<Reply> {
    serde_json::from_value(value)
        .map_err(|e| LinkError::Invalid(format!("malformed reply: {e}")))
}

/// The verb of a raw request body, if present
pub fn fcn_of(msg: &Value) -> Option<&str> {
    msg.get("fcn").and_then(Value::as_str)
}

/// The caller id of a raw request body, if present
pub fn id_of(msg: &Value) -> Option<&str> {
    msg.get("id").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ack_wire_shape() {
        let reply = Reply::ack_with("register", json!({"id": "vehicle001"}));
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(wire, json!({"fcn": "ack", "call": "register", "id": "vehicle001"}));
    }

    #[test]
    fn test_nack_wire_shape() {
        let reply = Reply::nack("gogo", "another task is still running");
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            wire,
            json!({
                "fcn": "nack",
                "call": "gogo",
                "description": "another task is still running"
            })
        );
    }

    #[test]
    fn test_parse_reply_roundtrip() {
        let wire = json!({"fcn": "ack", "call": "clients", "clients": {}});
        let reply = parse_reply(wire).unwrap();
        assert!(reply.is_ack());
        assert_eq!(reply.call(), "clients");
        assert_eq!(reply.field("clients"), Some(&json!({})));
    }

    #[test]
    fn test_into_result_maps_nack() {
        let reply = Reply::nack("get_drone", "no available drone with requested capabilities");
        match reply.into_result() {
            Err(LinkError::Nack(desc)) => {
                assert_eq!(desc, "no available drone with requested capabilities")
            }
            other => panic!("expected nack error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_fcn_is_rejected() {
        assert!(parse_reply(json!({"fcn": "bogus", "call": "x"})).is_err());
    }
}
