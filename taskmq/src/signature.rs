use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BrokerError, Result};

/// One typed task argument. `kind` names a primitive type ("int64",
/// "string", ...) that the worker layer understands; the broker treats it
/// as opaque.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Arg {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Value")]
    pub value: Value,
}

impl Arg {
    pub fn new(kind: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

/// Serializable descriptor of one task invocation.
///
/// The wire format uses PascalCase field names for compatibility with
/// producers in other languages. Fields this broker does not know about are
/// preserved across a decode/encode round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Signature {
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "RoutingKey")]
    pub routing_key: String,
    /// Absolute UTC instant. Set and in the future means the task is delayed.
    #[serde(rename = "ETA")]
    pub eta: Option<DateTime<Utc>>,
    #[serde(rename = "Args")]
    pub args: Vec<Arg>,
    #[serde(rename = "Headers")]
    pub headers: serde_json::Map<String, Value>,
    #[serde(rename = "Immutable")]
    pub immutable: bool,
    #[serde(rename = "RetryCount")]
    pub retry_count: i64,
    #[serde(rename = "RetryTimeout")]
    pub retry_timeout: i64,
    #[serde(rename = "GroupUUID")]
    pub group_uuid: String,
    #[serde(rename = "GroupTaskCount")]
    pub group_task_count: i64,
    #[serde(rename = "OnSuccess")]
    pub on_success: Vec<Signature>,
    #[serde(rename = "OnError")]
    pub on_error: Vec<Signature>,
    #[serde(rename = "ChordCallback")]
    pub chord_callback: Option<Box<Signature>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Signature {
    pub fn new(name: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            name: name.into(),
            args,
            ..Default::default()
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(BrokerError::Encode)
    }

    /// Deserialize from the wire format.
    pub fn decode(payload: &[u8]) -> Result<Signature> {
        serde_json::from_slice(payload).map_err(BrokerError::Decode)
    }

    /// An empty routing key is rewritten to the configured default queue, so
    /// the publish path always has a concrete list key to push to.
    pub fn adjust_routing_key(&mut self, default_queue: &str) {
        if self.routing_key.is_empty() {
            self.routing_key = default_queue.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn wire_format_field_names() {
        let sig = Signature::new("add", vec![Arg::new("int64", 1), Arg::new("int64", 2)])
            .with_uuid("task_123");

        let encoded = sig.encode().unwrap();
        let raw: Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(raw["UUID"], "task_123");
        assert_eq!(raw["Name"], "add");
        assert_eq!(raw["RoutingKey"], "");
        assert!(raw["ETA"].is_null());
        assert_eq!(raw["Args"][0]["Type"], "int64");
        assert_eq!(raw["Args"][1]["Value"], 2);
    }

    #[test]
    fn eta_round_trips_as_absolute_instant() {
        let eta = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let sig = Signature::new("send_email", vec![])
            .with_uuid("u1")
            .with_eta(eta);

        let decoded = Signature::decode(&sig.encode().unwrap()).unwrap();
        assert_eq!(decoded.eta, Some(eta));
        assert_eq!(decoded, sig);
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let wire = r#"{"UUID":"u2","Name":"add","RoutingKey":"q","ETA":null,
                       "Args":[],"Priority":7,"TraceID":"abc"}"#;

        let sig = Signature::decode(wire.as_bytes()).unwrap();
        assert_eq!(sig.extra["Priority"], 7);

        let reencoded: Value = serde_json::from_slice(&sig.encode().unwrap()).unwrap();
        assert_eq!(reencoded["Priority"], 7);
        assert_eq!(reencoded["TraceID"], "abc");
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        assert!(matches!(
            Signature::decode(b"{not json"),
            Err(BrokerError::Decode(_))
        ));
    }

    #[test]
    fn adjust_routing_key_only_rewrites_empty() {
        let mut sig = Signature::new("add", vec![]);
        sig.adjust_routing_key("tasks");
        assert_eq!(sig.routing_key, "tasks");

        let mut routed = Signature::new("add", vec![]).with_routing_key("custom");
        routed.adjust_routing_key("tasks");
        assert_eq!(routed.routing_key, "custom");
    }
}
