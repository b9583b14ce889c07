//! Safe JSON, NDJSON and querystring encoding
//!
//! Every body that crosses the wire goes through this module. Decoding
//! applies a poisoned-key policy so a malicious payload cannot smuggle
//! `__proto__` / `constructor.prototype` structures into consumers that
//! merge response bodies into their own state.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// What to do when a reserved structural key shows up in a decoded payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoisoningAction {
    /// Fail the decode with a deserialization error
    Error,
    /// Silently drop the offending key
    Ignore,
}

impl Default for PoisoningAction {
    fn default() -> Self {
        PoisoningAction::Error
    }
}

/// One item of an NDJSON batch: either a structured value to encode
/// or a line that is already encoded and is passed through verbatim.
#[derive(Debug, Clone)]
pub enum NdBodyItem {
    Value(Value),
    Line(String),
}

impl From<Value> for NdBodyItem {
    fn from(value: Value) -> Self {
        NdBodyItem::Value(value)
    }
}

impl From<&str> for NdBodyItem {
    fn from(line: &str) -> Self {
        NdBodyItem::Line(line.to_string())
    }
}

/// JSON serializer with prototype-poisoning protection
#[derive(Debug, Clone)]
pub struct Serializer {
    proto_action: PoisoningAction,
    constructor_action: PoisoningAction,
}

impl Default for Serializer {
    fn default() -> Self {
        Self {
            proto_action: PoisoningAction::Error,
            constructor_action: PoisoningAction::Error,
        }
    }
}

impl Serializer {
    /// Create a serializer with explicit poisoning policies
    pub fn new(proto_action: PoisoningAction, constructor_action: PoisoningAction) -> Self {
        Self {
            proto_action,
            constructor_action,
        }
    }

    /// Encode a structured value as a JSON string
    pub fn serialize(&self, value: &Value) -> Result<String> {
        serde_json::to_string(value)
            .map_err(|e| ClientError::Serialization(e.to_string()))
    }

    /// Decode a JSON string, enforcing the poisoned-key policy
    pub fn deserialize(&self, input: &str) -> Result<Value> {
        let mut value = serde_json::from_str(input).map_err(|e| ClientError::Deserialization {
            message: e.to_string(),
            data: input.to_string(),
        })?;
        self.sanitize(&mut value, input)?;
        Ok(value)
    }

    /// Decode raw response bytes, failing on invalid UTF-8
    pub fn deserialize_bytes(&self, input: &[u8]) -> Result<Value> {
        let text = std::str::from_utf8(input).map_err(|e| ClientError::Deserialization {
            message: e.to_string(),
            data: String::from_utf8_lossy(input).into_owned(),
        })?;
        self.deserialize(text)
    }

    /// Encode a batch as newline-delimited JSON, one line per item,
    /// order preserved. Pre-encoded lines are passed through verbatim.
    pub fn ndserialize(&self, items: &[NdBodyItem]) -> Result<String> {
        debug!(lines = items.len(), "Encoding ndjson batch");
        let mut ndjson = String::new();
        for item in items {
            match item {
                NdBodyItem::Line(line) => ndjson.push_str(line),
                NdBodyItem::Value(value) => ndjson.push_str(&self.serialize(value)?),
            }
            ndjson.push('\n');
        }
        Ok(ndjson)
    }

    /// Encode query parameters. Null values are dropped (the server
    /// rejects keys without a value), arrays are joined with a comma
    /// before escaping.
    pub fn qserialize(&self, params: &Map<String, Value>) -> String {
        let mut encoder = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in params {
            match value {
                Value::Null => continue,
                Value::String(s) => {
                    encoder.append_pair(key, s);
                }
                Value::Array(items) => {
                    let joined = items
                        .iter()
                        .map(scalar_to_string)
                        .collect::<Vec<_>>()
                        .join(",");
                    encoder.append_pair(key, &joined);
                }
                other => {
                    encoder.append_pair(key, &scalar_to_string(other));
                }
            }
        }
        encoder.finish()
    }

    /// Walk a decoded value and apply the poisoned-key policy.
    ///
    /// `__proto__` anywhere, and `constructor` objects carrying a
    /// `prototype` member, are the two injection shapes guarded against.
    fn sanitize(&self, value: &mut Value, raw: &str) -> Result<()> {
        match value {
            Value::Object(map) => {
                if map.contains_key("__proto__") {
                    match self.proto_action {
                        PoisoningAction::Error => {
                            return Err(ClientError::Deserialization {
                                message: "Object contains forbidden prototype property".to_string(),
                                data: raw.to_string(),
                            })
                        }
                        PoisoningAction::Ignore => {
                            map.remove("__proto__");
                        }
                    }
                }
                if constructor_is_poisoned(map) {
                    match self.constructor_action {
                        PoisoningAction::Error => {
                            return Err(ClientError::Deserialization {
                                message: "Object contains forbidden constructor property"
                                    .to_string(),
                                data: raw.to_string(),
                            })
                        }
                        PoisoningAction::Ignore => {
                            map.remove("constructor");
                        }
                    }
                }
                for (_, child) in map.iter_mut() {
                    self.sanitize(child, raw)?;
                }
            }
            Value::Array(items) => {
                for child in items.iter_mut() {
                    self.sanitize(child, raw)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn constructor_is_poisoned(map: &Map<String, Value>) -> bool {
    map.get("constructor")
        .and_then(Value::as_object)
        .is_some_and(|ctor| ctor.contains_key("prototype"))
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_serialize_roundtrip() {
        let serializer = Serializer::default();
        let value = json!({"hello": "world", "count": 2});
        let encoded = serializer.serialize(&value).unwrap();
        let decoded = serializer.deserialize(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_deserialize_malformed_input() {
        let serializer = Serializer::default();
        let err = serializer.deserialize("{not json").unwrap_err();
        assert_eq!(err.error_type(), "deserialization");
    }

    #[test]
    fn test_proto_key_rejected_by_default() {
        let serializer = Serializer::default();
        let err = serializer
            .deserialize(r#"{"__proto__": {"polluted": true}}"#)
            .unwrap_err();
        assert_eq!(err.error_type(), "deserialization");
    }

    #[test]
    fn test_proto_key_stripped_when_ignored() {
        let serializer = Serializer::new(PoisoningAction::Ignore, PoisoningAction::Error);
        let value = serializer
            .deserialize(r#"{"__proto__": {"polluted": true}, "ok": 1}"#)
            .unwrap();
        assert_eq!(value, json!({"ok": 1}));
    }

    #[test]
    fn test_constructor_prototype_rejected() {
        let serializer = Serializer::default();
        let err = serializer
            .deserialize(r#"{"constructor": {"prototype": {"polluted": true}}}"#)
            .unwrap_err();
        assert_eq!(err.error_type(), "deserialization");
    }

    #[test]
    fn test_plain_constructor_key_is_allowed() {
        let serializer = Serializer::default();
        let value = serializer
            .deserialize(r#"{"constructor": "a perfectly normal field"}"#)
            .unwrap();
        assert_eq!(value["constructor"], "a perfectly normal field");
    }

    #[test]
    fn test_nested_poisoned_key_detected() {
        let serializer = Serializer::default();
        let err = serializer
            .deserialize(r#"{"outer": [{"__proto__": {}}]}"#)
            .unwrap_err();
        assert_eq!(err.error_type(), "deserialization");
    }

    #[test]
    fn test_ndserialize_mixes_values_and_raw_lines() {
        let serializer = Serializer::default();
        let items = vec![
            NdBodyItem::Value(json!({"a": 1})),
            NdBodyItem::Line("raw-line".to_string()),
            NdBodyItem::Value(json!({"b": 2})),
        ];
        let ndjson = serializer.ndserialize(&items).unwrap();
        let lines: Vec<&str> = ndjson.lines().collect();
        assert_eq!(lines, vec![r#"{"a":1}"#, "raw-line", r#"{"b":2}"#]);
        assert!(ndjson.ends_with('\n'));
    }

    #[test]
    fn test_qserialize_drops_null_and_joins_arrays() {
        let serializer = Serializer::default();
        let params = map(&[
            ("q", json!("field:value")),
            ("ignored", Value::Null),
            ("routing", json!(["a", "b", "c"])),
            ("size", json!(25)),
        ]);
        let qs = serializer.qserialize(&params);
        assert!(qs.contains("q=field%3Avalue"));
        assert!(qs.contains("routing=a%2Cb%2Cc"));
        assert!(qs.contains("size=25"));
        assert!(!qs.contains("ignored"));
    }

    #[test]
    fn test_qserialize_empty() {
        let serializer = Serializer::default();
        assert_eq!(serializer.qserialize(&Map::new()), "");
    }
}
