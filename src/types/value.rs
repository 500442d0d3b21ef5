//! Closed value model for objects and queries.
//!
//! The REST wire format is an open JSON shape where special values travel as
//! `__type` envelopes (`{"__type":"Pointer",...}`). Internally every value is
//! a [`Value`] variant, so a pointer can never be confused with a plain map:
//! the distinction is made once, at the boundary, in [`Value::from_json`].

use std::cmp::Ordering;
use std::collections::BTreeMap;

use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;

use crate::error::{StoreError, StoreResult};

/// Ordered field-name → value map used for objects, queries and updates.
pub type ObjectMap = BTreeMap<String, Value>;

/// A single field value in its decoded, typed form.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(ObjectMap),
    Pointer { class_name: String, object_id: String },
    Relation { target_class: String },
    Date(DateTime<Utc>),
    GeoPoint { latitude: f64, longitude: f64 },
    Bytes(Vec<u8>),
    Polygon(Vec<(f64, f64)>),
}

impl Value {
    /// Decodes a wire-format JSON value, resolving `__type` envelopes.
    pub fn from_json(json: serde_json::Value) -> StoreResult<Value> {
        match json {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| StoreError::InvalidJson("number out of range".to_string())),
            serde_json::Value::String(s) => Ok(Value::String(s)),
            serde_json::Value::Array(items) => Ok(Value::Array(
                items
                    .into_iter()
                    .map(Value::from_json)
                    .collect::<StoreResult<Vec<_>>>()?,
            )),
            serde_json::Value::Object(map) => Self::from_json_object(map),
        }
    }

    fn from_json_object(map: serde_json::Map<String, serde_json::Value>) -> StoreResult<Value> {
        let type_tag = map.get("__type").and_then(|t| t.as_str()).map(String::from);
        let Some(tag) = type_tag else {
            let mut object = ObjectMap::new();
            for (key, value) in map {
                object.insert(key, Value::from_json(value)?);
            }
            return Ok(Value::Object(object));
        };
        let str_field = |name: &str| -> StoreResult<String> {
            map.get(name)
                .and_then(|v| v.as_str())
                .map(String::from)
                .ok_or_else(|| {
                    StoreError::InvalidJson(format!("{} envelope missing '{}'", tag, name))
                })
        };
        let num_field = |name: &str| -> StoreResult<f64> {
            map.get(name).and_then(|v| v.as_f64()).ok_or_else(|| {
                StoreError::InvalidJson(format!("{} envelope missing '{}'", tag, name))
            })
        };
        match tag.as_str() {
            "Pointer" => Ok(Value::Pointer {
                class_name: str_field("className")?,
                object_id: str_field("objectId")?,
            }),
            "Relation" => Ok(Value::Relation {
                target_class: str_field("className")?,
            }),
            "Date" => {
                let iso = str_field("iso")?;
                let parsed = DateTime::parse_from_rfc3339(&iso).map_err(|e| {
                    StoreError::InvalidJson(format!("invalid Date iso '{}': {}", iso, e))
                })?;
                Ok(Value::Date(parsed.with_timezone(&Utc)))
            }
            "GeoPoint" => Ok(Value::GeoPoint {
                latitude: num_field("latitude")?,
                longitude: num_field("longitude")?,
            }),
            "Bytes" => {
                let encoded = str_field("base64")?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| StoreError::InvalidJson(format!("invalid Bytes base64: {}", e)))?;
                Ok(Value::Bytes(bytes))
            }
            "Polygon" => {
                let coordinates = map
                    .get("coordinates")
                    .and_then(|c| c.as_array())
                    .ok_or_else(|| {
                        StoreError::InvalidJson("Polygon envelope missing 'coordinates'".to_string())
                    })?;
                let mut points = Vec::with_capacity(coordinates.len());
                for pair in coordinates {
                    let coords = pair.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                        StoreError::InvalidJson("Polygon coordinate is not a pair".to_string())
                    })?;
                    match (coords[0].as_f64(), coords[1].as_f64()) {
                        (Some(lat), Some(lng)) => points.push((lat, lng)),
                        _ => {
                            return Err(StoreError::InvalidJson(
                                "Polygon coordinate is not numeric".to_string(),
                            ))
                        }
                    }
                }
                Ok(Value::Polygon(points))
            }
            other => Err(StoreError::InvalidJson(format!("unknown __type: {}", other))),
        }
    }

    /// Encodes the value back into its wire-format JSON shape.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            // Whole numbers re-encode as JSON integers so a wire integer
            // round-trips unchanged.
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_992.0 {
                    json!(*n as i64)
                } else {
                    json!(n)
                }
            }
            Value::String(s) => json!(s),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Pointer {
                class_name,
                object_id,
            } => json!({
                "__type": "Pointer",
                "className": class_name,
                "objectId": object_id,
            }),
            Value::Relation { target_class } => json!({
                "__type": "Relation",
                "className": target_class,
            }),
            Value::Date(dt) => json!({
                "__type": "Date",
                "iso": dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
            Value::GeoPoint {
                latitude,
                longitude,
            } => json!({
                "__type": "GeoPoint",
                "latitude": latitude,
                "longitude": longitude,
            }),
            Value::Bytes(bytes) => json!({
                "__type": "Bytes",
                "base64": base64::engine::general_purpose::STANDARD.encode(bytes),
            }),
            Value::Polygon(points) => json!({
                "__type": "Polygon",
                "coordinates": points.iter().map(|(lat, lng)| json!([lat, lng])).collect::<Vec<_>>(),
            }),
        }
    }

    /// Decodes a wire-format JSON object into an [`ObjectMap`].
    pub fn object_from_json(json: serde_json::Value) -> StoreResult<ObjectMap> {
        match Value::from_json(json)? {
            Value::Object(map) => Ok(map),
            _ => Err(StoreError::InvalidJson("expected a JSON object".to_string())),
        }
    }

    pub fn pointer(class_name: impl Into<String>, object_id: impl Into<String>) -> Value {
        Value::Pointer {
            class_name: class_name.into(),
            object_id: object_id.into(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectMap> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut ObjectMap> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<(&str, &str)> {
        match self {
            Value::Pointer {
                class_name,
                object_id,
            } => Some((class_name, object_id)),
            _ => None,
        }
    }

    /// Returns `(op_name, payload)` when the value is a REST write operator
    /// (`{"__op": "Increment", ...}`).
    pub fn as_operator(&self) -> Option<(&str, &ObjectMap)> {
        let map = self.as_object()?;
        let op = map.get("__op")?.as_str()?;
        Some((op, map))
    }

    /// Total-order comparison for the orderable variants, `None` otherwise.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(json).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_envelope_roundtrip() {
        let wire = json!({"__type": "Pointer", "className": "Post", "objectId": "abc123"});
        let value = Value::from_json(wire.clone()).unwrap();
        assert_eq!(value, Value::pointer("Post", "abc123"));
        assert_eq!(value.to_json(), wire);
    }

    #[test]
    fn date_envelope_roundtrip() {
        let wire = json!({"__type": "Date", "iso": "2024-03-01T12:30:00.000Z"});
        let value = Value::from_json(wire.clone()).unwrap();
        assert!(matches!(value, Value::Date(_)));
        assert_eq!(value.to_json(), wire);
    }

    #[test]
    fn bytes_envelope_roundtrip() {
        let wire = json!({"__type": "Bytes", "base64": "aGVsbG8="});
        let value = Value::from_json(wire.clone()).unwrap();
        assert_eq!(value, Value::Bytes(b"hello".to_vec()));
        assert_eq!(value.to_json(), wire);
    }

    #[test]
    fn whole_numbers_reencode_as_integers() {
        let value = Value::from_json(json!(6)).unwrap();
        assert_eq!(value, Value::Number(6.0));
        assert_eq!(value.to_json(), json!(6));
        assert_eq!(Value::Number(2.5).to_json(), json!(2.5));
        assert_eq!(Value::Number(-3.0).to_json(), json!(-3));
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let wire = json!({"__type": "Banana"});
        assert!(matches!(
            Value::from_json(wire),
            Err(StoreError::InvalidJson(_))
        ));
    }

    #[test]
    fn malformed_pointer_is_rejected() {
        let wire = json!({"__type": "Pointer", "className": "Post"});
        assert!(matches!(
            Value::from_json(wire),
            Err(StoreError::InvalidJson(_))
        ));
    }

    #[test]
    fn nested_objects_decode_recursively() {
        let wire = json!({
            "author": {"__type": "Pointer", "className": "_User", "objectId": "u1"},
            "meta": {"tags": ["a", "b"]},
        });
        let map = Value::object_from_json(wire).unwrap();
        assert_eq!(map["author"], Value::pointer("_User", "u1"));
        let meta = map["meta"].as_object().unwrap();
        assert_eq!(
            meta["tags"],
            Value::Array(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn operator_detection() {
        let wire = json!({"__op": "Increment", "amount": 2});
        let value = Value::from_json(wire).unwrap();
        let (op, payload) = value.as_operator().unwrap();
        assert_eq!(op, "Increment");
        assert_eq!(payload["amount"], Value::Number(2.0));
    }
}
