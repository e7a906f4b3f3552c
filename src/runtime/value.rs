//! Dynamic values and control markers transported through ports
//!
//! Every value crossing a port is one variant of [`Value`]: plain data
//! (null, number, string, boolean, binary, nested map/stream) or a
//! control [`Marker`]. Stream markers carry the identity of the stream
//! port that issued them so readers can tell their own stream boundaries
//! from those of an enclosing stream passing through.

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identity of the stream port that issued a marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub Uuid);

impl StreamId {
    /// Allocate a fresh stream identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Control marker transported in-band through port queues
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Marker {
    /// Begin-of-stream, tagged with the issuing stream
    Bos(StreamId),
    /// End-of-stream, tagged with the issuing stream
    Eos(StreamId),
    /// Cooperative stop sentinel, wakes parked pulls
    Stop,
    /// A single value absent at this position (observer sentinel)
    PhSingle,
    /// A stream body absent at this position (observer sentinel)
    PhMultiple,
}

impl Marker {
    /// True for the synchronizing markers (BOS, EOS, stop) that parents
    /// fan out and pulls synchronize on. Placeholder sentinels travel
    /// like data instead: they compose into values.
    pub fn is_control(&self) -> bool {
        matches!(self, Marker::Bos(_) | Marker::Eos(_) | Marker::Stop)
    }
}

/// A dynamic value crossing a port
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absence of a value; also used as the trigger payload
    Null,
    /// Floating point number (integers are represented exactly up to 2^53)
    Number(f64),
    /// UTF-8 string
    String(String),
    /// Boolean
    Bool(bool),
    /// Raw bytes
    Binary(Vec<u8>),
    /// Composed map value, one entry per map-port child
    Map(BTreeMap<String, Value>),
    /// Assembled stream body, the elements between one BOS/EOS pair
    Stream(Vec<Value>),
    /// Control marker
    Marker(Marker),
}

impl Value {
    /// True iff this value is a control marker
    pub fn is_marker(&self) -> bool {
        matches!(self, Value::Marker(_))
    }

    /// True iff this value is a synchronizing marker (BOS, EOS, stop)
    pub fn is_control_marker(&self) -> bool {
        matches!(self, Value::Marker(m) if m.is_control())
    }

    /// True iff this value is the stop sentinel
    pub fn is_stop(&self) -> bool {
        matches!(self, Value::Marker(Marker::Stop))
    }

    /// Interpret as a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Interpret as a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Interpret as binary bytes
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Interpret as a composed map
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Interpret as an assembled stream body
    pub fn as_stream(&self) -> Option<&[Value]> {
        match self {
            Value::Stream(s) => Some(s),
            _ => None,
        }
    }

    /// Render a scalar for use inside an expanded name expression.
    ///
    /// Numbers without a fractional part print without a decimal point,
    /// so a property value `2.0` expands to `"2"` inside `{n}`.
    pub fn expression_string(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                format!("{}", *n as i64)
            }
            Value::Number(n) => format!("{n}"),
            Value::String(s) => s.clone(),
            Value::Bool(b) => format!("{b}"),
            other => format!("{other:?}"),
        }
    }

    /// Convert a JSON value into a runtime value, normalizing all
    /// numbers to floating point. Arrays become stream bodies and
    /// objects become maps.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Stream(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert a runtime value back into JSON. Binary renders as an
    /// array of byte values; markers render as opaque tokens.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Binary(bytes) => serde_json::Value::Array(
                bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
            ),
            Value::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Stream(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Marker(m) => serde_json::Value::String(marker_token(m).to_string()),
        }
    }
}

fn marker_token(marker: &Marker) -> &'static str {
    match marker {
        Marker::Bos(_) => "(BOS)",
        Marker::Eos(_) => "(EOS)",
        Marker::Stop => "(STOP)",
        Marker::PhSingle => "(PH)",
        Marker::PhMultiple => "(PH*)",
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
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

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Binary(bytes)
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::String(s) => serializer.serialize_str(s),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Binary(bytes) => {
                let mut seq = serializer.serialize_seq(Some(bytes.len()))?;
                for b in bytes {
                    seq.serialize_element(b)?;
                }
                seq.end()
            }
            Value::Map(m) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Stream(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for v in items {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            Value::Marker(m) => serializer.serialize_str(marker_token(m)),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a null, number, string, boolean, sequence, or mapping")
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }

    fn visit_bool<E>(self, b: bool) -> Result<Value, E> {
        Ok(Value::Bool(b))
    }

    fn visit_i64<E>(self, n: i64) -> Result<Value, E> {
        Ok(Value::Number(n as f64))
    }

    fn visit_u64<E>(self, n: u64) -> Result<Value, E> {
        Ok(Value::Number(n as f64))
    }

    fn visit_f64<E>(self, n: f64) -> Result<Value, E> {
        Ok(Value::Number(n))
    }

    fn visit_str<E>(self, s: &str) -> Result<Value, E> {
        Ok(Value::String(s.to_string()))
    }

    fn visit_string<E>(self, s: String) -> Result<Value, E> {
        Ok(Value::String(s))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::new();
        while let Some(v) = seq.next_element()? {
            items.push(v);
        }
        Ok(Value::Stream(items))
    }

    fn visit_map<A>(self, mut access: A) -> Result<Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries = BTreeMap::new();
        while let Some((k, v)) = access.next_entry::<String, Value>()? {
            entries.insert(k, v);
        }
        Ok(Value::Map(entries))
    }

    fn visit_bytes<E>(self, bytes: &[u8]) -> Result<Value, E>
    where
        E: de::Error,
    {
        Ok(Value::Binary(bytes.to_vec()))
    }
}

/// Property bag bound to an operator at specialization
pub type Properties = BTreeMap<String, Value>;

/// Convenience constructor for composed map values
#[macro_export]
macro_rules! value_map {
    ($($key:expr => $val:expr),* $(,)?) => {{
        let mut m = std::collections::BTreeMap::new();
        $(m.insert($key.to_string(), $crate::runtime::value::Value::from($val));)*
        $crate::runtime::value::Value::Map(m)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expression_string_formats_whole_numbers() {
        assert_eq!(Value::Number(2.0).expression_string(), "2");
        assert_eq!(Value::Number(2.5).expression_string(), "2.5");
        assert_eq!(Value::String("x".into()).expression_string(), "x");
        assert_eq!(Value::Bool(true).expression_string(), "true");
    }

    #[test]
    fn test_json_roundtrip_normalizes_numbers() {
        let json: serde_json::Value = serde_json::from_str(r#"{"a": 3, "b": [1, 2]}"#).unwrap();
        let value = Value::from_json(&json);
        assert_eq!(
            value,
            value_map! {
                "a" => 3.0,
                "b" => Value::Stream(vec![Value::Number(1.0), Value::Number(2.0)])
            }
        );
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let value: Value = serde_yaml::from_str("min: 3\nmax: 5\n").unwrap();
        assert_eq!(value, value_map! { "min" => 3.0, "max" => 5.0 });
    }

    #[test]
    fn test_marker_identity() {
        let own = StreamId::new();
        let foreign = StreamId::new();
        assert_eq!(Marker::Bos(own), Marker::Bos(own));
        assert_ne!(Marker::Bos(own), Marker::Bos(foreign));
        assert_ne!(Marker::Bos(own), Marker::Eos(own));
    }
}
