//! Data item identifiers.
//!
//! A [`Path`] wraps the JSON value a client uses to name a data item, e.g.
//! `["test", "user", {"user": 0}]`. Two paths are equal iff their canonical
//! JSON form is equal; the canonical form sorts object keys recursively, so
//! `{"a":1,"b":2}` and `{"b":2,"a":1}` name the same item.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::protocol::FetchPath;

/// Identifier of one logical remote data item.
#[derive(Clone)]
pub struct Path {
    value: Value,
    key: String,
}

impl Path {
    /// Wrap a JSON value as a path.
    pub fn new(value: Value) -> Self {
        let mut key = String::new();
        write_canonical(&value, &mut key);
        Self { value, key }
    }

    /// Build a path from a sequence of segments.
    pub fn from_segments<I, V>(segments: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::new(Value::Array(segments.into_iter().map(Into::into).collect()))
    }

    /// The JSON value as the client sent it.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consume the path and return its JSON value.
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Canonical JSON form used for equality and hashing.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Path segments, or an empty slice when the path is not an array.
    pub fn segments(&self) -> &[Value] {
        self.value.as_array().map_or(&[], Vec::as_slice)
    }

    /// String segment at `index`, if present.
    pub fn segment_str(&self, index: usize) -> Option<&str> {
        self.segments().get(index).and_then(Value::as_str)
    }

    /// Whether this path is a composite multi-path request
    /// (`{what, more}` or `{paths: [...]}`) rather than a plain item path.
    pub fn is_composite(&self) -> bool {
        self.value
            .as_object()
            .is_some_and(|obj| obj.contains_key("paths") || obj.contains_key("what"))
    }

    /// Decode a composite path into its fetch entries.
    ///
    /// Returns `None` for plain paths.
    pub fn fetch_paths(&self) -> Option<Result<Vec<FetchPath>, serde_json::Error>> {
        let obj = self.value.as_object()?;
        if let Some(paths) = obj.get("paths") {
            return Some(serde_json::from_value(paths.clone()));
        }
        if obj.contains_key("what") {
            return Some(serde_json::from_value(self.value.clone()).map(|p| vec![p]));
        }
        None
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Path {}

impl Hash for Path {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl From<Value> for Path {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::new)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
