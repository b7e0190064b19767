//! Declarative recipes for deriving related paths from a value.
//!
//! Schemas arrive as JSON inside `getMore` requests and push observations.
//! [`Schema::from_value`] classifies every node once, so evaluation in
//! [`crate::pointers`] can match exhaustively.
//!
//! Node classification (first match wins for objects):
//!
//! | JSON shape | node |
//! |---|---|
//! | string / number / bool / null | [`Schema::Literal`] |
//! | array | [`Schema::Tuple`] (cross product of elements) |
//! | `{source, schema}` | [`Schema::Source`] |
//! | `{identity: v}` with `v` truthy | [`Schema::Identity`] |
//! | `{array: s}` | [`Schema::Array`] |
//! | `{property: "a" \| ["a", "b"]}` | [`Schema::Property`] |
//! | `{switch: {...}, value, default?}` | [`Schema::Switch`] |
//! | `{static: v}` | [`Schema::Static`] |
//! | `{nonEmpty: s}` | [`Schema::NonEmpty`] |
//! | `{object: {...}}` or any other object | [`Schema::Object`] |

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::pointers::is_truthy;

/// Error raised for JSON that cannot be read as a schema.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid schema: {0}")]
pub struct SchemaError(pub String);

/// One node of a pointer schema.
#[derive(Clone, Debug, PartialEq)]
pub enum Schema {
    /// Constant result (strings, numbers, booleans, null).
    Literal(Value),
    /// Cross product of the element schemas, each result an array.
    Tuple(Vec<Schema>),
    /// Field access; more than one key walks nested fields left to right.
    Property(Vec<String>),
    /// The value itself, or each element when the value is an array.
    Identity,
    /// Wraps all results of the inner schema into one array-valued result.
    Array(Box<Schema>),
    /// Cross product of named sub-schemas, each result an object.
    Object(Vec<(String, Schema)>),
    /// Evaluate `schema` against the values found at the `source` pointers.
    Source {
        /// Pointers to the values to chase.
        source: Box<Schema>,
        /// Schema evaluated against each chased value.
        schema: Box<Schema>,
    },
    /// Value-keyed branch.
    Switch {
        /// Produces the branch keys.
        value: Box<Schema>,
        /// Branches by key.
        cases: Vec<(String, Schema)>,
        /// Branch for keys without a case.
        default: Option<Box<Schema>>,
    },
    /// Constant result that may itself look like a schema.
    Static(Value),
    /// Inner results with falsy entries removed.
    NonEmpty(Box<Schema>),
}

impl Schema {
    /// Classify a JSON value as a schema tree.
    pub fn from_value(value: &Value) -> Result<Self, SchemaError> {
        match value {
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                Ok(Self::Literal(value.clone()))
            }
            Value::Array(items) => items
                .iter()
                .map(Self::from_value)
                .collect::<Result<_, _>>()
                .map(Self::Tuple),
            Value::Object(map) => Self::from_object(map),
        }
    }

    fn from_object(map: &Map<String, Value>) -> Result<Self, SchemaError> {
        if let Some(source) = map.get("source") {
            let schema = map
                .get("schema")
                .ok_or_else(|| SchemaError("`source` requires a `schema`".into()))?;
            return Ok(Self::Source {
                source: Box::new(Self::from_value(source)?),
                schema: Box::new(Self::from_value(schema)?),
            });
        }
        // `{"identity": false}` falls through to a plain object.
        if map.get("identity").is_some_and(is_truthy) {
            return Ok(Self::Identity);
        }
        if let Some(inner) = map.get("array") {
            return Ok(Self::Array(Box::new(Self::from_value(inner)?)));
        }
        if let Some(property) = map.get("property") {
            return match property {
                Value::String(key) => Ok(Self::Property(vec![key.clone()])),
                Value::Array(keys) => keys
                    .iter()
                    .map(|k| {
                        k.as_str()
                            .map(str::to_owned)
                            .ok_or_else(|| SchemaError(format!("property key {k} is not a string")))
                    })
                    .collect::<Result<_, _>>()
                    .map(Self::Property),
                other => Err(SchemaError(format!("property must be a string or list, got {other}"))),
            };
        }
        if let Some(cases) = map.get("switch") {
            let Value::Object(cases) = cases else {
                return Err(SchemaError("`switch` must be an object".into()));
            };
            let value = map
                .get("value")
                .ok_or_else(|| SchemaError("`switch` requires a `value`".into()))?;
            return Ok(Self::Switch {
                value: Box::new(Self::from_value(value)?),
                cases: fields(cases)?,
                default: map
                    .get("default")
                    .map(Self::from_value)
                    .transpose()?
                    .map(Box::new),
            });
        }
        if let Some(constant) = map.get("static") {
            return Ok(Self::Static(constant.clone()));
        }
        if let Some(inner) = map.get("nonEmpty") {
            return Ok(Self::NonEmpty(Box::new(Self::from_value(inner)?)));
        }
        if let Some(Value::Object(inner)) = map.get("object") {
            return Ok(Self::Object(fields(inner)?));
        }
        Ok(Self::Object(fields(map)?))
    }

    /// Parse a list of schemas (the `schema` field of a fetch entry).
    pub fn list_from_value(value: &Value) -> Result<Vec<Self>, SchemaError> {
        match value {
            Value::Array(items) => items.iter().map(Self::from_value).collect(),
            single => Ok(vec![Self::from_value(single)?]),
        }
    }

    /// JSON form of this schema.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Tuple(items) => Value::Array(items.iter().map(Self::to_value).collect()),
            Self::Property(keys) if keys.len() == 1 => json!({ "property": keys[0] }),
            Self::Property(keys) => json!({ "property": keys }),
            Self::Identity => json!({ "identity": true }),
            Self::Array(inner) => json!({ "array": inner.to_value() }),
            Self::Object(fields) => json!({ "object": fields_to_value(fields) }),
            Self::Source { source, schema } => {
                json!({ "source": source.to_value(), "schema": schema.to_value() })
            }
            Self::Switch {
                value,
                cases,
                default,
            } => {
                let mut out = json!({ "switch": fields_to_value(cases), "value": value.to_value() });
                if let (Some(default), Value::Object(map)) = (default, &mut out) {
                    let _ = map.insert("default".into(), default.to_value());
                }
                out
            }
            Self::Static(v) => json!({ "static": v }),
            Self::NonEmpty(inner) => json!({ "nonEmpty": inner.to_value() }),
        }
    }
}

fn fields(map: &Map<String, Value>) -> Result<Vec<(String, Schema)>, SchemaError> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), Schema::from_value(v)?)))
        .collect()
}

fn fields_to_value(fields: &[(String, Schema)]) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(k, s)| (k.clone(), s.to_value()))
            .collect(),
    )
}

impl Serialize for Schema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn parse(v: Value) -> Schema {
        Schema::from_value(&v).unwrap()
    }

    #[test]
    fn scalars_are_literals() {
        assert_eq!(parse(json!("test")), Schema::Literal(json!("test")));
        assert_eq!(parse(json!(3)), Schema::Literal(json!(3)));
        assert_eq!(parse(json!(null)), Schema::Literal(Value::Null));
    }

    #[test]
    fn arrays_are_tuples() {
        let schema = parse(json!(["test", "user", {"user": {"identity": true}}]));
        assert_matches!(schema, Schema::Tuple(ref items) if items.len() == 3);
        let Schema::Tuple(items) = schema else { unreachable!() };
        assert_matches!(&items[2], Schema::Object(fields) if fields[0].0 == "user" && fields[0].1 == Schema::Identity);
    }

    #[test]
    fn property_forms() {
        assert_eq!(parse(json!({"property": "role"})), Schema::Property(vec!["role".into()]));
        assert_eq!(
            parse(json!({"property": ["a", "b"]})),
            Schema::Property(vec!["a".into(), "b".into()])
        );
        assert!(Schema::from_value(&json!({"property": 1})).is_err());
    }

    #[test]
    fn source_takes_priority() {
        let schema = parse(json!({"source": ["test", "me"], "schema": {"property": "id"}, "identity": true}));
        assert_matches!(schema, Schema::Source { .. });
    }

    #[test]
    fn source_without_schema_is_rejected() {
        assert!(Schema::from_value(&json!({"source": ["x"]})).is_err());
    }

    #[test]
    fn switch_with_default() {
        let schema = parse(json!({
            "value": {"property": "kind"},
            "switch": {"a": "first", "b": "second"},
            "default": "other"
        }));
        assert_matches!(schema, Schema::Switch { ref cases, default: Some(_), .. } if cases.len() == 2);
    }

    #[test]
    fn explicit_and_implicit_objects_agree() {
        let explicit = parse(json!({"object": {"name": "js"}}));
        let implicit = parse(json!({"name": "js"}));
        assert_eq!(explicit, implicit);
    }

    #[test]
    fn static_keeps_schema_like_values() {
        assert_eq!(parse(json!({"static": {"property": "x"}})), Schema::Static(json!({"property": "x"})));
    }

    #[test]
    fn non_empty_wraps_inner() {
        assert_eq!(
            parse(json!({"nonEmpty": {"property": "user"}})),
            Schema::NonEmpty(Box::new(Schema::Property(vec!["user".into()])))
        );
    }

    #[test]
    fn to_value_reparses_to_same_tree() {
        let source = json!([
            "test",
            {"object": {
                "user": {"source": ["test", "me"], "schema": {"property": ["profile", "id"]}},
                "tags": {"array": {"nonEmpty": {"property": "tags"}}},
                "kind": {"value": {"static": "a"}, "switch": {"a": 1}, "default": 2}
            }}
        ]);
        let schema = parse(source);
        assert_eq!(parse(schema.to_value()), schema);
    }

    #[test]
    fn identity_flag_must_be_truthy() {
        assert_eq!(parse(json!({"identity": 1})), Schema::Identity);
        assert_eq!(parse(json!({"identity": "yes"})), Schema::Identity);
        assert_eq!(
            parse(json!({"identity": false})),
            Schema::Object(vec![("identity".into(), Schema::Literal(json!(false)))])
        );
        assert_matches!(parse(json!({"identity": 0, "array": "x"})), Schema::Array(_));
    }

    #[test]
    fn list_from_value_accepts_single() {
        assert_eq!(Schema::list_from_value(&json!({"identity": true})).unwrap(), vec![Schema::Identity]);
        assert_eq!(Schema::list_from_value(&json!([["a"], ["b"]])).unwrap().len(), 2);
    }
}
