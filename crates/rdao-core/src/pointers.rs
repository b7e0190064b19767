//! Pointer resolution: evaluating a [`Schema`] against a value.
//!
//! [`collect`] returns the concrete pointers a value implies, together with a
//! `many` flag saying whether the position may hold more than one result.
//! Shape mismatches (a `property` on a string, a missing field) produce no
//! pointers. The one hard failure is the cardinality check in cross
//! products: a combination of operands that are all single-valued must never
//! yield more than one result.

use serde_json::{Map, Value};

use crate::errors::ResolveError;
use crate::schema::Schema;

/// Result list of one schema evaluation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pointers {
    /// Resolved values, in evaluation order.
    pub items: Vec<Value>,
    /// Whether this position may legitimately hold more than one result.
    pub many: bool,
}

impl Pointers {
    fn empty() -> Self {
        Self::default()
    }

    fn one(value: Value) -> Self {
        Self {
            items: vec![value],
            many: false,
        }
    }

    fn many(items: Vec<Value>) -> Self {
        Self { items, many: true }
    }
}

/// Evaluate `schema` against `source`.
///
/// `source` is `None` when there is no value (top-level schemas, or a chased
/// source that has not been fetched yet). `resolve` looks up the value behind
/// a pointer for `source` nodes; returning `None` means "not available".
pub fn collect(
    source: Option<&Value>,
    schema: &Schema,
    resolve: &mut dyn FnMut(&Value) -> Option<Value>,
) -> Result<Pointers, ResolveError> {
    match schema {
        Schema::Literal(v) | Schema::Static(v) => Ok(Pointers::one(v.clone())),
        Schema::Tuple(parts) => {
            let parts = parts
                .iter()
                .map(|part| collect(source, part, resolve))
                .collect::<Result<Vec<_>, _>>()?;
            cross(parts, Value::Array)
        }
        Schema::Property(keys) => Ok(property(source, keys)),
        Schema::Identity => Ok(match source {
            None => Pointers::empty(),
            Some(Value::Array(items)) => Pointers::many(items.clone()),
            Some(v) => Pointers::one(v.clone()),
        }),
        Schema::Array(inner) => {
            let inner = collect(source, inner, resolve)?;
            Ok(Pointers::one(Value::Array(inner.items)))
        }
        Schema::Object(fields) => {
            let parts = fields
                .iter()
                .map(|(_, field)| collect(source, field, resolve))
                .collect::<Result<Vec<_>, _>>()?;
            cross(parts, |values| {
                Value::Object(
                    fields
                        .iter()
                        .map(|(name, _)| name.clone())
                        .zip(values)
                        .collect::<Map<_, _>>(),
                )
            })
        }
        Schema::Source { source: from, schema } => {
            let pointers = collect(source, from, resolve)?;
            let mut out = Pointers {
                items: Vec::new(),
                many: pointers.many,
            };
            for pointer in &pointers.items {
                let value = resolve(pointer);
                let found = collect(value.as_ref(), schema, resolve)?;
                out.many |= found.many;
                out.items.extend(found.items);
            }
            Ok(out)
        }
        Schema::Switch {
            value,
            cases,
            default,
        } => {
            let keys = collect(source, value, resolve)?;
            let mut out = Pointers {
                items: Vec::new(),
                many: keys.many,
            };
            for key in &keys.items {
                let key = switch_key(key);
                let branch = cases
                    .iter()
                    .find(|(case, _)| *case == key)
                    .map(|(_, schema)| schema)
                    .or(default.as_deref());
                if let Some(branch) = branch {
                    let found = collect(source, branch, resolve)?;
                    out.many |= found.many;
                    out.items.extend(found.items);
                }
            }
            Ok(out)
        }
        Schema::NonEmpty(inner) => {
            let mut found = collect(source, inner, resolve)?;
            found.items.retain(is_truthy);
            Ok(found)
        }
    }
}

/// Evaluate a list of schemas and concatenate their pointers.
pub fn collect_pointers(
    source: Option<&Value>,
    schemas: &[Schema],
    resolve: &mut dyn FnMut(&Value) -> Option<Value>,
) -> Result<Vec<Value>, ResolveError> {
    let mut out = Vec::new();
    for schema in schemas {
        out.extend(collect(source, schema, resolve)?.items);
    }
    Ok(out)
}

/// Row-major cross product; the last operand varies fastest.
fn cross(parts: Vec<Pointers>, build: impl Fn(Vec<Value>) -> Value) -> Result<Pointers, ResolveError> {
    let many = parts.iter().any(|p| p.many);
    let count: usize = parts.iter().map(|p| p.items.len()).product();
    if count > 1 && !many {
        return Err(ResolveError::Cardinality { count });
    }
    let mut rows: Vec<Vec<Value>> = vec![Vec::new()];
    for part in parts {
        let mut next = Vec::with_capacity(rows.len() * part.items.len());
        for row in &rows {
            for item in &part.items {
                let mut extended = row.clone();
                extended.push(item.clone());
                next.push(extended);
            }
        }
        rows = next;
    }
    Ok(Pointers {
        items: rows.into_iter().map(build).collect(),
        many,
    })
}

fn property(source: Option<&Value>, keys: &[String]) -> Pointers {
    let Some(source) = source.filter(|v| !v.is_null()) else {
        return Pointers::empty();
    };
    let mut current = Pointers::one(source.clone());
    for key in keys {
        let mut next = Pointers {
            items: Vec::new(),
            many: current.many,
        };
        for value in &current.items {
            read_field(value, key, &mut next);
        }
        current = next;
    }
    current
}

fn read_field(value: &Value, key: &str, out: &mut Pointers) {
    match value {
        Value::Array(items) => {
            out.many = true;
            for item in items {
                read_field(item, key, out);
            }
        }
        Value::Object(map) => match map.get(key) {
            None => {}
            Some(Value::Array(items)) => {
                out.many = true;
                out.items.extend(items.iter().cloned());
            }
            Some(found) => out.items.push(found.clone()),
        },
        _ => {}
    }
}

fn switch_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
