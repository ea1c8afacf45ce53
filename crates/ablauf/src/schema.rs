//! Transport-safe payload schemas
//!
//! Event and live-update payloads are dynamic JSON values validated against a
//! [`Schema`] tree at delivery time. The tree is built from transport-safe
//! primitives and combinators only; anything that cannot survive
//! encode/decode (functions, futures, opaque handles) is unrepresentable by
//! construction. Validation reports the path of the first offending node,
//! e.g. `root.user.profile.cb`.

use std::collections::HashSet;

use chrono::DateTime;
use serde_json::Value;

/// Maximum schema nesting, bounding `Lazy` recursion.
const MAX_DEPTH: usize = 64;

/// A transport-safe value schema.
#[derive(Debug, Clone)]
pub enum Schema {
    /// Boolean.
    Bool,
    /// Integer (i64/u64 range).
    Int,
    /// Any JSON number.
    Float,
    /// String.
    Str,
    /// Millisecond epoch integer or RFC 3339 string.
    Timestamp,
    /// Base64-encoded byte string.
    Bytes,
    /// URL-like string with an explicit scheme.
    Url,
    /// Ordered sequence with uniform element schema.
    Seq(Box<Schema>),
    /// Fixed-arity tuple.
    Tuple(Vec<Schema>),
    /// Map with string keys and uniform value schema.
    Map(Box<Schema>),
    /// Sequence with unique elements.
    Set(Box<Schema>),
    /// Object with named fields. Fields wrapped in [`Schema::Optional`] may
    /// be absent; unknown fields are ignored.
    Object(Vec<(String, Schema)>),
    /// Field may be absent.
    Optional(Box<Schema>),
    /// Value may be null.
    Nullable(Box<Schema>),
    /// Field may be absent; readers substitute the given default.
    DefaultTo(Box<Schema>, Value),
    /// Value must match at least one variant.
    Union(Vec<Schema>),
    /// Value must match every part.
    Intersection(Vec<Schema>),
    /// Deferred schema, enabling recursive definitions.
    Lazy(fn() -> Schema),
    /// Validate against the first schema, then the second.
    Pipe(Box<Schema>, Box<Schema>),
}

/// Validation failure, carrying the path of the first offending node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at {path}")]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

impl SchemaError {
    fn new(path: &[String], message: impl Into<String>) -> Self {
        Self {
            path: path.join("."),
            message: message.into(),
        }
    }
}

impl Schema {
    /// Shorthand for an object schema.
    pub fn object<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Schema)>,
        S: Into<String>,
    {
        Self::Object(fields.into_iter().map(|(n, s)| (n.into(), s)).collect())
    }

    /// Validate a value against this schema.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        let mut path = vec!["root".to_string()];
        self.validate_at(value, &mut path, 0)
    }

    /// Definition-time well-formedness check.
    ///
    /// Rejects empty unions/intersections, duplicate object fields, defaults
    /// that do not satisfy their inner schema, and unbounded lazy recursion.
    /// Fails with the path of the first offending node.
    pub fn check(&self) -> Result<(), SchemaError> {
        let mut path = vec!["root".to_string()];
        let mut seen_lazy = HashSet::new();
        self.check_at(&mut path, 0, &mut seen_lazy)
    }

    fn validate_at(
        &self,
        value: &Value,
        path: &mut Vec<String>,
        depth: usize,
    ) -> Result<(), SchemaError> {
        if depth > MAX_DEPTH {
            return Err(SchemaError::new(path, "schema nesting too deep"));
        }

        match self {
            Self::Bool => match value {
                Value::Bool(_) => Ok(()),
                _ => Err(SchemaError::new(path, "expected boolean")),
            },
            Self::Int => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(()),
                _ => Err(SchemaError::new(path, "expected integer")),
            },
            Self::Float => match value {
                Value::Number(_) => Ok(()),
                _ => Err(SchemaError::new(path, "expected number")),
            },
            Self::Str => match value {
                Value::String(_) => Ok(()),
                _ => Err(SchemaError::new(path, "expected string")),
            },
            Self::Timestamp => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(()),
                Value::String(s) => DateTime::parse_from_rfc3339(s)
                    .map(|_| ())
                    .map_err(|_| SchemaError::new(path, "expected RFC 3339 timestamp")),
                _ => Err(SchemaError::new(path, "expected timestamp")),
            },
            Self::Bytes => match value {
                Value::String(s)
                    if s.bytes().all(|b| {
                        b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'='
                    }) =>
                {
                    Ok(())
                }
                _ => Err(SchemaError::new(path, "expected base64 byte string")),
            },
            Self::Url => match value {
                Value::String(s) => {
                    let scheme_ok = s
                        .split_once("://")
                        .is_some_and(|(scheme, rest)| !scheme.is_empty() && !rest.is_empty());
                    if scheme_ok {
                        Ok(())
                    } else {
                        Err(SchemaError::new(path, "expected URL with scheme"))
                    }
                }
                _ => Err(SchemaError::new(path, "expected URL string")),
            },
            Self::Seq(inner) => match value {
                Value::Array(items) => {
                    for (i, item) in items.iter().enumerate() {
                        path.push(format!("[{i}]"));
                        inner.validate_at(item, path, depth + 1)?;
                        path.pop();
                    }
                    Ok(())
                }
                _ => Err(SchemaError::new(path, "expected sequence")),
            },
            Self::Tuple(parts) => match value {
                Value::Array(items) if items.len() == parts.len() => {
                    for (i, (part, item)) in parts.iter().zip(items).enumerate() {
                        path.push(format!("[{i}]"));
                        part.validate_at(item, path, depth + 1)?;
                        path.pop();
                    }
                    Ok(())
                }
                Value::Array(items) => Err(SchemaError::new(
                    path,
                    format!("expected tuple of {} elements, got {}", parts.len(), items.len()),
                )),
                _ => Err(SchemaError::new(path, "expected tuple")),
            },
            Self::Map(inner) => match value {
                Value::Object(entries) => {
                    for (key, item) in entries {
                        path.push(key.clone());
                        inner.validate_at(item, path, depth + 1)?;
                        path.pop();
                    }
                    Ok(())
                }
                _ => Err(SchemaError::new(path, "expected map")),
            },
            Self::Set(inner) => match value {
                Value::Array(items) => {
                    let mut seen = HashSet::new();
                    for (i, item) in items.iter().enumerate() {
                        path.push(format!("[{i}]"));
                        inner.validate_at(item, path, depth + 1)?;
                        if !seen.insert(item.to_string()) {
                            return Err(SchemaError::new(path, "duplicate set element"));
                        }
                        path.pop();
                    }
                    Ok(())
                }
                _ => Err(SchemaError::new(path, "expected set")),
            },
            Self::Object(fields) => match value {
                Value::Object(entries) => {
                    for (name, field) in fields {
                        path.push(name.clone());
                        match entries.get(name) {
                            Some(item) => field.validate_at(item, path, depth + 1)?,
                            None if field.allows_absent() => {}
                            None => {
                                return Err(SchemaError::new(path, "missing required field"));
                            }
                        }
                        path.pop();
                    }
                    Ok(())
                }
                _ => Err(SchemaError::new(path, "expected object")),
            },
            Self::Optional(inner) | Self::DefaultTo(inner, _) => {
                // Presence is decided by the enclosing object; a present
                // value must satisfy the inner schema.
                inner.validate_at(value, path, depth + 1)
            }
            Self::Nullable(inner) => match value {
                Value::Null => Ok(()),
                _ => inner.validate_at(value, path, depth + 1),
            },
            Self::Union(variants) => {
                for variant in variants {
                    if variant.validate_at(value, path, depth + 1).is_ok() {
                        return Ok(());
                    }
                }
                Err(SchemaError::new(
                    path,
                    format!("expected one of {} union variants", variants.len()),
                ))
            }
            Self::Intersection(parts) => {
                for part in parts {
                    part.validate_at(value, path, depth + 1)?;
                }
                Ok(())
            }
            Self::Lazy(resolve) => resolve().validate_at(value, path, depth + 1),
            Self::Pipe(first, second) => {
                first.validate_at(value, path, depth + 1)?;
                second.validate_at(value, path, depth + 1)
            }
        }
    }

    fn check_at(
        &self,
        path: &mut Vec<String>,
        depth: usize,
        seen_lazy: &mut HashSet<usize>,
    ) -> Result<(), SchemaError> {
        if depth > MAX_DEPTH {
            return Err(SchemaError::new(path, "unbounded lazy schema recursion"));
        }

        match self {
            Self::Bool
            | Self::Int
            | Self::Float
            | Self::Str
            | Self::Timestamp
            | Self::Bytes
            | Self::Url => Ok(()),
            Self::Seq(inner) | Self::Map(inner) | Self::Set(inner) => {
                inner.check_at(path, depth + 1, seen_lazy)
            }
            Self::Tuple(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    path.push(format!("[{i}]"));
                    part.check_at(path, depth + 1, seen_lazy)?;
                    path.pop();
                }
                Ok(())
            }
            Self::Object(fields) => {
                let mut seen = HashSet::new();
                for (name, field) in fields {
                    path.push(name.clone());
                    if !seen.insert(name.as_str()) {
                        return Err(SchemaError::new(path, "duplicate object field"));
                    }
                    field.check_at(path, depth + 1, seen_lazy)?;
                    path.pop();
                }
                Ok(())
            }
            Self::Optional(inner) | Self::Nullable(inner) => {
                inner.check_at(path, depth + 1, seen_lazy)
            }
            Self::DefaultTo(inner, default) => {
                inner.check_at(path, depth + 1, seen_lazy)?;
                inner.validate_at(default, path, depth + 1).map_err(|e| {
                    SchemaError::new(path, format!("default value invalid: {}", e.message))
                })
            }
            Self::Union(variants) => {
                if variants.is_empty() {
                    return Err(SchemaError::new(path, "empty union"));
                }
                for variant in variants {
                    variant.check_at(path, depth + 1, seen_lazy)?;
                }
                Ok(())
            }
            Self::Intersection(parts) => {
                if parts.is_empty() {
                    return Err(SchemaError::new(path, "empty intersection"));
                }
                for part in parts {
                    part.check_at(path, depth + 1, seen_lazy)?;
                }
                Ok(())
            }
            Self::Lazy(resolve) => {
                // A lazy node already under check is a (legal) cycle.
                if !seen_lazy.insert(*resolve as usize) {
                    return Ok(());
                }
                resolve().check_at(path, depth + 1, seen_lazy)
            }
            Self::Pipe(first, second) => {
                first.check_at(path, depth + 1, seen_lazy)?;
                second.check_at(path, depth + 1, seen_lazy)
            }
        }
    }

    /// Whether an enclosing object may omit this field entirely.
    fn allows_absent(&self) -> bool {
        matches!(self, Self::Optional(_) | Self::DefaultTo(..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile_schema() -> Schema {
        Schema::object([
            ("name", Schema::Str),
            ("age", Schema::Optional(Box::new(Schema::Int))),
            (
                "homepage",
                Schema::Nullable(Box::new(Schema::Url)),
            ),
        ])
    }

    #[test]
    fn test_primitives() {
        assert!(Schema::Bool.validate(&json!(true)).is_ok());
        assert!(Schema::Int.validate(&json!(42)).is_ok());
        assert!(Schema::Int.validate(&json!(4.2)).is_err());
        assert!(Schema::Float.validate(&json!(4.2)).is_ok());
        assert!(Schema::Str.validate(&json!("x")).is_ok());
        assert!(Schema::Timestamp.validate(&json!(1700000000000i64)).is_ok());
        assert!(Schema::Timestamp
            .validate(&json!("2024-01-01T00:00:00Z"))
            .is_ok());
        assert!(Schema::Timestamp.validate(&json!("yesterday")).is_err());
        assert!(Schema::Url.validate(&json!("https://example.com")).is_ok());
        assert!(Schema::Url.validate(&json!("example.com")).is_err());
        assert!(Schema::Bytes.validate(&json!("aGVsbG8=")).is_ok());
    }

    #[test]
    fn test_object_validation() {
        let schema = profile_schema();

        assert!(schema
            .validate(&json!({ "name": "Alice", "homepage": null }))
            .is_ok());
        assert!(schema
            .validate(&json!({ "name": "Alice", "age": 30, "homepage": "https://a.example" }))
            .is_ok());

        let err = schema.validate(&json!({ "homepage": null })).unwrap_err();
        assert_eq!(err.path, "root.name");
    }

    #[test]
    fn test_nested_error_path() {
        let schema = Schema::object([(
            "user",
            Schema::object([("profile", profile_schema())]),
        )]);

        let err = schema
            .validate(&json!({ "user": { "profile": { "name": 7, "homepage": null } } }))
            .unwrap_err();
        assert_eq!(err.path, "root.user.profile.name");
    }

    #[test]
    fn test_seq_and_tuple() {
        let seq = Schema::Seq(Box::new(Schema::Int));
        assert!(seq.validate(&json!([1, 2, 3])).is_ok());
        let err = seq.validate(&json!([1, "x", 3])).unwrap_err();
        assert_eq!(err.path, "root.[1]");

        let tuple = Schema::Tuple(vec![Schema::Str, Schema::Int]);
        assert!(tuple.validate(&json!(["a", 1])).is_ok());
        assert!(tuple.validate(&json!(["a", 1, 2])).is_err());
    }

    #[test]
    fn test_set_uniqueness() {
        let set = Schema::Set(Box::new(Schema::Int));
        assert!(set.validate(&json!([1, 2, 3])).is_ok());
        assert!(set.validate(&json!([1, 2, 1])).is_err());
    }

    #[test]
    fn test_union_and_intersection() {
        let union = Schema::Union(vec![Schema::Int, Schema::Str]);
        assert!(union.validate(&json!(1)).is_ok());
        assert!(union.validate(&json!("x")).is_ok());
        assert!(union.validate(&json!(true)).is_err());

        let intersection = Schema::Intersection(vec![
            Schema::object([("a", Schema::Int)]),
            Schema::object([("b", Schema::Str)]),
        ]);
        assert!(intersection.validate(&json!({ "a": 1, "b": "x" })).is_ok());
        assert!(intersection.validate(&json!({ "a": 1 })).is_err());
    }

    #[test]
    fn test_lazy_recursion() {
        fn tree() -> Schema {
            Schema::object([
                ("value", Schema::Int),
                (
                    "children",
                    Schema::Optional(Box::new(Schema::Seq(Box::new(Schema::Lazy(tree))))),
                ),
            ])
        }

        let schema = tree();
        assert!(schema
            .validate(&json!({ "value": 1, "children": [{ "value": 2 }] }))
            .is_ok());
        assert!(schema
            .validate(&json!({ "value": 1, "children": [{ "value": "x" }] }))
            .is_err());
        // Recursion through Lazy is legal at definition time.
        assert!(schema.check().is_ok());
    }

    #[test]
    fn test_definition_check() {
        assert!(profile_schema().check().is_ok());

        let err = Schema::object([("cb", Schema::Union(vec![]))])
            .check()
            .unwrap_err();
        assert_eq!(err.path, "root.cb");
        assert!(err.message.contains("empty union"));

        let dup = Schema::Object(vec![
            ("a".into(), Schema::Int),
            ("a".into(), Schema::Str),
        ]);
        assert!(dup.check().is_err());

        let bad_default = Schema::object([(
            "n",
            Schema::DefaultTo(Box::new(Schema::Int), json!("zero")),
        )]);
        assert!(bad_default.check().is_err());
    }

    #[test]
    fn test_pipe() {
        let pipe = Schema::Pipe(Box::new(Schema::Str), Box::new(Schema::Url));
        assert!(pipe.validate(&json!("https://example.com")).is_ok());
        assert!(pipe.validate(&json!("nope")).is_err());
    }
}
