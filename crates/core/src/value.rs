// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed workflow values.
//!
//! A [`Value`] is what flows through variable declarations, step
//! parameters, and step outputs. Stringification always goes through
//! one codepath so that structured values render as JSON rather than
//! a debug-style dump.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::fmt;

/// The type tag a variable or output can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Int,
    Bool,
    Object,
    Json,
    File,
}

/// A typed workflow value.
///
/// Deserializes untagged so that TOML scalars, tables, and arrays map
/// directly onto the matching variant without an explicit `type` tag
/// in the source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    Array(Vec<Json>),
    Object(Map<String, Json>),
}

impl Value {
    /// Stringify for human display or command-line substitution.
    ///
    /// Structured values (`Array`/`Object`) are JSON-encoded; this is
    /// the only stringification path in the crate, so every caller
    /// sees the same representation.
    pub fn to_plain_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => {
                serde_json::to_string(&self.to_json()).unwrap_or_default()
            }
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::Number((*i).into()),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(a) => Json::Array(a.clone()),
            Value::Object(o) => Json::Object(o.clone()),
        }
    }

    pub fn from_json(json: Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::String(n.to_string())
                }
            }
            Json::String(s) => Value::String(s),
            Json::Array(a) => Value::Array(a),
            Json::Object(o) => Value::Object(o),
        }
    }

    /// Coerce this value to the declared type, following the
    /// type-directed rules: `json` parses strings, `object` rejects
    /// strings outright, `string` stringifies everything through
    /// [`Value::to_plain_string`].
    pub fn coerce(self, target: ValueType) -> Result<Value, CoerceError> {
        match target {
            ValueType::String => Ok(Value::String(self.to_plain_string())),
            ValueType::Int => match self {
                Value::Int(i) => Ok(Value::Int(i)),
                Value::String(s) => s
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| CoerceError::NotAnInt(s)),
                other => Err(CoerceError::NotAnInt(other.to_plain_string())),
            },
            ValueType::Bool => match self {
                Value::Bool(b) => Ok(Value::Bool(b)),
                Value::String(s) => match s.as_str() {
                    "true" | "1" | "yes" => Ok(Value::Bool(true)),
                    "false" | "0" | "no" => Ok(Value::Bool(false)),
                    _ => Err(CoerceError::NotABool(s)),
                },
                other => Err(CoerceError::NotABool(other.to_plain_string())),
            },
            ValueType::Object => match self {
                Value::Object(o) => Ok(Value::Object(o)),
                Value::Array(a) => Ok(Value::Array(a)),
                Value::String(s) => Err(CoerceError::NotAnObject(s)),
                other => Err(CoerceError::NotAnObject(other.to_plain_string())),
            },
            ValueType::Json => match self {
                Value::String(s) => {
                    let parsed: Json = serde_json::from_str(&s)
                        .map_err(|e| CoerceError::InvalidJson(s.clone(), e.to_string()))?;
                    Ok(Value::from_json(parsed))
                }
                other => Ok(other),
            },
            // `File` is resolved by the baker (it reads the file and
            // substitutes a `String`); coercion alone treats it as a
            // path string pass-through.
            ValueType::File => Ok(Value::String(self.to_plain_string())),
        }
    }

    pub fn is_empty_string(&self) -> bool {
        matches!(self, Value::String(s) if s.is_empty())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_plain_string())
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

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoerceError {
    #[error("'{0}' is not a valid int")]
    NotAnInt(String),
    #[error("'{0}' is not a valid bool")]
    NotABool(String),
    #[error("'{0}' cannot be coerced to an object")]
    NotAnObject(String),
    #[error("'{0}' is not valid json: {1}")]
    InvalidJson(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stringify_object_as_json_not_debug() {
        let mut map = Map::new();
        map.insert("key".into(), Json::String("value".into()));
        let v = Value::Object(map);
        assert_eq!(v.to_plain_string(), r#"{"key":"value"}"#);
    }

    #[test]
    fn empty_string_is_a_set_value() {
        assert!(Value::String(String::new()).is_empty_string());
        assert!(!Value::String("x".into()).is_empty_string());
    }

    #[test]
    fn coerce_string_to_json_parses_object() {
        let v = Value::String(r#"{"a":1}"#.into());
        let coerced = v.coerce(ValueType::Json).unwrap();
        assert!(matches!(coerced, Value::Object(_)));
    }

    #[test]
    fn coerce_object_to_string_rejected() {
        let err = Value::String("not an object".into())
            .coerce(ValueType::Object)
            .unwrap_err();
        assert!(matches!(err, CoerceError::NotAnObject(_)));
    }

    #[test]
    fn coerce_bool_accepts_yes_no() {
        assert_eq!(
            Value::String("yes".into()).coerce(ValueType::Bool).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            Value::String("no".into()).coerce(ValueType::Bool).unwrap(),
            Value::Bool(false)
        );
    }
}
