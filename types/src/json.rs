//! JSON view of a [`Value`] graph, used by tooling and diagnostics.
//!
//! Objects carry their type under `"$type"`, byte strings are
//! `{"$bytes": "<base64>"}`. A composite that is reached again while it is
//! still being rendered becomes `{"$cycle": "<type or list>"}`.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Number, Value as Json};
use thiserror::Error;

use crate::{InvalidTypeName, ListRef, ObjectRef, TypeName, Value};

pub const TYPE_KEY: &str = "$type";
pub const BYTES_KEY: &str = "$bytes";
const NATIVE_KEY: &str = "$native";
const CYCLE_KEY: &str = "$cycle";

#[derive(Debug, Error)]
pub enum JsonValueError {
    #[error("JSON object at {path} has no \"$type\" key")]
    MissingType { path: String },
    #[error("invalid type name at {path}: {source}")]
    InvalidType {
        path: String,
        source: InvalidTypeName,
    },
    #[error("invalid base64 at {path}: {source}")]
    InvalidBytes {
        path: String,
        source: base64::DecodeError,
    },
    #[error("number at {path} is not representable as i64 or f64")]
    UnsupportedNumber { path: String },
}

/// Render a value graph as JSON.
#[must_use]
pub fn to_json(value: &Value) -> Json {
    render(value, &mut Vec::new())
}

fn render(value: &Value, path: &mut Vec<usize>) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::Number(Number::from(*i)),
        Value::Float(x) => Number::from_f64(*x).map_or(Json::Null, Json::Number),
        Value::Text(s) => Json::String(s.clone()),
        Value::Bytes(bytes) => single(BYTES_KEY, Json::String(BASE64.encode(bytes))),
        Value::Native(handle) => single(NATIVE_KEY, Json::String(handle.label().to_string())),
        Value::List(list) => {
            if path.contains(&list.addr()) {
                return single(CYCLE_KEY, Json::String("list".to_string()));
            }
            path.push(list.addr());
            let items = list.to_vec().iter().map(|item| render(item, path)).collect();
            path.pop();
            Json::Array(items)
        }
        Value::Object(obj) => {
            if path.contains(&obj.addr()) {
                return single(CYCLE_KEY, Json::String(obj.type_name().to_string()));
            }
            path.push(obj.addr());
            let mut map = Map::new();
            map.insert(
                TYPE_KEY.to_string(),
                Json::String(obj.type_name().to_string()),
            );
            for (name, field) in obj.fields() {
                map.insert(name, render(&field, path));
            }
            path.pop();
            Json::Object(map)
        }
    }
}

fn single(key: &str, value: Json) -> Json {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Json::Object(map)
}

/// Build a value graph from JSON. Every JSON object must name its type.
pub fn from_json(json: &Json) -> Result<Value, JsonValueError> {
    parse(json, "$")
}

fn parse(json: &Json, path: &str) -> Result<Value, JsonValueError> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_f64().map(Value::Float))
            .ok_or_else(|| JsonValueError::UnsupportedNumber {
                path: path.to_string(),
            }),
        Json::String(s) => Ok(Value::Text(s.clone())),
        Json::Array(items) => {
            let values = items
                .iter()
                .enumerate()
                .map(|(i, item)| parse(item, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::List(ListRef::new(values)))
        }
        Json::Object(map) => {
            if let Some(Json::String(encoded)) = map.get(BYTES_KEY)
                && map.len() == 1
            {
                return BASE64
                    .decode(encoded)
                    .map(Value::Bytes)
                    .map_err(|source| JsonValueError::InvalidBytes {
                        path: path.to_string(),
                        source,
                    });
            }
            let type_name = match map.get(TYPE_KEY) {
                Some(Json::String(name)) => {
                    TypeName::new(name.as_str()).map_err(|source| JsonValueError::InvalidType {
                        path: path.to_string(),
                        source,
                    })?
                }
                _ => {
                    return Err(JsonValueError::MissingType {
                        path: path.to_string(),
                    });
                }
            };
            let mut fields = BTreeMap::new();
            for (name, field) in map.iter().filter(|(name, _)| *name != TYPE_KEY) {
                fields.insert(name.clone(), parse(field, &format!("{path}.{name}"))?);
            }
            Ok(Value::Object(ObjectRef::with_fields(type_name, fields)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_typed_objects() {
        let value = Value::object(
            TypeName::from_static("Order"),
            [
                ("total", Value::Int(10)),
                ("blob", Value::Bytes(vec![0xde, 0xad])),
            ],
        );
        assert_eq!(
            to_json(&value),
            json!({"$type": "Order", "total": 10, "blob": {"$bytes": "3q0="}})
        );
    }

    #[test]
    fn parses_back_into_value() {
        let json = json!({
            "$type": "Order",
            "total": 10,
            "ratio": 0.5,
            "items": [{"$type": "Item", "sku": "A"}],
        });
        let value = from_json(&json).expect("parse");
        assert_eq!(to_json(&value), json);
    }

    #[test]
    fn untyped_object_is_rejected() {
        let err = from_json(&json!({"items": [{"sku": "A"}]})).expect_err("missing type");
        assert!(matches!(err, JsonValueError::MissingType { .. }));
    }

    #[test]
    fn cycles_render_as_markers() {
        let node = ObjectRef::new(TypeName::from_static("Node"));
        node.set("next", Value::Object(node.clone()));
        assert_eq!(
            to_json(&Value::Object(node)),
            json!({"$type": "Node", "next": {"$cycle": "Node"}})
        );
    }
}
