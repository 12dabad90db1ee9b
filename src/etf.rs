//! External Term Format transcoding.
//!
//! Bridges the gateway's ETF wire encoding to [`serde_json::Value`] so
//! the rest of the shard is codec-agnostic. Atoms `true`/`false`/`nil`
//! map to JSON booleans and null; binaries map to strings; maps map to
//! objects with stringified keys.

use std::collections::HashMap;
use std::io::Cursor;

use eetf::{Atom, Binary, BigInteger, FixInteger, Float, List, Map, Term};
use serde_json::{Map as JsonMap, Number, Value};

use crate::error::GatewayError;

/// Decode an ETF message into a JSON value.
pub(crate) fn decode(bytes: &[u8]) -> Result<Value, GatewayError> {
    let term =
        Term::decode(Cursor::new(bytes)).map_err(|e| GatewayError::Etf(e.to_string()))?;
    term_to_value(&term)
}

/// Encode a JSON value as an ETF message.
pub(crate) fn encode(value: &Value) -> Result<Vec<u8>, GatewayError> {
    let term = value_to_term(value)?;
    let mut out = Vec::new();
    term.encode(&mut out)
        .map_err(|e| GatewayError::Etf(e.to_string()))?;
    Ok(out)
}

fn term_to_value(term: &Term) -> Result<Value, GatewayError> {
    match term {
        Term::Atom(atom) => Ok(match atom.name.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "nil" | "null" => Value::Null,
            other => Value::String(other.to_owned()),
        }),
        Term::FixInteger(n) => Ok(Value::from(n.value)),
        Term::BigInteger(n) => i64::try_from(&n.value)
            .map(Value::from)
            .or_else(|_| u64::try_from(&n.value).map(Value::from))
            .map_err(|_| GatewayError::Etf("integer out of range".to_string())),
        Term::Float(f) => Number::from_f64(f.value)
            .map(Value::Number)
            .ok_or_else(|| GatewayError::Etf("non-finite float".to_string())),
        Term::Binary(b) => Ok(Value::String(
            String::from_utf8_lossy(&b.bytes).into_owned(),
        )),
        Term::List(list) => list
            .elements
            .iter()
            .map(term_to_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Term::Tuple(tuple) => tuple
            .elements
            .iter()
            .map(term_to_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Term::Map(map) => {
            let mut object = JsonMap::new();
            for (key, value) in &map.map {
                object.insert(term_key(key)?, term_to_value(value)?);
            }
            Ok(Value::Object(object))
        }
        other => Err(GatewayError::Etf(format!("unsupported term: {other:?}"))),
    }
}

/// Map keys on the wire are atoms or binaries.
fn term_key(term: &Term) -> Result<String, GatewayError> {
    match term {
        Term::Atom(atom) => Ok(atom.name.clone()),
        Term::Binary(b) => Ok(String::from_utf8_lossy(&b.bytes).into_owned()),
        other => Err(GatewayError::Etf(format!("unsupported map key: {other:?}"))),
    }
}

fn value_to_term(value: &Value) -> Result<Term, GatewayError> {
    match value {
        Value::Null => Ok(Term::from(Atom::from("nil"))),
        Value::Bool(true) => Ok(Term::from(Atom::from("true"))),
        Value::Bool(false) => Ok(Term::from(Atom::from("false"))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(small) = i32::try_from(i) {
                    Ok(Term::from(FixInteger::from(small)))
                } else {
                    Ok(Term::from(BigInteger::from(i)))
                }
            } else if let Some(u) = n.as_u64() {
                Ok(Term::from(BigInteger::from(u)))
            } else if let Some(f) = n.as_f64() {
                Ok(Term::from(Float { value: f }))
            } else {
                Err(GatewayError::Etf("unrepresentable number".to_string()))
            }
        }
        Value::String(s) => Ok(Term::from(Binary::from(s.as_bytes().to_vec()))),
        Value::Array(items) => {
            let elements = items
                .iter()
                .map(value_to_term)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Term::from(List::from(elements)))
        }
        Value::Object(object) => {
            let mut map = HashMap::with_capacity(object.len());
            for (key, value) in object {
                map.insert(
                    Term::from(Binary::from(key.as_bytes().to_vec())),
                    value_to_term(value)?,
                );
            }
            Ok(Term::from(Map::from(map)))
        }
    }
}
