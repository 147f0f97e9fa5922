use crate::patch::GraphPatch;
use crate::value::Value;
use chrono::{DateTime, TimeDelta, Utc};
use ciborium::value::{Integer, Value as Cbor};
use indexmap::IndexMap;
use thiserror::Error;

/// Standard CBOR tag for RFC 3339 date/time text.
pub const TAG_DATETIME: u64 = 0;
/// Duration in whole microseconds.
pub const TAG_DURATION: u64 = 39_001;
/// Non-owning node reference by id.
pub const TAG_NODE_REF: u64 = 39_002;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("duration {0} does not fit in microseconds")]
    DurationOverflow(TimeDelta),
    #[error("integer out of range")]
    IntegerRange,
    #[error("map keys must be text, got {0}")]
    InvalidMapKey(&'static str),
    #[error("invalid datetime: {0}")]
    InvalidDateTime(String),
    #[error("tag {tag} carries unexpected content")]
    InvalidTagContent { tag: u64 },
    #[error("cbor encode failed: {0}")]
    Encode(String),
    #[error("cbor decode failed: {0}")]
    Decode(String),
}

fn kind_of(value: &Cbor) -> &'static str {
    match value {
        Cbor::Integer(_) => "integer",
        Cbor::Bytes(_) => "bytes",
        Cbor::Float(_) => "float",
        Cbor::Text(_) => "text",
        Cbor::Bool(_) => "bool",
        Cbor::Null => "null",
        Cbor::Tag(_, _) => "tag",
        Cbor::Array(_) => "array",
        Cbor::Map(_) => "map",
        _ => "unknown",
    }
}

pub fn to_cbor(value: &Value) -> Result<Cbor, CodecError> {
    Ok(match value {
        Value::Null => Cbor::Null,
        Value::Bool(flag) => Cbor::Bool(*flag),
        Value::Int(int) => Cbor::Integer(Integer::from(*int)),
        Value::Float(float) => Cbor::Float(*float),
        Value::Str(text) => Cbor::Text(text.clone()),
        Value::Bytes(bytes) => Cbor::Bytes(bytes.clone()),
        Value::DateTime(at) => Cbor::Tag(TAG_DATETIME, Box::new(Cbor::Text(at.to_rfc3339()))),
        Value::Duration(span) => {
            let micros = span
                .num_microseconds()
                .ok_or(CodecError::DurationOverflow(*span))?;
            Cbor::Tag(TAG_DURATION, Box::new(Cbor::Integer(Integer::from(micros))))
        }
        Value::List(items) => Cbor::Array(items.iter().map(to_cbor).collect::<Result<_, _>>()?),
        Value::Map(entries) => Cbor::Map(
            entries
                .iter()
                .map(|(key, value)| Ok((Cbor::Text(key.clone()), to_cbor(value)?)))
                .collect::<Result<_, CodecError>>()?,
        ),
        Value::NodeRef(id) => Cbor::Tag(TAG_NODE_REF, Box::new(Cbor::Integer(Integer::from(*id)))),
    })
}

pub fn from_cbor(value: Cbor) -> Result<Value, CodecError> {
    Ok(match value {
        Cbor::Null => Value::Null,
        Cbor::Bool(flag) => Value::Bool(flag),
        Cbor::Integer(int) => Value::Int(i64::try_from(int).map_err(|_| CodecError::IntegerRange)?),
        Cbor::Float(float) => Value::Float(float),
        Cbor::Text(text) => Value::Str(text),
        Cbor::Bytes(bytes) => Value::Bytes(bytes),
        Cbor::Array(items) => Value::List(
            items
                .into_iter()
                .map(from_cbor)
                .collect::<Result<_, _>>()?,
        ),
        Cbor::Map(entries) => {
            let mut map = IndexMap::with_capacity(entries.len());
            for (key, value) in entries {
                let key = match key {
                    Cbor::Text(key) => key,
                    other => return Err(CodecError::InvalidMapKey(kind_of(&other))),
                };
                map.insert(key, from_cbor(value)?);
            }
            Value::Map(map)
        }
        Cbor::Tag(TAG_DATETIME, inner) => match *inner {
            Cbor::Text(text) => Value::DateTime(
                DateTime::parse_from_rfc3339(&text)
                    .map_err(|err| CodecError::InvalidDateTime(err.to_string()))?
                    .with_timezone(&Utc),
            ),
            _ => return Err(CodecError::InvalidTagContent { tag: TAG_DATETIME }),
        },
        Cbor::Tag(TAG_DURATION, inner) => match *inner {
            Cbor::Integer(int) => Value::Duration(TimeDelta::microseconds(
                i64::try_from(int).map_err(|_| CodecError::IntegerRange)?,
            )),
            _ => return Err(CodecError::InvalidTagContent { tag: TAG_DURATION }),
        },
        Cbor::Tag(TAG_NODE_REF, inner) => match *inner {
            Cbor::Integer(int) => {
                Value::NodeRef(u64::try_from(int).map_err(|_| CodecError::IntegerRange)?)
            }
            _ => return Err(CodecError::InvalidTagContent { tag: TAG_NODE_REF }),
        },
        // Unknown tags decode as their content.
        Cbor::Tag(_, inner) => from_cbor(*inner)?,
        other => return Err(CodecError::Decode(format!("unsupported item {}", kind_of(&other)))),
    })
}

pub fn encode_value(value: &Value) -> Result<Vec<u8>, CodecError> {
    let cbor = to_cbor(value)?;
    let mut out = Vec::new();
    ciborium::ser::into_writer(&cbor, &mut out).map_err(|err| CodecError::Encode(err.to_string()))?;
    Ok(out)
}

pub fn decode_value(bytes: &[u8]) -> Result<Value, CodecError> {
    let cbor: Cbor =
        ciborium::de::from_reader(bytes).map_err(|err| CodecError::Decode(err.to_string()))?;
    from_cbor(cbor)
}

/// Binary form of a graph patch.
pub fn encode_graph(graph: &GraphPatch) -> Result<Vec<u8>, CodecError> {
    encode_value(&graph.to_value())
}

pub fn decode_graph(bytes: &[u8]) -> Result<GraphPatch, CodecError> {
    let value = decode_value(bytes)?;
    GraphPatch::from_value(&value)
        .ok_or_else(|| CodecError::Decode("graph patch must be a map of maps".to_string()))
}
