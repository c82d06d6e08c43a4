// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dynamic column values.
//!
//! A replicated row is a mapping from column name to [`Value`], the closed
//! sum of everything SQLite can hand back: null, 64-bit integers, doubles,
//! text, blobs, and timestamps. Timestamps are not a native SQLite storage
//! class; they exist so that date/time columns survive the wire with their
//! semantic type instead of degrading to an ambiguous integer.
//!
//! # Wire representation
//!
//! Values encode to plain CBOR primitives, except [`Value::Timestamp`]
//! which is wrapped in CBOR tag 1 (epoch-based time) so that any peer can
//! recognize it without consulting the table schema. Decode accepts both
//! tag 1 (integer or fractional seconds) and tag 0 (RFC 3339 text) and
//! normalizes to milliseconds since the Unix epoch.

use crate::error::Result;
use minicbor::data::{Tag, Type};
use minicbor::{Decoder, Encoder};

/// CBOR tag for epoch-based date/time.
const TAG_EPOCH: u64 = 1;
/// CBOR tag for RFC 3339 date/time strings.
const TAG_RFC3339: u64 = 0;

/// One dynamically typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
}

impl Value {
    /// Human-readable storage-class name, for logs and errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
            Value::Timestamp(_) => "timestamp",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Encode this value onto an in-flight CBOR stream.
    pub fn encode(&self, e: &mut Encoder<&mut Vec<u8>>) -> Result<()> {
        match self {
            Value::Null => {
                e.null()?;
            }
            Value::Integer(v) => {
                e.i64(*v)?;
            }
            Value::Real(v) => {
                e.f64(*v)?;
            }
            Value::Text(v) => {
                e.str(v)?;
            }
            Value::Blob(v) => {
                e.bytes(v)?;
            }
            Value::Timestamp(ms) => {
                e.tag(Tag::new(TAG_EPOCH))?;
                e.f64(*ms as f64 / 1000.0)?;
            }
        }
        Ok(())
    }

    /// Decode one value from a CBOR stream.
    pub fn decode(d: &mut Decoder<'_>) -> Result<Value> {
        match d.datatype()? {
            Type::Null => {
                d.null()?;
                Ok(Value::Null)
            }
            Type::Bool => Ok(Value::Integer(d.bool()? as i64)),
            Type::U8 | Type::U16 | Type::U32 | Type::U64 | Type::I8 | Type::I16 | Type::I32
            | Type::I64 | Type::Int => {
                let n = d.int()?;
                let n = i64::try_from(n).map_err(|_| {
                    minicbor::decode::Error::message("integer out of i64 range")
                })?;
                Ok(Value::Integer(n))
            }
            Type::F32 => Ok(Value::Real(d.f32()? as f64)),
            Type::F64 => Ok(Value::Real(d.f64()?)),
            Type::String | Type::StringIndef => Ok(Value::Text(d.str()?.to_owned())),
            Type::Bytes | Type::BytesIndef => Ok(Value::Blob(d.bytes()?.to_vec())),
            Type::Tag => {
                let tag = d.tag()?;
                Self::decode_tagged(d, tag.as_u64())
            }
            _ => Err(minicbor::decode::Error::message("unsupported value type").into()),
        }
    }

    fn decode_tagged(d: &mut Decoder<'_>, tag: u64) -> Result<Value> {
        match tag {
            TAG_EPOCH => match d.datatype()? {
                Type::F64 => Ok(Value::Timestamp((d.f64()? * 1000.0).round() as i64)),
                Type::F32 => {
                    Ok(Value::Timestamp((d.f32()? as f64 * 1000.0).round() as i64))
                }
                _ => {
                    let secs = i64::try_from(d.int()?).map_err(|_| {
                        minicbor::decode::Error::message("epoch seconds out of range")
                    })?;
                    Ok(Value::Timestamp(secs * 1000))
                }
            },
            TAG_RFC3339 => {
                let text = d.str()?;
                let parsed = chrono::DateTime::parse_from_rfc3339(text).map_err(|_| {
                    minicbor::decode::Error::message("malformed RFC 3339 timestamp")
                })?;
                Ok(Value::Timestamp(parsed.timestamp_millis()))
            }
            // Unknown tag: keep the inner value, drop the tag.
            _ => Self::decode(d),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
