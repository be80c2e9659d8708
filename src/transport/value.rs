//! Typed topic values
//!
//! `DataType` is the NT4 type id enumeration; `Value` is the tagged payload
//! carried in the fourth slot of a binary value frame. Values serialize as
//! their bare MessagePack representation (the type id travels next to them
//! in the frame), so decoding needs the type id up front: see `ValueSeed`.

use std::fmt;

use serde::de::{self, DeserializeSeed, Deserializer, SeqAccess, Visitor};
use serde::ser::{Serialize, Serializer};

/// Wire type ids. The numeric values are fixed by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Boolean,
    Double,
    Integer,
    Float,
    String,
    Raw,
    BooleanArray,
    DoubleArray,
    IntegerArray,
    FloatArray,
    StringArray,
}

impl DataType {
    pub fn id(self) -> u8 {
        match self {
            DataType::Boolean => 0,
            DataType::Double => 1,
            DataType::Integer => 2,
            DataType::Float => 3,
            DataType::String => 4,
            DataType::Raw => 5,
            DataType::BooleanArray => 16,
            DataType::DoubleArray => 17,
            DataType::IntegerArray => 18,
            DataType::FloatArray => 19,
            DataType::StringArray => 20,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0 => DataType::Boolean,
            1 => DataType::Double,
            2 => DataType::Integer,
            3 => DataType::Float,
            4 => DataType::String,
            5 => DataType::Raw,
            16 => DataType::BooleanArray,
            17 => DataType::DoubleArray,
            18 => DataType::IntegerArray,
            19 => DataType::FloatArray,
            20 => DataType::StringArray,
            _ => return None,
        })
    }

    /// Canonical topic type string for this type id.
    pub fn type_str(self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::Double => "double",
            DataType::Integer => "int",
            DataType::Float => "float",
            DataType::String => "string",
            DataType::Raw => "raw",
            DataType::BooleanArray => "boolean[]",
            DataType::DoubleArray => "double[]",
            DataType::IntegerArray => "int[]",
            DataType::FloatArray => "float[]",
            DataType::StringArray => "string[]",
        }
    }

    /// Maps a topic type string onto the wire type used for its values.
    /// Structured string and binary encodings share the `String`/`Raw` ids.
    pub fn from_type_str(s: &str) -> Option<Self> {
        Some(match s {
            "boolean" => DataType::Boolean,
            "double" => DataType::Double,
            "int" => DataType::Integer,
            "float" => DataType::Float,
            "string" | "json" => DataType::String,
            "raw" | "rpc" | "msgpack" | "protobuf" => DataType::Raw,
            "boolean[]" => DataType::BooleanArray,
            "double[]" => DataType::DoubleArray,
            "int[]" => DataType::IntegerArray,
            "float[]" => DataType::FloatArray,
            "string[]" => DataType::StringArray,
            _ => return None,
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Double(f64),
    Integer(i64),
    Float(f32),
    String(String),
    Raw(Vec<u8>),
    BooleanArray(Vec<bool>),
    DoubleArray(Vec<f64>),
    IntegerArray(Vec<i64>),
    FloatArray(Vec<f32>),
    StringArray(Vec<String>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Double(_) => DataType::Double,
            Value::Integer(_) => DataType::Integer,
            Value::Float(_) => DataType::Float,
            Value::String(_) => DataType::String,
            Value::Raw(_) => DataType::Raw,
            Value::BooleanArray(_) => DataType::BooleanArray,
            Value::DoubleArray(_) => DataType::DoubleArray,
            Value::IntegerArray(_) => DataType::IntegerArray,
            Value::FloatArray(_) => DataType::FloatArray,
            Value::StringArray(_) => DataType::StringArray,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Boolean(v) => serializer.serialize_bool(*v),
            Value::Double(v) => serializer.serialize_f64(*v),
            Value::Integer(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f32(*v),
            Value::String(v) => serializer.serialize_str(v),
            Value::Raw(v) => serializer.serialize_bytes(v),
            Value::BooleanArray(v) => serializer.collect_seq(v),
            Value::DoubleArray(v) => serializer.collect_seq(v),
            Value::IntegerArray(v) => serializer.collect_seq(v),
            Value::FloatArray(v) => serializer.collect_seq(v),
            Value::StringArray(v) => serializer.collect_seq(v),
        }
    }
}

/// Deserializes a `Value` of a type known ahead of time.
#[derive(Debug, Clone, Copy)]
pub struct ValueSeed(pub DataType);

impl<'de> DeserializeSeed<'de> for ValueSeed {
    type Value = Value;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        match self.0 {
            DataType::Boolean => deserializer
                .deserialize_any(BoolVisitor)
                .map(Value::Boolean),
            DataType::Double => deserializer
                .deserialize_any(NumberVisitor)
                .map(|n| Value::Double(n.as_f64())),
            DataType::Float => deserializer
                .deserialize_any(NumberVisitor)
                .map(|n| Value::Float(n.as_f64() as f32)),
            DataType::Integer => deserializer
                .deserialize_any(NumberVisitor)
                .and_then(|n| n.as_i64().ok_or_else(|| de::Error::custom("expected an integer")))
                .map(Value::Integer),
            DataType::String => deserializer
                .deserialize_any(StringVisitor)
                .map(Value::String),
            DataType::Raw => deserializer.deserialize_any(BytesVisitor).map(Value::Raw),
            DataType::BooleanArray => deserializer
                .deserialize_any(ArrayVisitor(BoolVisitor))
                .map(Value::BooleanArray),
            DataType::DoubleArray => deserializer
                .deserialize_any(ArrayVisitor(NumberVisitor))
                .map(|v| Value::DoubleArray(v.into_iter().map(WireNumber::as_f64).collect())),
            DataType::FloatArray => deserializer
                .deserialize_any(ArrayVisitor(NumberVisitor))
                .map(|v| {
                    Value::FloatArray(v.into_iter().map(|n| n.as_f64() as f32).collect())
                }),
            DataType::IntegerArray => {
                let numbers = deserializer.deserialize_any(ArrayVisitor(NumberVisitor))?;
                numbers
                    .into_iter()
                    .map(|n| n.as_i64())
                    .collect::<Option<Vec<_>>>()
                    .map(Value::IntegerArray)
                    .ok_or_else(|| de::Error::custom("expected an integer array"))
            }
            DataType::StringArray => deserializer
                .deserialize_any(ArrayVisitor(StringVisitor))
                .map(Value::StringArray),
        }
    }
}

/// A MessagePack number in whichever representation the peer chose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WireNumber {
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl WireNumber {
    pub fn as_f64(self) -> f64 {
        match self {
            WireNumber::Int(v) => v as f64,
            WireNumber::UInt(v) => v as f64,
            WireNumber::Float(v) => v,
        }
    }

    /// Exact integer view; floats are accepted only when integral.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            WireNumber::Int(v) => Some(v),
            WireNumber::UInt(v) => i64::try_from(v).ok(),
            WireNumber::Float(v) if v.fract() == 0.0 && v.abs() < 9.007_199_254_740_992e15 => {
                Some(v as i64)
            }
            WireNumber::Float(_) => None,
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct NumberVisitor;

impl<'de> Visitor<'de> for NumberVisitor {
    type Value = WireNumber;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a number")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<WireNumber, E> {
        Ok(WireNumber::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<WireNumber, E> {
        Ok(WireNumber::UInt(v))
    }

    fn visit_f32<E: de::Error>(self, v: f32) -> Result<WireNumber, E> {
        Ok(WireNumber::Float(f64::from(v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<WireNumber, E> {
        Ok(WireNumber::Float(v))
    }
}

#[derive(Clone, Copy)]
struct BoolVisitor;

impl<'de> Visitor<'de> for BoolVisitor {
    type Value = bool;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a boolean")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<bool, E> {
        Ok(v)
    }
}

#[derive(Clone, Copy)]
struct StringVisitor;

impl<'de> Visitor<'de> for StringVisitor {
    type Value = String;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<String, E> {
        Ok(v)
    }
}

/// Upper bound on elements reserved from a peer-supplied length header.
const MAX_PREALLOC: usize = 4096;

fn prealloc(hint: Option<usize>) -> usize {
    hint.unwrap_or(0).min(MAX_PREALLOC)
}

#[derive(Clone, Copy)]
struct BytesVisitor;

impl<'de> Visitor<'de> for BytesVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("binary data")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
        Ok(v.to_vec())
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
        Ok(v)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
        let mut out = Vec::with_capacity(prealloc(seq.size_hint()));
        while let Some(b) = seq.next_element::<u8>()? {
            out.push(b);
        }
        Ok(out)
    }
}

struct ArrayVisitor<V>(V);

// Element visitors are `Copy` so one instance serves every item.
impl<'de, V: Visitor<'de> + Copy> Visitor<'de> for ArrayVisitor<V> {
    type Value = Vec<V::Value>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut out = Vec::with_capacity(prealloc(seq.size_hint()));
        while let Some(item) = seq.next_element_seed(Element(self.0))? {
            out.push(item);
        }
        Ok(out)
    }
}

pub(crate) struct Element<V>(pub(crate) V);

impl<'de, V: Visitor<'de>> DeserializeSeed<'de> for Element<V> {
    type Value = V::Value;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<V::Value, D::Error> {
        deserializer.deserialize_any(self.0)
    }
}
