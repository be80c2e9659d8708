//! Binary value frames
//!
//! A frame is a MessagePack array of exactly four elements:
//! `[topic_id, timestamp_micros, type_id, value]`. Topic id `-1` is reserved
//! for round-trip-time probes. A single binary WebSocket message may carry
//! several frames back to back; `FrameReader` walks them in order.

use std::fmt;
use std::io::Cursor;

use serde::de::{self, Deserializer, IgnoredAny, SeqAccess, Visitor};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};

use crate::transport::value::{DataType, Element, NumberVisitor, Value, ValueSeed};
use crate::utils::error::{Nt4Error, Result};

/// Topic id used by round-trip-time probe frames.
pub const RTT_TOPIC_ID: i64 = -1;

/// Wall-clock time in microseconds, the unit of every frame timestamp.
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueFrame {
    pub topic_id: i64,
    pub timestamp: i64,
    pub type_id: u8,
    pub value: Value,
}

impl ValueFrame {
    pub fn new(topic_id: i64, timestamp: i64, value: Value) -> Self {
        Self {
            topic_id,
            timestamp,
            type_id: value.data_type().id(),
            value,
        }
    }

    /// Probe frame: `[-1, timestamp, 0, 0]`.
    pub fn rtt(timestamp: i64) -> Self {
        Self {
            topic_id: RTT_TOPIC_ID,
            timestamp,
            type_id: 0,
            value: Value::Integer(0),
        }
    }

    pub fn is_rtt(&self) -> bool {
        self.topic_id == RTT_TOPIC_ID
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }
}

pub fn encode_value_frame(
    topic_id: i64,
    timestamp: i64,
    type_id: u8,
    value: &Value,
) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(&(topic_id, timestamp, type_id, value))?)
}

/// Decodes a buffer holding exactly one frame.
pub fn decode_value_frame(bytes: &[u8]) -> Result<ValueFrame> {
    let mut reader = FrameReader::new(bytes);
    let frame = match reader.next() {
        Some(res) => res?.0,
        None => return Err(Nt4Error::Decode("empty value frame".to_string())),
    };
    if !reader.is_exhausted() {
        return Err(Nt4Error::Decode("trailing bytes after value frame".to_string()));
    }
    Ok(frame)
}

/// Iterates the frames of a binary message, yielding each decoded frame
/// together with the exact bytes it was decoded from. Stops after the
/// first malformed frame since the remainder cannot be resynchronized.
pub struct FrameReader<'a> {
    cursor: Cursor<&'a [u8]>,
    failed: bool,
}

impl<'a> FrameReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
            failed: false,
        }
    }

    fn is_exhausted(&self) -> bool {
        self.cursor.position() as usize >= self.cursor.get_ref().len()
    }
}

impl<'a> Iterator for FrameReader<'a> {
    type Item = Result<(ValueFrame, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.is_exhausted() {
            return None;
        }
        let start = self.cursor.position() as usize;
        match rmp_serde::decode::from_read::<_, ValueFrame>(&mut self.cursor) {
            Ok(frame) => {
                let end = self.cursor.position() as usize;
                let bytes: &'a [u8] = *self.cursor.get_ref();
                Some(Ok((frame, &bytes[start..end])))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e.into()))
            }
        }
    }
}

impl Serialize for ValueFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(4)?;
        tup.serialize_element(&self.topic_id)?;
        tup.serialize_element(&self.timestamp)?;
        tup.serialize_element(&self.type_id)?;
        tup.serialize_element(&self.value)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for ValueFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(FrameVisitor)
    }
}

struct FrameVisitor;

impl FrameVisitor {
    fn integer<'de, A: SeqAccess<'de>>(
        seq: &mut A,
        index: usize,
        what: &str,
    ) -> std::result::Result<i64, A::Error> {
        let number = seq
            .next_element_seed(Element(NumberVisitor))?
            .ok_or_else(|| de::Error::invalid_length(index, &"an array of 4 elements"))?;
        number
            .as_i64()
            .ok_or_else(|| de::Error::custom(format!("{what} must be an integer")))
    }
}

impl<'de> Visitor<'de> for FrameVisitor {
    type Value = ValueFrame;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of 4 elements")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<ValueFrame, A::Error> {
        if let Some(len) = seq.size_hint() {
            if len != 4 {
                return Err(de::Error::invalid_length(len, &self));
            }
        }

        let topic_id = Self::integer(&mut seq, 0, "topic id")?;
        let timestamp = Self::integer(&mut seq, 1, "timestamp")?;
        let raw_type = Self::integer(&mut seq, 2, "type id")?;
        let type_id = u8::try_from(raw_type)
            .map_err(|_| de::Error::custom(format!("type id {raw_type} out of range")))?;

        // Probes carry an integer payload whatever their type id says.
        let data_type = if topic_id == RTT_TOPIC_ID {
            DataType::Integer
        } else {
            DataType::from_id(type_id)
                .ok_or_else(|| de::Error::custom(format!("unknown type id {type_id}")))?
        };
        let value = seq
            .next_element_seed(ValueSeed(data_type))?
            .ok_or_else(|| de::Error::invalid_length(3, &self))?;

        if seq.next_element::<IgnoredAny>()?.is_some() {
            return Err(de::Error::invalid_length(5, &self));
        }

        Ok(ValueFrame {
            topic_id,
            timestamp,
            type_id,
            value,
        })
    }
}
