// src/core/value.rs

//! Value types shared by configuration records and decoded messages.

use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// An ordered map of named values, used for transport settings, connection
/// properties and group properties. Insertion order is preserved so that
/// configuration round-trips are stable.
pub type KeyValueMap = IndexMap<String, Variant>;

/// A dynamically typed scalar value, the payload unit of a DataSetMessage
/// field and the value type of [`KeyValueMap`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum Variant {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    ByteString(Bytes),
}

impl Variant {
    pub fn data_type(&self) -> DataType {
        match self {
            Variant::Bool(_) => DataType::Bool,
            Variant::Byte(_) => DataType::Byte,
            Variant::Int16(_) => DataType::Int16,
            Variant::UInt16(_) => DataType::UInt16,
            Variant::Int32(_) => DataType::Int32,
            Variant::UInt32(_) => DataType::UInt32,
            Variant::Int64(_) => DataType::Int64,
            Variant::UInt64(_) => DataType::UInt64,
            Variant::Float(_) => DataType::Float,
            Variant::Double(_) => DataType::Double,
            Variant::String(_) => DataType::String,
            Variant::ByteString(_) => DataType::ByteString,
        }
    }
}

/// The type tag of a dataset field, carried in the field metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    String,
    ByteString,
}

impl DataType {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Byte
                | DataType::Int16
                | DataType::UInt16
                | DataType::Int32
                | DataType::UInt32
                | DataType::Int64
                | DataType::UInt64
                | DataType::Float
                | DataType::Double
        )
    }
}

/// The publisher identifier of a connection, also matched by readers against
/// incoming NetworkMessage headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum PublisherId {
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    String(String),
}

impl PublisherId {
    /// String publisher ids carry a heap buffer and are excluded from the
    /// RT fixed-size fast path.
    pub fn is_fixed_size(&self) -> bool {
        !matches!(self, PublisherId::String(_))
    }
}

impl Default for PublisherId {
    fn default() -> Self {
        PublisherId::UInt16(0)
    }
}

/// Metadata for one dataset field: its name, type and, for String and
/// ByteString fields, the committed maximum length (0 = dynamic).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMetaData {
    pub name: String,
    pub data_type: DataType,
    pub max_string_length: u32,
}

impl FieldMetaData {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            max_string_length: 0,
        }
    }
}
