//! Scalar kinds and index orderings
//!
//! `FieldType` discriminates the stored column type of a document value.
//! A field name may appear with several types in the same doc part; each
//! `(name, type)` pair is a distinct field with its own column. The enum is
//! matched exhaustively wherever types drive behavior, so adding a kind is
//! a compile-time checked change.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The stored type of a document scalar value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldType {
    /// true/false
    Boolean,
    /// 32-bit signed integer
    Integer,
    /// 64-bit signed integer
    Long,
    /// 64-bit IEEE float
    Double,
    /// UTF-8 text
    String,
    /// Calendar date without time of day
    Date,
    /// Time of day without date
    Time,
    /// Point on the timeline
    Instant,
    /// Raw bytes
    Binary,
    /// Explicit null value
    Null,
    /// Marker for a nested object or array; the data lives in a child doc part
    Child,
}

impl FieldType {
    /// Single-character discriminator used in generated column identifiers.
    pub fn discriminator(self) -> char {
        match self {
            FieldType::Boolean => 'b',
            FieldType::Integer => 'i',
            FieldType::Long => 'l',
            FieldType::Double => 'd',
            FieldType::String => 's',
            FieldType::Date => 'c',
            FieldType::Time => 't',
            FieldType::Instant => 'g',
            FieldType::Binary => 'r',
            FieldType::Null => 'n',
            FieldType::Child => 'e',
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Boolean => "boolean",
            FieldType::Integer => "integer",
            FieldType::Long => "long",
            FieldType::Double => "double",
            FieldType::String => "string",
            FieldType::Date => "date",
            FieldType::Time => "time",
            FieldType::Instant => "instant",
            FieldType::Binary => "binary",
            FieldType::Null => "null",
            FieldType::Child => "child",
        };
        write!(f, "{}", name)
    }
}

/// Sort direction of one index column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldIndexOrdering {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

impl fmt::Display for FieldIndexOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldIndexOrdering::Asc => write!(f, "asc"),
            FieldIndexOrdering::Desc => write!(f, "desc"),
        }
    }
}
