// This file is part of Astarte.
//
// Copyright 2021 - 2025 SECO Mind Srl
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Astarte value types and the mapping type enumeration they are tagged with.

use chrono::{DateTime, Utc};

/// Closed enumeration of the types a [`Mapping`][crate::interface::Mapping] can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingType {
    Double,
    Integer,
    Boolean,
    LongInteger,
    String,
    BinaryBlob,
    DateTime,
    DoubleArray,
    IntegerArray,
    BooleanArray,
    LongIntegerArray,
    StringArray,
    BinaryBlobArray,
    DateTimeArray,
}

impl MappingType {
    /// Whether this type represents an array mapping.
    pub fn is_array(self) -> bool {
        matches!(
            self,
            Self::DoubleArray
                | Self::IntegerArray
                | Self::BooleanArray
                | Self::LongIntegerArray
                | Self::StringArray
                | Self::BinaryBlobArray
                | Self::DateTimeArray
        )
    }

    /// The scalar type backing an array mapping, or `self` if already scalar.
    pub fn scalar(self) -> Self {
        match self {
            Self::DoubleArray => Self::Double,
            Self::IntegerArray => Self::Integer,
            Self::BooleanArray => Self::Boolean,
            Self::LongIntegerArray => Self::LongInteger,
            Self::StringArray => Self::String,
            Self::BinaryBlobArray => Self::BinaryBlob,
            Self::DateTimeArray => Self::DateTime,
            scalar => scalar,
        }
    }

    /// Stable numeric discriminant, used by property stores that need to persist the mapping
    /// type alongside a value to decode it back later.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Double => 1,
            Self::Integer => 2,
            Self::Boolean => 3,
            Self::LongInteger => 4,
            Self::String => 5,
            Self::BinaryBlob => 6,
            Self::DateTime => 7,
            Self::DoubleArray => 8,
            Self::IntegerArray => 9,
            Self::BooleanArray => 10,
            Self::LongIntegerArray => 11,
            Self::StringArray => 12,
            Self::BinaryBlobArray => 13,
            Self::DateTimeArray => 14,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            1 => Self::Double,
            2 => Self::Integer,
            3 => Self::Boolean,
            4 => Self::LongInteger,
            5 => Self::String,
            6 => Self::BinaryBlob,
            7 => Self::DateTime,
            8 => Self::DoubleArray,
            9 => Self::IntegerArray,
            10 => Self::BooleanArray,
            11 => Self::LongIntegerArray,
            12 => Self::StringArray,
            13 => Self::BinaryBlobArray,
            14 => Self::DateTimeArray,
            _ => return None,
        })
    }
}

/// Error returned when converting a Rust value to/from an [`AstarteType`] fails.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum TypeError {
    /// The source value can't be represented as an [`AstarteType`].
    #[error("could not convert value to an Astarte type")]
    Conversion,
    /// The stored/received type doesn't match what the mapping declares.
    #[error("type mismatch: expected {expected:?}, found {found:?}")]
    Mismatch {
        expected: MappingType,
        found: MappingType,
    },
}

/// An Astarte individual value.
///
/// Tagged sum matching the [`MappingType`] enumeration, plus the special `Unset` marker used
/// only for property-unset events and device-owned unset payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum AstarteType {
    Double(f64),
    Integer(i32),
    Boolean(bool),
    LongInteger(i64),
    String(String),
    BinaryBlob(Vec<u8>),
    DateTime(DateTime<Utc>),
    DoubleArray(Vec<f64>),
    IntegerArray(Vec<i32>),
    BooleanArray(Vec<bool>),
    LongIntegerArray(Vec<i64>),
    StringArray(Vec<String>),
    BinaryBlobArray(Vec<Vec<u8>>),
    DateTimeArray(Vec<DateTime<Utc>>),
    /// Marker value used to represent an unset property; never sent on the wire as `v`, it is
    /// instead represented as a zero-length payload (see [`crate::payload`]).
    Unset,
}

impl AstarteType {
    /// The [`MappingType`] tag for this value, if it carries one (`Unset` has none).
    pub fn mapping_type(&self) -> Option<MappingType> {
        match self {
            Self::Double(_) => Some(MappingType::Double),
            Self::Integer(_) => Some(MappingType::Integer),
            Self::Boolean(_) => Some(MappingType::Boolean),
            Self::LongInteger(_) => Some(MappingType::LongInteger),
            Self::String(_) => Some(MappingType::String),
            Self::BinaryBlob(_) => Some(MappingType::BinaryBlob),
            Self::DateTime(_) => Some(MappingType::DateTime),
            Self::DoubleArray(_) => Some(MappingType::DoubleArray),
            Self::IntegerArray(_) => Some(MappingType::IntegerArray),
            Self::BooleanArray(_) => Some(MappingType::BooleanArray),
            Self::LongIntegerArray(_) => Some(MappingType::LongIntegerArray),
            Self::StringArray(_) => Some(MappingType::StringArray),
            Self::BinaryBlobArray(_) => Some(MappingType::BinaryBlobArray),
            Self::DateTimeArray(_) => Some(MappingType::DateTimeArray),
            Self::Unset => None,
        }
    }

    pub fn display_type(&self) -> &'static str {
        match self {
            Self::Double(_) => "double",
            Self::Integer(_) => "integer",
            Self::Boolean(_) => "boolean",
            Self::LongInteger(_) => "longinteger",
            Self::String(_) => "string",
            Self::BinaryBlob(_) => "binaryblob",
            Self::DateTime(_) => "datetime",
            Self::DoubleArray(_) => "doublearray",
            Self::IntegerArray(_) => "integerarray",
            Self::BooleanArray(_) => "booleanarray",
            Self::LongIntegerArray(_) => "longintegerarray",
            Self::StringArray(_) => "stringarray",
            Self::BinaryBlobArray(_) => "binaryblobarray",
            Self::DateTimeArray(_) => "datetimearray",
            Self::Unset => "unset",
        }
    }
}

macro_rules! impl_try_from {
    ($ty:ty, $variant:ident) => {
        impl TryFrom<$ty> for AstarteType {
            type Error = TypeError;

            fn try_from(value: $ty) -> Result<Self, Self::Error> {
                Ok(Self::$variant(value.into()))
            }
        }
    };
}

impl_try_from!(f64, Double);
impl_try_from!(i32, Integer);
impl_try_from!(bool, Boolean);
impl_try_from!(i64, LongInteger);
impl_try_from!(String, String);
impl_try_from!(Vec<u8>, BinaryBlob);
impl_try_from!(DateTime<Utc>, DateTime);
impl_try_from!(Vec<f64>, DoubleArray);
impl_try_from!(Vec<i32>, IntegerArray);
impl_try_from!(Vec<bool>, BooleanArray);
impl_try_from!(Vec<i64>, LongIntegerArray);
impl_try_from!(Vec<String>, StringArray);
impl_try_from!(Vec<Vec<u8>>, BinaryBlobArray);
impl_try_from!(Vec<DateTime<Utc>>, DateTimeArray);

impl TryFrom<&str> for AstarteType {
    type Error = TypeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(Self::String(value.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_type_array_scalar_roundtrip() {
        assert!(MappingType::IntegerArray.is_array());
        assert!(!MappingType::Integer.is_array());
        assert_eq!(MappingType::IntegerArray.scalar(), MappingType::Integer);
        assert_eq!(MappingType::Integer.scalar(), MappingType::Integer);
    }

    #[test]
    fn try_from_primitives() {
        assert_eq!(
            AstarteType::try_from(42i32).unwrap(),
            AstarteType::Integer(42)
        );
        assert_eq!(
            AstarteType::try_from("hi").unwrap(),
            AstarteType::String("hi".to_owned())
        );
    }
}
