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

//! A strict subset of BSON, bounds-checked on every read.
//!
//! This is intentionally hand-rolled rather than delegated to a general purpose BSON crate: the
//! wire format Astarte uses is a small, fixed subset (no regex, no ObjectId, no nested documents
//! beyond one level of arrays) and every read must be validated against the declared document
//! length, matching the guarantees the rest of the SDK relies on when decoding payloads that
//! arrived over the network.

use chrono::{DateTime, TimeZone, Utc};

use crate::types::MappingType;

const TAG_DOUBLE: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_DOCUMENT: u8 = 0x03;
const TAG_ARRAY: u8 = 0x04;
const TAG_BINARY: u8 = 0x05;
const TAG_BOOLEAN: u8 = 0x08;
const TAG_DATETIME: u8 = 0x09;
const TAG_INT32: u8 = 0x10;
const TAG_INT64: u8 = 0x12;

const BINARY_SUBTYPE_GENERIC: u8 = 0x00;

/// Maximum number of decimal digits used for an array index key (`"0"`..`"999999999999"`).
const MAX_ARRAY_INDEX_DIGITS: usize = 12;

/// Error produced while building or reading a document.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BsonError {
    /// The buffer is too short to contain a valid document header and trailing NUL.
    #[error("document is truncated")]
    Truncated,
    /// The length prefix doesn't agree with the buffer it was read from.
    #[error("declared document length {declared} doesn't fit in a buffer of {actual} bytes")]
    LengthMismatch { declared: i64, actual: usize },
    /// The byte at `declared_size - 1` isn't 0x00.
    #[error("document is missing its trailing NUL terminator")]
    MissingTerminator,
    /// An element name ran past the end of the document without a NUL.
    #[error("element name overruns the document bounds")]
    NameOverflow,
    /// An element's value would read outside of `[list, list + list_size)`.
    #[error("value of element '{name}' overruns the document bounds")]
    ValueOverflow { name: String },
    /// Computing an element's size would overflow.
    #[error("element size computation overflowed")]
    LengthOverflow,
    /// An unsupported / unknown BSON element type tag was encountered.
    #[error("unsupported BSON element type tag {0:#04x}")]
    UnsupportedTag(u8),
    /// The element's on-wire type doesn't match what the caller expected.
    #[error("type mismatch: expected {expected:?}, found tag {found:#04x}")]
    TypeMismatch { expected: MappingType, found: u8 },
    /// One element of an array didn't match the array's declared scalar type.
    #[error("array element {index} has the wrong type")]
    ArrayTypeMismatch { index: usize },
    /// The requested element/key isn't present in the document.
    #[error("element not found")]
    NotFound,
}

/// Builder for a BSON document.
///
/// Starts with a 4-byte placeholder for the document length; [`DocumentBuilder::finish`]
/// appends the terminating `0x00` and back-patches the length prefix.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    buf: Vec<u8>,
}

impl DocumentBuilder {
    pub fn new() -> Self {
        Self { buf: vec![0; 4] }
    }

    fn append_header(&mut self, tag: u8, name: &str) {
        self.buf.push(tag);
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(0);
    }

    pub fn append_double(&mut self, name: &str, value: f64) -> &mut Self {
        self.append_header(TAG_DOUBLE, name);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn append_int32(&mut self, name: &str, value: i32) -> &mut Self {
        self.append_header(TAG_INT32, name);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn append_int64(&mut self, name: &str, value: i64) -> &mut Self {
        self.append_header(TAG_INT64, name);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn append_boolean(&mut self, name: &str, value: bool) -> &mut Self {
        self.append_header(TAG_BOOLEAN, name);
        self.buf.push(value as u8);
        self
    }

    pub fn append_datetime(&mut self, name: &str, value: DateTime<Utc>) -> &mut Self {
        self.append_header(TAG_DATETIME, name);
        self.buf.extend_from_slice(&value.timestamp_millis().to_le_bytes());
        self
    }

    /// Appends a length-prefixed, NUL-terminated UTF-8 string. The length field includes the
    /// trailing NUL (`strlen + 1`).
    pub fn append_string(&mut self, name: &str, value: &str) -> &mut Self {
        self.append_header(TAG_STRING, name);
        let len = value.len() as i32 + 1;
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn append_binary(&mut self, name: &str, value: &[u8]) -> &mut Self {
        self.append_header(TAG_BINARY, name);
        self.buf.extend_from_slice(&(value.len() as i32).to_le_bytes());
        self.buf.push(BINARY_SUBTYPE_GENERIC);
        self.buf.extend_from_slice(value);
        self
    }

    /// Embeds a finished document as a sub-document element.
    pub fn append_document(&mut self, name: &str, doc: DocumentBuilder) -> &mut Self {
        self.append_header(TAG_DOCUMENT, name);
        self.buf.extend_from_slice(&doc.finish());
        self
    }

    /// Embeds a finished document as an array element (arrays are documents keyed by decimal
    /// index).
    pub fn append_array(&mut self, name: &str, doc: DocumentBuilder) -> &mut Self {
        self.append_header(TAG_ARRAY, name);
        self.buf.extend_from_slice(&doc.finish());
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(0);

        let len = self.buf.len() as i32;
        self.buf[0..4].copy_from_slice(&len.to_le_bytes());

        self.buf
    }
}

/// Builds the nested `{"0": v0, "1": v1, ...}` array document for a homogeneous array of
/// scalars, using the provided closure to append each element under its decimal index.
fn build_array_document<T>(items: &[T], mut append: impl FnMut(&mut DocumentBuilder, &str, &T)) -> DocumentBuilder {
    let mut doc = DocumentBuilder::new();

    for (i, item) in items.iter().enumerate() {
        let key = index_key(i);
        append(&mut doc, &key, item);
    }

    doc
}

fn index_key(i: usize) -> String {
    let key = i.to_string();
    debug_assert!(key.len() <= MAX_ARRAY_INDEX_DIGITS);
    key
}

/// A single parsed element: its type tag, name, and the byte range of its value within the
/// owning document's buffer.
#[derive(Debug, Clone, Copy)]
struct RawElement<'a> {
    tag: u8,
    name: &'a str,
    value: &'a [u8],
}

/// A validated BSON document borrowing its backing buffer.
///
/// [`Document::validate`] is the only entry point: the outer length is checked against the
/// buffer, the trailing NUL is checked, and the first element's name is bounds-checked before
/// any element is returned to the caller.
#[derive(Debug, Clone, Copy)]
pub struct Document<'a> {
    data: &'a [u8],
}

impl<'a> Document<'a> {
    pub fn validate(data: &'a [u8]) -> Result<Self, BsonError> {
        if data.len() < 5 {
            return Err(BsonError::Truncated);
        }

        let declared = i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64;

        if declared < 5 || declared as usize > data.len() {
            return Err(BsonError::LengthMismatch {
                declared,
                actual: data.len(),
            });
        }

        let declared = declared as usize;

        if data[declared - 1] != 0x00 {
            return Err(BsonError::MissingTerminator);
        }

        let doc = Self {
            data: &data[..declared],
        };

        // Validate the first element's type/name eagerly, matching the reference decoder's
        // up-front sanity check.
        if declared > 5 {
            let mut pos = 4;
            doc.read_element(&mut pos)?;
        }

        Ok(doc)
    }

    fn declared_len(&self) -> usize {
        self.data.len()
    }

    /// Reads one element starting at `*pos`, advancing `*pos` past it. Returns `Ok(None)` when
    /// `*pos` is at the trailing NUL (no more elements).
    fn read_element(&self, pos: &mut usize) -> Result<Option<RawElement<'a>>, BsonError> {
        let end = self.declared_len();

        if *pos >= end {
            return Err(BsonError::Truncated);
        }

        let tag = self.data[*pos];

        if tag == 0x00 {
            return Ok(None);
        }

        let mut cursor = *pos + 1;

        let name_start = cursor;
        let name_end = loop {
            if cursor >= end {
                return Err(BsonError::NameOverflow);
            }
            if self.data[cursor] == 0 {
                break cursor;
            }
            cursor += 1;
        };

        let name = std::str::from_utf8(&self.data[name_start..name_end])
            .map_err(|_| BsonError::NameOverflow)?;
        cursor = name_end + 1;

        let value_start = cursor;
        let value_len = self.element_value_len(tag, name, cursor, end)?;
        let value_end = value_start
            .checked_add(value_len)
            .ok_or(BsonError::LengthOverflow)?;

        if value_end > end {
            return Err(BsonError::ValueOverflow {
                name: name.to_owned(),
            });
        }

        *pos = value_end;

        Ok(Some(RawElement {
            tag,
            name,
            value: &self.data[value_start..value_end],
        }))
    }

    fn element_value_len(
        &self,
        tag: u8,
        name: &str,
        value_start: usize,
        end: usize,
    ) -> Result<usize, BsonError> {
        match tag {
            TAG_DOUBLE | TAG_DATETIME | TAG_INT64 => Ok(8),
            TAG_INT32 => Ok(4),
            TAG_BOOLEAN => Ok(1),
            TAG_STRING => {
                let len = self.read_i32_at(value_start, end)?;
                // overflow guard mirroring INT32_MAX - sizeof(int32) - sizeof(int8)
                if len < 1 || len as i64 > i32::MAX as i64 - 4 - 1 {
                    return Err(BsonError::ValueOverflow {
                        name: name.to_owned(),
                    });
                }
                Ok(4 + len as usize)
            }
            TAG_BINARY => {
                let len = self.read_i32_at(value_start, end)?;
                if len < 0 || len as i64 > i32::MAX as i64 - 4 - 1 {
                    return Err(BsonError::ValueOverflow {
                        name: name.to_owned(),
                    });
                }
                Ok(4 + 1 + len as usize)
            }
            TAG_DOCUMENT | TAG_ARRAY => {
                let len = self.read_i32_at(value_start, end)?;
                if len < 5 {
                    return Err(BsonError::ValueOverflow {
                        name: name.to_owned(),
                    });
                }
                Ok(len as usize)
            }
            other => Err(BsonError::UnsupportedTag(other)),
        }
    }

    fn read_i32_at(&self, pos: usize, end: usize) -> Result<i32, BsonError> {
        if pos + 4 > end {
            return Err(BsonError::Truncated);
        }
        Ok(i32::from_le_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ]))
    }

    /// Iterates the top-level elements of this document.
    pub fn elements(&self) -> Elements<'a> {
        Elements {
            doc: *self,
            pos: 4,
        }
    }

    /// Looks up an element by name. `O(n)` linear scan, same as the upstream "called rarely"
    /// interface lookups.
    pub fn get(&self, name: &str) -> Result<Option<Element<'a>>, BsonError> {
        for item in self.elements() {
            let item = item?;
            if item.name() == name {
                return Ok(Some(item));
            }
        }

        Ok(None)
    }

    /// Decodes the element named `name` as the given expected [`MappingType`], widening an
    /// on-wire `int32` to `i64` when `expected` is `LongInteger`.
    pub fn get_typed(
        &self,
        name: &str,
        expected: MappingType,
    ) -> Result<crate::types::AstarteType, BsonError> {
        let element = self.get(name)?.ok_or(BsonError::NotFound)?;
        element.decode(expected)
    }
}

/// A parsed element with accessors for each concrete BSON type.
#[derive(Debug, Clone, Copy)]
pub struct Element<'a> {
    raw: RawElement<'a>,
}

impl<'a> Element<'a> {
    pub fn name(&self) -> &'a str {
        self.raw.name
    }

    pub fn tag(&self) -> u8 {
        self.raw.tag
    }

    fn expect_tag(&self, tag: u8) -> Result<(), BsonError> {
        if self.raw.tag != tag {
            return Err(BsonError::UnsupportedTag(self.raw.tag));
        }
        Ok(())
    }

    pub fn as_f64(&self) -> Result<f64, BsonError> {
        self.expect_tag(TAG_DOUBLE)?;
        Ok(f64::from_le_bytes(self.raw.value.try_into().unwrap()))
    }

    pub fn as_i32(&self) -> Result<i32, BsonError> {
        self.expect_tag(TAG_INT32)?;
        Ok(i32::from_le_bytes(self.raw.value.try_into().unwrap()))
    }

    pub fn as_i64(&self) -> Result<i64, BsonError> {
        self.expect_tag(TAG_INT64)?;
        Ok(i64::from_le_bytes(self.raw.value.try_into().unwrap()))
    }

    pub fn as_bool(&self) -> Result<bool, BsonError> {
        self.expect_tag(TAG_BOOLEAN)?;
        Ok(self.raw.value[0] != 0)
    }

    pub fn as_datetime(&self) -> Result<DateTime<Utc>, BsonError> {
        self.expect_tag(TAG_DATETIME)?;
        let millis = i64::from_le_bytes(self.raw.value.try_into().unwrap());
        Ok(Utc.timestamp_millis_opt(millis).single().unwrap_or_else(|| Utc.timestamp_nanos(0)))
    }

    pub fn as_str(&self) -> Result<&'a str, BsonError> {
        self.expect_tag(TAG_STRING)?;
        // value = [len: i32][bytes..][0x00]; strip the length prefix and trailing NUL.
        let bytes = &self.raw.value[4..self.raw.value.len() - 1];
        std::str::from_utf8(bytes).map_err(|_| BsonError::UnsupportedTag(TAG_STRING))
    }

    pub fn as_binary(&self) -> Result<&'a [u8], BsonError> {
        self.expect_tag(TAG_BINARY)?;
        // value = [len: i32][subtype: u8][bytes..]
        Ok(&self.raw.value[5..])
    }

    pub fn as_document(&self) -> Result<Document<'a>, BsonError> {
        if self.raw.tag != TAG_DOCUMENT && self.raw.tag != TAG_ARRAY {
            return Err(BsonError::UnsupportedTag(self.raw.tag));
        }
        Document::validate(self.raw.value)
    }

    /// Decodes this element as the given expected type, widening `int32 -> i64` only when
    /// `expected` is [`MappingType::LongInteger`].
    pub fn decode(&self, expected: MappingType) -> Result<crate::types::AstarteType, BsonError> {
        use crate::types::AstarteType as T;

        match expected {
            MappingType::Double => self.as_f64().map(T::Double),
            MappingType::Integer => self.as_i32().map(T::Integer),
            MappingType::Boolean => self.as_bool().map(T::Boolean),
            MappingType::LongInteger => {
                // int32 -> int64 widening is accepted losslessly.
                if self.raw.tag == TAG_INT32 {
                    self.as_i32().map(|v| T::LongInteger(v as i64))
                } else {
                    self.as_i64().map(T::LongInteger)
                }
            }
            MappingType::String => self.as_str().map(|s| T::String(s.to_owned())),
            MappingType::BinaryBlob => self.as_binary().map(|b| T::BinaryBlob(b.to_owned())),
            MappingType::DateTime => self.as_datetime().map(T::DateTime),
            array_ty if array_ty.is_array() => self.decode_array(array_ty),
            other => Err(BsonError::TypeMismatch {
                expected: other,
                found: self.raw.tag,
            }),
        }
        .map_err(|err| match err {
            BsonError::UnsupportedTag(found) => BsonError::TypeMismatch { expected, found },
            other => other,
        })
    }

    /// Two-pass array decode: pass 1 validates every element's type against the scalar subtype
    /// and counts them, pass 2 fills a freshly allocated contiguous buffer.
    fn decode_array(&self, array_ty: MappingType) -> Result<crate::types::AstarteType, BsonError> {
        use crate::types::AstarteType as T;

        let scalar = array_ty.scalar();
        let doc = self.as_document()?;

        // Pass 1: validate.
        for (index, item) in doc.elements().enumerate() {
            let item = item?;
            let tag_ok = match scalar {
                MappingType::Double => item.raw.tag == TAG_DOUBLE,
                MappingType::Integer => item.raw.tag == TAG_INT32,
                MappingType::Boolean => item.raw.tag == TAG_BOOLEAN,
                MappingType::LongInteger => {
                    item.raw.tag == TAG_INT64 || item.raw.tag == TAG_INT32
                }
                MappingType::String => item.raw.tag == TAG_STRING,
                MappingType::BinaryBlob => item.raw.tag == TAG_BINARY,
                MappingType::DateTime => item.raw.tag == TAG_DATETIME,
                _ => unreachable!("scalar() never returns an array type"),
            };

            if !tag_ok {
                return Err(BsonError::ArrayTypeMismatch { index });
            }
        }

        // Pass 2: fill.
        macro_rules! collect {
            ($method:ident) => {{
                let mut out = Vec::new();
                for item in doc.elements() {
                    out.push(item?.$method()?);
                }
                out
            }};
        }

        let value = match array_ty {
            MappingType::DoubleArray => T::DoubleArray(collect!(as_f64)),
            MappingType::IntegerArray => T::IntegerArray(collect!(as_i32)),
            MappingType::BooleanArray => T::BooleanArray(collect!(as_bool)),
            MappingType::LongIntegerArray => {
                let mut out = Vec::new();
                for item in doc.elements() {
                    let item = item?;
                    out.push(item.decode(MappingType::LongInteger)?);
                }
                T::LongIntegerArray(
                    out.into_iter()
                        .map(|v| match v {
                            T::LongInteger(v) => v,
                            _ => unreachable!(),
                        })
                        .collect(),
                )
            }
            MappingType::StringArray => T::StringArray(
                collect!(as_str)
                    .into_iter()
                    .map(str::to_owned)
                    .collect(),
            ),
            MappingType::BinaryBlobArray => T::BinaryBlobArray(
                collect!(as_binary)
                    .into_iter()
                    .map(<[u8]>::to_owned)
                    .collect(),
            ),
            MappingType::DateTimeArray => T::DateTimeArray(collect!(as_datetime)),
            _ => unreachable!("array_ty is always an array type"),
        };

        Ok(value)
    }
}

/// Iterator over the top-level elements of a [`Document`].
pub struct Elements<'a> {
    doc: Document<'a>,
    pos: usize,
}

impl<'a> Iterator for Elements<'a> {
    type Item = Result<Element<'a>, BsonError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.doc.read_element(&mut self.pos) {
            Ok(Some(raw)) => Some(Ok(Element { raw })),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

/// Appends an [`crate::types::AstarteType`] to a builder under `name`, including arrays encoded
/// as nested index-keyed documents.
pub fn append_value(builder: &mut DocumentBuilder, name: &str, value: &crate::types::AstarteType) {
    use crate::types::AstarteType as T;

    match value {
        T::Double(v) => {
            builder.append_double(name, *v);
        }
        T::Integer(v) => {
            builder.append_int32(name, *v);
        }
        T::Boolean(v) => {
            builder.append_boolean(name, *v);
        }
        T::LongInteger(v) => {
            builder.append_int64(name, *v);
        }
        T::String(v) => {
            builder.append_string(name, v);
        }
        T::BinaryBlob(v) => {
            builder.append_binary(name, v);
        }
        T::DateTime(v) => {
            builder.append_datetime(name, *v);
        }
        T::DoubleArray(items) => {
            let doc = build_array_document(items, |d, k, v| {
                d.append_double(k, *v);
            });
            builder.append_array(name, doc);
        }
        T::IntegerArray(items) => {
            let doc = build_array_document(items, |d, k, v| {
                d.append_int32(k, *v);
            });
            builder.append_array(name, doc);
        }
        T::BooleanArray(items) => {
            let doc = build_array_document(items, |d, k, v| {
                d.append_boolean(k, *v);
            });
            builder.append_array(name, doc);
        }
        T::LongIntegerArray(items) => {
            let doc = build_array_document(items, |d, k, v| {
                d.append_int64(k, *v);
            });
            builder.append_array(name, doc);
        }
        T::StringArray(items) => {
            let doc = build_array_document(items, |d, k, v| {
                d.append_string(k, v);
            });
            builder.append_array(name, doc);
        }
        T::BinaryBlobArray(items) => {
            let doc = build_array_document(items, |d, k, v| {
                d.append_binary(k, v);
            });
            builder.append_array(name, doc);
        }
        T::DateTimeArray(items) => {
            let doc = build_array_document(items, |d, k, v| {
                d.append_datetime(k, *v);
            });
            builder.append_array(name, doc);
        }
        // Unset never appears inside a document; it is represented by an empty payload.
        T::Unset => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AstarteType;

    #[test]
    fn integer_roundtrip_matches_known_bytes() {
        let mut doc = DocumentBuilder::new();
        doc.append_int32("v", 42);
        let bytes = doc.finish();

        assert_eq!(
            bytes,
            vec![0x0C, 0x00, 0x00, 0x00, 0x10, b'v', 0x00, 0x2A, 0x00, 0x00, 0x00, 0x00]
        );

        let parsed = Document::validate(&bytes).unwrap();
        assert_eq!(parsed.get_typed("v", MappingType::Integer).unwrap(), AstarteType::Integer(42));
    }

    #[test]
    fn roundtrip_every_scalar_type() {
        let values = [
            AstarteType::Double(4.5),
            AstarteType::Integer(-4),
            AstarteType::Boolean(true),
            AstarteType::LongInteger(45543543534_i64),
            AstarteType::String("hello".into()),
            AstarteType::BinaryBlob(b"hello".to_vec()),
            AstarteType::DateTime(Utc.timestamp_opt(1627580808, 0).unwrap()),
        ];

        for value in values {
            let mut builder = DocumentBuilder::new();
            append_value(&mut builder, "v", &value);
            let bytes = builder.finish();

            let doc = Document::validate(&bytes).unwrap();
            let decoded = doc.get_typed("v", value.mapping_type().unwrap()).unwrap();

            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn roundtrip_every_array_type_including_empty() {
        let values = [
            AstarteType::DoubleArray(vec![1.2, 3.4]),
            AstarteType::IntegerArray(vec![]),
            AstarteType::BooleanArray(vec![true, false, true]),
            AstarteType::LongIntegerArray(vec![1, 2, 3]),
            AstarteType::StringArray(vec!["a".into(), "b".into()]),
            AstarteType::BinaryBlobArray(vec![b"a".to_vec(), b"bb".to_vec()]),
        ];

        for value in values {
            let mut builder = DocumentBuilder::new();
            append_value(&mut builder, "v", &value);
            let bytes = builder.finish();

            let doc = Document::validate(&bytes).unwrap();
            let decoded = doc.get_typed("v", value.mapping_type().unwrap()).unwrap();

            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn int32_widens_losslessly_to_longinteger() {
        let mut builder = DocumentBuilder::new();
        builder.append_int32("v", 7);
        let bytes = builder.finish();

        let doc = Document::validate(&bytes).unwrap();
        let decoded = doc.get_typed("v", MappingType::LongInteger).unwrap();

        assert_eq!(decoded, AstarteType::LongInteger(7));
    }

    #[test]
    fn widening_does_not_apply_in_reverse() {
        let mut builder = DocumentBuilder::new();
        builder.append_int64("v", 7);
        let bytes = builder.finish();

        let doc = Document::validate(&bytes).unwrap();
        let err = doc.get_typed("v", MappingType::Integer).unwrap_err();

        assert!(matches!(err, BsonError::TypeMismatch { .. }));
    }

    #[test]
    fn validate_rejects_truncated_buffer() {
        assert!(matches!(Document::validate(&[1, 2, 3]), Err(BsonError::Truncated)));
    }

    #[test]
    fn validate_rejects_declared_length_past_buffer() {
        let bytes = [0xFF, 0x00, 0x00, 0x00, 0x00];
        assert!(matches!(
            Document::validate(&bytes),
            Err(BsonError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn validate_rejects_missing_terminator() {
        let mut builder = DocumentBuilder::new();
        builder.append_int32("v", 1);
        let mut bytes = builder.finish();
        *bytes.last_mut().unwrap() = 0xFF;

        assert!(matches!(
            Document::validate(&bytes),
            Err(BsonError::MissingTerminator)
        ));
    }

    #[test]
    fn iteration_never_reads_past_declared_size() {
        let mut builder = DocumentBuilder::new();
        builder.append_int32("a", 1);
        builder.append_string("b", "hi");
        let mut bytes = builder.finish();
        // Append trailing garbage after the declared document: a conformant reader must ignore it.
        bytes.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let doc = Document::validate(&bytes[..bytes.len() - 4]).unwrap();
        let items: Result<Vec<_>, _> = doc.elements().collect();
        let items = items.unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name(), "a");
        assert_eq!(items[1].name(), "b");
    }
}
