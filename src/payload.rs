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

//! The `{"v": ..., "t"?: ...}` envelope wrapped around every individual and object payload, on
//! top of the raw codec in [`crate::bson`].

use chrono::{DateTime, Utc};

use crate::bson::{self, BsonError, Document, DocumentBuilder};
use crate::types::{AstarteType, MappingType};

/// A single `(endpoint, value)` entry of an aggregated object payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEntry {
    pub endpoint: String,
    pub value: AstarteType,
}

/// Encodes a single value as `{"v": value}`, with an optional `"t"` timestamp field.
///
/// An empty payload represents [`AstarteType::Unset`] and is never produced by this function;
/// callers that need to unset a property must publish `&[]` directly.
pub fn encode_individual(value: &AstarteType, timestamp: Option<DateTime<Utc>>) -> Vec<u8> {
    let mut doc = DocumentBuilder::new();
    bson::append_value(&mut doc, "v", value);

    if let Some(t) = timestamp {
        doc.append_datetime("t", t);
    }

    doc.finish()
}

/// Encodes an aggregated object as `{"v": {endpoint: value, ...}}`, with an optional `"t"`.
pub fn encode_object(entries: &[ObjectEntry], timestamp: Option<DateTime<Utc>>) -> Vec<u8> {
    let mut inner = DocumentBuilder::new();
    for entry in entries {
        bson::append_value(&mut inner, &entry.endpoint, &entry.value);
    }

    let mut doc = DocumentBuilder::new();
    doc.append_document("v", inner);

    if let Some(t) = timestamp {
        doc.append_datetime("t", t);
    }

    doc.finish()
}

/// Decodes an individual payload's `"v"` field as `expected`.
///
/// A zero-length `buf` decodes to [`AstarteType::Unset`] regardless of `expected`, matching the
/// property-unset wire representation.
pub fn decode_individual(
    buf: &[u8],
    expected: MappingType,
) -> Result<AstarteType, BsonError> {
    if buf.is_empty() {
        return Ok(AstarteType::Unset);
    }

    let doc = Document::validate(buf)?;
    doc.get_typed("v", expected)
}

/// Decodes an aggregated object payload's `"v"` sub-document against the mapping types declared
/// by `lookup`, which maps a bare endpoint (the path past the object's common prefix) to its
/// declared [`MappingType`].
pub fn decode_object(
    buf: &[u8],
    lookup: impl Fn(&str) -> Option<MappingType>,
) -> Result<Vec<ObjectEntry>, BsonError> {
    let doc = Document::validate(buf)?;
    let v = doc.get("v")?.ok_or(BsonError::NotFound)?;
    let inner = v.as_document()?;

    let mut entries = Vec::new();

    for element in inner.elements() {
        let element = element?;
        let name = element.name();
        let mapping_type = lookup(name).ok_or(BsonError::NotFound)?;
        let value = element.decode(mapping_type)?;

        entries.push(ObjectEntry {
            endpoint: name.to_owned(),
            value,
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_individual_matches_known_bytes() {
        let bytes = encode_individual(&AstarteType::Integer(42), None);

        assert_eq!(
            bytes,
            vec![0x0C, 0x00, 0x00, 0x00, 0x10, b'v', 0x00, 0x2A, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn individual_roundtrip_with_timestamp() {
        let ts = Utc::now();
        let bytes = encode_individual(&AstarteType::String("hello".into()), Some(ts));

        let decoded = decode_individual(&bytes, MappingType::String).unwrap();
        assert_eq!(decoded, AstarteType::String("hello".into()));
    }

    #[test]
    fn empty_payload_decodes_to_unset() {
        let decoded = decode_individual(&[], MappingType::Integer).unwrap();
        assert_eq!(decoded, AstarteType::Unset);
    }

    #[test]
    fn object_roundtrip() {
        let entries = vec![
            ObjectEntry {
                endpoint: "a".into(),
                value: AstarteType::Integer(1),
            },
            ObjectEntry {
                endpoint: "b".into(),
                value: AstarteType::String("x".into()),
            },
        ];

        let bytes = encode_object(&entries, None);

        let decoded = decode_object(&bytes, |name| match name {
            "a" => Some(MappingType::Integer),
            "b" => Some(MappingType::String),
            _ => None,
        })
        .unwrap();

        assert_eq!(decoded, entries);
    }
}
