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

//! The purge-properties / producer-properties control payload:
//! `[uncompressed_len: uint32 big-endian][deflate(name_list)]`, where `name_list` joins
//! `iface/path` entries with `;`.
//!
//! The length prefix is written big-endian while every BSON integer elsewhere in the wire
//! protocol is little-endian; this isn't a typo, it mirrors the upstream format exactly.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Error encoding/decoding a properties control payload.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PropertiesPayloadError {
    #[error("payload is shorter than the 4-byte length prefix")]
    Truncated,
    #[error("failed to deflate the property name list")]
    Deflate(#[source] std::io::Error),
    #[error("failed to inflate the property name list")]
    Inflate(#[source] std::io::Error),
    #[error("inflated length {actual} doesn't match the declared uncompressed length {declared}")]
    LengthMismatch { declared: u32, actual: usize },
}

/// Deflates `name_list` (already `;`-joined) and frames it with its big-endian uncompressed
/// length.
pub fn encode(name_list: &str) -> Result<Vec<u8>, PropertiesPayloadError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(name_list.as_bytes())
        .map_err(PropertiesPayloadError::Deflate)?;
    let deflated = encoder.finish().map_err(PropertiesPayloadError::Deflate)?;

    let mut out = Vec::with_capacity(4 + deflated.len());
    out.extend_from_slice(&(name_list.len() as u32).to_be_bytes());
    out.extend_from_slice(&deflated);

    Ok(out)
}

/// Inflates a framed payload back into its `;`-joined name list.
pub fn decode(payload: &[u8]) -> Result<String, PropertiesPayloadError> {
    if payload.len() < 4 {
        return Err(PropertiesPayloadError::Truncated);
    }

    let declared = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);

    let mut decoder = ZlibDecoder::new(&payload[4..]);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(PropertiesPayloadError::Inflate)?;

    if out.len() as u32 != declared {
        return Err(PropertiesPayloadError::LengthMismatch {
            declared,
            actual: out.len(),
        });
    }

    String::from_utf8(out).map_err(|_| PropertiesPayloadError::Inflate(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "name list is not valid UTF-8",
    )))
}

/// Parses a decoded name list (`"iface1/path1;iface2/path2"`) into `(interface, path)` pairs.
pub fn parse_name_list(name_list: &str) -> Vec<(String, String)> {
    if name_list.is_empty() {
        return Vec::new();
    }

    name_list
        .split(';')
        .filter_map(|entry| {
            let idx = entry.find('/')?;
            let (interface, path) = entry.split_at(idx);
            Some((interface.to_owned(), path.to_owned()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_encodes_to_the_known_empty_frame() {
        let encoded = encode("").unwrap();
        assert_eq!(&encoded[0..4], &[0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn roundtrip_non_empty_list() {
        let list = "com.test.One/foo;com.test.Two/bar";
        let encoded = encode(list).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, list);
    }

    #[test]
    fn length_prefix_is_big_endian() {
        let list = "a/b";
        let encoded = encode(list).unwrap();
        assert_eq!(u32::from_be_bytes(encoded[0..4].try_into().unwrap()), 3);
    }

    #[test]
    fn parse_name_list_splits_interface_and_path() {
        let pairs = parse_name_list("com.test.One/foo;com.test.Two/bar/baz");
        assert_eq!(
            pairs,
            vec![
                ("com.test.One".to_owned(), "/foo".to_owned()),
                ("com.test.Two".to_owned(), "/bar/baz".to_owned()),
            ]
        );
    }

    #[test]
    fn parse_name_list_empty_is_empty() {
        assert!(parse_name_list("").is_empty());
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        assert!(matches!(decode(&[0, 0]), Err(PropertiesPayloadError::Truncated)));
    }
}
