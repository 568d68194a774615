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

//! A single interface definition: its declared mappings, ownership, aggregation and the path
//! matching needed to route an incoming topic to the mapping it targets.

use std::fmt;
use std::io;
use std::path::Path;

use serde::Deserialize;

use crate::types::MappingType;

/// Upper bound on the number of mappings a single interface may declare.
pub const MAX_INTERFACE_MAPPINGS: usize = 1024;

/// Who is allowed to publish values for this interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ownership {
    Device,
    Server,
}

/// Whether values persist on the server past the last received one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Datastream,
    Properties,
}

/// Whether a datastream carries one value per message or a structured record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Individual,
    Object,
}

impl Default for Aggregation {
    fn default() -> Self {
        Self::Individual
    }
}

/// Datastream delivery guarantee, mapped onto the MQTT QoS used to publish it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    Unreliable,
    Guaranteed,
    Unique,
}

impl Reliability {
    pub fn qos(self) -> u8 {
        match self {
            Self::Unreliable => 0,
            Self::Guaranteed => 1,
            Self::Unique => 2,
        }
    }
}

impl Default for Reliability {
    fn default() -> Self {
        Self::Unreliable
    }
}

/// One segment of a mapping endpoint template: either a literal path component or a named
/// parameter (`%{sensor_id}`) that matches any single segment.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Parameter(String),
}

/// A parsed mapping endpoint template, e.g. `/%{sensor_id}/value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    raw: String,
    segments: Vec<Segment>,
}

/// Error parsing a mapping endpoint template.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint must start with '/': '{0}'")]
    MissingLeadingSlash(String),
    #[error("endpoint has an empty path segment: '{0}'")]
    EmptySegment(String),
    #[error("unterminated parameter segment: '{0}'")]
    UnterminatedParameter(String),
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        if !raw.starts_with('/') {
            return Err(EndpointError::MissingLeadingSlash(raw.to_owned()));
        }

        let mut segments = Vec::new();
        for part in raw.split('/').skip(1) {
            if part.is_empty() {
                return Err(EndpointError::EmptySegment(raw.to_owned()));
            }

            let segment = if let Some(name) = part.strip_prefix("%{") {
                let name = name
                    .strip_suffix('}')
                    .ok_or_else(|| EndpointError::UnterminatedParameter(raw.to_owned()))?;
                Segment::Parameter(name.to_owned())
            } else {
                Segment::Literal(part.to_owned())
            };

            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_owned(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Number of levels (path segments) in this endpoint.
    pub fn levels(&self) -> usize {
        self.segments.len()
    }

    /// Whether `path` (e.g. `/23/value`) matches this template.
    pub fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = path.split('/').skip(1).collect();

        if parts.len() != self.segments.len() {
            return false;
        }

        self.segments.iter().zip(parts.iter()).all(|(seg, part)| match seg {
            Segment::Literal(lit) => lit == part,
            Segment::Parameter(_) => true,
        })
    }

    /// The endpoint with every parameter segment replaced by its matched value from `path`, or
    /// `None` if `path` doesn't match this template. Used to build the bare endpoint key used by
    /// object-aggregated payloads (e.g. `"value"` from `/value`).
    pub fn last_literal(&self) -> Option<&str> {
        match self.segments.last()? {
            Segment::Literal(lit) => Some(lit),
            Segment::Parameter(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A single declared mapping within an interface.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub endpoint: Endpoint,
    pub mapping_type: MappingType,
    pub reliability: Reliability,
    pub explicit_timestamp: bool,
    pub allow_unset: bool,
}

impl Mapping {
    /// QoS to publish/subscribe this mapping at. Properties are always QoS 2; datastream
    /// mappings use their declared [`Reliability`].
    pub fn qos(&self, interface_type: InterfaceType) -> u8 {
        match interface_type {
            InterfaceType::Properties => 2,
            InterfaceType::Datastream => self.reliability.qos(),
        }
    }
}

/// Error for parsing and validating an interface.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum InterfaceError {
    #[error("cannot parse interface JSON")]
    Parse(#[from] serde_json::Error),
    #[error("cannot read interface file")]
    Io(#[from] io::Error),
    #[error("wrong major and minor")]
    MajorMinor,
    #[error("couldn't find the mapping '{path}' in the interface")]
    MappingNotFound { path: String },
    #[error("invalid endpoint")]
    InvalidEndpoint(#[from] EndpointError),
    #[error("interface with no mappings")]
    EmptyMappings,
    #[error("object with inconsistent endpoints")]
    InconsistentEndpoints,
    #[error("duplicate endpoint mapping '{endpoint}' and '{duplicate}'")]
    DuplicateMapping { endpoint: String, duplicate: String },
    #[error("object endpoint should have at least 2 levels: '{0}'")]
    ObjectEndpointTooShort(String),
    #[error("this version has a different name than the previous version: {name} (previous: {prev_name})")]
    NameMismatch { name: String, prev_name: String },
    #[error("interface '{name}' is already present at version {major}.{minor}")]
    AlreadyPresent {
        name: String,
        major: i32,
        minor: i32,
    },
    #[error("interface '{name}' would downgrade version from {old_major}.{old_minor} to {new_major}.{new_minor}")]
    VersionDowngrade {
        name: String,
        old_major: i32,
        old_minor: i32,
        new_major: i32,
        new_minor: i32,
    },
    #[error("too many mappings {0}, interfaces can have a max of {MAX_INTERFACE_MAPPINGS} mappings")]
    TooManyMappings(usize),
}

#[derive(Debug, Deserialize)]
struct RawMapping {
    endpoint: String,
    #[serde(rename = "type")]
    mapping_type: RawMappingType,
    #[serde(default)]
    reliability: Reliability,
    #[serde(default)]
    explicit_timestamp: bool,
    #[serde(default)]
    allow_unset: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawMappingType {
    Double,
    Integer,
    Boolean,
    Longinteger,
    String,
    Binaryblob,
    Datetime,
    Doublearray,
    Integerarray,
    Booleanarray,
    Longintegerarray,
    Stringarray,
    Binaryblobarray,
    Datetimearray,
}

impl From<RawMappingType> for MappingType {
    fn from(value: RawMappingType) -> Self {
        match value {
            RawMappingType::Double => Self::Double,
            RawMappingType::Integer => Self::Integer,
            RawMappingType::Boolean => Self::Boolean,
            RawMappingType::Longinteger => Self::LongInteger,
            RawMappingType::String => Self::String,
            RawMappingType::Binaryblob => Self::BinaryBlob,
            RawMappingType::Datetime => Self::DateTime,
            RawMappingType::Doublearray => Self::DoubleArray,
            RawMappingType::Integerarray => Self::IntegerArray,
            RawMappingType::Booleanarray => Self::BooleanArray,
            RawMappingType::Longintegerarray => Self::LongIntegerArray,
            RawMappingType::Stringarray => Self::StringArray,
            RawMappingType::Binaryblobarray => Self::BinaryBlobArray,
            RawMappingType::Datetimearray => Self::DateTimeArray,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawInterface {
    interface_name: String,
    version_major: i32,
    version_minor: i32,
    #[serde(rename = "type")]
    interface_type: InterfaceType,
    ownership: Ownership,
    #[serde(default)]
    aggregation: Aggregation,
    mappings: Vec<RawMapping>,
}

/// A parsed, validated interface definition.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub version_major: i32,
    pub version_minor: i32,
    pub interface_type: InterfaceType,
    pub ownership: Ownership,
    pub aggregation: Aggregation,
    pub mappings: Vec<Mapping>,
}

impl Interface {
    pub fn from_str(json: &str) -> Result<Self, InterfaceError> {
        let raw: RawInterface = serde_json::from_str(json)?;
        Self::from_raw(raw)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, InterfaceError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    fn from_raw(raw: RawInterface) -> Result<Self, InterfaceError> {
        if raw.version_major == 0 && raw.version_minor == 0 {
            return Err(InterfaceError::MajorMinor);
        }

        if raw.mappings.is_empty() {
            return Err(InterfaceError::EmptyMappings);
        }

        if raw.mappings.len() > MAX_INTERFACE_MAPPINGS {
            return Err(InterfaceError::TooManyMappings(raw.mappings.len()));
        }

        let mappings = raw
            .mappings
            .into_iter()
            .map(|m| {
                Ok(Mapping {
                    endpoint: Endpoint::parse(&m.endpoint)?,
                    mapping_type: m.mapping_type.into(),
                    reliability: m.reliability,
                    explicit_timestamp: m.explicit_timestamp,
                    allow_unset: m.allow_unset,
                })
            })
            .collect::<Result<Vec<_>, InterfaceError>>()?;

        if raw.aggregation == Aggregation::Object {
            let levels = mappings[0].endpoint.levels();

            if levels < 2 {
                return Err(InterfaceError::ObjectEndpointTooShort(
                    mappings[0].endpoint.to_string(),
                ));
            }

            if mappings.iter().any(|m| m.endpoint.levels() != levels) {
                return Err(InterfaceError::InconsistentEndpoints);
            }

            for (i, a) in mappings.iter().enumerate() {
                for b in &mappings[i + 1..] {
                    if a.endpoint.as_str() == b.endpoint.as_str() {
                        return Err(InterfaceError::DuplicateMapping {
                            endpoint: a.endpoint.to_string(),
                            duplicate: b.endpoint.to_string(),
                        });
                    }
                }
            }
        }

        Ok(Self {
            name: raw.interface_name,
            version_major: raw.version_major,
            version_minor: raw.version_minor,
            interface_type: raw.interface_type,
            ownership: raw.ownership,
            aggregation: raw.aggregation,
            mappings,
        })
    }

    /// Finds the mapping whose endpoint template matches `path`.
    pub fn find_mapping(&self, path: &str) -> Result<&Mapping, InterfaceError> {
        self.mappings
            .iter()
            .find(|m| m.endpoint.matches(path))
            .ok_or_else(|| InterfaceError::MappingNotFound {
                path: path.to_owned(),
            })
    }

    /// The `name:major:minor` introspection entry for this interface.
    pub fn introspection_entry(&self) -> String {
        format!("{}:{}:{}", self.name, self.version_major, self.version_minor)
    }

    /// Validates that `new` may replace `self` in the registered set: same name is implied by
    /// the caller, a strictly newer minor at the same major is accepted in place, anything else
    /// (older, equal, or a differing major) is rejected.
    pub fn check_update(&self, new: &Interface) -> Result<(), InterfaceError> {
        if self.name != new.name {
            return Err(InterfaceError::NameMismatch {
                name: new.name.clone(),
                prev_name: self.name.clone(),
            });
        }

        if new.version_major == self.version_major && new.version_minor == self.version_minor {
            return Err(InterfaceError::AlreadyPresent {
                name: new.name.clone(),
                major: new.version_major,
                minor: new.version_minor,
            });
        }

        if new.version_major < self.version_major
            || (new.version_major == self.version_major && new.version_minor < self.version_minor)
        {
            return Err(InterfaceError::VersionDowngrade {
                name: new.name.clone(),
                old_major: self.version_major,
                old_minor: self.version_minor,
                new_major: new.version_major,
                new_minor: new.version_minor,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDIVIDUAL_JSON: &str = r#"{
        "interface_name": "org.astarte-platform.Test",
        "version_major": 1,
        "version_minor": 0,
        "type": "datastream",
        "ownership": "device",
        "aggregation": "individual",
        "mappings": [
            { "endpoint": "/%{sensor_id}/value", "type": "double", "reliability": "guaranteed" }
        ]
    }"#;

    #[test]
    fn parses_individual_interface() {
        let iface = Interface::from_str(INDIVIDUAL_JSON).unwrap();
        assert_eq!(iface.name, "org.astarte-platform.Test");
        assert_eq!(iface.mappings.len(), 1);
        assert_eq!(iface.mappings[0].qos(iface.interface_type), 1);
    }

    #[test]
    fn endpoint_matches_parametrized_path() {
        let endpoint = Endpoint::parse("/%{sensor_id}/value").unwrap();
        assert!(endpoint.matches("/23/value"));
        assert!(!endpoint.matches("/23/other"));
        assert!(!endpoint.matches("/23/value/extra"));
    }

    #[test]
    fn find_mapping_reports_path_mismatch() {
        let iface = Interface::from_str(INDIVIDUAL_JSON).unwrap();
        let err = iface.find_mapping("/nope").unwrap_err();
        assert!(matches!(err, InterfaceError::MappingNotFound { .. }));
    }

    #[test]
    fn rejects_major_minor_both_zero() {
        let json = INDIVIDUAL_JSON.replace("\"version_major\": 1,", "\"version_major\": 0,").replace("\"version_minor\": 0,", "\"version_minor\": 0,");
        let err = Interface::from_str(&json).unwrap_err();
        assert!(matches!(err, InterfaceError::MajorMinor));
    }

    #[test]
    fn object_endpoints_must_share_level_count() {
        let json = r#"{
            "interface_name": "org.astarte-platform.Obj",
            "version_major": 1,
            "version_minor": 0,
            "type": "datastream",
            "ownership": "device",
            "aggregation": "object",
            "mappings": [
                { "endpoint": "/a/one", "type": "integer" },
                { "endpoint": "/two", "type": "integer" }
            ]
        }"#;

        let err = Interface::from_str(json).unwrap_err();
        assert!(matches!(err, InterfaceError::InconsistentEndpoints));
    }

    #[test]
    fn check_update_accepts_newer_minor_rejects_downgrade() {
        let old = Interface::from_str(INDIVIDUAL_JSON).unwrap();

        let newer_json = INDIVIDUAL_JSON.replace("\"version_minor\": 0,", "\"version_minor\": 1,");
        let newer = Interface::from_str(&newer_json).unwrap();
        assert!(old.check_update(&newer).is_ok());

        let same = Interface::from_str(INDIVIDUAL_JSON).unwrap();
        assert!(matches!(
            old.check_update(&same),
            Err(InterfaceError::AlreadyPresent { .. })
        ));
    }
}
