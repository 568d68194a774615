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

//! Parses an incoming MQTT topic of the form `<realm>/<device_id>/<interface>/<path>`.

use std::fmt;

use tracing::trace;

/// The `<realm>/<device_id>` pair every application topic is rooted under.
#[derive(Debug, Clone, Copy)]
pub struct ClientId<'a> {
    pub realm: &'a str,
    pub device_id: &'a str,
}

impl fmt::Display for ClientId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.realm, self.device_id)
    }
}

/// Error returned when parsing a topic.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,
    #[error(
        "the topic should start with <realm>/<device_id> equal to {client_id}, received: {topic}"
    )]
    UnknownClientId { client_id: String, topic: String },
    #[error(
        "the topic should be in the form <realm>/<device_id>/<interface>/<path>, received: {0}"
    )]
    Malformed(String),
}

impl TopicError {
    pub fn topic(&self) -> &str {
        match self {
            TopicError::Empty => "",
            TopicError::UnknownClientId { topic, .. } => topic,
            TopicError::Malformed(topic) => topic,
        }
    }
}

/// A topic parsed relative to the device's `<realm>/<device_id>` root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedTopic<'a> {
    /// `<base>/control/consumer/properties`
    PurgeProperties,
    /// `<base>/<interface>/<path>`
    InterfacePath { interface: &'a str, path: &'a str },
}

impl<'a> ParsedTopic<'a> {
    const PURGE_PROPERTIES_TOPIC: &'static str = "control/consumer/properties";

    pub fn try_parse(client_id: ClientId<'_>, topic: &'a str) -> Result<Self, TopicError> {
        if topic.is_empty() {
            return Err(TopicError::Empty);
        }

        let rest = topic
            .strip_prefix(client_id.realm)
            .and_then(|s| s.strip_prefix('/'))
            .and_then(|s| s.strip_prefix(client_id.device_id))
            .ok_or_else(|| TopicError::UnknownClientId {
                client_id: client_id.to_string(),
                topic: topic.to_string(),
            })?;

        let rest = rest
            .strip_prefix('/')
            .ok_or_else(|| TopicError::Malformed(topic.to_string()))?;

        trace!(%rest, "parsed topic remainder");

        if rest == Self::PURGE_PROPERTIES_TOPIC {
            return Ok(Self::PurgeProperties);
        }

        let idx = rest
            .find('/')
            .ok_or_else(|| TopicError::Malformed(topic.to_string()))?;

        let (interface, path) = rest.split_at(idx);

        if interface.is_empty() || path.is_empty() {
            return Err(TopicError::Malformed(topic.to_string()));
        }

        Ok(Self::InterfacePath { interface, path })
    }
}

/// Builds the base publish topic `<realm>/<device_id>/<interface><path>` for a mapping send.
pub fn base_topic(client_id: ClientId<'_>, interface: &str, path: &str) -> String {
    format!("{client_id}/{interface}{path}")
}

/// Builds the device control-topic suffix paths used during the handshake.
pub fn empty_cache_topic(client_id: ClientId<'_>) -> String {
    format!("{client_id}/control/emptyCache")
}

pub fn consumer_properties_topic(client_id: ClientId<'_>) -> String {
    format!("{client_id}/control/consumer/properties")
}

pub fn producer_properties_topic(client_id: ClientId<'_>) -> String {
    format!("{client_id}/control/producer/properties")
}

pub fn interface_wildcard_topic(client_id: ClientId<'_>, interface: &str) -> String {
    format!("{client_id}/{interface}/#")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_ID: ClientId<'static> = ClientId {
        realm: "test",
        device_id: "u-WraCwtK_G_fjJf63TiAw",
    };

    #[test]
    fn parses_interface_path_topic() {
        let topic = "test/u-WraCwtK_G_fjJf63TiAw/com.interface.test/led/red";
        let ParsedTopic::InterfacePath { interface, path } =
            ParsedTopic::try_parse(CLIENT_ID, topic).unwrap()
        else {
            panic!("wrong variant parsed");
        };

        assert_eq!(interface, "com.interface.test");
        assert_eq!(path, "/led/red");
    }

    #[test]
    fn parses_purge_properties_topic() {
        let topic = "test/u-WraCwtK_G_fjJf63TiAw/control/consumer/properties";
        let parsed = ParsedTopic::try_parse(CLIENT_ID, topic);

        assert!(matches!(parsed, Ok(ParsedTopic::PurgeProperties)));
    }

    #[test]
    fn almost_purge_properties_topic_is_treated_as_interface_path() {
        let topic = "test/u-WraCwtK_G_fjJf63TiAw/control/consumer/properties/another";
        let ParsedTopic::InterfacePath { interface, path } =
            ParsedTopic::try_parse(CLIENT_ID, topic).unwrap()
        else {
            panic!("wrong variant parsed");
        };

        assert_eq!(interface, "control");
        assert_eq!(path, "/consumer/properties/another");
    }

    #[test]
    fn rejects_empty_topic() {
        let err = ParsedTopic::try_parse(CLIENT_ID, "").unwrap_err();
        assert!(matches!(err, TopicError::Empty));
    }

    #[test]
    fn rejects_topic_with_no_path() {
        let topic = "test/u-WraCwtK_G_fjJf63TiAw/com.interface.test";
        let err = ParsedTopic::try_parse(CLIENT_ID, topic).unwrap_err();
        assert!(matches!(err, TopicError::Malformed(_)));
    }

    #[test]
    fn rejects_unknown_client_id() {
        let topic = "test/u-WraCwtK_G_different/com.interface.test/led/red";
        let err = ParsedTopic::try_parse(CLIENT_ID, topic).unwrap_err();
        assert!(matches!(err, TopicError::UnknownClientId { .. }));
    }

    #[test]
    fn base_topic_concatenates_client_interface_and_path() {
        let topic = base_topic(CLIENT_ID, "com.iface", "/x");
        assert_eq!(topic, "test/u-WraCwtK_G_fjJf63TiAw/com.iface/x");
    }
}
