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

//! The device handshake: the sequence that runs once the MQTT session is up, before the device
//! is considered synchronized with the server, plus the steady-state dispatch of incoming
//! publishes once that handshake has completed.
//!
//! `Handshake` only knows about one CONNACK/drain cycle at a time; it doesn't own the MQTT
//! client's reconnect policy, just its own backoff for retrying a failed handshake.

use std::time::Instant;

use chrono::{DateTime, Utc};
use mqttbytes::QoS;
use tracing::{debug, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::bson::{BsonError, Document};
use crate::interface::{Aggregation, InterfaceType, Ownership};
use crate::interfaces::Interfaces;
use crate::mqtt::{self, MqttEvent};
use crate::payload::{self, ObjectEntry};
use crate::properties::{self, PropertiesPayloadError};
use crate::store::{IntrospectionStatus, PropertyStore, StoredProp};
use crate::topic::{self, ClientId, ParsedTopic, TopicError};
use crate::types::AstarteType;

/// Error returned while running the handshake send sequence.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError<E>
where
    E: std::error::Error + 'static,
{
    #[error(transparent)]
    Mqtt(#[from] mqtt::MqttError),
    #[error("failed to encode the producer-properties payload")]
    Properties(#[from] PropertiesPayloadError),
    #[error("property store operation failed")]
    Store(#[source] E),
}

/// Error dispatching one incoming publish once the device is connected.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum DispatchError<E>
where
    E: std::error::Error + 'static,
{
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error("unknown interface '{0}' referenced by an incoming publish")]
    UnknownInterface(String),
    #[error("couldn't find a mapping for '{interface}{path}'")]
    MappingNotFound { interface: String, path: String },
    #[error(transparent)]
    Bson(#[from] BsonError),
    #[error(transparent)]
    Properties(#[from] PropertiesPayloadError),
    #[error("property store operation failed")]
    Store(#[source] E),
}

/// Internal handshake phase, driven by [`Handshake::on_connack`] / [`Handshake::on_tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the MQTT client to report a CONNACK.
    Idle,
    /// The start-handshake sequence has been sent; waiting for the outgoing cache to drain and
    /// for no subscription to come back rejected.
    Draining,
    /// Synchronized and ready for steady-state traffic.
    Settled,
    /// A subscription was rejected; backing off before retrying from scratch.
    Error,
}

/// Outcome of one [`Handshake::on_tick`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Still draining; nothing changed.
    Unchanged,
    /// The handshake completed and the device is synchronized.
    Connected,
    /// A subscription was rejected; the handshake will be retried after a backoff.
    Failed,
}

/// Drives the `start_handshake -> end_handshake -> connected` sequence, with `handshake_error` as
/// a recovery branch back to `start_handshake` after a backoff.
#[derive(Debug)]
pub struct Handshake {
    phase: Phase,
    subscription_failed: bool,
    backoff: Backoff,
}

impl Handshake {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            phase: Phase::Idle,
            subscription_failed: false,
            backoff: Backoff::new(backoff),
        }
    }

    /// Whether the last-seen handshake settled; i.e. the device layer may treat the connection as
    /// fully up.
    pub fn is_settled(&self) -> bool {
        self.phase == Phase::Settled
    }

    /// Called once per MQTT reconnect, before any CONNACK has arrived.
    pub fn reset_for_new_connection(&mut self) {
        self.phase = Phase::Idle;
        self.subscription_failed = false;
    }

    /// Runs (or skips, if the broker resumed a clean session we'd already synchronized) the
    /// start-handshake send sequence.
    pub fn on_connack<S: PropertyStore>(
        &mut self,
        session_present: bool,
        client: &mut mqtt::Client,
        client_id: ClientId<'_>,
        interfaces: &Interfaces,
        store: &S,
        now: Instant,
    ) -> Result<(), HandshakeError<S::Err>> {
        self.subscription_failed = false;

        let already_synced = session_present
            && store.synchronization_get().map_err(HandshakeError::Store)?
            && matches!(
                store
                    .introspection_check(&interfaces.introspection_string())
                    .map_err(HandshakeError::Store)?,
                IntrospectionStatus::Current
            );

        if already_synced {
            debug!("resuming an already-synchronized session, skipping start handshake");
        } else {
            start_handshake(client, client_id, interfaces, store, now)?;
        }

        self.phase = Phase::Draining;
        Ok(())
    }

    /// Called once per poll tick while draining: observes the MQTT events produced this tick for
    /// subscription failures, and `outgoing_drained` (the MQTT client's outgoing cache being
    /// empty) to detect the handshake's completion.
    pub fn on_tick<S: PropertyStore>(
        &mut self,
        mqtt_events: &[MqttEvent],
        outgoing_drained: bool,
        interfaces: &Interfaces,
        store: &S,
        now: Instant,
    ) -> Result<HandshakeOutcome, S::Err> {
        if self.phase != Phase::Draining {
            return Ok(HandshakeOutcome::Unchanged);
        }

        for event in mqtt_events {
            if let MqttEvent::Subscribed { accepted: false, id } = event {
                warn!(id, "a handshake subscription was rejected");
                self.subscription_failed = true;
            }
        }

        if self.subscription_failed {
            self.phase = Phase::Error;
            store.synchronization_set(false)?;
            self.backoff.next_delay(now);
            return Ok(HandshakeOutcome::Failed);
        }

        if !outgoing_drained {
            return Ok(HandshakeOutcome::Unchanged);
        }

        store.synchronization_set(true)?;

        let introspection = interfaces.introspection_string();
        if store.introspection_check(&introspection)? != IntrospectionStatus::Current {
            store.introspection_store(&introspection)?;
        }

        self.backoff.reset();
        self.phase = Phase::Settled;
        Ok(HandshakeOutcome::Connected)
    }

    /// Whether enough time has passed since a handshake failure to retry.
    pub fn ready_to_retry(&self, now: Instant) -> bool {
        self.phase == Phase::Error && self.backoff.is_elapsed(now)
    }

    /// Resets back to `Idle` so the next CONNACK re-runs the start-handshake sequence.
    pub fn retry(&mut self) {
        self.phase = Phase::Idle;
    }
}

fn start_handshake<S: PropertyStore>(
    client: &mut mqtt::Client,
    client_id: ClientId<'_>,
    interfaces: &Interfaces,
    store: &S,
    now: Instant,
) -> Result<(), HandshakeError<S::Err>> {
    client.subscribe(
        topic::consumer_properties_topic(client_id),
        QoS::ExactlyOnce,
        now,
    )?;

    for iface in interfaces.server_owned() {
        client.subscribe(
            topic::interface_wildcard_topic(client_id, &iface.name),
            QoS::ExactlyOnce,
            now,
        )?;
    }

    client.publish(
        client_id.to_string(),
        interfaces.introspection_string().into_bytes(),
        QoS::ExactlyOnce,
        now,
    )?;

    client.publish(
        topic::empty_cache_topic(client_id),
        b"1".to_vec(),
        QoS::ExactlyOnce,
        now,
    )?;

    let device_props = store.device_props_string().map_err(HandshakeError::Store)?;
    let encoded = properties::encode(&device_props)?;
    client.publish(
        topic::producer_properties_topic(client_id),
        encoded,
        QoS::ExactlyOnce,
        now,
    )?;

    replay_device_properties(client, client_id, interfaces, store, now)?;

    Ok(())
}

/// Re-publishes every stored device-owned property, dropping ones whose interface no longer
/// exists or whose major version moved on (the store itself can't know that without being handed
/// the current interface set).
fn replay_device_properties<S: PropertyStore>(
    client: &mut mqtt::Client,
    client_id: ClientId<'_>,
    interfaces: &Interfaces,
    store: &S,
    now: Instant,
) -> Result<(), HandshakeError<S::Err>> {
    for prop in store.device_props().map_err(HandshakeError::Store)? {
        match interfaces.get(&prop.interface) {
            Some(iface) if iface.version_major == prop.interface_major => {
                let payload = payload::encode_individual(&prop.value, None);
                let topic = topic::base_topic(client_id, &prop.interface, &prop.path);
                client.publish(topic, payload, QoS::ExactlyOnce, now)?;
            }
            _ => {
                store
                    .delete_prop(&prop.interface, &prop.path)
                    .map_err(HandshakeError::Store)?;
            }
        }
    }

    Ok(())
}

/// Dispatches one incoming publish once the device is connected: purge-properties sweeps, or an
/// interface payload decoded into the event(s) it produces.
pub fn dispatch_incoming<S: PropertyStore>(
    client_id: ClientId<'_>,
    topic: &str,
    payload: &[u8],
    interfaces: &Interfaces,
    store: &S,
) -> Result<Vec<crate::events::DeviceEvent>, DispatchError<S::Err>> {
    match ParsedTopic::try_parse(client_id, topic)? {
        ParsedTopic::PurgeProperties => {
            purge_properties(payload, store)?;
            Ok(Vec::new())
        }
        ParsedTopic::InterfacePath { interface, path } => {
            dispatch_interface_path(interface, path, payload, interfaces, store)
        }
    }
}

fn purge_properties<S: PropertyStore>(payload: &[u8], store: &S) -> Result<(), DispatchError<S::Err>> {
    let name_list = properties::decode(payload)?;
    let keep = properties::parse_name_list(&name_list);

    for stored in store.server_props().map_err(DispatchError::Store)? {
        let is_kept = keep
            .iter()
            .any(|(interface, path)| *interface == stored.interface && *path == stored.path);

        if !is_kept {
            store
                .delete_prop(&stored.interface, &stored.path)
                .map_err(DispatchError::Store)?;
        }
    }

    Ok(())
}

fn dispatch_interface_path<S: PropertyStore>(
    interface: &str,
    path: &str,
    raw_payload: &[u8],
    interfaces: &Interfaces,
    store: &S,
) -> Result<Vec<crate::events::DeviceEvent>, DispatchError<S::Err>> {
    use crate::events::DeviceEvent;

    let iface = interfaces
        .get(interface)
        .ok_or_else(|| DispatchError::UnknownInterface(interface.to_owned()))?;

    let timestamp = extract_timestamp(raw_payload);

    match (iface.interface_type, iface.aggregation) {
        (InterfaceType::Properties, _) => {
            let mapping = iface
                .find_mapping(path)
                .map_err(|_| DispatchError::MappingNotFound {
                    interface: interface.to_owned(),
                    path: path.to_owned(),
                })?;

            let value = payload::decode_individual(raw_payload, mapping.mapping_type)?;

            if let AstarteType::Unset = value {
                store.delete_prop(interface, path).map_err(DispatchError::Store)?;
                Ok(vec![DeviceEvent::PropertyUnset {
                    interface: interface.to_owned(),
                    path: path.to_owned(),
                }])
            } else {
                store
                    .store_prop(StoredProp {
                        interface,
                        path,
                        value: &value,
                        interface_major: iface.version_major,
                        ownership: Ownership::Server,
                    })
                    .map_err(DispatchError::Store)?;
                Ok(vec![DeviceEvent::PropertySet {
                    interface: interface.to_owned(),
                    path: path.to_owned(),
                    value,
                }])
            }
        }
        (InterfaceType::Datastream, Aggregation::Individual) => {
            let mapping = iface
                .find_mapping(path)
                .map_err(|_| DispatchError::MappingNotFound {
                    interface: interface.to_owned(),
                    path: path.to_owned(),
                })?;

            let value = payload::decode_individual(raw_payload, mapping.mapping_type)?;
            Ok(vec![DeviceEvent::DatastreamIndividual {
                interface: interface.to_owned(),
                path: path.to_owned(),
                value,
                timestamp,
            }])
        }
        (InterfaceType::Datastream, Aggregation::Object) => {
            let entries: Vec<ObjectEntry> = payload::decode_object(raw_payload, |name| {
                iface
                    .find_mapping(&format!("{path}/{name}"))
                    .ok()
                    .map(|m| m.mapping_type)
            })?;

            Ok(vec![DeviceEvent::DatastreamObject {
                interface: interface.to_owned(),
                path: path.to_owned(),
                entries,
                timestamp,
            }])
        }
    }
}

/// Best-effort extraction of the envelope's optional `"t"` field; a missing or malformed
/// timestamp is not a decode failure, just a timestamp-less event.
fn extract_timestamp(buf: &[u8]) -> Option<DateTime<Utc>> {
    let doc = Document::validate(buf).ok()?;
    doc.get("t").ok().flatten()?.as_datetime().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    const CLIENT_ID: ClientId<'static> = ClientId {
        realm: "test",
        device_id: "device1",
    };

    const PROPERTY_IFACE: &str = r#"{
        "interface_name": "com.test.Prop",
        "version_major": 1,
        "version_minor": 0,
        "type": "properties",
        "ownership": "server",
        "mappings": [{ "endpoint": "/enable", "type": "boolean" }]
    }"#;

    const DATASTREAM_IFACE: &str = r#"{
        "interface_name": "com.test.Stream",
        "version_major": 1,
        "version_minor": 0,
        "type": "datastream",
        "ownership": "server",
        "mappings": [{ "endpoint": "/value", "type": "integer" }]
    }"#;

    fn interfaces() -> Interfaces {
        let mut interfaces = Interfaces::new();
        interfaces
            .add(crate::interface::Interface::from_str(PROPERTY_IFACE).unwrap())
            .unwrap();
        interfaces
            .add(crate::interface::Interface::from_str(DATASTREAM_IFACE).unwrap())
            .unwrap();
        interfaces
    }

    #[test]
    fn dispatch_stores_a_server_property() {
        let store = MemoryStore::new();
        let payload = payload::encode_individual(&AstarteType::Boolean(true), None);

        let events = dispatch_incoming(
            CLIENT_ID,
            "test/device1/com.test.Prop/enable",
            &payload,
            &interfaces(),
            &store,
        )
        .unwrap();

        assert_eq!(
            events,
            vec![crate::events::DeviceEvent::PropertySet {
                interface: "com.test.Prop".into(),
                path: "/enable".into(),
                value: AstarteType::Boolean(true),
            }]
        );
        assert_eq!(
            store.load_prop("com.test.Prop", "/enable", 1).unwrap(),
            Some(AstarteType::Boolean(true))
        );
    }

    #[test]
    fn dispatch_unsets_a_property_on_empty_payload() {
        let store = MemoryStore::new();
        store
            .store_prop(StoredProp {
                interface: "com.test.Prop",
                path: "/enable",
                value: &AstarteType::Boolean(true),
                interface_major: 1,
                ownership: Ownership::Server,
            })
            .unwrap();

        let events = dispatch_incoming(
            CLIENT_ID,
            "test/device1/com.test.Prop/enable",
            &[],
            &interfaces(),
            &store,
        )
        .unwrap();

        assert_eq!(
            events,
            vec![crate::events::DeviceEvent::PropertyUnset {
                interface: "com.test.Prop".into(),
                path: "/enable".into(),
            }]
        );
        assert_eq!(store.load_prop("com.test.Prop", "/enable", 1).unwrap(), None);
    }

    #[test]
    fn dispatch_produces_a_datastream_event() {
        let store = MemoryStore::new();
        let payload = payload::encode_individual(&AstarteType::Integer(7), None);

        let events = dispatch_incoming(
            CLIENT_ID,
            "test/device1/com.test.Stream/value",
            &payload,
            &interfaces(),
            &store,
        )
        .unwrap();

        assert_eq!(
            events,
            vec![crate::events::DeviceEvent::DatastreamIndividual {
                interface: "com.test.Stream".into(),
                path: "/value".into(),
                value: AstarteType::Integer(7),
                timestamp: None,
            }]
        );
    }

    #[test]
    fn dispatch_rejects_an_unknown_interface() {
        let store = MemoryStore::new();
        let err = dispatch_incoming(
            CLIENT_ID,
            "test/device1/com.test.Missing/value",
            &[],
            &interfaces(),
            &store,
        )
        .unwrap_err();

        assert!(matches!(err, DispatchError::UnknownInterface(_)));
    }

    #[test]
    fn purge_properties_removes_properties_not_in_the_list() {
        let store = MemoryStore::new();
        store
            .store_prop(StoredProp {
                interface: "com.test.Prop",
                path: "/enable",
                value: &AstarteType::Boolean(true),
                interface_major: 1,
                ownership: Ownership::Server,
            })
            .unwrap();

        let encoded = properties::encode("").unwrap();

        dispatch_incoming(
            CLIENT_ID,
            "test/device1/control/consumer/properties",
            &encoded,
            &interfaces(),
            &store,
        )
        .unwrap();

        assert_eq!(store.load_prop("com.test.Prop", "/enable", 1).unwrap(), None);
    }

    #[test]
    fn purge_properties_keeps_properties_named_in_the_list() {
        let store = MemoryStore::new();
        store
            .store_prop(StoredProp {
                interface: "com.test.Prop",
                path: "/enable",
                value: &AstarteType::Boolean(true),
                interface_major: 1,
                ownership: Ownership::Server,
            })
            .unwrap();

        let encoded = properties::encode("com.test.Prop/enable").unwrap();

        dispatch_incoming(
            CLIENT_ID,
            "test/device1/control/consumer/properties",
            &encoded,
            &interfaces(),
            &store,
        )
        .unwrap();

        assert_eq!(
            store.load_prop("com.test.Prop", "/enable", 1).unwrap(),
            Some(AstarteType::Boolean(true))
        );
    }
}
