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

//! The top-level device facade: pairs with Astarte, then drives the MQTT client and handshake
//! from a single cooperative [`Device::poll`] call.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::DeviceConfig;
use crate::crypto;
use crate::error::Error;
use crate::events::DeviceEvent;
use crate::handshake::{self, Handshake, HandshakeOutcome};
use crate::interface::{Aggregation, InterfaceType, Ownership};
use crate::interfaces::Interfaces;
use crate::mqtt::tls::ClientIdentity;
use crate::mqtt::{self, qos_from_u8, MqttClientConfig, MqttEvent};
use crate::pairing::PairingClient;
use crate::payload::{self, ObjectEntry};
use crate::store::{PropertyStore, StoredProp};
use crate::topic::ClientId;
use crate::types::AstarteType;

/// Errors raised directly by the device facade, as opposed to one of the collaborators it wraps.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("unknown interface '{0}'")]
    UnknownInterface(String),
    #[error("interface '{0}' is owned by the server; the device cannot publish on it")]
    ServerOwned(String),
    #[error("interface '{0}' is not an object-aggregation datastream")]
    NotAnObjectInterface(String),
    #[error("'{interface}{path}' does not allow unsetting")]
    UnsetNotAllowed { interface: String, path: String },
    #[error("the device has not completed its handshake yet")]
    NotReady,
    #[error("interfaces can only be changed while disconnected")]
    InterfacesFrozen,
}

fn qos_for(interface_type: InterfaceType, mapping: &crate::interface::Mapping) -> mqttbytes::QoS {
    qos_from_u8(mapping.qos(interface_type))
}

/// A connected-or-connecting Astarte device: owns the paired MQTT client identity, the
/// handshake state machine, the interface introspection, and the property store.
pub struct Device<S: PropertyStore> {
    realm: String,
    device_id: String,
    interfaces: Interfaces,
    store: S,
    client: mqtt::Client,
    handshake: Handshake,
    identity: ClientIdentity,
    trust_anchor: crate::mqtt::tls::TrustAnchor,
    last_session_present: bool,
}

impl<S: PropertyStore> Device<S> {
    /// Pairs with Astarte (registering for a client certificate and resolving the broker
    /// address) and builds a device ready to [`connect`](Device::connect).
    pub fn new(config: DeviceConfig, store: S) -> Result<Self, Error<S::Err>> {
        let credentials_secret = config
            .credentials_secret
            .ok_or(crate::config::ConfigError::Missing("credentials_secret"))?;

        let pairing = PairingClient::new(
            config.pairing_url,
            config.realm.clone(),
            config.device_id.clone(),
            config.http_timeout,
        )?;

        let broker = pairing.get_broker_info(&credentials_secret)?;

        let csr = crypto::generate_csr()?;
        let client_crt = pairing.get_client_certificate(&credentials_secret, &csr.csr_pem)?;
        pairing.verify_client_certificate(&credentials_secret, &client_crt)?;

        let identity = ClientIdentity {
            certificate_chain_pem: client_crt,
            private_key_pem: csr.key_pair_pem,
        };

        let mqtt_config = MqttClientConfig {
            client_id: format!("{}/{}", config.realm, config.device_id),
            host: broker.host,
            port: broker.port,
            keep_alive: Duration::from_secs(30),
            connect_timeout: config.mqtt_connection_timeout,
            poll_timeout: config.mqtt_poll_timeout,
            max_msg_size: config.mqtt_max_msg_size,
            clean_session: false,
            reconnect_backoff: config.mqtt_reconnect_backoff,
        };

        Ok(Self {
            realm: config.realm,
            device_id: config.device_id,
            interfaces: config.interfaces,
            store,
            client: mqtt::Client::new(mqtt_config),
            handshake: Handshake::new(config.handshake_reconnect_backoff),
            identity,
            trust_anchor: config.trust_anchor,
            last_session_present: false,
        })
    }

    fn client_id(&self) -> ClientId<'_> {
        ClientId {
            realm: &self.realm,
            device_id: &self.device_id,
        }
    }

    /// Opens the MQTT connection. The handshake runs automatically once the broker's CONNACK is
    /// observed by a subsequent [`Device::poll`].
    pub fn connect(&mut self, now: Instant) -> Result<(), Error<S::Err>> {
        self.client
            .connect(self.identity.clone(), self.trust_anchor.clone(), now)?;
        self.handshake.reset_for_new_connection();
        Ok(())
    }

    /// Begins a graceful disconnect, waiting up to `timeout` for outgoing QoS traffic to drain.
    pub fn disconnect(&mut self, timeout: Duration, now: Instant) {
        self.client.disconnect(timeout, now);
    }

    /// Tears the connection down immediately, discarding any in-flight QoS traffic.
    pub fn force_disconnect(&mut self) {
        self.client.force_disconnect();
        self.handshake.reset_for_new_connection();
    }

    /// Whether the handshake has completed and the device may send/receive application data.
    pub fn is_connected(&self) -> bool {
        self.handshake.is_settled()
    }

    /// Registers a new interface. Interfaces are frozen while the connection is up; this only
    /// succeeds while fully [`disconnected`](mqtt::State::Disconnected).
    pub fn add_interface(&mut self, interface: crate::interface::Interface) -> Result<(), Error<S::Err>> {
        if self.client.state() != mqtt::State::Disconnected {
            return Err(DeviceError::InterfacesFrozen.into());
        }
        self.interfaces.add(interface)?;
        Ok(())
    }

    /// Parses and registers an interface from its JSON definition. See [`Device::add_interface`].
    pub fn add_interface_from_str(&mut self, json: &str) -> Result<(), Error<S::Err>> {
        self.add_interface(crate::interface::Interface::from_str(json)?)
    }

    /// Parses and registers an interface from a JSON file. See [`Device::add_interface`].
    pub fn add_interface_from_file(&mut self, path: impl AsRef<std::path::Path>) -> Result<(), Error<S::Err>> {
        self.add_interface(crate::interface::Interface::from_file(path)?)
    }

    /// Unregisters an interface by name. See [`Device::add_interface`] for the same connection
    /// gating.
    pub fn remove_interface(&mut self, name: &str) -> Result<(), Error<S::Err>> {
        if self.client.state() != mqtt::State::Disconnected {
            return Err(DeviceError::InterfacesFrozen.into());
        }
        self.interfaces.remove(name);
        Ok(())
    }

    /// Drives the connection: MQTT protocol handling, the handshake, and dispatch of incoming
    /// publishes once the handshake is settled. Expected to be called on a regular cadence.
    pub fn poll(&mut self, now: Instant) -> Result<Vec<DeviceEvent>, Error<S::Err>> {
        let mqtt_events = self.client.poll(now);
        let mut device_events = Vec::new();

        for event in &mqtt_events {
            match event {
                MqttEvent::Connected { session_present } => {
                    self.last_session_present = *session_present;
                    self.handshake.on_connack(
                        *session_present,
                        &mut self.client,
                        self.client_id(),
                        &self.interfaces,
                        &self.store,
                        now,
                    )?;
                }
                MqttEvent::Disconnected | MqttEvent::ConnectionError => {
                    self.handshake.reset_for_new_connection();
                    device_events.push(DeviceEvent::Disconnected);
                }
                MqttEvent::Incoming { topic, payload } => {
                    if self.handshake.is_settled() {
                        device_events.extend(handshake::dispatch_incoming(
                            self.client_id(),
                            topic,
                            payload,
                            &self.interfaces,
                            &self.store,
                        )?);
                    }
                }
                MqttEvent::Delivered { .. } | MqttEvent::Subscribed { .. } => {}
            }
        }

        if self.client.state() == mqtt::State::Connected {
            if self.handshake.ready_to_retry(now) {
                self.handshake.retry();
                self.handshake.on_connack(
                    false,
                    &mut self.client,
                    self.client_id(),
                    &self.interfaces,
                    &self.store,
                    now,
                )?;
            }

            let was_settled = self.handshake.is_settled();
            let outcome = self
                .handshake
                .on_tick(
                    &mqtt_events,
                    self.client.outgoing_drained(),
                    &self.interfaces,
                    &self.store,
                    now,
                )
                .map_err(Error::Store)?;

            if outcome == HandshakeOutcome::Connected && !was_settled {
                device_events.push(DeviceEvent::Connected {
                    session_present: self.last_session_present,
                });
            }
        }

        Ok(device_events)
    }

    /// Sends a value on an individual-aggregation datastream, or sets a device-owned property.
    pub fn send_individual(
        &mut self,
        interface: &str,
        path: &str,
        value: AstarteType,
        timestamp: Option<DateTime<Utc>>,
        now: Instant,
    ) -> Result<(), Error<S::Err>> {
        if !self.is_connected() {
            return Err(DeviceError::NotReady.into());
        }

        let iface = self
            .interfaces
            .get(interface)
            .ok_or_else(|| DeviceError::UnknownInterface(interface.to_owned()))?;

        if iface.ownership == Ownership::Server {
            return Err(DeviceError::ServerOwned(interface.to_owned()).into());
        }

        let mapping = iface.find_mapping(path)?;

        if matches!(value, AstarteType::Unset) && !mapping.allow_unset {
            return Err(DeviceError::UnsetNotAllowed {
                interface: interface.to_owned(),
                path: path.to_owned(),
            }
            .into());
        }

        let qos = qos_for(iface.interface_type, mapping);
        let topic = crate::topic::base_topic(self.client_id(), interface, path);
        let publish_payload = payload::encode_individual(&value, timestamp);

        if iface.interface_type == InterfaceType::Properties {
            if matches!(value, AstarteType::Unset) {
                self.store
                    .delete_prop(interface, path)
                    .map_err(Error::Store)?;
            } else {
                self.store
                    .store_prop(StoredProp {
                        interface,
                        path,
                        value: &value,
                        interface_major: iface.version_major,
                        ownership: Ownership::Device,
                    })
                    .map_err(Error::Store)?;
            }
        }

        self.client.publish(topic, publish_payload, qos, now)?;
        Ok(())
    }

    /// Unsets a device-owned property. Shorthand for [`Device::send_individual`] with
    /// [`AstarteType::Unset`].
    pub fn unset_property(
        &mut self,
        interface: &str,
        path: &str,
        now: Instant,
    ) -> Result<(), Error<S::Err>> {
        self.send_individual(interface, path, AstarteType::Unset, None, now)
    }

    /// Sends a structured record on an object-aggregation datastream.
    pub fn send_object(
        &mut self,
        interface: &str,
        path: &str,
        entries: Vec<ObjectEntry>,
        timestamp: Option<DateTime<Utc>>,
        now: Instant,
    ) -> Result<(), Error<S::Err>> {
        if !self.is_connected() {
            return Err(DeviceError::NotReady.into());
        }

        let iface = self
            .interfaces
            .get(interface)
            .ok_or_else(|| DeviceError::UnknownInterface(interface.to_owned()))?;

        if iface.ownership == Ownership::Server {
            return Err(DeviceError::ServerOwned(interface.to_owned()).into());
        }

        if iface.aggregation != Aggregation::Object {
            return Err(DeviceError::NotAnObjectInterface(interface.to_owned()).into());
        }

        let qos = iface
            .mappings
            .first()
            .map(|m| qos_for(iface.interface_type, m))
            .unwrap_or(mqttbytes::QoS::AtMostOnce);

        let topic = crate::topic::base_topic(self.client_id(), interface, path);
        let publish_payload = payload::encode_object(&entries, timestamp);

        self.client.publish(topic, publish_payload, qos, now)?;
        Ok(())
    }

    /// Reads back the last value stored for a property, if any.
    pub fn property(
        &self,
        interface: &str,
        path: &str,
    ) -> Result<Option<AstarteType>, Error<S::Err>> {
        let iface = self
            .interfaces
            .get(interface)
            .ok_or_else(|| DeviceError::UnknownInterface(interface.to_owned()))?;

        self.store
            .load_prop(interface, path, iface.version_major)
            .map_err(Error::Store)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use crate::backoff::BackoffConfig;
    use crate::interface::Interface;
    use crate::mqtt::tls::TrustAnchor;
    use crate::store::memory::MemoryStore;

    use super::*;

    const PROP_IFACE: &str = r#"{
        "interface_name": "com.test.Settings",
        "version_major": 1,
        "version_minor": 0,
        "type": "properties",
        "ownership": "device",
        "mappings": [{ "endpoint": "/enable", "type": "boolean" }]
    }"#;

    fn test_device() -> Device<MemoryStore> {
        let mqtt_config = MqttClientConfig {
            client_id: "realm/device".into(),
            host: "127.0.0.1".into(),
            port: 8883,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_millis(250),
            max_msg_size: 64 * 1024,
            clean_session: false,
            reconnect_backoff: BackoffConfig::default(),
        };

        Device {
            realm: "realm".into(),
            device_id: "device".into(),
            interfaces: Interfaces::new(),
            store: MemoryStore::new(),
            client: mqtt::Client::new(mqtt_config),
            handshake: Handshake::new(BackoffConfig::default()),
            identity: ClientIdentity {
                certificate_chain_pem: String::new(),
                private_key_pem: String::new(),
            },
            trust_anchor: TrustAnchor::Native,
            last_session_present: false,
        }
    }

    fn unwrap_device_error<T: std::fmt::Debug>(result: Result<T, Error<Infallible>>) -> DeviceError {
        match result.unwrap_err() {
            Error::Device(err) => err,
            other => panic!("expected a DeviceError, got {other:?}"),
        }
    }

    #[test]
    fn send_individual_rejects_before_the_handshake_settles() {
        let mut device = test_device();
        device.interfaces.add(Interface::from_str(PROP_IFACE).unwrap()).unwrap();

        let err = unwrap_device_error(device.send_individual(
            "com.test.Settings",
            "/enable",
            AstarteType::Boolean(true),
            None,
            Instant::now(),
        ));

        assert!(matches!(err, DeviceError::NotReady));
    }

    #[test]
    fn unset_property_rejects_before_the_handshake_settles() {
        let mut device = test_device();
        device.interfaces.add(Interface::from_str(PROP_IFACE).unwrap()).unwrap();

        let err = unwrap_device_error(device.unset_property("com.test.Settings", "/enable", Instant::now()));

        assert!(matches!(err, DeviceError::NotReady));
    }

    #[test]
    fn send_object_rejects_before_the_handshake_settles() {
        let mut device = test_device();
        let err = unwrap_device_error(device.send_object(
            "com.test.Settings",
            "/",
            Vec::new(),
            None,
            Instant::now(),
        ));

        assert!(matches!(err, DeviceError::NotReady));
    }

    #[test]
    fn interfaces_can_be_added_and_removed_while_disconnected() {
        let mut device = test_device();

        device.add_interface_from_str(PROP_IFACE).unwrap();
        assert!(device.interfaces.get("com.test.Settings").is_some());

        device.remove_interface("com.test.Settings").unwrap();
        assert!(device.interfaces.get("com.test.Settings").is_none());
    }

    #[test]
    fn interfaces_are_frozen_outside_the_disconnected_state() {
        let mut device = test_device();
        device.client.set_state_for_test(mqtt::State::Connected);

        let err = unwrap_device_error(device.add_interface_from_str(PROP_IFACE));
        assert!(matches!(err, DeviceError::InterfacesFrozen));

        let err = unwrap_device_error(device.remove_interface("com.test.Settings"));
        assert!(matches!(err, DeviceError::InterfacesFrozen));
    }
}
