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

//! Builds the immutable [`DeviceConfig`] consumed once by [`crate::device::Device::connect`].

use std::path::Path;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::interface::InterfaceError;
use crate::interfaces::Interfaces;
use crate::mqtt::tls::TrustAnchor;

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MQTT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MQTT_POLL_TIMEOUT: Duration = Duration::from_millis(250);
const DEFAULT_MQTT_MAX_MSG_SIZE: usize = 64 * 1024;

/// Errors raised while assembling a [`DeviceConfig`].
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Interface(#[from] InterfaceError),
    #[error("could not read interface directory")]
    Io(#[from] std::io::Error),
    #[error("{0} is required")]
    Missing(&'static str),
}

/// Immutable device configuration, produced by [`DeviceConfigBuilder::build`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub realm: String,
    pub device_id: String,
    pub credentials_secret: Option<String>,
    pub pairing_url: String,
    pub interfaces: Interfaces,
    pub http_timeout: Duration,
    pub mqtt_connection_timeout: Duration,
    pub mqtt_poll_timeout: Duration,
    pub mqtt_max_msg_size: usize,
    pub mqtt_reconnect_backoff: BackoffConfig,
    pub handshake_reconnect_backoff: BackoffConfig,
    pub permanent_storage_enabled: bool,
    pub trust_anchor: TrustAnchor,
}

/// A chained builder for [`DeviceConfig`], mirroring the teacher's `MqttConfig` builder.
#[derive(Debug)]
pub struct DeviceConfigBuilder {
    realm: Option<String>,
    device_id: Option<String>,
    credentials_secret: Option<String>,
    pairing_url: Option<String>,
    interfaces: Interfaces,
    http_timeout: Duration,
    mqtt_connection_timeout: Duration,
    mqtt_poll_timeout: Duration,
    mqtt_max_msg_size: usize,
    mqtt_reconnect_backoff: BackoffConfig,
    handshake_reconnect_backoff: BackoffConfig,
    permanent_storage_enabled: bool,
    trust_anchor: TrustAnchor,
}

impl Default for DeviceConfigBuilder {
    fn default() -> Self {
        Self {
            realm: None,
            device_id: None,
            credentials_secret: None,
            pairing_url: None,
            interfaces: Interfaces::new(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            mqtt_connection_timeout: DEFAULT_MQTT_CONNECTION_TIMEOUT,
            mqtt_poll_timeout: DEFAULT_MQTT_POLL_TIMEOUT,
            mqtt_max_msg_size: DEFAULT_MQTT_MAX_MSG_SIZE,
            mqtt_reconnect_backoff: BackoffConfig::default(),
            handshake_reconnect_backoff: BackoffConfig::default(),
            permanent_storage_enabled: true,
            trust_anchor: TrustAnchor::Native,
        }
    }
}

impl DeviceConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn credentials_secret(mut self, secret: impl Into<String>) -> Self {
        self.credentials_secret = Some(secret.into());
        self
    }

    pub fn pairing_url(mut self, url: impl Into<String>) -> Self {
        self.pairing_url = Some(url.into());
        self
    }

    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn mqtt_connection_timeout(mut self, timeout: Duration) -> Self {
        self.mqtt_connection_timeout = timeout;
        self
    }

    pub fn mqtt_poll_timeout(mut self, timeout: Duration) -> Self {
        self.mqtt_poll_timeout = timeout;
        self
    }

    pub fn mqtt_max_msg_size(mut self, bytes: usize) -> Self {
        self.mqtt_max_msg_size = bytes;
        self
    }

    pub fn mqtt_reconnect_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.mqtt_reconnect_backoff = backoff;
        self
    }

    pub fn handshake_reconnect_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.handshake_reconnect_backoff = backoff;
        self
    }

    /// Disables persistent property storage (equivalent to forcing the in-memory store at
    /// connect time regardless of which [`crate::store::PropertyStore`] is supplied).
    pub fn permanent_storage_enabled(mut self, enabled: bool) -> Self {
        self.permanent_storage_enabled = enabled;
        self
    }

    /// Trusts the bundled Mozilla CA set instead of the platform's native trust store. Requires
    /// the `webpki` feature.
    #[cfg(feature = "webpki")]
    pub fn webpki_roots(mut self) -> Self {
        self.trust_anchor = TrustAnchor::WebpkiRoots;
        self
    }

    /// Trusts a single PEM-encoded CA certificate, e.g. for a self-hosted Astarte instance.
    pub fn custom_ca(mut self, pem: impl Into<String>) -> Self {
        self.trust_anchor = TrustAnchor::Custom(pem.into());
        self
    }

    /// Accepts any server certificate. Development escape hatch only; mirrors the teacher's
    /// `MqttConfig::ignore_ssl_errors`.
    pub fn insecure_skip_verify(mut self) -> Self {
        self.trust_anchor = TrustAnchor::InsecureSkipVerify;
        self
    }

    pub fn interface(mut self, interface: crate::interface::Interface) -> Result<Self, ConfigError> {
        self.interfaces.add(interface)?;
        Ok(self)
    }

    pub fn interface_file(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        self.interfaces.add_from_file(path)?;
        Ok(self)
    }

    pub fn interface_directory(mut self, dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        self.interfaces.add_from_directory(dir)?;
        Ok(self)
    }

    pub fn build(self) -> Result<DeviceConfig, ConfigError> {
        Ok(DeviceConfig {
            realm: self.realm.ok_or(ConfigError::Missing("realm"))?,
            device_id: self.device_id.ok_or(ConfigError::Missing("device_id"))?,
            credentials_secret: self.credentials_secret,
            pairing_url: self.pairing_url.ok_or(ConfigError::Missing("pairing_url"))?,
            interfaces: self.interfaces,
            http_timeout: self.http_timeout,
            mqtt_connection_timeout: self.mqtt_connection_timeout,
            mqtt_poll_timeout: self.mqtt_poll_timeout,
            mqtt_max_msg_size: self.mqtt_max_msg_size,
            mqtt_reconnect_backoff: self.mqtt_reconnect_backoff,
            handshake_reconnect_backoff: self.handshake_reconnect_backoff,
            permanent_storage_enabled: self.permanent_storage_enabled,
            trust_anchor: self.trust_anchor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_fails_without_required_fields() {
        let err = DeviceConfigBuilder::new().build().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("realm")));
    }

    #[test]
    fn build_succeeds_with_required_fields_and_defaults() {
        let config = DeviceConfigBuilder::new()
            .realm("test")
            .device_id("device1")
            .pairing_url("https://api.astarte.example.com/pairing")
            .build()
            .unwrap();

        assert_eq!(config.realm, "test");
        assert_eq!(config.mqtt_max_msg_size, DEFAULT_MQTT_MAX_MSG_SIZE);
        assert!(config.permanent_storage_enabled);
    }

    #[test]
    fn insecure_skip_verify_overrides_the_trust_anchor() {
        let config = DeviceConfigBuilder::new()
            .realm("test")
            .device_id("device1")
            .pairing_url("https://api.astarte.example.com/pairing")
            .insecure_skip_verify()
            .build()
            .unwrap();

        assert!(matches!(config.trust_anchor, TrustAnchor::InsecureSkipVerify));
    }
}
