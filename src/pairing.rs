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

//! The HTTPS pairing collaborator: registers a device, resolves the broker address, and
//! requests/verifies the client certificate used for mutual TLS.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Error talking to the pairing API.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("HTTP request to the pairing API failed")]
    Http(#[from] reqwest::Error),
    #[error("couldn't parse the broker URL '{0}'")]
    InvalidBrokerUrl(String),
    #[error("the server rejected the client certificate: {cause}")]
    InvalidCertificate { cause: String },
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    data: RegisterRequestData<'a>,
}

#[derive(Debug, Serialize)]
struct RegisterRequestData<'a> {
    hw_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    data: RegisterResponseData,
}

#[derive(Debug, Deserialize)]
struct RegisterResponseData {
    credentials_secret: String,
}

#[derive(Debug, Serialize)]
struct CertificateRequest<'a> {
    data: CertificateRequestData<'a>,
}

#[derive(Debug, Serialize)]
struct CertificateRequestData<'a> {
    csr: &'a str,
}

#[derive(Debug, Deserialize)]
struct CertificateResponse {
    data: CertificateResponseData,
}

#[derive(Debug, Deserialize)]
struct CertificateResponseData {
    client_crt: String,
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    data: VerifyRequestData<'a>,
}

#[derive(Debug, Serialize)]
struct VerifyRequestData<'a> {
    client_crt: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    data: VerifyResponseData,
}

#[derive(Debug, Deserialize)]
struct VerifyResponseData {
    valid: bool,
    /// `null` means no further detail was given; treated the same as an absent cause.
    #[serde(default)]
    cause: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BrokerInfoResponse {
    data: BrokerInfoData,
}

#[derive(Debug, Deserialize)]
struct BrokerInfoData {
    protocols: BrokerProtocols,
}

#[derive(Debug, Deserialize)]
struct BrokerProtocols {
    mqtt_v1: BrokerMqttV1,
}

#[derive(Debug, Deserialize)]
struct BrokerMqttV1 {
    broker_url: String,
}

/// The broker `host:port` resolved out of the pairing API's `broker_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerInfo {
    pub host: String,
    pub port: u16,
}

fn parse_broker_url(broker_url: &str) -> Result<BrokerInfo, PairingError> {
    let url = url::Url::parse(broker_url)
        .map_err(|_| PairingError::InvalidBrokerUrl(broker_url.to_owned()))?;

    let host = url
        .host_str()
        .ok_or_else(|| PairingError::InvalidBrokerUrl(broker_url.to_owned()))?
        .to_owned();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| PairingError::InvalidBrokerUrl(broker_url.to_owned()))?;

    if host.len() > 253 {
        return Err(PairingError::InvalidBrokerUrl(broker_url.to_owned()));
    }

    Ok(BrokerInfo { host, port })
}

/// A thin, synchronous client for the pairing API.
pub struct PairingClient {
    http: reqwest::blocking::Client,
    pairing_url: String,
    realm: String,
    device_id: String,
}

impl PairingClient {
    pub fn new(
        pairing_url: impl Into<String>,
        realm: impl Into<String>,
        device_id: impl Into<String>,
        http_timeout: Duration,
    ) -> Result<Self, PairingError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(http_timeout)
            .build()?;

        Ok(Self {
            http,
            pairing_url: pairing_url.into(),
            realm: realm.into(),
            device_id: device_id.into(),
        })
    }

    fn agent_url(&self, suffix: &str) -> String {
        format!(
            "{}/v1/{}/agent/devices/{}{suffix}",
            self.pairing_url, self.realm, self.device_id
        )
    }

    /// Registers the device with a JWT-authenticated agent token, returning its
    /// `credentials_secret`.
    pub fn register(&self, jwt: &str) -> Result<String, PairingError> {
        let body = RegisterRequest {
            data: RegisterRequestData {
                hw_id: &self.device_id,
            },
        };

        debug!(device_id = %self.device_id, "registering device");

        let response: RegisterResponse = self
            .http
            .post(self.agent_url(""))
            .bearer_auth(jwt)
            .json(&body)
            .send()?
            .error_for_status()?
            .json()?;

        Ok(response.data.credentials_secret)
    }

    /// Resolves the broker host/port using the device's `credentials_secret`.
    pub fn get_broker_info(&self, credentials_secret: &str) -> Result<BrokerInfo, PairingError> {
        let url = format!(
            "{}/v1/{}/devices/{}",
            self.pairing_url, self.realm, self.device_id
        );

        let response: BrokerInfoResponse = self
            .http
            .get(url)
            .bearer_auth(credentials_secret)
            .send()?
            .error_for_status()?
            .json()?;

        parse_broker_url(&response.data.protocols.mqtt_v1.broker_url)
    }

    /// Requests a client certificate for the given PEM-encoded CSR.
    pub fn get_client_certificate(
        &self,
        credentials_secret: &str,
        csr_pem: &str,
    ) -> Result<String, PairingError> {
        let url = format!(
            "{}/v1/{}/devices/{}/protocols/astarte_mqtt_v1/credentials",
            self.pairing_url, self.realm, self.device_id
        );

        let body = CertificateRequest {
            data: CertificateRequestData { csr: csr_pem },
        };

        let response: CertificateResponse = self
            .http
            .post(url)
            .bearer_auth(credentials_secret)
            .json(&body)
            .send()?
            .error_for_status()?
            .json()?;

        Ok(response.data.client_crt)
    }

    /// Checks with the server whether a previously obtained client certificate is still valid.
    pub fn verify_client_certificate(
        &self,
        credentials_secret: &str,
        client_crt_pem: &str,
    ) -> Result<(), PairingError> {
        let url = format!(
            "{}/v1/{}/devices/{}/protocols/astarte_mqtt_v1/credentials/verify",
            self.pairing_url, self.realm, self.device_id
        );

        let body = VerifyRequest {
            data: VerifyRequestData {
                client_crt: client_crt_pem,
            },
        };

        let response: VerifyResponse = self
            .http
            .post(url)
            .bearer_auth(credentials_secret)
            .json(&body)
            .send()?
            .error_for_status()?
            .json()?;

        if response.data.valid {
            Ok(())
        } else {
            Err(PairingError::InvalidCertificate {
                cause: response.data.cause.unwrap_or_else(|| "unknown".to_owned()),
            })
        }
    }

    #[cfg(test)]
    fn base_url(&self) -> &str {
        &self.pairing_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_broker_url_into_host_and_port() {
        let info = parse_broker_url("mqtts://broker.astarte.example.com:8883").unwrap();
        assert_eq!(info.host, "broker.astarte.example.com");
        assert_eq!(info.port, 8883);
    }

    #[test]
    fn rejects_unparsable_broker_url() {
        assert!(parse_broker_url("not a url").is_err());
    }

    #[test]
    fn register_posts_to_the_agent_devices_endpoint() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/v1/test/agent/devices/device1")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":{"credentials_secret":"s3cr3t"}}"#)
            .create();

        let client =
            PairingClient::new(server.url(), "test", "device1", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), server.url());

        let secret = client.register("jwt-token").unwrap();
        assert_eq!(secret, "s3cr3t");
        mock.assert();
    }

    #[test]
    fn verify_treats_null_cause_as_missing() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock(
                "POST",
                "/v1/test/devices/device1/protocols/astarte_mqtt_v1/credentials/verify",
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":{"valid":false,"cause":null}}"#)
            .create();

        let client =
            PairingClient::new(server.url(), "test", "device1", Duration::from_secs(5)).unwrap();

        let err = client
            .verify_client_certificate("secret", "-----BEGIN CERTIFICATE-----")
            .unwrap_err();

        assert!(matches!(err, PairingError::InvalidCertificate { cause } if cause == "unknown"));
    }
}
