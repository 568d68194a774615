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

//! The top-level error type, aggregating every subsystem's own error enum.
//!
//! It's generic over the property store's associated error type `E`, the same way
//! [`crate::handshake::HandshakeError`] and [`crate::handshake::DispatchError`] are:
//! [`crate::device::Device<S>`] reports its errors as `Error<S::Err>`. Callers that never touch a
//! fallible store (e.g. only use [`crate::store::memory::MemoryStore`]) see `E =
//! std::convert::Infallible` and never have to match the `Store` variant.

use std::convert::Infallible;

use crate::bson::BsonError;
use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::device::DeviceError;
use crate::handshake::{DispatchError, HandshakeError};
use crate::interface::InterfaceError;
use crate::mqtt::tls::TlsError;
use crate::mqtt::MqttError;
use crate::pairing::PairingError;
use crate::properties::PropertiesPayloadError;
use crate::topic::TopicError;

/// Astarte device SDK error.
///
/// Possible errors returned by functions of the device SDK.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum Error<E = Infallible>
where
    E: std::error::Error + 'static,
{
    #[error("invalid configuration")]
    Config(#[from] ConfigError),

    #[error("invalid interface")]
    Interface(#[from] InterfaceError),

    #[error("invalid topic")]
    Topic(#[from] TopicError),

    #[error("couldn't process payload")]
    Bson(#[from] BsonError),

    #[error("couldn't handle properties")]
    Properties(#[from] PropertiesPayloadError),

    #[error("couldn't generate client credentials")]
    Crypto(#[from] CryptoError),

    #[error("pairing request failed")]
    Pairing(#[from] PairingError),

    #[error("tls setup failed")]
    Tls(#[from] TlsError),

    #[error("mqtt client error")]
    Mqtt(#[from] MqttError),

    #[error("invalid device operation")]
    Device(#[from] DeviceError),

    #[error("handshake failed")]
    Handshake(#[from] HandshakeError<E>),

    #[error("couldn't dispatch an incoming publish")]
    Dispatch(#[from] DispatchError<E>),

    #[error("property store operation failed")]
    Store(#[source] E),
}

/// Shorthand for a `Result` returning the crate's [`Error`], generic over the store's error type.
pub type Result<T, E = Infallible> = std::result::Result<T, Error<E>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_via_from() {
        let err: Error = ConfigError::Missing("realm").into();
        assert!(matches!(err, Error::Config(ConfigError::Missing("realm"))));
    }
}
