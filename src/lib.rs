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

//! A synchronous, single-threaded-poll Astarte device SDK: mutual-TLS MQTT 3.1.1 with QoS 1/2
//! reliability, the device handshake state machine, and a BSON wire codec, all driven by a
//! single cooperative [`Device::poll`] call rather than a background async runtime.

pub mod backoff;
pub mod bson;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod events;
pub mod handshake;
pub mod interface;
pub mod interfaces;
pub mod mqtt;
pub mod pairing;
pub mod payload;
pub mod properties;
pub mod store;
pub mod topic;
pub mod types;

pub use chrono;

pub use crate::config::{DeviceConfig, DeviceConfigBuilder};
pub use crate::device::{Device, DeviceError};
pub use crate::error::{Error, Result};
pub use crate::events::{DeviceEvent, EventSink};
pub use crate::interface::Interface;
pub use crate::types::AstarteType;
