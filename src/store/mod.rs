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

//! Persistent storage for device and server properties, plus the bookkeeping the handshake
//! needs (synchronization flag, last-persisted introspection).

use std::error::Error as StdError;
use std::fmt::Debug;

use crate::interface::Ownership;
use crate::types::AstarteType;

pub mod memory;
pub mod sqlite;

/// A property value together with the interface it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProp<S = String, V = AstarteType> {
    pub interface: S,
    pub path: S,
    pub value: V,
    pub interface_major: i32,
    pub ownership: Ownership,
}

impl StoredProp {
    pub fn as_ref(&self) -> StoredProp<&str, &AstarteType> {
        StoredProp {
            interface: &self.interface,
            path: &self.path,
            value: &self.value,
            interface_major: self.interface_major,
            ownership: self.ownership,
        }
    }
}

/// Result of comparing a persisted introspection string against the device's current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrospectionStatus {
    /// Matches exactly; the handshake may skip re-advertising.
    Current,
    /// A persisted introspection exists but differs from the current one.
    Outdated,
    /// No introspection was ever persisted.
    NotFound,
}

/// Permanent storage for properties, implementable against any backing database.
///
/// All operations are synchronous: the device's single-threaded poll loop calls them directly
/// and treats failures as non-fatal (logged and the in-memory state kept authoritative), except
/// where the caller explicitly needs durability before proceeding.
pub trait PropertyStore: Debug + Send + Sync + 'static
where
    Self::Err: StdError + Send + Sync + 'static,
{
    type Err;

    fn store_prop(&self, prop: StoredProp<&str, &AstarteType>) -> Result<(), Self::Err>;

    /// Loads a property, deleting it first if `interface_major` doesn't match what was stored.
    fn load_prop(
        &self,
        interface: &str,
        path: &str,
        interface_major: i32,
    ) -> Result<Option<AstarteType>, Self::Err>;

    fn delete_prop(&self, interface: &str, path: &str) -> Result<(), Self::Err>;

    fn clear(&self) -> Result<(), Self::Err>;

    fn load_all_props(&self) -> Result<Vec<StoredProp>, Self::Err>;

    fn device_props(&self) -> Result<Vec<StoredProp>, Self::Err> {
        Ok(self
            .load_all_props()?
            .into_iter()
            .filter(|p| p.ownership == Ownership::Device)
            .collect())
    }

    fn server_props(&self) -> Result<Vec<StoredProp>, Self::Err> {
        Ok(self
            .load_all_props()?
            .into_iter()
            .filter(|p| p.ownership == Ownership::Server)
            .collect())
    }

    fn interface_props(&self, interface: &str) -> Result<Vec<StoredProp>, Self::Err> {
        Ok(self
            .load_all_props()?
            .into_iter()
            .filter(|p| p.interface == interface)
            .collect())
    }

    fn delete_interface(&self, interface: &str) -> Result<(), Self::Err>;

    /// Whether the device has completed at least one full handshake synchronization.
    fn synchronization_get(&self) -> Result<bool, Self::Err>;

    fn synchronization_set(&self, value: bool) -> Result<(), Self::Err>;

    /// Compares `current` against the last persisted introspection string.
    fn introspection_check(&self, current: &str) -> Result<IntrospectionStatus, Self::Err> {
        match self.introspection_load()? {
            None => Ok(IntrospectionStatus::NotFound),
            Some(stored) if stored == current => Ok(IntrospectionStatus::Current),
            Some(_) => Ok(IntrospectionStatus::Outdated),
        }
    }

    fn introspection_load(&self) -> Result<Option<String>, Self::Err>;

    fn introspection_store(&self, introspection: &str) -> Result<(), Self::Err>;

    /// The device-owned property list as `iface/path;iface2/path2;...`, used to build the
    /// producer-properties handshake payload.
    fn device_props_string(&self) -> Result<String, Self::Err> {
        let mut names: Vec<String> = self
            .device_props()?
            .into_iter()
            .map(|p| format!("{}{}", p.interface, p.path))
            .collect();
        names.sort();
        Ok(names.join(";"))
    }
}

#[cfg(test)]
pub(crate) fn test_property_store<S>(store: S)
where
    S: PropertyStore,
{
    let ty = AstarteType::Integer(23);
    let prop = StoredProp {
        interface: "com.test",
        path: "/test",
        value: &ty,
        interface_major: 1,
        ownership: Ownership::Device,
    };

    store.clear().unwrap();

    assert_eq!(store.load_prop("com.test", "/test", 1).unwrap(), None);

    store.store_prop(prop).unwrap();
    assert_eq!(
        store.load_prop("com.test", "/test", 1).unwrap().unwrap(),
        ty
    );

    // major version mismatch deletes the stale entry
    assert_eq!(store.load_prop("com.test", "/test", 2).unwrap(), None);
    assert_eq!(store.load_prop("com.test", "/test", 1).unwrap(), None);

    // delete
    store.store_prop(prop).unwrap();
    store.delete_prop("com.test", "/test").unwrap();
    assert_eq!(store.load_prop("com.test", "/test", 1).unwrap(), None);

    // device/server partition
    let device = StoredProp {
        interface: "com.test1".to_owned(),
        path: "/test1".to_owned(),
        value: ty.clone(),
        interface_major: 1,
        ownership: Ownership::Device,
    };
    let server = StoredProp {
        interface: "com.test2".to_owned(),
        path: "/test2".to_owned(),
        value: ty.clone(),
        interface_major: 1,
        ownership: Ownership::Server,
    };

    store.store_prop(device.as_ref()).unwrap();
    store.store_prop(server.as_ref()).unwrap();

    assert_eq!(store.device_props().unwrap(), vec![device.clone()]);
    assert_eq!(store.server_props().unwrap(), vec![server.clone()]);
    assert_eq!(
        store.interface_props("com.test1").unwrap(),
        vec![device.clone()]
    );

    store.delete_interface("com.test1").unwrap();
    assert!(store.interface_props("com.test1").unwrap().is_empty());

    // synchronization flag
    assert!(!store.synchronization_get().unwrap());
    store.synchronization_set(true).unwrap();
    assert!(store.synchronization_get().unwrap());

    // introspection bookkeeping
    assert_eq!(
        store.introspection_check("a:1:0").unwrap(),
        IntrospectionStatus::NotFound
    );
    store.introspection_store("a:1:0").unwrap();
    assert_eq!(
        store.introspection_check("a:1:0").unwrap(),
        IntrospectionStatus::Current
    );
    assert_eq!(
        store.introspection_check("a:1:1").unwrap(),
        IntrospectionStatus::Outdated
    );

    // device props string, sorted
    store.clear().unwrap();
    store.store_prop(device.as_ref()).unwrap();
    let third = StoredProp {
        interface: "com.aaa".to_owned(),
        path: "/z".to_owned(),
        value: ty.clone(),
        interface_major: 1,
        ownership: Ownership::Device,
    };
    store.store_prop(third.as_ref()).unwrap();

    assert_eq!(
        store.device_props_string().unwrap(),
        "com.aaa/z;com.test1/test1"
    );
}
