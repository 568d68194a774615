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

//! The registered interface set: an ordered collection keyed by name, frozen while the device is
//! connected.

use std::collections::BTreeMap;
use std::path::Path;

use crate::interface::{Interface, InterfaceError, Ownership};

/// The ordered collection of interfaces a device has registered.
///
/// Lookups are linear, matching the "called rarely" contract; a `BTreeMap` is used purely to
/// keep introspection output deterministically ordered by name, not for lookup speed.
#[derive(Debug, Default, Clone)]
pub struct Interfaces {
    by_name: BTreeMap<String, Interface>,
}

impl Interfaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an interface, enforcing the same conflict/downgrade rules as
    /// [`Interface::check_update`] against any interface already registered under that name.
    pub fn add(&mut self, interface: Interface) -> Result<(), InterfaceError> {
        if let Some(existing) = self.by_name.get(&interface.name) {
            existing.check_update(&interface)?;
        }

        self.by_name.insert(interface.name.clone(), interface);
        Ok(())
    }

    /// Loads and adds a single interface from a JSON file.
    pub fn add_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), InterfaceError> {
        let interface = Interface::from_file(path)?;
        self.add(interface)
    }

    /// Loads and adds every `*.json` file directly inside `dir` (non-recursive).
    pub fn add_from_directory(&mut self, dir: impl AsRef<Path>) -> Result<(), InterfaceError> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
            .collect();
        entries.sort();

        for path in entries {
            self.add_from_file(path)?;
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Interface> {
        self.by_name.get(name)
    }

    /// Removes a registered interface by name, returning it if it was present.
    pub fn remove(&mut self, name: &str) -> Option<Interface> {
        self.by_name.remove(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.by_name.values()
    }

    pub fn server_owned(&self) -> impl Iterator<Item = &Interface> {
        self.iter().filter(|i| i.ownership == Ownership::Server)
    }

    pub fn device_owned(&self) -> impl Iterator<Item = &Interface> {
        self.iter().filter(|i| i.ownership == Ownership::Device)
    }

    /// The `name:major:minor;...` introspection string, in name order, with no trailing
    /// separator (the wire format adds its own NUL when framed for publish).
    pub fn introspection_string(&self) -> String {
        self.iter()
            .map(Interface::introspection_entry)
            .collect::<Vec<_>>()
            .join(";")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IFACE_A: &str = r#"{
        "interface_name": "a.Test",
        "version_major": 1,
        "version_minor": 0,
        "type": "datastream",
        "ownership": "server",
        "mappings": [{ "endpoint": "/x", "type": "integer" }]
    }"#;

    const IFACE_B: &str = r#"{
        "interface_name": "b.Test",
        "version_major": 2,
        "version_minor": 1,
        "type": "properties",
        "ownership": "device",
        "mappings": [{ "endpoint": "/y", "type": "string" }]
    }"#;

    #[test]
    fn introspection_string_is_sorted_and_joined() {
        let mut interfaces = Interfaces::new();
        interfaces.add(Interface::from_str(IFACE_B).unwrap()).unwrap();
        interfaces.add(Interface::from_str(IFACE_A).unwrap()).unwrap();

        assert_eq!(interfaces.introspection_string(), "a.Test:1:0;b.Test:2:1");
    }

    #[test]
    fn add_rejects_conflicting_redeclaration() {
        let mut interfaces = Interfaces::new();
        interfaces.add(Interface::from_str(IFACE_A).unwrap()).unwrap();

        let err = interfaces.add(Interface::from_str(IFACE_A).unwrap()).unwrap_err();
        assert!(matches!(err, InterfaceError::AlreadyPresent { .. }));
    }

    #[test]
    fn remove_returns_the_removed_interface() {
        let mut interfaces = Interfaces::new();
        interfaces.add(Interface::from_str(IFACE_A).unwrap()).unwrap();

        let removed = interfaces.remove("a.Test").unwrap();
        assert_eq!(removed.name, "a.Test");
        assert!(interfaces.get("a.Test").is_none());
        assert!(interfaces.remove("a.Test").is_none());
    }

    #[test]
    fn ownership_filters_partition_the_set() {
        let mut interfaces = Interfaces::new();
        interfaces.add(Interface::from_str(IFACE_A).unwrap()).unwrap();
        interfaces.add(Interface::from_str(IFACE_B).unwrap()).unwrap();

        assert_eq!(interfaces.server_owned().count(), 1);
        assert_eq!(interfaces.device_owned().count(), 1);
    }
}
