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

//! An in-memory [`PropertyStore`], used as the zero-config default and in tests. Nothing is
//! persisted across process restarts.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Mutex;

use super::{PropertyStore, StoredProp};
use crate::types::AstarteType;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    interface: String,
    path: String,
}

#[derive(Debug, Default)]
struct Inner {
    props: BTreeMap<Key, StoredProp>,
    synchronized: bool,
    introspection: Option<String>,
}

/// A non-persistent property store backed by a `BTreeMap` behind a mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PropertyStore for MemoryStore {
    type Err = Infallible;

    fn store_prop(&self, prop: StoredProp<&str, &AstarteType>) -> Result<(), Self::Err> {
        let key = Key {
            interface: prop.interface.to_owned(),
            path: prop.path.to_owned(),
        };

        self.inner.lock().unwrap().props.insert(
            key,
            StoredProp {
                interface: prop.interface.to_owned(),
                path: prop.path.to_owned(),
                value: prop.value.clone(),
                interface_major: prop.interface_major,
                ownership: prop.ownership,
            },
        );

        Ok(())
    }

    fn load_prop(
        &self,
        interface: &str,
        path: &str,
        interface_major: i32,
    ) -> Result<Option<AstarteType>, Self::Err> {
        let key = Key {
            interface: interface.to_owned(),
            path: path.to_owned(),
        };

        let mut inner = self.inner.lock().unwrap();

        let Some(stored) = inner.props.get(&key) else {
            return Ok(None);
        };

        if stored.interface_major != interface_major {
            inner.props.remove(&key);
            return Ok(None);
        }

        Ok(Some(stored.value.clone()))
    }

    fn delete_prop(&self, interface: &str, path: &str) -> Result<(), Self::Err> {
        let key = Key {
            interface: interface.to_owned(),
            path: path.to_owned(),
        };
        self.inner.lock().unwrap().props.remove(&key);
        Ok(())
    }

    fn clear(&self) -> Result<(), Self::Err> {
        self.inner.lock().unwrap().props.clear();
        Ok(())
    }

    fn load_all_props(&self) -> Result<Vec<StoredProp>, Self::Err> {
        Ok(self.inner.lock().unwrap().props.values().cloned().collect())
    }

    fn delete_interface(&self, interface: &str) -> Result<(), Self::Err> {
        self.inner
            .lock()
            .unwrap()
            .props
            .retain(|key, _| key.interface != interface);
        Ok(())
    }

    fn synchronization_get(&self) -> Result<bool, Self::Err> {
        Ok(self.inner.lock().unwrap().synchronized)
    }

    fn synchronization_set(&self, value: bool) -> Result<(), Self::Err> {
        self.inner.lock().unwrap().synchronized = value;
        Ok(())
    }

    fn introspection_load(&self) -> Result<Option<String>, Self::Err> {
        Ok(self.inner.lock().unwrap().introspection.clone())
    }

    fn introspection_store(&self, introspection: &str) -> Result<(), Self::Err> {
        self.inner.lock().unwrap().introspection = Some(introspection.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_property_store;

    #[test]
    fn passes_the_shared_property_store_contract() {
        test_property_store(MemoryStore::new());
    }
}
