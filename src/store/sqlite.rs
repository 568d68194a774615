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

//! A [`rusqlite`]-backed [`PropertyStore`].
//!
//! Values are stored as the BSON-encoded individual payload (`{"v": value}`) alongside the
//! mapping type discriminant needed to decode them back into an [`AstarteType`].

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, trace};

use super::{PropertyStore, StoredProp};
use crate::interface::Ownership;
use crate::payload;
use crate::types::{AstarteType, MappingType};

/// Error returned by the [`SqliteStore`].
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SqliteError {
    #[error("could not open or migrate the database")]
    Connection(#[source] rusqlite::Error),
    #[error("could not execute query")]
    Query(#[from] rusqlite::Error),
    #[error("could not decode the stored value")]
    Decode(#[source] crate::bson::BsonError),
    #[error("stored mapping type discriminant {0} is not a known mapping type")]
    UnknownMappingType(i32),
}

fn ownership_to_i32(ownership: Ownership) -> i32 {
    match ownership {
        Ownership::Device => 0,
        Ownership::Server => 1,
    }
}

fn ownership_from_i32(value: i32) -> Ownership {
    if value == 0 {
        Ownership::Device
    } else {
        Ownership::Server
    }
}

/// Permanent property storage backed by a SQLite file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if missing) the SQLite database at `path` and runs its migrations.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SqliteError> {
        let conn = Connection::open(path).map_err(SqliteError::Connection)?;
        Self::from_connection(conn)
    }

    /// An in-process, non-persistent SQLite database, useful for tests.
    pub fn in_memory() -> Result<Self, SqliteError> {
        let conn = Connection::open_in_memory().map_err(SqliteError::Connection)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, SqliteError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS properties (
                interface TEXT NOT NULL,
                path TEXT NOT NULL,
                value BLOB NOT NULL,
                mapping_type INTEGER NOT NULL,
                interface_major INTEGER NOT NULL,
                ownership INTEGER NOT NULL,
                PRIMARY KEY (interface, path)
            );
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl PropertyStore for SqliteStore {
    type Err = SqliteError;

    fn store_prop(&self, prop: StoredProp<&str, &AstarteType>) -> Result<(), Self::Err> {
        debug!(interface = prop.interface, path = prop.path, "storing property");

        let mapping_type = prop
            .value
            .mapping_type()
            .expect("Unset is never persisted directly; unset_prop removes the row instead");

        let encoded = payload::encode_individual(prop.value, None);

        self.conn.lock().unwrap().execute(
            "INSERT INTO properties (interface, path, value, mapping_type, interface_major, ownership)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(interface, path) DO UPDATE SET
                value = excluded.value,
                mapping_type = excluded.mapping_type,
                interface_major = excluded.interface_major,
                ownership = excluded.ownership",
            params![
                prop.interface,
                prop.path,
                encoded,
                mapping_type.as_i32(),
                prop.interface_major,
                ownership_to_i32(prop.ownership),
            ],
        )?;

        Ok(())
    }

    fn load_prop(
        &self,
        interface: &str,
        path: &str,
        interface_major: i32,
    ) -> Result<Option<AstarteType>, Self::Err> {
        let row: Option<(Vec<u8>, i32, i32)> = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT value, mapping_type, interface_major FROM properties
                 WHERE interface = ?1 AND path = ?2",
                params![interface, path],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((value, mapping_type, stored_major)) = row else {
            return Ok(None);
        };

        if stored_major != interface_major {
            error!(
                interface,
                path, stored_major, interface_major, "property version mismatch, deleting"
            );
            self.delete_prop(interface, path)?;
            return Ok(None);
        }

        let mapping_type = MappingType::from_i32(mapping_type)
            .ok_or(SqliteError::UnknownMappingType(mapping_type))?;

        trace!(interface, path, "decoding stored property");

        payload::decode_individual(&value, mapping_type)
            .map(Some)
            .map_err(SqliteError::Decode)
    }

    fn delete_prop(&self, interface: &str, path: &str) -> Result<(), Self::Err> {
        self.conn.lock().unwrap().execute(
            "DELETE FROM properties WHERE interface = ?1 AND path = ?2",
            params![interface, path],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<(), Self::Err> {
        self.conn.lock().unwrap().execute("DELETE FROM properties", [])?;
        Ok(())
    }

    fn load_all_props(&self) -> Result<Vec<StoredProp>, Self::Err> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT interface, path, value, mapping_type, interface_major, ownership FROM properties",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, i32>(3)?,
                row.get::<_, i32>(4)?,
                row.get::<_, i32>(5)?,
            ))
        })?;

        let mut props = Vec::new();
        for row in rows {
            let (interface, path, value, mapping_type, interface_major, ownership) = row?;

            let mapping_type = MappingType::from_i32(mapping_type)
                .ok_or(SqliteError::UnknownMappingType(mapping_type))?;
            let value = payload::decode_individual(&value, mapping_type).map_err(SqliteError::Decode)?;

            props.push(StoredProp {
                interface,
                path,
                value,
                interface_major,
                ownership: ownership_from_i32(ownership),
            });
        }

        Ok(props)
    }

    fn delete_interface(&self, interface: &str) -> Result<(), Self::Err> {
        self.conn
            .lock()
            .unwrap()
            .execute("DELETE FROM properties WHERE interface = ?1", params![interface])?;
        Ok(())
    }

    fn synchronization_get(&self) -> Result<bool, Self::Err> {
        let value: Option<String> = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT value FROM kv WHERE key = 'synchronized'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value.as_deref() == Some("1"))
    }

    fn synchronization_set(&self, value: bool) -> Result<(), Self::Err> {
        self.conn.lock().unwrap().execute(
            "INSERT INTO kv (key, value) VALUES ('synchronized', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![if value { "1" } else { "0" }],
        )?;
        Ok(())
    }

    fn introspection_load(&self) -> Result<Option<String>, Self::Err> {
        let value = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT value FROM kv WHERE key = 'introspection'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn introspection_store(&self, introspection: &str) -> Result<(), Self::Err> {
        self.conn.lock().unwrap().execute(
            "INSERT INTO kv (key, value) VALUES ('introspection', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![introspection],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_property_store;

    #[test]
    fn passes_the_shared_property_store_contract() {
        let store = SqliteStore::in_memory().unwrap();
        test_property_store(store);
    }

    #[test]
    fn persists_across_a_reopened_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("props.sqlite");

        {
            let store = SqliteStore::new(&path).unwrap();
            store
                .store_prop(StoredProp {
                    interface: "com.test",
                    path: "/x",
                    value: &AstarteType::Integer(7),
                    interface_major: 1,
                    ownership: Ownership::Device,
                })
                .unwrap();
        }

        let store = SqliteStore::new(&path).unwrap();
        assert_eq!(
            store.load_prop("com.test", "/x", 1).unwrap(),
            Some(AstarteType::Integer(7))
        );
    }
}
