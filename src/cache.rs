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

//! Packet-id-keyed caches backing QoS 1/2 reliability: one for messages awaiting an
//! ack/rec/comp/suback from the broker, one for QoS 2 publishes received from the broker and
//! awaiting a PUBREL, used to filter duplicates.
//!
//! The caching layer never touches the network; it only tracks state and supplies a
//! retransmission schedule.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A cached outgoing entry: either a publish (retransmitted with DUP=1 on expiry) or a
/// subscribe (retransmitted verbatim on expiry).
#[derive(Debug, Clone)]
pub enum OutgoingEntry {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
    },
    Subscribe {
        topic: String,
        qos: u8,
    },
}

/// The outgoing cache: packet id -> entry awaiting PUBACK/PUBREC+PUBCOMP/SUBACK, plus its next
/// retransmission deadline.
#[derive(Debug, Default)]
pub struct OutgoingCache {
    entries: HashMap<u16, (OutgoingEntry, Instant)>,
    retransmit_interval: Duration,
}

impl OutgoingCache {
    pub fn new(retransmit_interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            retransmit_interval,
        }
    }

    /// Returns a 16-bit id not currently present in the cache. Ids are always `>= 1` (0 is
    /// reserved, matching the MQTT spec's "packet identifier must not be 0").
    pub fn allocate_id(&self) -> u16 {
        let mut candidate: u16 = 1;
        while self.entries.contains_key(&candidate) {
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                candidate = 1;
            }
        }
        candidate
    }

    pub fn insert(&mut self, id: u16, entry: OutgoingEntry, now: Instant) {
        self.entries
            .insert(id, (entry, now + self.retransmit_interval));
    }

    pub fn remove(&mut self, id: u16) -> Option<OutgoingEntry> {
        self.entries.remove(&id).map(|(entry, _)| entry)
    }

    pub fn get(&self, id: u16) -> Option<&OutgoingEntry> {
        self.entries.get(&id).map(|(entry, _)| entry)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.entries.contains_key(&id)
    }

    /// Refreshes `id`'s retransmission deadline without altering its entry (used on PUBREC,
    /// which acknowledges receipt of the PUBLISH but not yet the final PUBCOMP).
    pub fn refresh(&mut self, id: u16, now: Instant) {
        if let Some((_, deadline)) = self.entries.get_mut(&id) {
            *deadline = now + self.retransmit_interval;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Invokes `retransmit` for every entry whose deadline has elapsed and refreshes its
    /// deadline. Order of invocation is arbitrary.
    pub fn check_expiry(&mut self, now: Instant, mut retransmit: impl FnMut(u16, &OutgoingEntry)) {
        let interval = self.retransmit_interval;

        for (id, (entry, deadline)) in self.entries.iter_mut() {
            if now >= *deadline {
                retransmit(*id, entry);
                *deadline = now + interval;
            }
        }
    }
}

/// The incoming cache: QoS 2 PUBLISH ids received but not yet released by a PUBREL, used to
/// drop duplicate deliveries before they reach the user callback.
#[derive(Debug, Default)]
pub struct IncomingCache {
    ids: HashMap<u16, Instant>,
    retransmit_interval: Duration,
}

impl IncomingCache {
    pub fn new(retransmit_interval: Duration) -> Self {
        Self {
            ids: HashMap::new(),
            retransmit_interval,
        }
    }

    /// Returns `true` if `id` was newly inserted (i.e. this PUBLISH is not a duplicate).
    pub fn insert(&mut self, id: u16, now: Instant) -> bool {
        if self.ids.contains_key(&id) {
            return false;
        }
        self.ids.insert(id, now + self.retransmit_interval);
        true
    }

    pub fn remove(&mut self, id: u16) -> bool {
        self.ids.remove(&id).is_some()
    }

    pub fn contains(&self, id: u16) -> bool {
        self.ids.contains_key(&id)
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Invokes `resend_pubrec` for every cached id whose deadline elapsed (the broker never got
    /// our PUBREC, or it got lost) and refreshes its deadline.
    pub fn check_expiry(&mut self, now: Instant, mut resend_pubrec: impl FnMut(u16)) {
        let interval = self.retransmit_interval;

        for (id, deadline) in self.ids.iter_mut() {
            if now >= *deadline {
                resend_pubrec(*id);
                *deadline = now + interval;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_id_skips_ids_in_use_and_starts_at_one() {
        let mut cache = OutgoingCache::new(Duration::from_secs(30));
        let now = Instant::now();

        let id1 = cache.allocate_id();
        assert_eq!(id1, 1);
        cache.insert(
            id1,
            OutgoingEntry::Publish {
                topic: "t".into(),
                payload: vec![],
                qos: 1,
            },
            now,
        );

        let id2 = cache.allocate_id();
        assert_ne!(id2, id1);
        assert!(id2 >= 1);
    }

    #[test]
    fn remove_releases_the_entry() {
        let mut cache = OutgoingCache::new(Duration::from_secs(30));
        let now = Instant::now();

        cache.insert(
            5,
            OutgoingEntry::Subscribe {
                topic: "t".into(),
                qos: 2,
            },
            now,
        );
        assert!(cache.contains(5));

        cache.remove(5);
        assert!(!cache.contains(5));
    }

    #[test]
    fn check_expiry_retransmits_and_reschedules() {
        let mut cache = OutgoingCache::new(Duration::from_millis(1));
        let now = Instant::now();

        cache.insert(
            1,
            OutgoingEntry::Publish {
                topic: "t".into(),
                payload: vec![1],
                qos: 1,
            },
            now,
        );

        std::thread::sleep(Duration::from_millis(5));
        let later = Instant::now();

        let mut retransmitted = Vec::new();
        cache.check_expiry(later, |id, _entry| retransmitted.push(id));

        assert_eq!(retransmitted, vec![1]);

        // A second immediate check should not fire again (deadline was just refreshed).
        let mut retransmitted_again = Vec::new();
        cache.check_expiry(later, |id, _entry| retransmitted_again.push(id));
        assert!(retransmitted_again.is_empty());
    }

    #[test]
    fn incoming_cache_filters_duplicate_ids() {
        let mut cache = IncomingCache::new(Duration::from_secs(30));
        let now = Instant::now();

        assert!(cache.insert(7, now));
        assert!(!cache.insert(7, now));

        cache.remove(7);
        assert!(cache.insert(7, now));
    }

    #[test]
    fn clear_drops_all_entries() {
        let mut out = OutgoingCache::new(Duration::from_secs(30));
        let now = Instant::now();
        out.insert(
            1,
            OutgoingEntry::Publish {
                topic: "t".into(),
                payload: vec![],
                qos: 1,
            },
            now,
        );
        out.clear();
        assert!(out.is_empty());

        let mut inc = IncomingCache::new(Duration::from_secs(30));
        inc.insert(1, now);
        inc.clear();
        assert!(!inc.contains(1));
    }
}
