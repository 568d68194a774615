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

//! Exponential backoff with optional full jitter, used independently for MQTT reconnection and
//! for Astarte handshake retries.

use std::time::{Duration, Instant};

use rand::Rng;

/// Backoff parameters: `delay = min(initial * 2^attempt, max)`, optionally replaced with a
/// uniform sample in `[0, delay]` when `jitter` is enabled.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: true,
        }
    }
}

/// Tracks the current attempt count and the deadline by which the next attempt may start.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    next_attempt_at: Option<Instant>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            next_attempt_at: None,
        }
    }

    /// Resets the attempt counter to 0 (called on a successful connect/handshake).
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_attempt_at = None;
    }

    /// Computes the next delay, advances the attempt counter, and arms the deadline at
    /// `now + delay`.
    pub fn next_delay(&mut self, now: Instant) -> Duration {
        let exp = self.attempt.min(32);
        let scaled = self
            .config
            .initial
            .checked_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
            .unwrap_or(self.config.max);
        let delay = scaled.min(self.config.max);

        let delay = if self.config.jitter {
            let millis = delay.as_millis().min(u128::from(u64::MAX)) as u64;
            if millis == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
            }
        } else {
            delay
        };

        self.attempt = self.attempt.saturating_add(1);
        self.next_attempt_at = Some(now + delay);
        delay
    }

    /// Whether the armed deadline (if any) has elapsed.
    pub fn is_elapsed(&self, now: Instant) -> bool {
        match self.next_attempt_at {
            Some(deadline) => now >= deadline,
            None => true,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_up_to_the_cap() {
        let config = BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: false,
        };
        let mut backoff = Backoff::new(config);
        let now = Instant::now();

        assert_eq!(backoff.next_delay(now), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(now), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(now), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(now), Duration::from_millis(800));
        // capped
        assert_eq!(backoff.next_delay(now), Duration::from_secs(1));
    }

    #[test]
    fn reset_returns_to_the_initial_delay() {
        let config = BackoffConfig {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(10),
            jitter: false,
        };
        let mut backoff = Backoff::new(config);
        let now = Instant::now();

        backoff.next_delay(now);
        backoff.next_delay(now);
        backoff.reset();

        assert_eq!(backoff.next_delay(now), Duration::from_millis(50));
    }

    #[test]
    fn jittered_delay_never_exceeds_the_unjittered_bound() {
        let config = BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            jitter: true,
        };
        let mut backoff = Backoff::new(config);
        let now = Instant::now();

        for _ in 0..10 {
            let delay = backoff.next_delay(now);
            assert!(delay <= config.max);
        }
    }

    #[test]
    fn not_elapsed_until_deadline_reached() {
        let config = BackoffConfig {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(10),
            jitter: false,
        };
        let mut backoff = Backoff::new(config);
        let now = Instant::now();

        backoff.next_delay(now);
        assert!(!backoff.is_elapsed(now));
        assert!(backoff.is_elapsed(now + Duration::from_secs(11)));
    }
}
