// Copyright 2026 the vakt authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-IP rate limiting: sliding window plus token-bucket burst.
//!
//! A request is denied when either the window is full or the bucket is
//! empty. `check` never consumes capacity; callers invoke `record` only
//! after an allow decision, so denied requests are free.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Outcome of a rate check.
#[derive(Debug, PartialEq, Eq)]
pub enum RateDecision {
    /// Within limits.
    Allow,
    /// Over a limit.
    Deny {
        /// Seconds until a retry can succeed.
        retry_after: u64,
        /// Configured requests per window.
        limit: u32,
        /// Remaining window capacity (0 on denial).
        remaining: u32,
    },
}

#[derive(Debug)]
struct ClientWindow {
    hits: VecDeque<Instant>,
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Sliding window + burst bucket per client IP, with periodic GC.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clients: Mutex<HashMap<IpAddr, ClientWindow>>,
}

impl RateLimiter {
    /// Creates a limiter with no tracked clients.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_seconds)
    }

    /// Tokens regained per second; the bucket refills at the sustained
    /// window rate and caps at `burst_size`.
    fn refill_rate(&self) -> f64 {
        self.config.requests_per_window as f64 / self.config.window_seconds.max(1) as f64
    }

    /// Evaluates `ip` against both limits without consuming capacity.
    pub fn check(&self, ip: IpAddr) -> RateDecision {
        let now = Instant::now();
        let window = self.window();
        let limit = self.config.requests_per_window;

        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        let entry = clients.entry(ip).or_insert_with(|| ClientWindow {
            hits: VecDeque::new(),
            tokens: self.config.burst_size as f64,
            last_refill: now,
            last_seen: now,
        });

        entry.last_seen = now;
        while entry
            .hits
            .front()
            .is_some_and(|t| now.duration_since(*t) > window)
        {
            entry.hits.pop_front();
        }

        if self.config.burst_size > 0 {
            let elapsed = now.duration_since(entry.last_refill).as_secs_f64();
            entry.tokens = (entry.tokens + elapsed * self.refill_rate())
                .min(self.config.burst_size as f64);
            entry.last_refill = now;
        }

        if entry.hits.len() >= limit as usize {
            let oldest = *entry.hits.front().unwrap_or(&now);
            let retry = window
                .checked_sub(now.duration_since(oldest))
                .unwrap_or_default();
            return RateDecision::Deny {
                retry_after: retry.as_secs().max(1),
                limit,
                remaining: 0,
            };
        }

        if self.config.burst_size > 0 && entry.tokens < 1.0 {
            let missing = 1.0 - entry.tokens;
            let retry = (missing / self.refill_rate()).ceil() as u64;
            return RateDecision::Deny {
                retry_after: retry.max(1),
                limit,
                remaining: 0,
            };
        }

        RateDecision::Allow
    }

    /// Consumes one unit of capacity for `ip`. Call only after an allow.
    pub fn record(&self, ip: IpAddr) {
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = clients.get_mut(&ip) {
            entry.hits.push_back(now);
            if self.config.burst_size > 0 {
                entry.tokens = (entry.tokens - 1.0).max(0.0);
            }
        }
    }

    /// Evicts clients idle beyond twice the window.
    pub fn gc(&self) {
        let cutoff = self.window() * 2;
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        clients.retain(|_, entry| now.duration_since(entry.last_seen) <= cutoff);
    }

    /// Number of tracked client entries (observability and tests).
    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod test {
    use super::{RateDecision, RateLimiter};
    use crate::config::RateLimitConfig;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn limiter(requests: u32, window: u64, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            requests_per_window: requests,
            window_seconds: window,
            burst_size: burst,
        })
    }

    #[test]
    fn window_denies_after_capacity_with_metadata() {
        let rl = limiter(2, 60, 0);
        let client = ip("203.0.113.9");

        for _ in 0..2 {
            assert_eq!(RateDecision::Allow, rl.check(client));
            rl.record(client);
        }

        match rl.check(client) {
            RateDecision::Deny {
                retry_after,
                limit,
                remaining,
            } => {
                assert!(retry_after >= 1);
                assert_eq!(2, limit);
                assert_eq!(0, remaining);
            }
            RateDecision::Allow => panic!("third request must be denied"),
        }
    }

    #[test]
    fn burst_bucket_denies_rapid_fire_before_window_fills() {
        // window allows 100, bucket only 3 at a burst
        let rl = limiter(100, 60, 3);
        let client = ip("203.0.113.10");

        for _ in 0..3 {
            assert_eq!(RateDecision::Allow, rl.check(client));
            rl.record(client);
        }
        assert!(matches!(rl.check(client), RateDecision::Deny { .. }));
    }

    #[test]
    fn denials_do_not_consume_capacity() {
        let rl = limiter(1, 60, 0);
        let client = ip("203.0.113.11");

        assert_eq!(RateDecision::Allow, rl.check(client));
        rl.record(client);
        // repeated denied checks leave the single recorded hit in place
        for _ in 0..5 {
            assert!(matches!(rl.check(client), RateDecision::Deny { .. }));
        }
    }

    #[test]
    fn clients_are_independent() {
        let rl = limiter(1, 60, 0);
        let a = ip("203.0.113.1");
        let b = ip("203.0.113.2");

        assert_eq!(RateDecision::Allow, rl.check(a));
        rl.record(a);
        assert!(matches!(rl.check(a), RateDecision::Deny { .. }));
        assert_eq!(RateDecision::Allow, rl.check(b));
    }

    #[test]
    fn gc_keeps_recent_clients() {
        let rl = limiter(5, 60, 0);
        let client = ip("203.0.113.3");
        rl.check(client);
        rl.record(client);
        rl.gc();
        assert_eq!(1, rl.tracked_clients());
    }
}
