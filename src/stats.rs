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

//! Process-wide counters.
//!
//! All hot-path counters are relaxed atomics; a snapshot is therefore only
//! approximately consistent across counters, which the surface tolerates.
//! Per-second rates live under a separate mutex and are recomputed on read
//! at most once per second.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Mutex;
use std::time::Instant;

use serde_json::json;

/// Atomic counter block plus 1 Hz rate tracking.
#[derive(Debug)]
pub struct StatsCore {
    started: Instant,

    requests_total: AtomicU64,
    requests_success: AtomicU64,
    requests_error: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    active_connections: AtomicU64,
    busy_workers: AtomicU64,
    peak_workers: AtomicU64,

    latency_sum_us: AtomicU64,
    latency_count: AtomicU64,
    latency_min_us: AtomicU64,
    latency_max_us: AtomicU64,

    rates: Mutex<RateSample>,
}

#[derive(Debug)]
struct RateSample {
    sampled_at: Instant,
    requests_at_sample: u64,
    bytes_in_at_sample: u64,
    bytes_out_at_sample: u64,
    requests_per_sec: f64,
    bytes_in_per_sec: f64,
    bytes_out_per_sec: f64,
}

impl Default for StatsCore {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCore {
    /// Creates a zeroed counter block.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            requests_total: AtomicU64::new(0),
            requests_success: AtomicU64::new(0),
            requests_error: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            busy_workers: AtomicU64::new(0),
            peak_workers: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            latency_min_us: AtomicU64::new(u64::MAX),
            latency_max_us: AtomicU64::new(0),
            rates: Mutex::new(RateSample {
                sampled_at: now,
                requests_at_sample: 0,
                bytes_in_at_sample: 0,
                bytes_out_at_sample: 0,
                requests_per_sec: 0.0,
                bytes_in_per_sec: 0.0,
                bytes_out_per_sec: 0.0,
            }),
        }
    }

    /// Records one completed request and its latency.
    pub fn record_request(&self, success: bool, latency_us: u64) {
        self.requests_total.fetch_add(1, Relaxed);
        if success {
            self.requests_success.fetch_add(1, Relaxed);
        } else {
            self.requests_error.fetch_add(1, Relaxed);
        }
        self.latency_sum_us.fetch_add(latency_us, Relaxed);
        self.latency_count.fetch_add(1, Relaxed);
        self.latency_min_us.fetch_min(latency_us, Relaxed);
        self.latency_max_us.fetch_max(latency_us, Relaxed);
    }

    /// Adds received bytes.
    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Relaxed);
    }

    /// Adds sent bytes.
    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Relaxed);
    }

    /// A connection was accepted.
    pub fn conn_opened(&self) {
        self.active_connections.fetch_add(1, Relaxed);
    }

    /// A connection closed (any path).
    pub fn conn_closed(&self) {
        // saturating: close paths can race accept accounting during shutdown
        let _ = self
            .active_connections
            .fetch_update(Relaxed, Relaxed, |v| v.checked_sub(1));
    }

    /// A worker started executing a task.
    pub fn worker_busy(&self) {
        let now = self.busy_workers.fetch_add(1, Relaxed) + 1;
        self.peak_workers.fetch_max(now, Relaxed);
    }

    /// A worker finished its task.
    pub fn worker_idle(&self) {
        let _ = self
            .busy_workers
            .fetch_update(Relaxed, Relaxed, |v| v.checked_sub(1));
    }

    /// Active connection count, for slot accounting.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Relaxed)
    }

    /// Produces the `/stats` JSON document, refreshing rates when at least
    /// one second has passed since the previous refresh.
    pub fn snapshot(&self) -> serde_json::Value {
        let total = self.requests_total.load(Relaxed);
        let bytes_in = self.bytes_in.load(Relaxed);
        let bytes_out = self.bytes_out.load(Relaxed);

        let (rps, bips, bops) = {
            let mut rates = self.rates.lock().unwrap_or_else(|p| p.into_inner());
            let elapsed = rates.sampled_at.elapsed().as_secs_f64();
            if elapsed >= 1.0 {
                rates.requests_per_sec =
                    (total - rates.requests_at_sample) as f64 / elapsed;
                rates.bytes_in_per_sec =
                    (bytes_in - rates.bytes_in_at_sample) as f64 / elapsed;
                rates.bytes_out_per_sec =
                    (bytes_out - rates.bytes_out_at_sample) as f64 / elapsed;
                rates.sampled_at = Instant::now();
                rates.requests_at_sample = total;
                rates.bytes_in_at_sample = bytes_in;
                rates.bytes_out_at_sample = bytes_out;
            }
            (
                rates.requests_per_sec,
                rates.bytes_in_per_sec,
                rates.bytes_out_per_sec,
            )
        };

        let count = self.latency_count.load(Relaxed);
        let min = self.latency_min_us.load(Relaxed);
        json!({
            "uptime_seconds": self.started.elapsed().as_secs(),
            "requests": {
                "total": total,
                "success": self.requests_success.load(Relaxed),
                "error": self.requests_error.load(Relaxed),
                "per_second": rps,
            },
            "bytes": {
                "in": bytes_in,
                "out": bytes_out,
                "in_per_second": bips,
                "out_per_second": bops,
            },
            "connections": {
                "active": self.active_connections.load(Relaxed),
            },
            "workers": {
                "busy": self.busy_workers.load(Relaxed),
                "peak": self.peak_workers.load(Relaxed),
            },
            "latency_us": {
                "count": count,
                "sum": self.latency_sum_us.load(Relaxed),
                "min": if count == 0 { 0 } else { min },
                "max": self.latency_max_us.load(Relaxed),
            },
        })
    }
}
