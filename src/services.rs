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

//! The process-wide service bundle.
//!
//! Constructed once at startup and passed explicitly; nothing in the
//! gateway reaches for global singletons.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::engine::license::LicenseManager;
use crate::engine::EngineChannel;
use crate::gate::GatePipeline;
use crate::ipc_test::IpcTestManager;
use crate::stats::StatsCore;
use crate::video::StreamRegistry;

/// Everything request handling needs, bundled once.
#[derive(Debug)]
pub struct Services {
    /// Immutable configuration.
    pub config: Config,
    /// Counters.
    pub stats: StatsCore,
    /// The engine subprocess channel.
    pub engine: Arc<EngineChannel>,
    /// One-shot license operations.
    pub license: LicenseManager,
    /// IP / rate / auth gates.
    pub gates: GatePipeline,
    /// MJPEG stream registry.
    pub video: StreamRegistry,
    /// Auxiliary IPC test-client lifecycle.
    pub ipc_tests: IpcTestManager,
    /// Monotonic epoch for connection-activity accounting.
    pub epoch: Instant,
    /// Per-instance shutdown request (used by tests and embedding).
    shutdown: AtomicBool,
}

/// Process-wide shutdown flag. A static so the signal handler can set it
/// with nothing but an atomic store.
static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

/// Requests shutdown; safe to call from a signal handler.
pub fn request_shutdown() {
    SHUTDOWN_FLAG.store(true, Ordering::Release);
}

impl Services {
    /// Wires the bundle from a validated configuration. Does not spawn the
    /// engine; the caller starts it once signal handling is in place.
    pub fn build(config: Config) -> Result<Arc<Self>> {
        let browser = PathBuf::from(
            config
                .browser_path
                .as_deref()
                .context("browser_path missing after validation")?,
        );

        let gates = GatePipeline::from_config(&config)?;
        let engine = EngineChannel::new(browser.clone(), config.browser_timeout());
        let license = LicenseManager::new(browser);
        let ipc_tests = IpcTestManager::new(config.ipc_tests.clone());

        Ok(Arc::new(Self {
            config,
            stats: StatsCore::new(),
            engine,
            license,
            gates,
            video: StreamRegistry::new(),
            ipc_tests,
            epoch: Instant::now(),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Requests shutdown of this gateway instance only.
    pub fn trigger_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// True once a shutdown signal (process-wide or instance-local) has
    /// been observed.
    pub fn is_shutting_down(&self) -> bool {
        SHUTDOWN_FLAG.load(Ordering::Acquire) || self.shutdown.load(Ordering::Acquire)
    }
}
