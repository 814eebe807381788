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

//! Gateway binary: configuration, logging, signals, and the run loop.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vakt::config::Config;
use vakt::engine::{EngineState, STARTUP_WINDOW};
use vakt::reactor::Reactor;
use vakt::services::{request_shutdown, Services};

#[derive(Debug, Parser)]
#[command(name = "vakt", about = "HTTP/1.1 + WebSocket gateway for a browser-automation engine")]
struct Cli {
    /// Path to a JSON or YAML config file.
    #[arg(long, env = "VAKT_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address override.
    #[arg(long)]
    host: Option<String>,

    /// Listen port override.
    #[arg(long)]
    port: Option<u16>,

    /// Log filter override (e.g. "debug", "info,vakt=trace").
    #[arg(long)]
    log: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(log) = cli.log {
        config.log = log;
    }
    config.validate()?;

    init_logging(&config.log);
    install_signal_handlers();

    let services = Services::build(config)?;

    services.engine.start()?;
    match services.engine.wait_ready(STARTUP_WINDOW) {
        EngineState::Ready => info!("engine ready; full surface available"),
        EngineState::LicenseError => {
            warn!("engine in license-error state; serving license subsurface only")
        }
        state => warn!(state = state.as_str(), "engine did not become ready"),
    }

    let mut reactor = Reactor::new(services.clone())?;
    reactor.run();

    services.engine.shutdown();
    info!("gateway stopped");
    Ok(())
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_from_env("VAKT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(filter.to_owned()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(unix)]
fn install_signal_handlers() {
    extern "C" fn on_shutdown_signal(_sig: libc::c_int) {
        request_shutdown();
    }

    // SIGPIPE would otherwise kill the process on a peer hangup mid-write
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGINT, on_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_shutdown_signal as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}
