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

//! Gateway configuration.
//!
//! Priority (highest to lowest): CLI flags > `VAKT_*` environment
//! variables > JSON/YAML config file > built-in defaults. The file format
//! is chosen by extension (`.yaml`/`.yml` parse as YAML, everything else
//! as JSON) and the file is capped at 1 MiB before parsing.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Hard ceiling on request bodies, independent of configuration.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Hard ceiling on the configuration file itself.
pub const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Authentication mode; exactly one per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Shared bearer token, constant-time compare.
    Token,
    /// RS256/RS384/RS512 JWTs against a configured public key.
    Jwt,
}

/// JWT verification options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// Path to the RSA public key in PEM form.
    pub public_key_path: Option<String>,
    /// Expected `alg`; RS384/RS512 are also accepted when listed here.
    pub algorithm: String,
    /// Expected `iss` claim, when set.
    pub expected_issuer: Option<String>,
    /// Expected `aud` claim, when set.
    pub expected_audience: Option<String>,
    /// Tolerated clock skew for `exp`/`nbf`, in seconds.
    pub clock_skew_seconds: u64,
    /// Whether a missing/expired `exp` fails verification.
    pub require_exp: bool,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            public_key_path: None,
            algorithm: "RS256".to_owned(),
            expected_issuer: None,
            expected_audience: None,
            clock_skew_seconds: 60,
            require_exp: true,
        }
    }
}

/// Rate limiter options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Gate enabled at all.
    pub enabled: bool,
    /// Sliding-window capacity per IP.
    pub requests_per_window: u32,
    /// Window length in seconds.
    pub window_seconds: u64,
    /// Token-bucket burst capacity on top of the window.
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_window: 100,
            window_seconds: 60,
            burst_size: 20,
        }
    }
}

/// IP allowlist options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IpWhitelistConfig {
    /// Gate enabled at all. Enabled with an empty list denies everything.
    pub enabled: bool,
    /// Literal addresses and CIDR blocks, v4 or v6.
    pub entries: Vec<String>,
}

/// TLS termination options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    /// Terminate TLS on the listening socket.
    pub enabled: bool,
    /// Server certificate chain (PEM).
    pub cert_path: Option<String>,
    /// Server private key (PEM).
    pub key_path: Option<String>,
    /// Trust anchors for client verification (PEM).
    pub ca_path: Option<String>,
    /// Require a client certificate.
    pub verify_client: bool,
}

/// CORS response-header options, applied uniformly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Emit CORS headers at all.
    pub enabled: bool,
    /// `Access-Control-Allow-Origin` value.
    pub allowed_origins: String,
    /// `Access-Control-Allow-Methods` value.
    pub allowed_methods: String,
    /// `Access-Control-Allow-Headers` value.
    pub allowed_headers: String,
    /// `Access-Control-Max-Age` for preflight responses.
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: "*".to_owned(),
            allowed_methods: "GET, POST, OPTIONS".to_owned(),
            allowed_headers: "Content-Type, Authorization".to_owned(),
            max_age_seconds: 86400,
        }
    }
}

/// WebSocket endpoint options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Serve `/ws` at all.
    pub enabled: bool,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Maximum reassembled message size in bytes.
    pub message_max_size: usize,
    /// Ping cadence.
    pub ping_interval_sec: u64,
    /// Disconnect when no pong arrives within this window after a ping.
    pub pong_timeout_sec: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections: 50,
            message_max_size: 16 * 1024 * 1024,
            ping_interval_sec: 30,
            pong_timeout_sec: 10,
        }
    }
}

/// Auxiliary IPC test-client options; the whole surface is off by default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IpcTestConfig {
    /// Expose the `/ipc-tests/*` management surface.
    pub enabled: bool,
    /// Binary to spawn as the test client.
    pub test_client_path: Option<String>,
    /// Directory the client writes reports into.
    pub reports_dir: Option<String>,
}

/// Full gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Authentication mode.
    pub auth_mode: AuthMode,
    /// Shared secret for token mode (and the panel login).
    pub auth_token: Option<String>,
    /// JWT options for jwt mode.
    pub jwt: JwtConfig,
    /// Path to the browser-automation engine binary. Required.
    pub browser_path: Option<String>,
    /// Connection-slot capacity.
    pub max_connections: usize,
    /// Worker threads; 0 means one per core.
    pub worker_threads: usize,
    /// Idle/incomplete-request timeout.
    pub request_timeout_ms: u64,
    /// Default deadline for engine calls.
    pub browser_timeout_ms: u64,
    /// Rate limiter.
    pub rate_limit: RateLimitConfig,
    /// IP allowlist.
    pub ip_whitelist: IpWhitelistConfig,
    /// TLS termination.
    pub ssl: SslConfig,
    /// CORS headers.
    pub cors: CorsConfig,
    /// WebSocket endpoint.
    pub websocket: WebSocketConfig,
    /// Drain connections on shutdown instead of dropping them.
    pub graceful_shutdown: bool,
    /// Drain deadline.
    pub shutdown_timeout_sec: u64,
    /// Keep-alive idle limit.
    pub keep_alive_timeout_sec: u64,
    /// Emit one log line per completed request.
    pub log_requests: bool,
    /// Log filter string (overridden by `VAKT_LOG`).
    pub log: String,
    /// IPC test-client surface.
    pub ipc_tests: IpcTestConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8080,
            auth_mode: AuthMode::Token,
            auth_token: None,
            jwt: JwtConfig::default(),
            browser_path: None,
            max_connections: 100,
            worker_threads: 0,
            request_timeout_ms: 30_000,
            browser_timeout_ms: 60_000,
            rate_limit: RateLimitConfig::default(),
            ip_whitelist: IpWhitelistConfig::default(),
            ssl: SslConfig::default(),
            cors: CorsConfig::default(),
            websocket: WebSocketConfig::default(),
            graceful_shutdown: true,
            shutdown_timeout_sec: 30,
            keep_alive_timeout_sec: 60,
            log_requests: false,
            log: "info".to_owned(),
            ipc_tests: IpcTestConfig::default(),
        }
    }
}

impl Config {
    /// Loads the file at `path` (if any), then layers environment
    /// variables on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_from(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Parses a JSON or YAML config file, enforcing the size cap first.
    pub fn from_file(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("config file {} not readable", path.display()))?;
        if meta.len() > MAX_CONFIG_FILE_SIZE {
            bail!(
                "config file {} exceeds {} bytes",
                path.display(),
                MAX_CONFIG_FILE_SIZE
            );
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let config = if is_yaml {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("parsing {} as YAML", path.display()))?
        } else {
            serde_json::from_str(&contents)
                .with_context(|| format!("parsing {} as JSON", path.display()))?
        };
        Ok(config)
    }

    /// Applies `VAKT_*` overrides via the supplied lookup, so tests can
    /// substitute a map for the process environment.
    pub fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        fn set<T: std::str::FromStr>(slot: &mut T, value: Option<String>) {
            if let Some(v) = value.and_then(|v| v.parse().ok()) {
                *slot = v;
            }
        }
        fn set_opt(slot: &mut Option<String>, value: Option<String>) {
            if value.is_some() {
                *slot = value;
            }
        }

        set(&mut self.host, get("VAKT_HOST"));
        set(&mut self.port, get("VAKT_PORT"));
        if let Some(mode) = get("VAKT_AUTH_MODE") {
            match mode.as_str() {
                "token" => self.auth_mode = AuthMode::Token,
                "jwt" => self.auth_mode = AuthMode::Jwt,
                _ => {}
            }
        }
        set_opt(&mut self.auth_token, get("VAKT_AUTH_TOKEN"));
        set_opt(&mut self.browser_path, get("VAKT_BROWSER_PATH"));
        set_opt(&mut self.jwt.public_key_path, get("VAKT_JWT_PUBLIC_KEY_PATH"));
        set(&mut self.max_connections, get("VAKT_MAX_CONNECTIONS"));
        set(&mut self.worker_threads, get("VAKT_WORKER_THREADS"));
        set(&mut self.request_timeout_ms, get("VAKT_REQUEST_TIMEOUT_MS"));
        set(&mut self.browser_timeout_ms, get("VAKT_BROWSER_TIMEOUT_MS"));
        set(&mut self.rate_limit.enabled, get("VAKT_RATE_LIMIT_ENABLED"));
        set(
            &mut self.rate_limit.requests_per_window,
            get("VAKT_RATE_LIMIT_REQUESTS"),
        );
        set(
            &mut self.rate_limit.window_seconds,
            get("VAKT_RATE_LIMIT_WINDOW_SECONDS"),
        );
        set(&mut self.rate_limit.burst_size, get("VAKT_RATE_LIMIT_BURST"));
        set(&mut self.ip_whitelist.enabled, get("VAKT_IP_WHITELIST_ENABLED"));
        if let Some(entries) = get("VAKT_IP_WHITELIST_ENTRIES") {
            self.ip_whitelist.entries = entries
                .split(',')
                .map(|e| e.trim().to_owned())
                .filter(|e| !e.is_empty())
                .collect();
        }
        set(&mut self.websocket.enabled, get("VAKT_WEBSOCKET_ENABLED"));
        set(&mut self.graceful_shutdown, get("VAKT_GRACEFUL_SHUTDOWN"));
        set(&mut self.shutdown_timeout_sec, get("VAKT_SHUTDOWN_TIMEOUT_SEC"));
        set(
            &mut self.keep_alive_timeout_sec,
            get("VAKT_KEEP_ALIVE_TIMEOUT_SEC"),
        );
        set(&mut self.log_requests, get("VAKT_LOG_REQUESTS"));
        set(&mut self.log, get("VAKT_LOG"));
    }

    /// Rejects configurations that cannot possibly serve.
    pub fn validate(&self) -> Result<()> {
        if self.browser_path.as_deref().unwrap_or("").is_empty() {
            bail!("browser_path is required (VAKT_BROWSER_PATH or config file)");
        }
        match self.auth_mode {
            AuthMode::Token => {
                if self.auth_token.as_deref().unwrap_or("").is_empty() {
                    bail!("auth_mode=token requires auth_token");
                }
            }
            AuthMode::Jwt => {
                if self.jwt.public_key_path.as_deref().unwrap_or("").is_empty() {
                    bail!("auth_mode=jwt requires jwt.public_key_path");
                }
            }
        }
        if self.ssl.enabled
            && (self.ssl.cert_path.is_none() || self.ssl.key_path.is_none())
        {
            bail!("ssl.enabled requires ssl.cert_path and ssl.key_path");
        }
        Ok(())
    }

    /// Idle/incomplete-request timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Default engine-call deadline as a duration.
    pub fn browser_timeout(&self) -> Duration {
        Duration::from_millis(self.browser_timeout_ms)
    }

    /// Keep-alive idle limit as a duration.
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_sec)
    }
}

#[cfg(test)]
mod test {
    use super::{AuthMode, Config};
    use std::collections::HashMap;

    #[test]
    fn defaults_match_the_surface_contract() {
        let c = Config::default();
        assert_eq!("127.0.0.1", c.host);
        assert_eq!(8080, c.port);
        assert_eq!(AuthMode::Token, c.auth_mode);
        assert_eq!(100, c.max_connections);
        assert_eq!(30_000, c.request_timeout_ms);
        assert_eq!(60_000, c.browser_timeout_ms);
        assert_eq!(100, c.rate_limit.requests_per_window);
        assert_eq!(20, c.rate_limit.burst_size);
        assert_eq!(50, c.websocket.max_connections);
        assert_eq!(16 * 1024 * 1024, c.websocket.message_max_size);
        assert_eq!(30, c.websocket.ping_interval_sec);
        assert_eq!(60, c.jwt.clock_skew_seconds);
        assert!(c.jwt.require_exp);
        assert!(c.graceful_shutdown);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut env = HashMap::new();
        env.insert("VAKT_PORT", "9999");
        env.insert("VAKT_AUTH_MODE", "jwt");
        env.insert("VAKT_IP_WHITELIST_ENTRIES", "10.0.0.0/8, 192.168.1.5");
        env.insert("VAKT_RATE_LIMIT_ENABLED", "true");

        let mut c = Config::default();
        c.apply_env_from(|name| env.get(name).map(|v| (*v).to_owned()));

        assert_eq!(9999, c.port);
        assert_eq!(AuthMode::Jwt, c.auth_mode);
        assert_eq!(vec!["10.0.0.0/8", "192.168.1.5"], c.ip_whitelist.entries);
        assert!(c.rate_limit.enabled);
    }

    #[test]
    fn json_round_trips_nested_sections() {
        let raw = r#"{
            "port": 8181,
            "auth_token": "s3cret",
            "browser_path": "/usr/bin/engine",
            "rate_limit": {"enabled": true, "requests_per_window": 5},
            "websocket": {"ping_interval_sec": 5}
        }"#;
        let c: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(8181, c.port);
        assert!(c.rate_limit.enabled);
        assert_eq!(5, c.rate_limit.requests_per_window);
        // unset nested fields keep their defaults
        assert_eq!(20, c.rate_limit.burst_size);
        assert_eq!(5, c.websocket.ping_interval_sec);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_requires_engine_and_credentials() {
        let c = Config::default();
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.browser_path = Some("/usr/bin/engine".into());
        assert!(c.validate().is_err(), "token mode without token");

        c.auth_token = Some("t".into());
        assert!(c.validate().is_ok());
    }
}
