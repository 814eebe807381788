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

//! The gate pipeline: IP filter → rate limiter → authenticator.
//!
//! Runs in the reactor before a request is dispatched. Order matters: the
//! cheapest rejection wins, and `record` on the rate limiter only happens
//! after an allow decision so denials do not consume capacity.

use std::net::IpAddr;

use crate::config::Config;
use crate::error::GatewayError;
use crate::parser::request::Request;
use crate::parser::HttpMethod;

pub mod auth;
pub mod ip;
pub mod rate;

use auth::{Authenticator, Claims};
use ip::{IpDecision, IpFilter};
use rate::{RateDecision, RateLimiter};

/// Paths that bypass every gate (liveness, the playground, panel login,
/// CORS preflight).
pub fn is_exempt(method: HttpMethod, path: &str) -> bool {
    if method == HttpMethod::Options {
        return true;
    }
    match (method, path) {
        (HttpMethod::Get, "/health")
        | (HttpMethod::Get, "/")
        | (HttpMethod::Get, "/logo.svg")
        | (HttpMethod::Get, "/api/schema")
        | (HttpMethod::Post, "/auth") => true,
        _ => false,
    }
}

/// Evidence that a request cleared the pipeline.
#[derive(Debug, Default)]
pub struct GatePass {
    /// JWT claims, in jwt mode. Token mode and exempt paths carry none.
    pub claims: Option<Claims>,
}

/// The assembled pipeline.
#[derive(Debug)]
pub struct GatePipeline {
    ip: IpFilter,
    rate: Option<RateLimiter>,
    auth: Authenticator,
}

impl GatePipeline {
    /// Builds the pipeline from configuration. Fails when the JWT public
    /// key cannot be loaded.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            ip: IpFilter::from_config(&config.ip_whitelist),
            rate: config
                .rate_limit
                .enabled
                .then(|| RateLimiter::new(config.rate_limit.clone())),
            auth: Authenticator::from_config(config)?,
        })
    }

    /// Applies all three gates to a parsed request.
    pub fn check(
        &self,
        client_ip: IpAddr,
        request: &Request,
    ) -> Result<GatePass, GatewayError> {
        if is_exempt(request.method, &request.path) {
            return Ok(GatePass::default());
        }

        match self.ip.check(client_ip) {
            IpDecision::Allowed => {}
            IpDecision::Denied | IpDecision::Invalid => {
                return Err(GatewayError::Forbidden(format!(
                    "IP {client_ip} is not allowed"
                )));
            }
        }

        if let Some(rate) = &self.rate {
            match rate.check(client_ip) {
                RateDecision::Allow => rate.record(client_ip),
                RateDecision::Deny {
                    retry_after,
                    limit,
                    remaining,
                } => {
                    return Err(GatewayError::RateLimited {
                        retry_after,
                        limit,
                        remaining,
                    })
                }
            }
        }

        let claims = self.auth.authenticate(request.bearer_token())?;
        if let Some(c) = &claims {
            tracing::debug!(sub = ?c.sub, scope = ?c.scope, client_id = ?c.client_id, "jwt verified");
        }
        Ok(GatePass { claims })
    }

    /// Periodic maintenance, invoked from the reactor's housekeeping pass.
    pub fn housekeeping(&self) {
        if let Some(rate) = &self.rate {
            rate.gc();
        }
    }

    /// Authenticator access for endpoints that verify tokens directly.
    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }
}

#[cfg(test)]
mod test {
    use super::is_exempt;
    use crate::parser::HttpMethod;

    #[test]
    fn exempt_set_is_exact() {
        assert!(is_exempt(HttpMethod::Get, "/health"));
        assert!(is_exempt(HttpMethod::Get, "/"));
        assert!(is_exempt(HttpMethod::Get, "/logo.svg"));
        assert!(is_exempt(HttpMethod::Get, "/api/schema"));
        assert!(is_exempt(HttpMethod::Post, "/auth"));
        assert!(is_exempt(HttpMethod::Options, "/anything"));

        assert!(!is_exempt(HttpMethod::Get, "/tools"));
        assert!(!is_exempt(HttpMethod::Post, "/execute/browser_navigate"));
        assert!(!is_exempt(HttpMethod::Get, "/auth/verify"));
    }
}
