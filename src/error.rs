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

//! Gateway error taxonomy and its mapping onto the HTTP surface.
//!
//! Transport- and gateway-level failures surface as non-200 responses with
//! a uniform `{"success":false,"error":…}` body. Engine-reported failures
//! are *not* errors at this level: they travel back as HTTP 200 with the
//! outer `success` flag false, so clients can tell "the engine rejected the
//! call" from "the call never reached the engine".

use serde_json::json;
use thiserror::Error;

use crate::engine::{EngineError, LicenseRecord};
use crate::parser::response::Response;
use crate::tools::ValidationFailure;

/// Everything the gateway itself can answer with.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Unparseable or semantically invalid request.
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Missing or unverifiable credentials.
    #[error("Invalid or missing authorization token")]
    AuthRequired,

    /// The IP filter (or another policy) rejected the client.
    #[error("Access denied: {0}")]
    Forbidden(String),

    /// Unknown route or resource.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Known route, wrong method.
    #[error("Method not allowed")]
    MethodNotAllowed,

    /// Tool parameter validation failed.
    #[error("Parameter validation failed")]
    Validation(ValidationFailure),

    /// The rate limiter rejected the client.
    #[error("Rate limit exceeded")]
    RateLimited {
        /// Seconds until the window has capacity again.
        retry_after: u64,
        /// Configured requests per window.
        limit: u32,
        /// Remaining capacity (always 0 on denial).
        remaining: u32,
    },

    /// Engine not in the Ready state.
    #[error("Engine not ready")]
    NotReady,

    /// The engine closed its side of the IPC channel.
    #[error("Engine disconnected")]
    EngineDisconnected,

    /// The engine answered `success:false`; carried verbatim in a 200 body.
    #[error("{0}")]
    EngineReported(String),

    /// The engine failed license validation; part of the surface stays up.
    #[error("Engine license error")]
    License(LicenseRecord),

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The per-call deadline elapsed before the engine replied.
    #[error("Engine call timed out")]
    Timeout,
}

impl GatewayError {
    /// HTTP status this error surfaces as.
    pub fn status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::AuthRequired => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::MethodNotAllowed => 405,
            Self::Validation(_) => 422,
            Self::RateLimited { .. } => 429,
            Self::NotReady | Self::License(_) => 503,
            Self::EngineDisconnected | Self::Timeout => 502,
            Self::EngineReported(_) => 200,
            Self::Internal(_) => 500,
        }
    }

    /// Builds the JSON error response, including the per-variant metadata
    /// the surface contract promises (retry-after, validation field lists,
    /// license details).
    pub fn to_response(&self) -> Response {
        let mut body = json!({
            "success": false,
            "error": self.to_string(),
        });

        match self {
            Self::RateLimited {
                retry_after,
                limit,
                remaining,
            } => {
                body["retry_after"] = json!(retry_after);
                body["limit"] = json!(limit);
                body["remaining"] = json!(remaining);
            }
            Self::Validation(failure) => {
                body["error"] = json!(failure.summary());
                body["missing_fields"] = json!(failure.missing_fields);
                body["unknown_fields"] = json!(failure.unknown_fields);
                body["supported_fields"] = json!(failure.supported_fields);
                body["errors"] = serde_json::to_value(&failure.errors)
                    .unwrap_or_else(|_| json!([]));
            }
            Self::License(record) => {
                body["license_status"] = json!(record.status);
                body["error"] = json!(record.message);
                body["hardware_fingerprint"] = json!(record.hardware_fingerprint);
            }
            _ => {}
        }

        let mut resp = Response::json(self.status(), &body);
        if let Self::RateLimited { retry_after, .. } = self {
            resp.add_header("Retry-After", &retry_after.to_string());
        }
        resp
    }
}

impl From<EngineError> for GatewayError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotReady => Self::NotReady,
            EngineError::Timeout => Self::Timeout,
            EngineError::Disconnected => Self::EngineDisconnected,
            EngineError::License(record) => Self::License(record),
            EngineError::Reported(message) => Self::EngineReported(message),
            EngineError::Io(e) => Self::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::GatewayError;

    #[test]
    fn statuses_follow_the_surface_contract() {
        assert_eq!(401, GatewayError::AuthRequired.status());
        assert_eq!(503, GatewayError::NotReady.status());
        assert_eq!(502, GatewayError::Timeout.status());
        assert_eq!(
            429,
            GatewayError::RateLimited {
                retry_after: 1,
                limit: 2,
                remaining: 0
            }
            .status()
        );
    }

    #[test]
    fn rate_limit_response_carries_retry_metadata() {
        let resp = GatewayError::RateLimited {
            retry_after: 7,
            limit: 100,
            remaining: 0,
        }
        .to_response();
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.contains("Retry-After: 7"));
        assert!(text.contains("\"retry_after\":7"));
        assert!(text.contains("\"limit\":100"));
    }
}
