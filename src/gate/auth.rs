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

//! Request authentication: shared bearer token or RSA-signed JWTs.
//!
//! The process runs in exactly one mode. Token comparison never
//! short-circuits, neither on content nor on length, so response timing
//! carries no information about the secret.

use anyhow::{bail, Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::config::{AuthMode, Config, JwtConfig};
use crate::error::GatewayError;

/// Claims surfaced from a verified JWT.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// Subject.
    pub sub: Option<String>,
    /// Space-separated scopes.
    pub scope: Option<String>,
    /// OAuth-style client id.
    pub client_id: Option<String>,
}

#[derive(Debug)]
enum Mode {
    Token(String),
    Jwt(Box<JwtVerifier>),
}

/// Verifies `Authorization: Bearer` credentials.
#[derive(Debug)]
pub struct Authenticator {
    mode: Mode,
}

impl Authenticator {
    /// Builds the authenticator for the configured mode. In jwt mode this
    /// reads and parses the public key, so it fails fast at startup.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mode = match config.auth_mode {
            AuthMode::Token => {
                let token = config
                    .auth_token
                    .clone()
                    .context("auth_mode=token requires auth_token")?;
                Mode::Token(token)
            }
            AuthMode::Jwt => Mode::Jwt(Box::new(JwtVerifier::from_config(&config.jwt)?)),
        };
        Ok(Self { mode })
    }

    /// Verifies the bearer token of a request. `None` means the header was
    /// missing or not a bearer credential.
    pub fn authenticate(
        &self,
        bearer: Option<&str>,
    ) -> Result<Option<Claims>, GatewayError> {
        let token = bearer.ok_or(GatewayError::AuthRequired)?;
        match &self.mode {
            Mode::Token(secret) => {
                if constant_time_eq(token.as_bytes(), secret.as_bytes()) {
                    Ok(None)
                } else {
                    Err(GatewayError::AuthRequired)
                }
            }
            Mode::Jwt(verifier) => verifier.verify(token).map(Some),
        }
    }

    /// Constant-time check of the panel password against the shared token.
    /// Only meaningful in token mode; jwt mode has no panel secret.
    pub fn panel_login(&self, password: &str) -> Result<String, GatewayError> {
        match &self.mode {
            Mode::Token(secret) => {
                if constant_time_eq(password.as_bytes(), secret.as_bytes()) {
                    Ok(secret.clone())
                } else {
                    Err(GatewayError::AuthRequired)
                }
            }
            Mode::Jwt(_) => Err(GatewayError::Forbidden(
                "panel login is unavailable in jwt mode".to_owned(),
            )),
        }
    }
}

/// Length-independent constant-time equality: XOR-accumulates over the
/// longer input and folds the length difference into the result.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = (a.len() ^ b.len()) as u8;
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

// DecodingKey holds raw key material and implements neither Debug nor
// Display; keep it out of any debug output.
impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

impl JwtVerifier {
    fn from_config(config: &JwtConfig) -> Result<Self> {
        let algorithm = match config.algorithm.as_str() {
            "RS256" => Algorithm::RS256,
            "RS384" => Algorithm::RS384,
            "RS512" => Algorithm::RS512,
            other => bail!("unsupported jwt.algorithm {other}; expected RS256/RS384/RS512"),
        };

        let path = config
            .public_key_path
            .as_deref()
            .context("jwt.public_key_path is required in jwt mode")?;
        let pem = std::fs::read(path)
            .with_context(|| format!("reading jwt public key {path}"))?;
        let key = DecodingKey::from_rsa_pem(&pem)
            .with_context(|| format!("parsing jwt public key {path}"))?;

        let mut validation = Validation::new(algorithm);
        validation.leeway = config.clock_skew_seconds;
        validation.validate_exp = config.require_exp;
        validation.validate_nbf = true;
        if !config.require_exp {
            validation.required_spec_claims.clear();
        }
        if let Some(iss) = &config.expected_issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(aud) = &config.expected_audience {
            validation.set_audience(&[aud]);
        } else {
            validation.validate_aud = false;
        }

        Ok(Self { key, validation })
    }

    fn verify(&self, token: &str) -> Result<Claims, GatewayError> {
        jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| GatewayError::AuthRequired)
    }
}

#[cfg(test)]
mod test {
    use super::{constant_time_eq, Authenticator};
    use crate::config::{AuthMode, Config};
    use crate::error::GatewayError;

    fn token_auth(secret: &str) -> Authenticator {
        let mut config = Config::default();
        config.auth_mode = AuthMode::Token;
        config.auth_token = Some(secret.to_owned());
        Authenticator::from_config(&config).unwrap()
    }

    #[test]
    fn constant_time_eq_matches_equality() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn bearer_token_accepted_and_rejected() {
        let auth = token_auth("valid-token");
        assert!(auth.authenticate(Some("valid-token")).is_ok());
        assert!(matches!(
            auth.authenticate(Some("wrong")),
            Err(GatewayError::AuthRequired)
        ));
        assert!(matches!(
            auth.authenticate(None),
            Err(GatewayError::AuthRequired)
        ));
    }

    #[test]
    fn panel_login_returns_token_on_match() {
        let auth = token_auth("hunter2");
        assert_eq!("hunter2", auth.panel_login("hunter2").unwrap());
        assert!(auth.panel_login("wrong").is_err());
    }
}
