//! Bearer token verification for the SCITOKENS method.
//!
//! Tokens are JWTs. Each trusted issuer brings its own algorithm, key and
//! audience list; a token is accepted by the first issuer whose validation
//! it passes. The verified claims travel with the authenticated identity.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;

use crate::config::{TokenConfig, TrustedIssuer};
use crate::error::{AuthError, AuthResult};
use crate::identity::TokenClaims;

#[derive(Debug, Deserialize)]
struct RawClaims {
    iss: String,
    sub: String,
    #[serde(default)]
    jti: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default, rename = "wlcg.groups", alias = "groups")]
    groups: Vec<String>,
    #[serde(default)]
    exp: Option<u64>,
}

impl From<RawClaims> for TokenClaims {
    fn from(raw: RawClaims) -> Self {
        Self {
            issuer: raw.iss,
            subject: raw.sub,
            token_id: raw.jti,
            scopes: raw
                .scope
                .unwrap_or_default()
                .split_whitespace()
                .map(str::to_owned)
                .collect(),
            groups: raw.groups,
            expires_at: raw.exp.map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
        }
    }
}

struct IssuerKey {
    issuer: String,
    key: DecodingKey,
    validation: Validation,
}

impl IssuerKey {
    fn load(trusted: &TrustedIssuer) -> AuthResult<Self> {
        let algorithm = Algorithm::from_str(&trusted.algorithm).map_err(|e| {
            AuthError::config(format!(
                "issuer {}: unknown algorithm {}: {e}",
                trusted.issuer, trusted.algorithm
            ))
        })?;
        let key = match (algorithm, &trusted.secret, &trusted.key_file) {
            (Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512, Some(secret), _) => {
                DecodingKey::from_secret(secret.as_bytes())
            }
            (_, _, Some(path)) => pem_key(algorithm, path, &trusted.issuer)?,
            _ => {
                return Err(AuthError::config(format!(
                    "issuer {}: no key for {}",
                    trusted.issuer, trusted.algorithm
                )));
            }
        };
        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[trusted.issuer.as_str()]);
        if trusted.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&trusted.audiences);
        }
        Ok(Self {
            issuer: trusted.issuer.clone(),
            key,
            validation,
        })
    }
}

fn pem_key(algorithm: Algorithm, path: &Path, issuer: &str) -> AuthResult<DecodingKey> {
    let pem = std::fs::read(path).map_err(|e| {
        AuthError::config(format!("issuer {issuer}: cannot read {}: {e}", path.display()))
    })?;
    let key = match algorithm {
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(&pem),
        Algorithm::EdDSA => DecodingKey::from_ed_pem(&pem),
        _ => DecodingKey::from_rsa_pem(&pem),
    };
    key.map_err(|e| AuthError::config(format!("issuer {issuer}: bad key: {e}")))
}

/// Validates tokens against the trusted issuers.
pub struct TokenVerifier {
    issuers: Vec<IssuerKey>,
}

impl core::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.issuers.iter().map(|i| &i.issuer))
            .finish()
    }
}

impl TokenVerifier {
    /// Loads every trusted issuer's key.
    pub fn from_config(config: &TokenConfig) -> AuthResult<Self> {
        let issuers = config
            .trusted_issuers
            .iter()
            .map(IssuerKey::load)
            .collect::<AuthResult<Vec<_>>>()?;
        Ok(Self { issuers })
    }

    /// Returns `true` if no issuer is trusted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issuers.is_empty()
    }

    /// Verifies `token` and returns its claims.
    pub fn verify(&self, token: &str) -> AuthResult<TokenClaims> {
        let mut last = None;
        for issuer in &self.issuers {
            match decode::<RawClaims>(token, &issuer.key, &issuer.validation) {
                Ok(data) => {
                    tracing::debug!(issuer = %issuer.issuer, subject = %data.claims.sub, "token verified");
                    return Ok(data.claims.into());
                }
                Err(e) => last = Some(e),
            }
        }
        Err(AuthError::method(match last {
            Some(e) => format!("SCITOKENS: token rejected: {e}"),
            None => "SCITOKENS: no trusted issuers configured".to_owned(),
        }))
    }
}

/// The token this client presents: inline first, then the token file.
///
/// The file's first non-blank line that is not a `#` comment is the token.
pub(crate) fn client_token(config: &TokenConfig) -> Option<String> {
    if let Some(token) = config.token.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        return Some(token.to_owned());
    }
    let path = config.token_file.as_ref()?;
    match std::fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_owned),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read token file");
            None
        }
    }
}

/// Seconds until `claims` expire, for logs.
pub(crate) fn remaining(claims: &TokenClaims) -> Option<Duration> {
    claims
        .expires_at
        .and_then(|at| at.duration_since(SystemTime::now()).ok())
}
