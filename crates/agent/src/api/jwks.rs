//! Inbound bearer-token validation against the configured issuer's JWKS.
//! Keys are cached for five minutes and re-fetched eagerly when a token
//! names an unknown `kid` (key rotation).

use models::ErrorKind;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const KEYSET_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token is invalid: {0}")]
    Invalid(String),
    #[error("token is expired")]
    Expired,
    #[error("token is not for this service: {0}")]
    Forbidden(String),
    #[error("JWKS endpoint unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Invalid(_) => ErrorKind::AuthInvalid,
            AuthError::Expired => ErrorKind::AuthExpired,
            AuthError::Forbidden(_) => ErrorKind::AuthForbidden,
            AuthError::Unavailable(_) => ErrorKind::RecordStoreUnavailable,
        }
    }
}

/// Claims we read from inbound tokens. Signature and the registered claims
/// (`iss`, `aud`, `exp`, `nbf`) are enforced by validation; `sub` is kept
/// for log attribution.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Claims {
    pub sub: Option<String>,
}

#[derive(serde::Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(serde::Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

struct CachedKeys {
    by_kid: HashMap<String, jsonwebtoken::DecodingKey>,
    fetched_at: Instant,
}

pub struct JwksCache {
    uri: url::Url,
    keys: tokio::sync::RwLock<Option<CachedKeys>>,
    last_success: std::sync::Mutex<Option<Instant>>,
}

impl JwksCache {
    pub fn new(uri: url::Url) -> Self {
        Self {
            uri,
            keys: tokio::sync::RwLock::new(None),
            last_success: std::sync::Mutex::new(None),
        }
    }

    /// Whether a JWKS fetch has succeeded within the readiness window.
    pub fn fresh_within(&self, window: Duration) -> bool {
        self.last_success
            .lock()
            .unwrap()
            .map(|at| at.elapsed() <= window)
            .unwrap_or(false)
    }

    /// Forces a refresh when the cache has gone stale; used by readiness.
    pub async fn probe(&self, http: &reqwest::Client) -> bool {
        if self.fresh_within(KEYSET_TTL) {
            return true;
        }
        self.refresh(http).await.is_ok()
    }

    async fn refresh(&self, http: &reqwest::Client) -> Result<(), AuthError> {
        let set: JwkSet = http
            .get(self.uri.clone())
            .send()
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?
            .error_for_status()
            .map_err(|err| AuthError::Unavailable(err.to_string()))?
            .json()
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;

        let mut by_kid = HashMap::new();
        for key in set.keys {
            let (Some(kid), Some(n), Some(e)) = (key.kid, key.n.as_deref(), key.e.as_deref())
            else {
                continue;
            };
            if key.kty != "RSA" {
                continue;
            }
            match jsonwebtoken::DecodingKey::from_rsa_components(n, e) {
                Ok(decoding_key) => {
                    by_kid.insert(kid, decoding_key);
                }
                Err(err) => tracing::warn!(%kid, error = %err, "skipping unusable JWK"),
            }
        }

        *self.keys.write().await = Some(CachedKeys {
            by_kid,
            fetched_at: Instant::now(),
        });
        *self.last_success.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    async fn key_for(
        &self,
        http: &reqwest::Client,
        kid: &str,
    ) -> Result<jsonwebtoken::DecodingKey, AuthError> {
        {
            let cached = self.keys.read().await;
            if let Some(cached) = &*cached {
                if cached.fetched_at.elapsed() <= KEYSET_TTL {
                    if let Some(key) = cached.by_kid.get(kid) {
                        return Ok(key.clone());
                    }
                }
            }
        }

        // Stale cache or unknown kid: re-fetch once.
        self.refresh(http).await?;
        let cached = self.keys.read().await;
        cached
            .as_ref()
            .and_then(|cached| cached.by_kid.get(kid).cloned())
            .ok_or_else(|| AuthError::Invalid(format!("no JWKS key with kid {kid:?}")))
    }

    /// Validates a bearer token: signature via JWKS, plus `iss`, `aud`,
    /// `exp`, and `nbf`.
    pub async fn verify(
        &self,
        http: &reqwest::Client,
        token: &str,
        issuer: &str,
        audience: &str,
    ) -> Result<Claims, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|err| AuthError::Invalid(err.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::Invalid("token header has no kid".to_string()))?;
        let key = self.key_for(http, &kid).await?;

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.validate_nbf = true;

        let decoded = jsonwebtoken::decode::<Claims>(token, &key, &validation).map_err(|err| {
            use jsonwebtoken::errors::ErrorKind as JwtError;
            match err.kind() {
                JwtError::ExpiredSignature => AuthError::Expired,
                JwtError::InvalidAudience | JwtError::InvalidIssuer => {
                    AuthError::Forbidden(err.to_string())
                }
                _ => AuthError::Invalid(err.to_string()),
            }
        })?;
        Ok(decoded.claims)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_auth_errors_map_to_taxonomy() {
        assert_eq!(AuthError::Expired.kind(), ErrorKind::AuthExpired);
        assert_eq!(
            AuthError::Forbidden("aud".to_string()).kind(),
            ErrorKind::AuthForbidden
        );
        assert_eq!(
            AuthError::Invalid("sig".to_string()).kind(),
            ErrorKind::AuthInvalid
        );
    }
}
