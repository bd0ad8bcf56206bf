use crate::Error;
use std::time::{Duration, Instant};

/// Outbound authentication settings for the JWT-bearer grant flow.
#[derive(Clone)]
pub struct AuthConfig {
    /// Login endpoint base, e.g. `https://acme.my.salesforce.com`.
    pub login_url: url::Url,
    /// The connected app's consumer key.
    pub client_id: String,
    /// The integration user to impersonate.
    pub username: String,
    /// PEM-encoded RSA private key of the connected app's certificate.
    pub private_key_pem: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The private key must never appear in logs.
        f.debug_struct("AuthConfig")
            .field("login_url", &self.login_url.as_str())
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A granted access token plus the instance it is valid against.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub instance_url: url::Url,
    pub acquired_at: Instant,
}

impl TokenGrant {
    /// Tokens are refreshed proactively well before the server-side session
    /// timeout, so steady-state calls never eat a 401 round trip.
    pub fn is_stale(&self) -> bool {
        self.acquired_at.elapsed() > Duration::from_secs(50 * 60)
    }
}

#[derive(serde::Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    exp: u64,
}

#[derive(serde::Deserialize)]
struct GrantResponse {
    access_token: String,
    instance_url: url::Url,
}

#[derive(serde::Deserialize)]
struct GrantError {
    error: String,
    error_description: String,
}

/// Executes the OAuth JWT-bearer grant: a short-lived RS256 assertion signed
/// with the connected app's key, exchanged for an access token.
pub(crate) async fn fetch_token(
    http: &reqwest::Client,
    config: &AuthConfig,
) -> Result<TokenGrant, Error> {
    let key = jsonwebtoken::EncodingKey::from_rsa_pem(config.private_key_pem.as_bytes())
        .map_err(|err| Error::TokenGrant(format!("reading private key: {err}")))?;

    let exp = jsonwebtoken::get_current_timestamp() + 180;
    let assertion = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
        &AssertionClaims {
            iss: &config.client_id,
            sub: &config.username,
            aud: config.login_url.as_str().trim_end_matches('/'),
            exp,
        },
        &key,
    )
    .map_err(|err| Error::TokenGrant(format!("signing assertion: {err}")))?;

    let token_url = config
        .login_url
        .join("/services/oauth2/token")
        .expect("token path always joins");

    let response = http
        .post(token_url)
        .form(&[
            (
                "grant_type",
                "urn:ietf:params:oauth:grant-type:jwt-bearer",
            ),
            ("assertion", assertion.as_str()),
        ])
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        let grant: GrantResponse = response.json().await?;
        tracing::debug!(instance = %grant.instance_url, "acquired access token");
        Ok(TokenGrant {
            access_token: grant.access_token,
            instance_url: grant.instance_url,
            acquired_at: Instant::now(),
        })
    } else if status.is_server_error() {
        Err(Error::Unavailable {
            status: Some(status.as_u16()),
            message: "token endpoint unavailable".to_string(),
        })
    } else {
        let err: GrantError = response.json().await.unwrap_or(GrantError {
            error: "unknown".to_string(),
            error_description: format!("http status {status}"),
        });
        Err(Error::TokenGrant(format!(
            "{}: {}",
            err.error, err.error_description
        )))
    }
}
