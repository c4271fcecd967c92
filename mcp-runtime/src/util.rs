//! Access-token acquisition against the vendor's accessKey login endpoint.
//!
//! The provider holds the process-wide token cache the runtime shares across
//! tool invocations: reuse while comfortably inside the expiry window,
//! otherwise re-acquire. The cache lock is never held across a network call,
//! so a cold-start burst may fetch a token more than once; tokens are
//! idempotently re-fetchable and the last writer wins.

use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

const LOGIN_PATH: &str = "/v2/quecauth/accessKeyAuthrize/accessKeyLogin";

/// Reuse margin: a cached token is re-acquired once less than this much
/// validity remains, so in-flight requests never ride an about-to-expire
/// token.
const EXPIRY_MARGIN_MINUTES: i64 = 60;

/// Lifetime assumed for tokens whose `exp` claim cannot be read.
const FALLBACK_LIFETIME_HOURS: i64 = 2;

pub type AuthError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Injectable credential provider: `get_valid` yields a token that is good
/// for at least the expiry margin, refreshing through the accessKey login
/// exchange when needed.
pub struct TokenProvider {
    http: reqwest::Client,
    base_url: String,
    access_key: String,
    access_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(
        base_url: impl Into<String>,
        access_key: impl Into<String>,
        access_secret: impl Into<String>,
    ) -> Self {
        Self {
            http: client(),
            base_url: base_url.into(),
            access_key: access_key.into(),
            access_secret: access_secret.into(),
            cached: Mutex::new(None),
        }
    }

    pub async fn get_valid(&self) -> Result<String, AuthError> {
        if let Some(token) = self.cached_if_fresh() {
            return Ok(token);
        }

        let token = self.acquire().await?;
        let expires_at = token_expiry(&token)
            .unwrap_or_else(|| Utc::now() + Duration::hours(FALLBACK_LIFETIME_HOURS));
        // stdout is the protocol channel; events go to stderr.
        eprintln!(
            "{}",
            json!({ "event": "access_token_acquired", "expires_at": expires_at.to_rfc3339() })
        );
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at,
        });
        Ok(token)
    }

    fn cached_if_fresh(&self) -> Option<String> {
        let cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        cached.as_ref().and_then(|entry| {
            if Utc::now() + Duration::minutes(EXPIRY_MARGIN_MINUTES) < entry.expires_at {
                Some(entry.token.clone())
            } else {
                None
            }
        })
    }

    async fn acquire(&self) -> Result<String, AuthError> {
        if self.access_key.is_empty() || self.access_secret.is_empty() {
            return Err("Missing access key or secret. Set IOTCLOUD_ACCESS_KEY and IOTCLOUD_ACCESS_SECRET, or pass --token.".into());
        }

        let timestamp = Utc::now().timestamp_millis().to_string();
        let username = login_username(&self.access_key, &timestamp);
        let password = login_password(&username, &self.access_secret);

        let mut url = reqwest::Url::parse(&format!(
            "{}{LOGIN_PATH}",
            self.base_url.trim_end_matches('/')
        ))?;
        url.query_pairs_mut()
            .append_pair("grant_type", "password")
            .append_pair("username", &username)
            .append_pair("password", &password);

        let response = self
            .http
            .get(url)
            .header("Content-Type", "application/json")
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            return Err(format!("Token request failed with HTTP {status}: {body}").into());
        }

        match body.get("access_token").and_then(Value::as_str) {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => Err(format!(
                "Token response did not contain an access_token: {}",
                body.get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
            )
            .into()),
        }
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

/// Signature plaintext for the login exchange. The vendor recomputes the
/// SHA-256 over exactly this string, so parameter order is fixed.
fn login_username(access_key: &str, timestamp_ms: &str) -> String {
    format!(
        "ver=1&auth_mode=accessKey&sign_method=sha256&access_key={access_key}&timestamp={timestamp_ms}"
    )
}

fn login_password(username: &str, access_secret: &str) -> String {
    hex::encode(Sha256::digest(format!("{username}{access_secret}")))
}

/// Reads the `exp` claim from an unverified JWT payload. Verification is the
/// vendor's job; the claim is only used to schedule the local refresh.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}
