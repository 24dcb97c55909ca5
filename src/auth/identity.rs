//! Verification of bearer tokens minted by an external identity provider.
//!
//! Keys are fetched from the provider's JWKS endpoint and cached for the
//! `max-age` the endpoint advertises. An unknown `kid` forces a refetch so
//! key rotation does not lock users out until the cache expires, but never
//! more than once per `MIN_REFETCH_INTERVAL`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::AppConfig;

const DEFAULT_KEY_TTL: Duration = Duration::from_secs(300);
const MIN_REFETCH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("token header could not be decoded: {0}")]
    Header(jsonwebtoken::errors::Error),
    #[error("token header has no key id")]
    MissingKid,
    #[error("no signing key found for kid {0}")]
    KeyNotFound(String),
    #[error("unsupported key type {0}")]
    UnsupportedKeyType(String),
    #[error("failed to fetch signing keys: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("token failed validation: {0}")]
    Invalid(jsonwebtoken::errors::Error),
    #[error("token carries no email claim")]
    MissingEmail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kid: String,
    pub kty: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl IdentityClaims {
    pub fn normalized_email(&self) -> Result<String, IdentityError> {
        self.email
            .as_deref()
            .map(|email| email.trim().to_lowercase())
            .filter(|email| !email.is_empty())
            .ok_or(IdentityError::MissingEmail)
    }
}

struct CachedKeys {
    keys: HashMap<String, Jwk>,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedKeys {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }
}

pub struct IdentityProvider {
    client: Client,
    jwks_url: String,
    issuer: Option<String>,
    audience: Option<String>,
    cache: RwLock<Option<CachedKeys>>,
    /// Start of the last fetch attempt, successful or not. Held while fetching.
    last_fetch: Mutex<Option<Instant>>,
}

impl IdentityProvider {
    /// Returns `None` when no JWKS endpoint is configured.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let jwks_url = config.idp_jwks_url.clone()?;
        Some(Self {
            client: Client::new(),
            jwks_url,
            issuer: config.idp_issuer.clone(),
            audience: config.idp_audience.clone(),
            cache: RwLock::new(None),
            last_fetch: Mutex::new(None),
        })
    }

    pub async fn verify(&self, token: &str) -> Result<IdentityClaims, IdentityError> {
        let header = decode_header(token).map_err(IdentityError::Header)?;
        let kid = header.kid.ok_or(IdentityError::MissingKid)?;

        let key = self.signing_key(&kid).await?;

        if key.kty != "RSA" {
            return Err(IdentityError::UnsupportedKeyType(key.kty));
        }

        let decoding_key =
            DecodingKey::from_rsa_components(&key.n, &key.e).map_err(IdentityError::Invalid)?;

        let mut validation = Validation::new(Algorithm::RS256);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let data = decode::<IdentityClaims>(token, &decoding_key, &validation)
            .map_err(IdentityError::Invalid)?;
        Ok(data.claims)
    }

    async fn signing_key(&self, kid: &str) -> Result<Jwk, IdentityError> {
        if let Some(key) = self.cached_key(kid, false).await {
            return Ok(key);
        }

        let mut last_fetch = self.last_fetch.lock().await;
        // A concurrent request may have refreshed while this one waited.
        if let Some(key) = self.cached_key(kid, false).await {
            return Ok(key);
        }
        if (*last_fetch).is_some_and(|at| at.elapsed() < MIN_REFETCH_INTERVAL) {
            debug!(kid, "skipping signing key refetch inside the minimum interval");
            return self
                .cached_key(kid, true)
                .await
                .ok_or_else(|| IdentityError::KeyNotFound(kid.to_string()));
        }

        *last_fetch = Some(Instant::now());
        self.refresh_keys().await?;
        self.cached_key(kid, false)
            .await
            .ok_or_else(|| IdentityError::KeyNotFound(kid.to_string()))
    }

    async fn cached_key(&self, kid: &str, allow_stale: bool) -> Option<Jwk> {
        let guard = self.cache.read().await;
        guard
            .as_ref()
            .filter(|cached| allow_stale || cached.is_fresh())
            .and_then(|cached| cached.keys.get(kid).cloned())
    }

    async fn refresh_keys(&self) -> Result<(), IdentityError> {
        debug!(url = %self.jwks_url, "fetching identity provider signing keys");
        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await?
            .error_for_status()?;

        let ttl = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or(DEFAULT_KEY_TTL);

        let body: JwksResponse = response.json().await?;
        if body.keys.is_empty() {
            warn!(url = %self.jwks_url, "identity provider returned an empty key set");
        }

        let keys = body
            .keys
            .into_iter()
            .map(|key| (key.kid.clone(), key))
            .collect();

        *self.cache.write().await = Some(CachedKeys {
            keys,
            fetched_at: Instant::now(),
            ttl,
        });
        Ok(())
    }
}

fn parse_max_age(cache_control: &str) -> Option<Duration> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|directive| directive.strip_prefix("max-age="))
        .and_then(|seconds| seconds.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::routing::get;
    use axum::{Json, Router};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn max_age_is_read_from_cache_control() {
        assert_eq!(
            parse_max_age("public, max-age=19427, must-revalidate"),
            Some(Duration::from_secs(19427))
        );
        assert_eq!(parse_max_age("no-store"), None);
        assert_eq!(parse_max_age("max-age=abc"), None);
    }

    #[test]
    fn email_claim_is_normalized() {
        let claims = IdentityClaims {
            sub: "auth0|123".to_string(),
            email: Some("  Owner@Example.CL ".to_string()),
        };
        assert_eq!(claims.normalized_email().unwrap(), "owner@example.cl");

        let anonymous = IdentityClaims {
            sub: "auth0|456".to_string(),
            email: None,
        };
        assert!(matches!(
            anonymous.normalized_email(),
            Err(IdentityError::MissingEmail)
        ));
    }

    fn provider(jwks_url: String) -> IdentityProvider {
        IdentityProvider {
            client: Client::new(),
            jwks_url,
            issuer: None,
            audience: None,
            cache: RwLock::new(None),
            last_fetch: Mutex::new(None),
        }
    }

    async fn serve_jwks(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/jwks",
            get(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(json!({
                        "keys": [{ "kid": "current", "kty": "RSA", "n": "sXchDaQebSXHH", "e": "AQAB" }]
                    }))
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/jwks")
    }

    fn token_with_kid(kid: &str) -> String {
        let header = Header {
            kid: Some(kid.to_string()),
            ..Header::default()
        };
        encode(&header, &json!({ "sub": "idp|1" }), &EncodingKey::from_secret(b"unused")).unwrap()
    }

    #[tokio::test]
    async fn garbage_tokens_fail_before_any_fetch() {
        let provider = provider("http://127.0.0.1:9/jwks".to_string());
        let result = provider.verify("not-a-jwt").await;
        assert!(matches!(result, Err(IdentityError::Header(_))));
    }

    #[tokio::test]
    async fn unknown_kids_refetch_at_most_once_per_interval() {
        let hits = Arc::new(AtomicUsize::new(0));
        let provider = provider(serve_jwks(hits.clone()).await);

        for kid in ["rotated-away", "another-ghost", "rotated-away"] {
            let result = provider.verify(&token_with_kid(kid)).await;
            assert!(matches!(result, Err(IdentityError::KeyNotFound(found)) if found == kid));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Known kids are served from the cache.
        let result = provider.verify(&token_with_kid("current")).await;
        assert!(matches!(result, Err(IdentityError::Invalid(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
