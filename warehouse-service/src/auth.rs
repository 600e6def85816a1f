use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::error::WarehouseError;

pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub role: Option<String>,
    pub exp: u64,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no signing key has been received from the auth service")]
    KeyUnavailable,
    #[error("stored signing key is not a valid RSA key: {0}")]
    InvalidKey(jsonwebtoken::errors::Error),
    #[error("invalid token: {0}")]
    InvalidToken(jsonwebtoken::errors::Error),
}

/// Holds the auth service's current public key. Readers take a cheap
/// clone of the key; the refresher replaces it in one swap.
#[derive(Debug, Default)]
pub struct PublicKeyCache {
    slot: RwLock<Option<Arc<str>>>,
}

impl PublicKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<str>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs `key` and returns the key it replaced.
    pub fn swap(&self, key: impl Into<Arc<str>>) -> Option<Arc<str>> {
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(key.into())
    }

    /// Checks an RS256 bearer token against the current key.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let key = self.current().ok_or(AuthError::KeyUnavailable)?;
        let decoding_key = DecodingKey::from_rsa_pem(key.as_bytes()).map_err(AuthError::InvalidKey)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;

        decode::<Claims>(token, &decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(AuthError::InvalidToken)
    }
}

#[async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch(&self) -> Result<String, WarehouseError>;
}

#[derive(Deserialize)]
struct KeyResponse {
    public_key: String,
}

/// Fetches the key from the auth service's `/auth/key` endpoint.
pub struct HttpKeySource {
    client: reqwest::Client,
    url: String,
}

impl HttpKeySource {
    pub fn new(auth_base_url: &str, timeout: Duration) -> Result<Self, WarehouseError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WarehouseError::KeyRefresh(e.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}/auth/key", auth_base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self) -> Result<String, WarehouseError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| WarehouseError::KeyRefresh(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WarehouseError::KeyRefresh(format!(
                "{} answered {}",
                self.url, status
            )));
        }

        let body: KeyResponse = response
            .json()
            .await
            .map_err(|e| WarehouseError::KeyRefresh(e.to_string()))?;
        Ok(body.public_key)
    }
}

#[derive(Clone)]
pub struct KeyRefresher {
    cache: Arc<PublicKeyCache>,
    source: Arc<dyn KeySource>,
}

impl KeyRefresher {
    pub fn new(cache: Arc<PublicKeyCache>, source: Arc<dyn KeySource>) -> Self {
        Self { cache, source }
    }

    pub async fn refresh(&self) -> Result<(), WarehouseError> {
        let key = self.source.fetch().await?;
        let previous = self.cache.swap(key);
        info!(rotated = previous.is_some(), "Public key updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_returns_previous_key() {
        let cache = PublicKeyCache::new();
        assert!(cache.current().is_none());
        assert!(cache.swap("first").is_none());

        let previous = cache.swap("second");
        assert_eq!(previous.as_deref(), Some("first"));
        assert_eq!(cache.current().as_deref(), Some("second"));
    }

    #[test]
    fn verify_without_key_is_unavailable() {
        let cache = PublicKeyCache::new();
        assert!(matches!(cache.verify("a.b.c"), Err(AuthError::KeyUnavailable)));
    }

    #[test]
    fn garbage_key_is_reported_as_invalid_key() {
        let cache = PublicKeyCache::new();
        cache.swap("not a pem");
        assert!(matches!(cache.verify("a.b.c"), Err(AuthError::InvalidKey(_))));
    }

    #[test]
    fn admin_role_is_exact() {
        let mut claims = Claims {
            sub: "1".into(),
            role: Some("admin".into()),
            exp: 0,
        };
        assert!(claims.is_admin());
        claims.role = Some("Admin".into());
        assert!(!claims.is_admin());
        claims.role = None;
        assert!(!claims.is_admin());
    }
}
