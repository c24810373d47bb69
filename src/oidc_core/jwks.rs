//! JWKS retrieval, with an optional short-lived cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, instrument};

use super::error::{OidcError, Result};
use super::http_client::{HttpRequest, OidcHttpClient};
use super::types::SigningKeySet;

/// Fetches the provider's signing keys from its `jwks_uri`.
#[derive(Clone)]
pub struct JwksFetcher<C: OidcHttpClient> {
    http: C,
    uri: String,
    timeout: Duration,
}

impl<C: OidcHttpClient> JwksFetcher<C> {
    pub fn new(http: C, uri: impl Into<String>, timeout: Duration) -> Self {
        JwksFetcher { http, uri: uri.into(), timeout }
    }

    /// GETs and parses the key set. Some providers want the caller's access
    /// token on this request; pass it as `bearer`.
    #[instrument(skip(self, bearer), fields(uri = %self.uri), level = "debug")]
    pub async fn fetch_keys(&self, bearer: Option<&str>) -> Result<SigningKeySet> {
        let mut request = HttpRequest::get(self.uri.clone())
            .header("Accept", "application/json")
            .timeout(self.timeout);
        if let Some(token) = bearer {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        let resp = tokio::time::timeout(self.timeout, self.http.execute(request))
            .await?
            .map_err(|e| OidcError::Protocol(format!("JWKS request failed: {}", e)))?;
        if !resp.is_success() {
            return Err(OidcError::Protocol(format!("JWKS endpoint answered {}", resp.status)));
        }
        let set: SigningKeySet = serde_json::from_slice(&resp.body)
            .map_err(|e| OidcError::Protocol(format!("malformed JWKS document: {}", e)))?;
        debug!(keys = set.keys.len(), "fetched signing keys");
        Ok(set)
    }
}

/// Where a key set handed out by [`KeySource`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFreshness {
    /// Fetched for this call.
    Fresh,
    /// Served from the cache; may predate a provider key rotation.
    Cached,
}

struct CachedKeys {
    keys: Arc<SigningKeySet>,
    fetched_at: Instant,
}

/// Key set provider used by the reconciler.
///
/// With a zero TTL every call fetches. Otherwise a set is reused for at most
/// `ttl` and dropped by [`KeySource::invalidate`] after a failed verification.
#[derive(Clone)]
pub struct KeySource<C: OidcHttpClient> {
    fetcher: JwksFetcher<C>,
    ttl: Duration,
    cached: Arc<RwLock<Option<CachedKeys>>>,
}

impl<C: OidcHttpClient> KeySource<C> {
    pub fn new(fetcher: JwksFetcher<C>, ttl: Duration) -> Self {
        KeySource { fetcher, ttl, cached: Arc::new(RwLock::new(None)) }
    }

    pub async fn current(&self, bearer: Option<&str>) -> Result<(Arc<SigningKeySet>, KeyFreshness)> {
        if !self.ttl.is_zero() {
            let guard = self.cached.read().await;
            if let Some(entry) = guard.as_ref() {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok((entry.keys.clone(), KeyFreshness::Cached));
                }
            }
        }
        self.refresh(bearer).await.map(|keys| (keys, KeyFreshness::Fresh))
    }

    /// Fetches unconditionally and replaces the cached set.
    pub async fn refresh(&self, bearer: Option<&str>) -> Result<Arc<SigningKeySet>> {
        let keys = Arc::new(self.fetcher.fetch_keys(bearer).await?);
        if !self.ttl.is_zero() {
            let mut guard = self.cached.write().await;
            *guard = Some(CachedKeys { keys: keys.clone(), fetched_at: Instant::now() });
        }
        Ok(keys)
    }

    pub async fn invalidate(&self) {
        self.cached.write().await.take();
    }
}
