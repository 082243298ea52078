//! JWKS key source: fetching, caching, and refresh de-duplication.
//!
//! Resolves a token's `kid` to public-key material from the issuer's JWKS
//! endpoint. The cached key set is served until its TTL expires, refreshed
//! lazily on expiry or on a `kid` the cache does not know, and retained as
//! last-known-good (up to a hard staleness bound) when a refresh fails, so
//! a flaky issuer endpoint does not take down every verification.
//!
//! Concurrent refreshes collapse into a single in-flight fetch: callers
//! queue on an async mutex and re-check the cache once they hold it, so a
//! cold cache under load produces exactly one outbound request.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::JwkSet;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::allowlist::DomainAllowList;
use crate::error::AuthError;

/// Default cache TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
/// Default hard bound on serving a stale key set after refresh failures.
pub const DEFAULT_MAX_STALENESS: Duration = Duration::from_secs(3600);
/// Default minimum interval between refresh attempts. Defends the issuer
/// against storms of tokens carrying unknown `kid`s.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// A key document could not be retrieved or parsed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct FetchError(pub String);

/// Retrieves a JWKS document. The network seam: production uses
/// [`HttpKeyFetcher`]; tests substitute a recording fake.
pub trait KeyFetcher: Send + Sync + 'static {
    /// Fetch and parse the key set at `uri`.
    fn fetch_keys(&self, uri: &str) -> impl Future<Output = Result<JwkSet, FetchError>> + Send;
}

/// JWKS fetcher over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpKeyFetcher {
    client: reqwest::Client,
}

impl HttpKeyFetcher {
    /// Build a fetcher with a 10 second request timeout.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
        }
    }
}

impl Default for HttpKeyFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyFetcher for HttpKeyFetcher {
    async fn fetch_keys(&self, uri: &str) -> Result<JwkSet, FetchError> {
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| FetchError(format!("request failed: {e}")))?
            .error_for_status()
            .map_err(|e| FetchError(format!("error status: {e}")))?;
        response
            .json::<JwkSet>()
            .await
            .map_err(|e| FetchError(format!("invalid key set document: {e}")))
    }
}

/// Decoded keys by `kid`, with the moment they were fetched.
struct CachedKeys {
    keys: HashMap<String, Arc<DecodingKey>>,
    fetched_at: Instant,
}

impl CachedKeys {
    fn from_set(set: JwkSet) -> Self {
        let mut keys = HashMap::new();
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                debug!("skipping key without kid in key set");
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid, Arc::new(key));
                }
                Err(e) => {
                    warn!(kid = %kid, error = %e, "skipping unusable key in key set");
                }
            }
        }
        Self {
            keys,
            fetched_at: Instant::now(),
        }
    }

    fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

/// Cached key source for one issuer's JWKS endpoint.
///
/// Not `Clone`; share it behind an [`Arc`]. Reads never block on a fresh
/// cache, and nothing is held across the network fetch except the refresh
/// mutex that de-duplicates it.
pub struct JwksKeySource<F = HttpKeyFetcher> {
    jwks_uri: String,
    allowlist: DomainAllowList,
    ttl: Duration,
    max_staleness: Duration,
    min_refresh_interval: Duration,
    fetcher: F,
    cache: RwLock<Option<CachedKeys>>,
    last_attempt: std::sync::Mutex<Option<Instant>>,
    refresh_lock: Mutex<()>,
}

impl JwksKeySource<HttpKeyFetcher> {
    /// Start building a key source for the given JWKS endpoint.
    pub fn builder(jwks_uri: impl Into<String>) -> JwksKeySourceBuilder<HttpKeyFetcher> {
        JwksKeySourceBuilder {
            jwks_uri: jwks_uri.into(),
            ttl: DEFAULT_TTL,
            max_staleness: DEFAULT_MAX_STALENESS,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            allowlist: DomainAllowList::allow_all(),
            fetcher: HttpKeyFetcher::default(),
        }
    }
}

impl<F: KeyFetcher> JwksKeySource<F> {
    /// The configured JWKS endpoint.
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Resolve a `kid` to its public key.
    ///
    /// A fresh cache answers without any locking beyond a read guard. A
    /// miss (expired cache, or a `kid` the fresh cache does not carry)
    /// triggers exactly one refresh attempt before the lookup is retried
    /// and, if still absent, rejected.
    pub async fn get_key(&self, kid: &str) -> Result<Arc<DecodingKey>, AuthError> {
        let started = Instant::now();
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.age() < self.ttl
            {
                if let Some(key) = cached.keys.get(kid) {
                    return Ok(key.clone());
                }
                // fresh cache, unknown kid: likely key rotation, refresh once
                debug!(kid = %kid, "kid not in fresh key set, attempting refresh");
            }
        }

        self.refresh(started).await?;

        let cache = self.cache.read().await;
        match cache.as_ref().and_then(|c| c.keys.get(kid)) {
            Some(key) => Ok(key.clone()),
            None => Err(AuthError::KeyLookup(format!(
                "kid {kid:?} not present in key set"
            ))),
        }
    }

    /// Refresh the cached key set, de-duplicating concurrent attempts.
    ///
    /// Returns `Ok` when a usable key set is cached afterwards — freshly
    /// fetched, refreshed by a caller we waited on, or stale-but-within-
    /// bounds after a fetch failure. Errs only when nothing usable exists.
    async fn refresh(&self, started: Instant) -> Result<(), AuthError> {
        // SSRF guard and scheme check come before any locking or I/O.
        self.allowlist.check(&self.jwks_uri)?;
        if !self.jwks_uri.starts_with("https://")
            && !self.jwks_uri.starts_with("http://localhost")
            && !self.jwks_uri.starts_with("http://127.0.0.1")
        {
            return Err(AuthError::KeyLookup(format!(
                "key set endpoint must use https: {}",
                self.jwks_uri
            )));
        }

        let _guard = self.refresh_lock.lock().await;

        // A refresh that completed while this caller waited on the lock
        // satisfies it: this is what collapses a cold-cache stampede into
        // one fetch.
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at > started
            {
                return Ok(());
            }
        }

        // Separately, rate-limit refreshes so a storm of unknown-kid
        // tokens cannot hammer the issuer.
        let rate_limited = {
            let last = self.last_attempt.lock().expect("last_attempt poisoned");
            last.is_some_and(|at| at.elapsed() < self.min_refresh_interval)
        };
        if rate_limited {
            let cache = self.cache.read().await;
            return match cache.as_ref() {
                Some(cached) if cached.age() < self.max_staleness => Ok(()),
                _ => Err(AuthError::KeyLookup(
                    "key set refresh rate limited with no usable cached keys".to_string(),
                )),
            };
        }
        *self.last_attempt.lock().expect("last_attempt poisoned") = Some(Instant::now());

        match self.fetcher.fetch_keys(&self.jwks_uri).await {
            Ok(set) => {
                let cached = CachedKeys::from_set(set);
                info!(
                    jwks_uri = %self.jwks_uri,
                    keys = cached.keys.len(),
                    "refreshed key set"
                );
                *self.cache.write().await = Some(cached);
                Ok(())
            }
            Err(e) => {
                warn!(jwks_uri = %self.jwks_uri, error = %e, "key set refresh failed");
                let cache = self.cache.read().await;
                match cache.as_ref() {
                    Some(cached) if cached.age() < self.max_staleness => {
                        warn!(
                            jwks_uri = %self.jwks_uri,
                            age_secs = cached.age().as_secs(),
                            "serving last-known-good key set"
                        );
                        Ok(())
                    }
                    _ => Err(AuthError::KeyLookup(format!(
                        "failed to fetch key set: {e}"
                    ))),
                }
            }
        }
    }
}

/// Builder for [`JwksKeySource`].
pub struct JwksKeySourceBuilder<F = HttpKeyFetcher> {
    jwks_uri: String,
    ttl: Duration,
    max_staleness: Duration,
    min_refresh_interval: Duration,
    allowlist: DomainAllowList,
    fetcher: F,
}

impl<F: KeyFetcher> JwksKeySourceBuilder<F> {
    /// Cache TTL (default 5 minutes).
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Hard bound on serving stale keys after refresh failures
    /// (default 1 hour).
    pub fn max_staleness(mut self, bound: Duration) -> Self {
        self.max_staleness = bound;
        self
    }

    /// Minimum interval between refresh attempts (default 10 seconds).
    pub fn min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Domain allow-list checked before every fetch.
    pub fn allowlist(mut self, allowlist: DomainAllowList) -> Self {
        self.allowlist = allowlist;
        self
    }

    /// Substitute the network seam.
    pub fn fetcher<G: KeyFetcher>(self, fetcher: G) -> JwksKeySourceBuilder<G> {
        JwksKeySourceBuilder {
            jwks_uri: self.jwks_uri,
            ttl: self.ttl,
            max_staleness: self.max_staleness,
            min_refresh_interval: self.min_refresh_interval,
            allowlist: self.allowlist,
            fetcher,
        }
    }

    /// Build the key source. No fetch happens here; the cache fills on the
    /// first verification attempt.
    pub fn build(self) -> JwksKeySource<F> {
        JwksKeySource {
            jwks_uri: self.jwks_uri,
            allowlist: self.allowlist,
            ttl: self.ttl,
            max_staleness: self.max_staleness,
            min_refresh_interval: self.min_refresh_interval,
            fetcher: self.fetcher,
            cache: RwLock::new(None),
            last_attempt: std::sync::Mutex::new(None),
            refresh_lock: Mutex::new(()),
        }
    }
}
