//! Access token cache with lazy refresh.
//!
//! The cached token is considered expired `SAFETY_MARGIN` before the platform says it is,
//! so a caller never receives a token that is about to lapse. Refresh happens on demand
//! in the caller's task; there is no background refresh.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Buffer subtracted from the upstream ttl.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(300);

/// Ttl assumed when the token endpoint omits `expires_in`.
const DEFAULT_TTL_SECS: u64 = 7200;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("get access token failed: {message} (errcode {code})")]
    Rejected { code: i64, message: String },
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token response invalid: {0}")]
    Decode(String),
    #[error("token ttl of {ttl_secs}s is within the refresh margin")]
    ShortLived { ttl_secs: u64 },
}

impl AuthError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AuthError::Request(e) if e.is_timeout())
    }
}

/// A freshly minted token and its lifetime as reported upstream.
#[derive(Debug, Clone)]
pub struct FetchedToken {
    pub token: String,
    pub ttl: Duration,
}

/// Obtains a new token from the platform.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self) -> Result<FetchedToken, AuthError>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    /// Instant after which the token is no longer handed out (true expiry minus margin).
    usable_until: Instant,
}

/// Single bearer token with lazy refresh through an injected fetcher.
pub struct TokenCache {
    fetcher: Arc<dyn TokenFetcher>,
    current: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(fetcher: Arc<dyn TokenFetcher>) -> Self {
        Self {
            fetcher,
            current: RwLock::new(None),
        }
    }

    /// Return the cached token while usable, otherwise fetch, cache and return a new one.
    ///
    /// The lock is not held across the fetch: concurrent callers that all see an expired
    /// token may each refresh once. The last write wins and every returned token is valid.
    pub async fn get_token(&self) -> Result<String, AuthError> {
        if let Some(cached) = self.current.read().await.as_ref() {
            if Instant::now() < cached.usable_until {
                return Ok(cached.token.clone());
            }
        }

        let fetched = self.fetcher.fetch().await?;
        if fetched.ttl <= SAFETY_MARGIN {
            return Err(AuthError::ShortLived {
                ttl_secs: fetched.ttl.as_secs(),
            });
        }
        let usable_until = Instant::now()
            .checked_add(fetched.ttl - SAFETY_MARGIN)
            .ok_or_else(|| {
                AuthError::Decode(format!("token ttl of {}s is out of range", fetched.ttl.as_secs()))
            })?;
        *self.current.write().await = Some(CachedToken {
            token: fetched.token.clone(),
            usable_until,
        });
        log::info!("dingtalk: access token refreshed");
        Ok(fetched.token)
    }

    /// Drop the cached token so the next caller refetches.
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }
}

#[derive(Debug, Deserialize)]
struct GetTokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

/// Fetches tokens from the open platform `gettoken` endpoint with the app key and secret.
pub struct OapiTokenFetcher {
    api_base: String,
    app_key: String,
    app_secret: String,
    client: reqwest::Client,
}

impl OapiTokenFetcher {
    pub fn new(
        api_base: impl Into<String>,
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            client,
        }
    }
}

#[async_trait]
impl TokenFetcher for OapiTokenFetcher {
    /// GET /gettoken?appkey=&appsecret=
    async fn fetch(&self) -> Result<FetchedToken, AuthError> {
        let url = format!("{}/gettoken", self.api_base);
        let res = self
            .client
            .get(&url)
            .query(&[("appkey", &self.app_key), ("appsecret", &self.app_secret)])
            .send()
            .await?;
        let data: GetTokenResponse = res.json().await?;
        if data.errcode != 0 {
            return Err(AuthError::Rejected {
                code: data.errcode,
                message: data.errmsg.unwrap_or_default(),
            });
        }
        let token = data
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::Decode("missing access_token".to_string()))?;
        Ok(FetchedToken {
            token,
            ttl: Duration::from_secs(data.expires_in.unwrap_or(DEFAULT_TTL_SECS)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
        ttl: Duration,
    }

    impl CountingFetcher {
        fn new(ttl: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                ttl,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenFetcher for CountingFetcher {
        async fn fetch(&self) -> Result<FetchedToken, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(FetchedToken {
                token: format!("token-{}", n),
                ttl: self.ttl,
            })
        }
    }

    struct RejectingFetcher;

    #[async_trait]
    impl TokenFetcher for RejectingFetcher {
        async fn fetch(&self) -> Result<FetchedToken, AuthError> {
            Err(AuthError::Rejected {
                code: 40089,
                message: "invalid appkey".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reuses_token_until_margin_then_refreshes() {
        let fetcher = CountingFetcher::new(Duration::from_secs(7200));
        let cache = TokenCache::new(fetcher.clone());

        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        tokio::time::advance(Duration::from_secs(6899)).await;
        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        assert_eq!(fetcher.calls(), 1);

        // 6900s = 7200 - 300: inside the margin now.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get_token().await.unwrap(), "token-2");
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_forces_refetch() {
        let fetcher = CountingFetcher::new(Duration::from_secs(7200));
        let cache = TokenCache::new(fetcher.clone());
        cache.get_token().await.unwrap();
        cache.invalidate().await;
        assert_eq!(cache.get_token().await.unwrap(), "token-2");
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_inside_margin_is_refused() {
        let fetcher = CountingFetcher::new(Duration::from_secs(300));
        let cache = TokenCache::new(fetcher);
        let err = cache.get_token().await.unwrap_err();
        assert!(matches!(err, AuthError::ShortLived { ttl_secs: 300 }));
    }

    #[tokio::test]
    async fn rejection_is_surfaced_and_not_cached() {
        let cache = TokenCache::new(Arc::new(RejectingFetcher));
        let err = cache.get_token().await.unwrap_err();
        match err {
            AuthError::Rejected { code, message } => {
                assert_eq!(code, 40089);
                assert_eq!(message, "invalid appkey");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(cache.current.read().await.is_none());
    }

    #[tokio::test]
    async fn oapi_fetcher_reads_token_and_ttl() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/gettoken")
                .query_param("appkey", "key")
                .query_param("appsecret", "secret");
            then.status(200)
                .json_body(serde_json::json!({"errcode": 0, "access_token": "abc", "expires_in": 7200}));
        });
        let fetcher = OapiTokenFetcher::new(server.base_url(), "key", "secret", reqwest::Client::new());
        let fetched = fetcher.fetch().await.unwrap();
        assert_eq!(fetched.token, "abc");
        assert_eq!(fetched.ttl, Duration::from_secs(7200));
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_an_error_not_a_panic() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/gettoken");
            then.status(200).json_body(
                serde_json::json!({"errcode": 0, "access_token": "abc", "expires_in": u64::MAX}),
            );
        });
        let fetcher = OapiTokenFetcher::new(server.base_url(), "key", "secret", reqwest::Client::new());
        let cache = TokenCache::new(Arc::new(fetcher));
        let err = cache.get_token().await.unwrap_err();
        assert!(matches!(err, AuthError::Decode(_)), "{err}");
        assert!(cache.current.read().await.is_none());
    }

    #[tokio::test]
    async fn oapi_fetcher_maps_errcode_to_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/gettoken");
            then.status(200)
                .json_body(serde_json::json!({"errcode": 40089, "errmsg": "invalid appkey"}));
        });
        let fetcher = OapiTokenFetcher::new(server.base_url(), "key", "bad", reqwest::Client::new());
        let err = fetcher.fetch().await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected { code: 40089, .. }));
    }
}
