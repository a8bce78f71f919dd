//! Feed platform integration client.
//!
//! REST client for the predictor ranking and per-predictor activity endpoints.
//! Requests share one outbound rate limiter and carry browser-like headers;
//! HTTP statuses are mapped onto `FetchError` so the circuit breaker can tell
//! a removed predictor from ordinary upstream noise.

use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, REFERER, USER_AGENT};
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use tracing::{debug, info, warn};

use crate::config::FetcherConfig;
use crate::fetcher::{FetchError, Fetcher};
use crate::types::{ActivityResponse, RankingEntry, RankingResponse, RawPrediction};

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0";

/// Ids longer than this belong to the newer account namespace
const LEGACY_ID_MAX_LEN: usize = 15;

/// Ranking endpoint path
pub const RANKING_ENDPOINT: &str = "/user-account/vote-ranking";

/// Activity endpoint path for an entity id
pub fn activity_endpoint(entity_id: &str, page: u32) -> String {
    if entity_id.len() > LEGACY_ID_MAX_LEN {
        format!("/user-account/{}/predictions?page={}", entity_id, page)
    } else {
        format!("/user/{}/predictions?page={}", entity_id, page)
    }
}

// === Feed Client ===

pub struct SofascoreClient {
    http: reqwest::Client,
    base_url: String,
    limiter: DefaultDirectRateLimiter,
}

impl SofascoreClient {
    pub fn new(config: &FetcherConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(REFERER, HeaderValue::from_static("https://www.sofascore.com/"));

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(proxy_url) = &config.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url).context("invalid PROXY_URL")?);
            // Never log credentials
            info!("[FETCH] Using proxy {}", proxy_url.rsplit('@').next().unwrap_or(""));
        }

        let per_sec = NonZeroU32::new(config.rate_limit_per_sec).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            http: builder.build().context("building HTTP client")?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::direct(Quota::per_second(per_sec)),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, FetchError> {
        self.limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, endpoint);
        debug!("[FETCH] GET {}", url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| FetchError::Decode(e.to_string()));
        }

        match status.as_u16() {
            404 => Err(FetchError::NotFound(endpoint.to_string())),
            429 => {
                warn!("[FETCH] Rate limited (429) on {}", endpoint);
                Err(FetchError::RateLimited)
            }
            403 => {
                warn!("[FETCH] Blocked (403) on {}", endpoint);
                Err(FetchError::Blocked(403))
            }
            other => {
                warn!("[FETCH] Error fetching {}: {}", endpoint, other);
                Err(FetchError::Status(other))
            }
        }
    }
}

#[async_trait]
impl Fetcher for SofascoreClient {
    async fn fetch_ranking(&self) -> Result<Vec<RankingEntry>, FetchError> {
        let body: RankingResponse = self.get_json(RANKING_ENDPOINT).await?;
        Ok(body.ranking)
    }

    async fn fetch_activity(&self, entity_id: &str, page: u32) -> Result<Vec<RawPrediction>, FetchError> {
        let body: ActivityResponse = self.get_json(&activity_endpoint(entity_id, page)).await?;
        Ok(body.predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_endpoint_by_id_namespace() {
        assert_eq!(activity_endpoint("857093", 0), "/user/857093/predictions?page=0");
        assert_eq!(
            activity_endpoint("65a1b2c3d4e5f6a7b8c9d0e1", 2),
            "/user-account/65a1b2c3d4e5f6a7b8c9d0e1/predictions?page=2"
        );
    }

    #[test]
    fn test_client_builds_with_defaults() {
        let cfg = FetcherConfig {
            base_url: "https://example.invalid/api/v1/".into(),
            timeout: std::time::Duration::from_secs(15),
            rate_limit_per_sec: 0,
            proxy_url: None,
        };
        let client = SofascoreClient::new(&cfg).unwrap();
        assert_eq!(client.base_url, "https://example.invalid/api/v1");
    }
}
