//! HTTP access to the upstream transit API with retry.

use reqwest::StatusCode;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::backoff::jitter;
use crate::config::RelayConfig;
use crate::error::FetchError;
use crate::location::Position;
use crate::state::{RelayState, bump};

/// Black-box request/response primitive.
pub trait HttpClient: Send + Sync + 'static {
    /// One GET. Anything but a 200 is an error.
    fn get(&self, url: &str) -> impl Future<Output = Result<String, FetchError>> + Send;
}

#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("busrelay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<String, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(response.text().await?)
    }
}

/// Builds request URLs for the OneBusAway "where" API.
#[derive(Debug, Clone)]
pub struct ObaEndpoints {
    base: String,
    key: String,
    radius_m: u32,
}

impl ObaEndpoints {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            base: config.api_base_url.clone(),
            key: config.api_key.clone(),
            radius_m: config.search_radius_m,
        }
    }

    pub fn arrivals_for_stop(&self, stop_id: &str) -> String {
        format!(
            "{}/api/where/arrivals-and-departures-for-stop/{}.json?key={}",
            self.base, stop_id, self.key
        )
    }

    pub fn stops_for_location(&self, position: Position) -> String {
        format!(
            "{}/api/where/stops-for-location.json?key={}&lat={}&lon={}&radius={}",
            self.base, self.key, position.lat, position.lon, self.radius_m
        )
    }

    pub fn stop(&self, stop_id: &str) -> String {
        format!("{}/api/where/stop/{}.json?key={}", self.base, stop_id, self.key)
    }
}

/// Retries a GET with escalating per-attempt timeouts and jittered waits.
pub struct ResilientFetcher<H> {
    client: H,
    max_attempts: u32,
    retry_base: Duration,
    request_timeout: Duration,
    state: Arc<RelayState>,
}

impl<H: HttpClient> ResilientFetcher<H> {
    pub fn new(client: H, config: &RelayConfig, state: Arc<RelayState>) -> Self {
        Self {
            client,
            max_attempts: config.http_max_attempts,
            retry_base: config.http_retry_base,
            request_timeout: config.http_request_timeout,
            state,
        }
    }

    pub fn client(&self) -> &H {
        &self.client
    }

    /// Fetch `url`, returning the raw body. Only the final failure is
    /// returned; intermediate ones are logged.
    pub async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let mut attempts = 0;
        loop {
            let timeout = self.request_timeout * (attempts + 1);
            let outcome = match tokio::time::timeout(timeout, self.client.get(url)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(timeout)),
            };

            match outcome {
                Ok(body) => {
                    debug!(url, attempt = attempts + 1, bytes = body.len(), "Fetched");
                    return Ok(body);
                }
                Err(e) => {
                    attempts += 1;
                    warn!(url, attempt = attempts, error = %e, "Fetch attempt failed");
                    if attempts >= self.max_attempts {
                        error!(url, attempts, "Fetch failed on every attempt. Bailing.");
                        bump(&self.state.fetch_failures);
                        return Err(FetchError::Exhausted {
                            url: url.to_string(),
                            attempts,
                        });
                    }
                    tokio::time::sleep(jitter(self.retry_base, attempts)).await;
                }
            }
        }
    }
}
