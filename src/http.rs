//! HTTP client with rate limiting for the extraction service and the refresh
//! endpoint.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Request rate limiting so bursts of plays cannot hammer the extraction
//!   service
//! * A hard ceiling on every request
//! * Consistent timeouts and headers
//!
//! # Rate Limiting
//!
//! * 20 calls per 10-second interval
//! * Allows bursts up to the maximum calls per interval
//! * Requests that would exceed the limit are delayed, never rejected
//!
//! Audio streams are long-lived downloads that must not be cut off by a
//! request ceiling, so they use a separate client from [`streaming`].

use std::{future::Future, num::NonZeroU32, time::Duration};

use futures_util::FutureExt;
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT},
    Method, Url,
};

use crate::{
    config::Config,
    error::{Error, Result},
};

/// HTTP client with built-in rate limiting.
pub struct Client {
    /// Direct access to the underlying client without rate limiting.
    pub unlimited: reqwest::Client,

    /// Rate limiter for outbound resolution calls.
    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Rolling window of the rate limiter.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(10);

    /// Maximum calls per interval. Requests beyond this limit are delayed.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 20;

    /// Duration to keep idle connections alive.
    ///
    /// Prevents frequent reconnection overhead for subsequent requests.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for a connection to be established.
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a new client with a total request ceiling of `timeout`.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created.
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn new(config: &Config, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .connect_timeout(Self::CONNECT_TIMEOUT)
            .timeout(timeout)
            .default_headers(headers)
            .user_agent(&config.user_agent);

        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }

    /// Builds a request with specified method and URL.
    ///
    /// Creates a raw request that can be executed with `execute()`.
    pub fn request<U>(&self, method: Method, url: U) -> reqwest::RequestBuilder
    where
        U: Into<Url>,
    {
        self.unlimited.request(method, url.into())
    }

    /// Builds a POST request with a JSON body.
    pub fn post_json<U, T>(&self, url: U, body: &T) -> reqwest::RequestBuilder
    where
        U: Into<Url>,
        T: serde::Serialize + ?Sized,
    {
        self.request(Method::POST, url).json(body)
    }

    /// Builds a GET request.
    pub fn get<U>(&self, url: U) -> reqwest::RequestBuilder
    where
        U: Into<Url>,
    {
        self.request(Method::GET, url)
    }

    /// Executes a request with rate limiting.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * The request cannot be built
    /// * Request execution fails
    /// * Network error occurs
    pub fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        // No need to await with jitter because the level of concurrency is low.
        let throttle = self.rate_limiter.until_ready();
        throttle.then(move |()| async move {
            let request = request.build()?;
            let response = self.unlimited.execute(request).await?;
            Ok::<_, Error>(response)
        })
    }
}

/// Duration to wait for individual network reads while streaming audio.
///
/// Reads that take longer will time out to allow faster recovery from
/// network issues, like a tunnel that silently stopped sending data.
const STREAMING_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates a client for audio streaming: no total ceiling, but bounded reads.
///
/// # Errors
///
/// Returns error if the HTTP client cannot be created.
pub fn streaming(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .tcp_keepalive(Client::KEEPALIVE_TIMEOUT)
        .connect_timeout(Client::CONNECT_TIMEOUT)
        .read_timeout(STREAMING_READ_TIMEOUT)
        .user_agent(&config.user_agent)
        .build()
        .map_err(Into::into)
}
