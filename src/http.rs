//! HTTP client with rate limiting for the streaming provider.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Request rate limiting for the provider's resolver endpoints
//! * Consistent timeouts and headers
//! * A separate, unlimited client for CDN body downloads
//!
//! # Rate Limiting
//!
//! Resolver calls are throttled to a conservative quota so that bursts of
//! prefetches cannot hammer the provider:
//! * 30 calls per 10-second interval
//! * Automatic request throttling
//! * Allows bursts up to the maximum calls per interval
//! * Requests that would exceed the limit are delayed
//!
//! CDN audio bodies are exempt: they are served from edge caches and
//! throttling them would only stall playback.
//!
//! # Example
//!
//! ```rust
//! use cadenza::http::Client;
//!
//! let client = Client::new()?;
//!
//! // Make rate-limited resolver requests
//! let request = client.get(url, "");
//! let response = client.execute(request).await?;
//! ```

use std::{future::Future, num::NonZeroU32, time::Duration};

use futures_util::{FutureExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    self,
    header::{HeaderValue, ACCEPT},
    Body, Method, Url,
};

use crate::error::Result;

/// `User-Agent` presented on stream and resolver requests.
///
/// Matches a recent official mobile client; CDN edges serve different
/// (sometimes throttled) representations to unknown agents.
pub const USER_AGENT: &str =
    "com.google.android.apps.youtube.music/7.31.51 (Linux; U; Android 14) gzip";

/// HTTP client with built-in rate limiting.
///
/// Wraps `reqwest::Client` to provide:
/// * Rate limiting for resolver quotas
/// * Consistent configuration
/// * Direct CDN access through [`Client::unlimited`]
pub struct Client {
    /// Unlimited request client for CDN bodies.
    ///
    /// Direct access to underlying client without rate limiting.
    pub unlimited: reqwest::Client,

    /// Rate limiter for resolver quota compliance.
    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Standard rate limit interval for resolver endpoints.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(10);

    /// Maximum allowed resolver calls per interval.
    ///
    /// Requests beyond this limit will be automatically delayed.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 30;

    /// Duration to keep idle connections alive.
    ///
    /// Prevents frequent reconnection overhead for subsequent requests.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for individual network reads.
    ///
    /// Reads that take longer than 2 seconds will timeout to:
    /// * Prevent blocking operations
    /// * Allow faster recovery from network issues
    /// * Maintain responsive streaming
    const READ_TIMEOUT: Duration = Duration::from_secs(2);

    /// Duration to wait for a connection to be established.
    ///
    /// Applied to precache and download connections; a CDN edge that takes
    /// longer than this is better retried through a fresh resolve.
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client creation fails.
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn new() -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));

        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .read_timeout(Self::READ_TIMEOUT)
            .connect_timeout(Self::CONNECT_TIMEOUT)
            .default_headers(headers)
            .user_agent(USER_AGENT);

        // Rate limit resolver requests as to not DoS the provider.
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

    /// Builds a request with specified method, URL and body.
    ///
    /// Creates a raw request that can be executed with `execute()`.
    pub fn request<U, T>(&self, method: Method, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        let mut request = reqwest::Request::new(method, url.into());
        let body_mut = request.body_mut();
        *body_mut = Some(body.into());

        request
    }

    /// Builds a POST request.
    ///
    /// Convenience method for `request()` with POST method.
    pub fn post<U, T>(&self, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        self.request(Method::POST, url, body)
    }

    /// Builds a GET request.
    ///
    /// Convenience method for `request()` with GET method.
    pub fn get<U, T>(&self, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        self.request(Method::GET, url, body)
    }

    /// Executes a request with rate limiting.
    ///
    /// Applies rate limiting before executing the request to comply with
    /// resolver quotas. Use [`Client::unlimited`] for CDN bodies.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * Request execution fails
    /// * Network error occurs
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        // No need to await with jitter because the level of concurrency is low.
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| self.unlimited.execute(request).map_err(Into::into))
    }
}
