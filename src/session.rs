//! Shared HTTP session: connection pool, default headers, retry policy.
//!
//! One [`Session`] is shared by the preloader, downloader, and API fetches.
//! Idempotent requests (GET, HEAD) are retried on {429, 500, 502, 503, 504}
//! with exponential backoff honoring `Retry-After`; asset streams use a
//! redirect-refusing client and leave retry to their own state machines.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use rand::Rng;
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue, RANGE, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, Method, Proxy, Response, StatusCode, redirect};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Default connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default read timeout in seconds.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Maximum retries on retryable statuses for idempotent methods.
const MAX_STATUS_RETRIES: u32 = 5;

/// Statuses retried for idempotent methods.
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Base backoff delay between status retries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Backoff cap between status retries.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Upper bound accepted from a `Retry-After` header.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Idle pool size per host.
const POOL_MAX_IDLE_PER_HOST: usize = 20;

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session was closed; no further requests are accepted.
    #[error("session closed")]
    Closed,

    /// The underlying client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    /// Network-level request failure.
    #[error("network error requesting {url}: {source}")]
    Network {
        /// Requested URL.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The request timed out.
    #[error("timeout requesting {url}")]
    Timeout {
        /// Requested URL.
        url: String,
    },
}

impl SessionError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::Network {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

/// Build-time session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Read timeout in seconds.
    pub read_timeout_secs: u64,
    /// Whether TLS certificates are verified. On unless the caller has a
    /// concrete reason to disable it.
    pub verify_tls: bool,
    /// User-Agent sent with every request.
    pub user_agent: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            verify_tls: true,
            user_agent: format!("booruview/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug)]
struct Clients {
    /// Follows redirects; used for API requests.
    standard: Client,
    /// Refuses redirects; used for asset streams (3xx is an error there).
    no_redirect: Client,
}

/// Shared, internally synchronised HTTP session.
///
/// All methods take `&self` and may be called concurrently. `close()` is
/// idempotent; afterwards every request fails with [`SessionError::Closed`].
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    clients: RwLock<Clients>,
    extra_headers: Mutex<HeaderMap>,
    proxies: Mutex<(Option<String>, Option<String>)>,
    closed: AtomicBool,
}

impl Session {
    /// Creates a session with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Build`] when the client cannot be constructed.
    pub fn new() -> Result<Self, SessionError> {
        Self::with_config(SessionConfig::default())
    }

    /// Creates a session with explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Build`] when the client cannot be constructed.
    pub fn with_config(config: SessionConfig) -> Result<Self, SessionError> {
        let clients = build_clients(&config, None, None)?;
        Ok(Self {
            config,
            clients: RwLock::new(clients),
            extra_headers: Mutex::new(HeaderMap::new()),
            proxies: Mutex::new((None, None)),
            closed: AtomicBool::new(false),
        })
    }

    /// Issues a retried GET and returns the final response.
    ///
    /// Retryable statuses are consumed up to the retry budget; the last
    /// response is returned regardless of status so callers can inspect it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on close, timeout, or network failure.
    #[instrument(skip(self, params), fields(url = %url))]
    pub async fn get(&self, url: &str, params: &[(&str, String)]) -> Result<Response, SessionError> {
        self.request_with_retry(Method::GET, url, params, None).await
    }

    /// Issues a retried GET with a per-request read timeout override.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on close, timeout, or network failure.
    pub async fn get_with_timeout(
        &self,
        url: &str,
        params: &[(&str, String)],
        timeout: Duration,
    ) -> Result<Response, SessionError> {
        self.request_with_retry(Method::GET, url, params, Some(timeout))
            .await
    }

    /// Issues a retried HEAD request.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on close, timeout, or network failure.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn head(&self, url: &str) -> Result<Response, SessionError> {
        self.request_with_retry(Method::HEAD, url, &[], None).await
    }

    /// Issues a single non-retried request with an arbitrary method.
    ///
    /// Non-idempotent methods are never retried by the session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on close, timeout, or network failure.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<Response, SessionError> {
        self.ensure_open()?;
        let client = self.standard_client();
        self.send_once(&client, method, url, params, None, None).await
    }

    /// Opens a streaming GET against the redirect-refusing client.
    ///
    /// No session-level retry: asset transfers implement their own retry
    /// loop with resume. `range` is forwarded as a `Range` header.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on close, timeout, or network failure.
    #[instrument(skip(self), fields(url = %url, range = range.as_deref().unwrap_or("")))]
    pub async fn get_asset(
        &self,
        url: &str,
        range: Option<String>,
        timeout: Duration,
    ) -> Result<Response, SessionError> {
        self.ensure_open()?;
        let client = {
            let clients = self
                .clients
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            clients.no_redirect.clone()
        };
        self.send_once(&client, Method::GET, url, &[], range, Some(timeout))
            .await
    }

    /// Merges headers into the set sent with every subsequent request.
    ///
    /// Invalid header names or values are skipped with a warning.
    pub fn update_headers(&self, headers: &[(&str, &str)]) {
        let mut extra = self
            .extra_headers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (name, value) in headers {
            match (
                HeaderName::from_str(name),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    extra.insert(name, value);
                }
                _ => warn!(name = %name, "skipping invalid header"),
            }
        }
    }

    /// Replaces the HTTP/HTTPS proxies and rebuilds the connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Build`] when a proxy URL is rejected.
    pub fn set_proxy(
        &self,
        http: Option<&str>,
        https: Option<&str>,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let rebuilt = build_clients(
            &self.config,
            http.map(ToString::to_string),
            https.map(ToString::to_string),
        )?;
        {
            let mut proxies = self
                .proxies
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *proxies = (http.map(ToString::to_string), https.map(ToString::to_string));
        }
        let mut clients = self
            .clients
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *clients = rebuilt;
        Ok(())
    }

    /// Closes the session. Idempotent; subsequent requests fail with
    /// [`SessionError::Closed`]. Pooled connections drop with the clients.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("session closed");
        }
    }

    /// Whether `close()` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn standard_client(&self) -> Client {
        self.clients
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .standard
            .clone()
    }

    async fn send_once(
        &self,
        client: &Client,
        method: Method,
        url: &str,
        params: &[(&str, String)],
        range: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Response, SessionError> {
        let mut request = client.request(method, url);
        if !params.is_empty() {
            request = request.query(params);
        }
        {
            let extra = self
                .extra_headers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for (name, value) in extra.iter() {
                request = request.header(name, value);
            }
        }
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        request
            .send()
            .await
            .map_err(|e| SessionError::from_reqwest(url, e))
    }

    async fn request_with_retry(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> Result<Response, SessionError> {
        self.ensure_open()?;
        let client = self.standard_client();

        let mut attempt: u32 = 0;
        loop {
            self.ensure_open()?;
            let response = self
                .send_once(&client, method.clone(), url, params, None, timeout)
                .await?;

            let status = response.status();
            if !RETRYABLE_STATUSES.contains(&status.as_u16()) || attempt >= MAX_STATUS_RETRIES {
                return Ok(response);
            }

            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let delay = retry_after.unwrap_or_else(|| backoff_delay(attempt));

            attempt += 1;
            debug!(
                url,
                status = status.as_u16(),
                attempt,
                delay_ms = delay.as_millis(),
                using_retry_after = retry_after.is_some(),
                "retrying idempotent request"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Parses a `Retry-After` header value: delta-seconds or an HTTP-date.
///
/// Values above one hour are capped; past dates yield zero.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    let delay = when
        .duration_since(std::time::SystemTime::now())
        .unwrap_or(Duration::ZERO);
    Some(delay.min(MAX_RETRY_AFTER))
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(RETRY_MAX_DELAY);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=250));
    exp + jitter
}

fn build_clients(
    config: &SessionConfig,
    http_proxy: Option<String>,
    https_proxy: Option<String>,
) -> Result<Clients, SessionError> {
    let standard = builder_base(config, http_proxy.as_deref(), https_proxy.as_deref())?
        .redirect(redirect::Policy::limited(10))
        .build()
        .map_err(SessionError::Build)?;
    let no_redirect = builder_base(config, http_proxy.as_deref(), https_proxy.as_deref())?
        .redirect(redirect::Policy::none())
        .build()
        .map_err(SessionError::Build)?;
    Ok(Clients {
        standard,
        no_redirect,
    })
}

fn builder_base(
    config: &SessionConfig,
    http_proxy: Option<&str>,
    https_proxy: Option<&str>,
) -> Result<reqwest::ClientBuilder, SessionError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, image/*;q=0.9, */*;q=0.5"),
    );
    if let Ok(ua) = HeaderValue::from_str(&config.user_agent) {
        headers.insert(USER_AGENT, ua);
    }

    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .timeout(Duration::from_secs(config.read_timeout_secs))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .gzip(true)
        .default_headers(headers)
        .danger_accept_invalid_certs(!config.verify_tls);

    if let Some(proxy) = http_proxy {
        builder = builder.proxy(Proxy::http(proxy).map_err(SessionError::Build)?);
    }
    if let Some(proxy) = https_proxy {
        builder = builder.proxy(Proxy::https(proxy).map_err(SessionError::Build)?);
    }
    Ok(builder)
}

/// Returns whether a status is in the session's retryable set.
#[must_use]
pub fn is_retryable_status(status: StatusCode) -> bool {
    RETRYABLE_STATUSES.contains(&status.as_u16())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_retry_after_caps_excessive_values() {
        assert_eq!(parse_retry_after("999999"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_http_date_in_past() {
        let past = httpdate::fmt_http_date(std::time::SystemTime::UNIX_EPOCH);
        assert_eq!(parse_retry_after(&past), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_garbage() {
        assert_eq!(parse_retry_after("not a delay"), None);
    }

    #[test]
    fn test_is_retryable_status() {
        for code in [429u16, 500, 502, 503, 504] {
            assert!(is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
        for code in [200u16, 404, 416, 301] {
            assert!(!is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[tokio::test]
    async fn test_get_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let session = Session::new().unwrap();
        let response = session
            .get(&format!("{}/posts", server.uri()), &[])
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_get_retries_on_503_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let session = Session::new().unwrap();
        let response = session
            .get(&format!("{}/flaky", server.uri()), &[])
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_get_does_not_retry_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let session = Session::new().unwrap();
        let response = session
            .get(&format!("{}/missing", server.uri()), &[])
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_requests() {
        let session = Session::new().unwrap();
        session.close();
        session.close(); // idempotent

        let result = session.get("https://example.invalid/", &[]).await;
        assert!(matches!(result, Err(SessionError::Closed)));
        let result = session.head("https://example.invalid/").await;
        assert!(matches!(result, Err(SessionError::Closed)));
        let result = session
            .get_asset("https://example.invalid/", None, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_asset_client_refuses_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/asset.jpg"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "/elsewhere.jpg"),
            )
            .mount(&server)
            .await;

        let session = Session::new().unwrap();
        let response = session
            .get_asset(
                &format!("{}/asset.jpg", server.uri()),
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        // The redirect is returned raw, not followed.
        assert_eq!(response.status(), 302);
    }

    #[tokio::test]
    async fn test_asset_request_forwards_range_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/partial.bin"))
            .and(wiremock::matchers::header("Range", "bytes=1024-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![0u8; 16]))
            .expect(1)
            .mount(&server)
            .await;

        let session = Session::new().unwrap();
        let response = session
            .get_asset(
                &format!("{}/partial.bin", server.uri()),
                Some("bytes=1024-".to_string()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 206);
    }

    #[tokio::test]
    async fn test_update_headers_applied_to_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tagged"))
            .and(wiremock::matchers::header("X-Client-Tag", "night-build"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let session = Session::new().unwrap();
        session.update_headers(&[("X-Client-Tag", "night-build")]);
        let response = session
            .get(&format!("{}/tagged", server.uri()), &[])
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_query_params_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts"))
            .and(wiremock::matchers::query_param("limit", "100"))
            .and(wiremock::matchers::query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&server)
            .await;

        let session = Session::new().unwrap();
        let response = session
            .get(
                &format!("{}/posts", server.uri()),
                &[("limit", "100".to_string()), ("page", "2".to_string())],
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
}
