use std::collections::HashMap;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use moult::{BinaryStream, BoxError, FetchError, Fetcher};
use reqwest::header::CONTENT_ENCODING;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::body::{into_binary, wants_gunzip};

/// Response headers that identify a particular build. If any of them
/// changes between two `HEAD` requests, the binary is downloaded.
pub const DEFAULT_CHECK_HEADERS: &[&str] =
    &["ETag", "If-Modified-Since", "Last-Modified", "Content-Length"];

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

enum UrlSource {
    Fixed(String),
    Dynamic(Box<dyn FnMut() -> Result<String, BoxError> + Send>),
}

/// Polls a URL with `HEAD` and downloads it with `GET` when it changes.
///
/// URLs ending in `.gz` are inflated on the fly unless the server already
/// marks the response as gzip-encoded.
pub struct HttpFetcher {
    source: UrlSource,
    interval: Duration,
    check_headers: Vec<String>,
    client: Client,
    lasts: HashMap<String, String>,
    delay: bool,
}

impl HttpFetcher {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_source(UrlSource::Fixed(url.into()))
    }

    /// Resolve the URL anew before every check.
    pub fn with_url_fn<F>(url_fn: F) -> Self
    where
        F: FnMut() -> Result<String, BoxError> + Send + 'static,
    {
        Self::with_source(UrlSource::Dynamic(Box::new(url_fn)))
    }

    fn with_source(source: UrlSource) -> Self {
        Self {
            source,
            interval: Duration::ZERO,
            check_headers: Vec::new(),
            client: Client::new(),
            lasts: HashMap::new(),
            delay: false,
        }
    }

    /// Time between checks. Defaults to five minutes.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn check_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.check_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    pub fn client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn url(&mut self) -> Result<String, FetchError> {
        match &mut self.source {
            UrlSource::Fixed(url) => Ok(url.clone()),
            UrlSource::Dynamic(url_fn) => url_fn().map_err(FetchError::transient),
        }
    }

    /// Record the current check headers; true when all of them match the
    /// previous response.
    fn unchanged(&mut self, headers: &reqwest::header::HeaderMap) -> bool {
        let (mut matches, mut total) = (0, 0);
        for name in &self.check_headers {
            let Some(current) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            if current.is_empty() {
                continue;
            }
            if self.lasts.get(name).is_some_and(|last| last == current) {
                matches += 1;
            }
            self.lasts.insert(name.clone(), current.to_string());
            total += 1;
        }
        matches == total
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn init(&mut self) -> Result<(), FetchError> {
        if matches!(&self.source, UrlSource::Fixed(url) if url.is_empty()) {
            return Err(FetchError::InvalidConfig("URL or URL function required".into()));
        }
        if self.interval.is_zero() {
            self.interval = DEFAULT_INTERVAL;
        }
        if self.check_headers.is_empty() {
            self.check_headers = DEFAULT_CHECK_HEADERS.iter().map(|h| h.to_string()).collect();
        }
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Option<BinaryStream>, FetchError> {
        if self.delay {
            tokio::time::sleep(self.interval).await;
        }
        self.delay = true;

        let url = self.url()?;

        let head = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|err| FetchError::transient(format!("HEAD request failed ({err})")))?;
        if head.status() != StatusCode::OK {
            return Err(FetchError::transient(format!(
                "HEAD request failed (status code {})",
                head.status().as_u16()
            )));
        }
        if self.unchanged(head.headers()) {
            debug!(url = %url, "Remote binary unchanged");
            return Ok(None);
        }

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| FetchError::transient(format!("GET request failed ({err})")))?;
        if response.status() != StatusCode::OK {
            return Err(FetchError::transient(format!(
                "GET request failed (status code {})",
                response.status().as_u16()
            )));
        }

        let encoding = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let gunzip = wants_gunzip(&url, encoding.as_deref());
        debug!(url = %url, gunzip, "Downloading binary");

        let body = response.bytes_stream().map_err(io::Error::other);
        Ok(Some(into_binary(body, gunzip)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::AsyncReadExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn read_all(mut stream: BinaryStream) -> Vec<u8> {
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        body
    }

    async fn mount_head(server: &MockServer, route: &str, etag: &str, times: u64) {
        Mock::given(method("HEAD"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", etag))
            .up_to_n_times(times)
            .mount(server)
            .await;
    }

    async fn mount_get(server: &MockServer, route: &str, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    async fn fetcher(url: String) -> HttpFetcher {
        let mut fetcher = HttpFetcher::new(url).interval(Duration::from_millis(10));
        fetcher.init().await.unwrap();
        fetcher
    }

    #[tokio::test]
    async fn test_missing_url_is_invalid() {
        let err = HttpFetcher::new("").init().await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_defaults_applied_on_init() {
        let fetcher = fetcher("http://localhost/app".into()).await;
        assert_eq!(fetcher.interval, Duration::from_millis(10));
        assert_eq!(fetcher.check_headers.len(), DEFAULT_CHECK_HEADERS.len());

        let mut fetcher = HttpFetcher::new("http://localhost/app");
        fetcher.init().await.unwrap();
        assert_eq!(fetcher.interval, DEFAULT_INTERVAL);
    }

    #[tokio::test]
    async fn test_downloads_only_when_headers_change() {
        let server = MockServer::start().await;
        mount_head(&server, "/app", "\"v1\"", 2).await;
        mount_head(&server, "/app", "\"v2\"", 10).await;
        mount_get(&server, "/app", b"binary bytes").await;

        let mut fetcher = fetcher(format!("{}/app", server.uri())).await;

        let first = fetcher.fetch().await.unwrap().expect("first check downloads");
        assert_eq!(read_all(first).await, b"binary bytes");
        assert!(fetcher.fetch().await.unwrap().is_none());
        assert!(fetcher.fetch().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_gz_url_is_inflated() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"compressed binary").unwrap();
        let gz = encoder.finish().unwrap();

        let server = MockServer::start().await;
        mount_head(&server, "/app.gz", "\"v1\"", 10).await;
        mount_get(&server, "/app.gz", &gz).await;

        let mut fetcher = fetcher(format!("{}/app.gz", server.uri())).await;
        let stream = fetcher.fetch().await.unwrap().unwrap();
        assert_eq!(read_all(stream).await, b"compressed binary");
    }

    #[tokio::test]
    async fn test_failed_head_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut fetcher = fetcher(format!("{}/app", server.uri())).await;
        let err = fetcher.fetch().await.err().unwrap();
        assert!(matches!(err, FetchError::Transient(msg) if msg.contains("404")));
    }

    #[tokio::test]
    async fn test_url_function_is_called_per_check() {
        let server = MockServer::start().await;
        mount_head(&server, "/b", "\"v1\"", 10).await;
        mount_get(&server, "/b", b"from b").await;

        let base = server.uri();
        let mut fetcher = HttpFetcher::with_url_fn(move || Ok(format!("{base}/b")))
            .interval(Duration::from_millis(10));
        fetcher.init().await.unwrap();
        let stream = fetcher.fetch().await.unwrap().unwrap();
        assert_eq!(read_all(stream).await, b"from b");
    }
}
