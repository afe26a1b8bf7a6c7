use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use moult::{BinaryStream, FetchError, Fetcher};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{Attribute, ObjectStore};
use tracing::debug;

use crate::body::{into_binary, wants_gunzip};

const DEFAULT_REGION: &str = "ap-southeast-2";
const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls an S3 object and downloads it whenever its ETag changes.
///
/// Credentials fall back to the usual `AWS_*` environment variables. Keys
/// ending in `.gz` are inflated while streaming.
pub struct S3Fetcher {
    bucket: String,
    key: String,
    region: String,
    credentials: Option<(String, String)>,
    interval: Duration,
    head_timeout: Duration,
    store: Option<Arc<dyn ObjectStore>>,
    last_etag: Option<String>,
    seen: bool,
    delay: bool,
}

impl S3Fetcher {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            region: DEFAULT_REGION.to_string(),
            credentials: None,
            interval: DEFAULT_INTERVAL,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
            store: None,
            last_etag: None,
            seen: false,
            delay: false,
        }
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn credentials(mut self, access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        self.credentials = Some((access_key.into(), secret_key.into()));
        self
    }

    /// Time between checks. Defaults to five minutes.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Upper bound on the metadata request of each check.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.head_timeout = timeout;
        self
    }

    /// Use an already configured store instead of building an S3 client.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn build_store(&self) -> Result<Arc<dyn ObjectStore>, FetchError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&self.bucket)
            .with_region(&self.region);
        if let Some((access_key, secret_key)) = &self.credentials {
            builder = builder
                .with_access_key_id(access_key)
                .with_secret_access_key(secret_key);
        }
        let store = builder
            .build()
            .map_err(|err| FetchError::InvalidConfig(format!("S3 client: {err}")))?;
        Ok(Arc::new(store))
    }
}

#[async_trait]
impl Fetcher for S3Fetcher {
    async fn init(&mut self) -> Result<(), FetchError> {
        if self.bucket.is_empty() {
            return Err(FetchError::InvalidConfig("S3 bucket not set".into()));
        }
        if self.key.is_empty() {
            return Err(FetchError::InvalidConfig("S3 key not set".into()));
        }
        if self.store.is_none() {
            self.store = Some(self.build_store()?);
        }
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Option<BinaryStream>, FetchError> {
        if self.delay {
            tokio::time::sleep(self.interval).await;
        }
        self.delay = true;

        let store = match &self.store {
            Some(store) => Arc::clone(store),
            None => return Err(FetchError::InvalidConfig("fetcher not initialised".into())),
        };
        let location = Path::from(self.key.as_str());

        let meta = tokio::time::timeout(self.head_timeout, store.head(&location))
            .await
            .map_err(|_| FetchError::transient("HEAD request timed out"))?
            .map_err(|err| FetchError::transient(format!("HEAD request failed ({err})")))?;
        let etag = meta.e_tag.map(|tag| tag.trim_matches('"').to_string());
        if self.seen && etag == self.last_etag {
            debug!(bucket = %self.bucket, key = %self.key, "Object unchanged");
            return Ok(None);
        }

        let object = store
            .get(&location)
            .await
            .map_err(|err| FetchError::transient(format!("GET request failed ({err})")))?;
        let encoding = object
            .attributes
            .get(&Attribute::ContentEncoding)
            .map(|value| AsRef::<str>::as_ref(value).to_owned());
        let gunzip = wants_gunzip(&self.key, encoding.as_deref());
        debug!(bucket = %self.bucket, key = %self.key, etag = ?etag, gunzip, "Downloading object");

        self.last_etag = etag;
        self.seen = true;

        let body = object.into_stream().map_err(io::Error::other);
        Ok(Some(into_binary(body, gunzip)))
    }
}
