use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use moult::{BinaryStream, FetchError, Fetcher};
use tracing::debug;

const MIN_INTERVAL: Duration = Duration::from_secs(1);
const SETTLE_RATE: Duration = Duration::from_millis(250);
const SETTLE_LIMIT: Duration = Duration::from_secs(5);

/// Modification time and size; a change in either means a new file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    size: u64,
}

/// Watches a path on the local filesystem for a new binary.
///
/// A missing file is not an error: the fetcher keeps waiting for it to
/// appear. A file that is still being written is re-checked until it stops
/// changing.
#[derive(Debug)]
pub struct FileFetcher {
    path: PathBuf,
    interval: Duration,
    fingerprint: Option<Fingerprint>,
    delay: bool,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interval: MIN_INTERVAL,
            fingerprint: None,
            delay: false,
        }
    }

    /// Time between checks. Anything below one second is raised to it.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    async fn refresh(&mut self) -> Result<(), FetchError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => {
                self.fingerprint = Some(Fingerprint {
                    modified: meta.modified().ok(),
                    size: meta.len(),
                });
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(FetchError::transient(format!("stat file error: {err}"))),
        }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn init(&mut self) -> Result<(), FetchError> {
        if self.path.as_os_str().is_empty() {
            return Err(FetchError::InvalidConfig("path required".into()));
        }
        self.interval = self.interval.max(MIN_INTERVAL);
        self.refresh().await
    }

    async fn fetch(&mut self) -> Result<Option<BinaryStream>, FetchError> {
        if self.delay {
            tokio::time::sleep(self.interval).await;
        }
        self.delay = true;

        let mut last = self.fingerprint;
        self.refresh().await?;
        if last == self.fingerprint {
            return Ok(None);
        }

        // Wait for the file to stop changing in case it is mid-copy.
        let attempts = SETTLE_LIMIT.as_millis() / SETTLE_RATE.as_millis();
        let mut attempt = 1;
        loop {
            if attempt == attempts {
                return Err(FetchError::transient("file is currently being changed"));
            }
            attempt += 1;
            tokio::time::sleep(SETTLE_RATE).await;
            last = self.fingerprint;
            self.refresh().await?;
            if last == self.fingerprint {
                break;
            }
        }

        debug!(path = %self.path.display(), "File changed");
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Some(Box::pin(file)))
    }
}
