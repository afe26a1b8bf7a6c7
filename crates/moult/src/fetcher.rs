//! The seam to binary sources.
//!
//! A [`Fetcher`] is polled by the update pipeline. `Ok(None)` means "checked,
//! nothing new"; `Ok(Some(stream))` hands over the bytes of a candidate
//! binary. Concrete sources live in the `moult-fetch` crate.

use std::future::Future;
use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Bytes of a candidate binary.
pub type BinaryStream = Pin<Box<dyn AsyncRead + Send>>;

/// Errors reported by a [`Fetcher`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid fetcher configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Transient(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FetchError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        FetchError::Transient(err.to_string())
    }
}

/// A pluggable source of candidate binaries.
///
/// Implementations own their polling cadence: the pipeline only enforces a
/// floor between two calls to [`Fetcher::fetch`].
#[async_trait]
pub trait Fetcher: Send + 'static {
    /// Validate configuration. Called once, in the supervisor only.
    async fn init(&mut self) -> Result<(), FetchError> {
        Ok(())
    }

    /// Check for a new binary and stream it back when there is one.
    async fn fetch(&mut self) -> Result<Option<BinaryStream>, FetchError>;
}

/// Adapter turning a closure into a [`Fetcher`].
pub struct FnFetcher<F> {
    fetch: F,
}

/// Build a [`Fetcher`] from a closure returning a future.
pub fn from_fn<F, Fut>(fetch: F) -> FnFetcher<F>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<BinaryStream>, FetchError>> + Send + 'static,
{
    FnFetcher { fetch }
}

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<BinaryStream>, FetchError>> + Send + 'static,
{
    async fn fetch(&mut self) -> Result<Option<BinaryStream>, FetchError> {
        (self.fetch)().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_from_fn_streams_closure_output() {
        let mut calls = 0;
        let mut fetcher = from_fn(move || {
            calls += 1;
            let next = calls;
            async move {
                if next == 1 {
                    Ok(None)
                } else {
                    let stream: BinaryStream = Box::pin(std::io::Cursor::new(b"binary".to_vec()));
                    Ok(Some(stream))
                }
            }
        });

        fetcher.init().await.unwrap();
        assert!(fetcher.fetch().await.unwrap().is_none());

        let mut stream = fetcher.fetch().await.unwrap().expect("second call yields a stream");
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"binary");
    }
}
