//! # moult-fetch
//!
//! Binary sources for [`moult`].
//!
//! Each fetcher polls one place for a newer build and streams it back to the
//! update pipeline when it finds one:
//! - [`FileFetcher`]: a path on the local filesystem
//! - [`HttpFetcher`]: a URL, checked with `HEAD` before downloading
//! - [`S3Fetcher`]: an S3 object, checked by ETag
//! - [`Multiple`]: several of the above, first answer wins
//!
//! Fetchers own their polling cadence. Every call after the first waits for
//! the configured interval before checking again.

mod body;
mod file;
mod http;
mod multiple;
mod s3;

pub use file::FileFetcher;
pub use http::{HttpFetcher, DEFAULT_CHECK_HEADERS};
pub use moult::fetcher::{from_fn, BinaryStream, FetchError, Fetcher};
pub use multiple::Multiple;
pub use s3::S3Fetcher;
