//! Bootstrap errors.
//!
//! Everything in here means the supervision contract cannot be honoured:
//! the caller either aborts or falls back to running the program without
//! upgrade support. Failures inside an upgrade cycle never surface here;
//! the pipeline logs them and retries on the next interval.

use std::io;

use thiserror::Error;

use crate::binary::StoreError;

/// Errors returned by [`crate::run_err`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Binary(#[from] StoreError),

    #[error("os ({0}) not supported")]
    UnsupportedPlatform(&'static str),

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to retrieve descriptor for {address}: {source}")]
    Descriptor {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to register handler for {signal}: {source}")]
    Signal {
        signal: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to start child process: {0}")]
    Spawn(#[source] io::Error),

    #[error("invalid {name} value {value:?}")]
    ChildEnvironment { name: &'static str, value: String },

    #[error("failed to inherit file descriptor {fd}: {reason}")]
    Inherit { fd: i32, reason: String },
}
