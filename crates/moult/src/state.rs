//! What the program sees.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::listener::GracefulListener;

/// One-shot notification that the supervisor wants this process gone.
///
/// Fires at most once; every clone observes the same notification.
#[derive(Debug, Clone, Default)]
pub struct ShutdownNotice {
    token: CancellationToken,
}

impl ShutdownNotice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves once a graceful shutdown has been requested.
    pub async fn requested(&self) {
        self.token.cancelled().await
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn notify(&self) {
        self.token.cancel();
    }
}

/// Snapshot handed to the program when it starts.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    /// Whether the program runs supervised. When enabled it runs in a child
    /// process and upgrades replace it without dropping the listeners.
    pub enabled: bool,
    /// Hex SHA-256 of the binary this process was started from.
    pub id: String,
    /// Sequential child number; zero when unsupervised.
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    /// First entry of `listeners`.
    pub listener: Option<Arc<GracefulListener>>,
    /// Sockets bound by the supervisor, in configuration order.
    pub listeners: Vec<Arc<GracefulListener>>,
    /// First entry of `addresses`.
    pub address: Option<String>,
    pub addresses: Vec<String>,
    pub graceful_shutdown: ShutdownNotice,
    pub bin_path: Option<PathBuf>,
}

impl RuntimeState {
    pub(crate) fn new(
        id: String,
        generation: u64,
        listeners: Vec<Arc<GracefulListener>>,
        addresses: Vec<String>,
        graceful_shutdown: ShutdownNotice,
        bin_path: Option<PathBuf>,
    ) -> Self {
        Self {
            enabled: true,
            id,
            generation,
            started_at: Utc::now(),
            listener: listeners.first().cloned(),
            listeners,
            address: addresses.first().cloned(),
            addresses,
            graceful_shutdown,
            bin_path,
        }
    }

    /// State for running the program without supervision.
    ///
    /// The configured addresses are bound in-process so the program still
    /// has something to serve on; addresses that fail to bind are skipped.
    pub async fn disabled(addresses: Vec<String>) -> Self {
        let mut listeners = Vec::with_capacity(addresses.len());
        for address in &addresses {
            match crate::listener::bind(address).await {
                Ok(listener) => listeners.push(Arc::new(listener)),
                Err(err) => warn!(address = %address, error = %err, "Failed to bind listener"),
            }
        }

        Self {
            enabled: false,
            id: String::new(),
            generation: 0,
            started_at: Utc::now(),
            listener: listeners.first().cloned(),
            listeners,
            address: addresses.first().cloned(),
            addresses,
            graceful_shutdown: ShutdownNotice::new(),
            bin_path: std::env::current_exe().ok(),
        }
    }
}
