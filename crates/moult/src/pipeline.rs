//! Update pipeline.
//!
//! One cycle: ask the fetcher for a candidate, stage it while hashing,
//! drop it if nothing changed, copy permissions, let the pre-upgrade hook
//! veto it, run the sanity check, commit, and request a restart. Any
//! failure ends the cycle without touching the running binary; the next
//! cycle simply tries again.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::binary::{BinaryHash, BinaryRecord, BinaryStore, StoreError};
use crate::config::{BoxError, Settings};
use crate::fetcher::{BinaryStream, FetchError, Fetcher};
use crate::log::{gated_debug, gated_warn};
use crate::sanity::SanityError;
use crate::supervisor::Event;

/// Why an upgrade attempt was abandoned.
#[derive(Debug, Error)]
pub(crate) enum UpgradeError {
    #[error("failed to get latest version: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("user cancelled upgrade: {0}")]
    Vetoed(BoxError),

    #[error("sanity check failed: {0}")]
    Sanity(#[from] SanityError),
}

/// How a single cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleOutcome {
    /// A restart was in flight, so the fetcher was not consulted.
    Skipped,
    NoUpdate,
    FetchFailed,
    /// The candidate had the same hash as the running binary.
    Unchanged,
    Rejected,
    Upgraded {
        previous: BinaryHash,
        current: BinaryHash,
    },
}

pub(crate) struct UpdatePipeline {
    fetcher: Box<dyn Fetcher>,
    store: BinaryStore,
    settings: Settings,
    record: watch::Sender<BinaryRecord>,
    restarting: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<Event>,
    announce_check: bool,
}

impl UpdatePipeline {
    pub(crate) fn new(
        fetcher: Box<dyn Fetcher>,
        store: BinaryStore,
        settings: Settings,
        record: watch::Sender<BinaryRecord>,
        restarting: watch::Receiver<bool>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            fetcher,
            store,
            settings,
            record,
            restarting,
            events,
            announce_check: true,
        }
    }

    /// Cycle forever, never faster than the minimum fetch interval.
    ///
    /// The caller is expected to have run one cycle already.
    pub(crate) async fn run(mut self) {
        let floor = self.settings.min_fetch_interval;
        tokio::time::sleep(floor).await;
        loop {
            let started = Instant::now();
            self.run_cycle().await;
            let spent = started.elapsed();
            if spent < floor {
                tokio::time::sleep(floor - spent).await;
            }
        }
    }

    pub(crate) async fn run_cycle(&mut self) -> CycleOutcome {
        let verbosity = self.settings.verbosity;
        if *self.restarting.borrow() {
            gated_debug!(verbosity, "Restart in progress, skipping update check");
            return CycleOutcome::Skipped;
        }

        if self.announce_check {
            gated_debug!(verbosity, "Checking for updates");
        }
        let stream = match self.fetcher.fetch().await {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                if self.announce_check {
                    gated_debug!(verbosity, "No updates");
                }
                self.announce_check = false;
                return CycleOutcome::NoUpdate;
            }
            Err(err) => {
                gated_debug!(verbosity, error = %UpgradeError::from(err), "Update check failed");
                return CycleOutcome::FetchFailed;
            }
        };
        self.announce_check = true;

        gated_debug!(verbosity, "Streaming update");
        match self.upgrade(stream).await {
            Ok(Some((previous, current))) => CycleOutcome::Upgraded { previous, current },
            Ok(None) => CycleOutcome::Unchanged,
            Err(err) => {
                gated_warn!(verbosity, "Upgrade aborted: {err}");
                CycleOutcome::Rejected
            }
        }
    }

    async fn upgrade(
        &mut self,
        stream: BinaryStream,
    ) -> Result<Option<(BinaryHash, BinaryHash)>, UpgradeError> {
        let verbosity = self.settings.verbosity;
        let staged = self.store.stage(stream).await?;
        if staged.hash() == self.store.record().hash {
            gated_debug!(verbosity, "Hash match, skipping");
            return Ok(None);
        }

        self.store.prepare(&staged)?;
        if let Some(hook) = &self.settings.pre_upgrade {
            hook(staged.path()).map_err(UpgradeError::Vetoed)?;
        }
        self.store
            .verify(&staged, self.settings.verify_timeout)
            .await?;

        let previous = self.store.commit(staged).await?;
        let current = self.store.record().hash;
        gated_debug!(
            verbosity,
            previous = %previous.short(),
            current = %current.short(),
            "Upgraded binary"
        );
        self.record.send_replace(self.store.record().clone());

        if self.settings.restart_after_fetch() {
            let _ = self.events.send(Event::Restart);
        }
        Ok(Some((previous, current)))
    }

    #[cfg(test)]
    fn store(&self) -> &BinaryStore {
        &self.store
    }
}
