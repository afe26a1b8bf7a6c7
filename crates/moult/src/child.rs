//! Child process runtime.
//!
//! Rebuilds the listeners the supervisor passed down, keeps an eye on the
//! supervisor, and turns the restart signal into a graceful hand-over
//! before running the program.

use std::net::TcpListener as StdTcpListener;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{info_span, Instrument};

use crate::config::Settings;
use crate::env::ChildEnv;
use crate::error::Error;
use crate::listener::GracefulListener;
use crate::log::{gated_debug, Verbosity};
use crate::state::{RuntimeState, ShutdownNotice};
use crate::sys;

/// How often the supervisor's liveness is checked.
const PARENT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub(crate) async fn run(settings: Settings) -> Result<(), Error> {
    let identity = ChildEnv::from_env()?;
    let span = info_span!("child", generation = identity.generation);
    ChildRuntime { settings, identity }.run().instrument(span).await
}

struct ChildRuntime {
    settings: Settings,
    identity: ChildEnv,
}

impl ChildRuntime {
    async fn run(self) -> Result<(), Error> {
        let verbosity = self.settings.verbosity;
        gated_debug!(verbosity, "Run");

        let parent = sys::parent_pid();
        tokio::spawn(watch_parent(parent, verbosity).in_current_span());

        let listeners = inherit_listeners(self.identity.num_fds)?;
        let notice = ShutdownNotice::new();
        let restart = signal(SignalKind::from_raw(self.settings.restart_signal)).map_err(|source| {
            Error::Signal {
                signal: sys::signal_name(self.settings.restart_signal),
                source,
            }
        })?;

        let state = RuntimeState::new(
            self.identity.bin_id.clone(),
            self.identity.generation,
            listeners.clone(),
            self.settings.addresses.clone(),
            notice.clone(),
            self.identity.bin_path.clone(),
        );

        tokio::spawn(
            watch_restart(
                restart,
                parent,
                listeners,
                notice,
                self.settings.terminate_timeout,
                self.settings.no_restart,
                verbosity,
            )
            .in_current_span(),
        );

        (self.settings.program)(state).await;
        gated_debug!(verbosity, "Program returned");
        Ok(())
    }
}

/// Rebuild one listener per inherited descriptor, starting at fd 3.
fn inherit_listeners(count: usize) -> Result<Vec<Arc<GracefulListener>>, Error> {
    (0..count)
        .map(|index| {
            let fd = sys::LISTEN_FD_START + index as RawFd;
            inherit(fd).map(Arc::new)
        })
        .collect()
}

fn inherit(fd: RawFd) -> Result<GracefulListener, Error> {
    let failed = |reason: String| Error::Inherit { fd, reason };
    if !sys::is_socket(fd) {
        return Err(failed("not a socket".into()));
    }
    // SAFETY: the supervisor placed a listening socket at `fd` for this
    // process and nothing else owns it.
    let listener = unsafe { StdTcpListener::from_raw_fd(fd) };
    listener
        .set_nonblocking(true)
        .map_err(|err| failed(err.to_string()))?;
    let listener = TcpListener::from_std(listener).map_err(|err| failed(err.to_string()))?;
    GracefulListener::new(listener).map_err(|err| failed(err.to_string()))
}

/// Exit as soon as the supervisor is gone.
async fn watch_parent(parent: u32, verbosity: Verbosity) {
    let mut ticker = tokio::time::interval(PARENT_POLL_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !sys::parent_alive(parent) {
            gated_debug!(verbosity, parent, "Parent process gone, exiting");
            std::process::exit(1);
        }
    }
}

/// Wait for the restart signal, then hand over.
///
/// The signal stream is dropped after the first delivery; the process has
/// `timeout` from that moment to finish, whether or not the program does.
async fn watch_restart(
    mut restart: Signal,
    parent: u32,
    listeners: Vec<Arc<GracefulListener>>,
    notice: ShutdownNotice,
    timeout: Duration,
    no_restart: bool,
    verbosity: Verbosity,
) {
    if restart.recv().await.is_none() {
        return;
    }
    drop(restart);
    gated_debug!(verbosity, "Graceful shutdown requested");

    tokio::spawn(
        async move {
            tokio::time::sleep(timeout).await;
            gated_debug!(verbosity, timeout_secs = timeout.as_secs(), "Timeout, forcing exit");
            std::process::exit(1);
        }
        .in_current_span(),
    );

    hand_over(parent, &listeners, &notice, timeout, no_restart, verbosity).await;
}

/// Notify the program, release every listener, and tell the parent the
/// descriptors are free so it can start the next generation while these
/// connections drain.
async fn hand_over(
    parent: u32,
    listeners: &[Arc<GracefulListener>],
    notice: &ShutdownNotice,
    timeout: Duration,
    no_restart: bool,
    verbosity: Verbosity,
) {
    notice.notify();

    let drains: Vec<_> = listeners
        .iter()
        .map(|listener| listener.release(timeout))
        .collect();

    if !listeners.is_empty() && !no_restart {
        if let Err(err) = sys::send_signal(parent, sys::ACK_SIGNAL) {
            gated_debug!(verbosity, error = %err, "Failed to signal parent");
        }
    }

    for report in join_all(drains).await.into_iter().flatten() {
        gated_debug!(verbosity, forced = report.forced, "Listener released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdin_is_not_a_listener() {
        let err = inherit(0).unwrap_err();
        assert!(matches!(err, Error::Inherit { fd: 0, .. }));
    }

    #[test]
    fn test_no_inherited_listeners() {
        assert!(inherit_listeners(0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hand_over_releases_listeners_and_acks_parent() {
        // Ack to ourselves so the test observes it.
        let mut ack = signal(SignalKind::from_raw(sys::ACK_SIGNAL)).unwrap();

        let listener = Arc::new(crate::listener::bind("127.0.0.1:0").await.unwrap());
        let notice = ShutdownNotice::new();
        let quiet = Verbosity::new(false, true);

        tokio::time::timeout(
            Duration::from_secs(2),
            hand_over(std::process::id(), &[Arc::clone(&listener)], &notice, Duration::from_secs(1), false, quiet),
        )
        .await
        .expect("hand over finished");

        assert!(notice.is_requested());
        assert!(listener.is_released());
        tokio::time::timeout(Duration::from_secs(2), ack.recv())
            .await
            .expect("parent acknowledged");
    }

    #[tokio::test]
    async fn test_hand_over_without_listeners_does_not_ack() {
        let notice = ShutdownNotice::new();
        hand_over(0x3fff_fff0, &[], &notice, Duration::from_secs(1), false, Verbosity::new(false, true)).await;
        assert!(notice.is_requested());
    }
}
