//! # moult
//!
//! Self-upgrading supervision for long-running network services.
//!
//! ## Overview
//!
//! [`run`] turns the calling binary into a small process tree:
//! 1. A supervisor binds the configured addresses once and keeps them open
//! 2. A child process runs the program against inherited copies of those sockets
//! 3. The supervisor polls a [`Fetcher`] for new binaries, sanity-checks each
//!    candidate and moves it over the running executable
//! 4. The child is asked to hand over; it stops accepting, the supervisor forks
//!    the next generation right away, and the old child drains in parallel
//!
//! ## Startup contract
//!
//! Every binary built on this crate must reach [`run`] early, or call
//! [`answer_sanity_check`] before any fallible startup work. When
//! `MOULT_BIN_CHECK` is set, the process prints its value to stdout and exits
//! zero without starting the program; staged binaries that fail this check
//! never replace the running one.
//!
//! ## Environment Variables
//!
//! - `MOULT_IS_CHILD`: set to `1` in supervised children
//! - `MOULT_GENERATION`: sequential child number, starting at 1
//! - `MOULT_NUM_FDS`: number of inherited listeners (starting at fd 3)
//! - `MOULT_BIN_ID`: hex SHA-256 of the binary the child runs
//! - `MOULT_BIN_PATH`: path of that binary
//! - `MOULT_BIN_CHECK`: sanity-check token
//!
//! ## Signal Conventions
//!
//! - `SIGUSR2` (configurable): graceful restart
//! - `SIGUSR1`: child to supervisor: listeners released
//! - everything else the supervisor receives is forwarded to the child
//!
//! ## Platform
//!
//! Supervision requires Unix. Elsewhere [`run`] falls back to running the
//! program unsupervised.

mod binary;
mod config;
mod env;
mod error;
pub mod fetcher;
mod listener;
mod log;
mod sanity;
mod state;
mod sys;

#[cfg(unix)]
mod child;
#[cfg(unix)]
mod pipeline;
#[cfg(unix)]
mod supervisor;

use std::io::Write;

pub use binary::{BinaryHash, BinaryRecord, BinaryStore, StagedBinary, StoreError};
pub use config::{
    BoxError, Config, Program, DEFAULT_MIN_FETCH_INTERVAL, DEFAULT_TERMINATE_TIMEOUT,
    DEFAULT_VERIFY_TIMEOUT,
};
pub use error::Error;
pub use fetcher::{BinaryStream, FetchError, Fetcher};
pub use listener::{DrainReport, GracefulListener, TrackedStream};
pub use sanity::SanityError;
pub use state::{RuntimeState, ShutdownNotice};
pub use sys::signal_from_name;

use config::Settings;
use log::gated_warn;

/// Run the program under supervision.
///
/// Never returns on success: the process exits with the child's exit code
/// in the supervisor and with zero in the child. If supervision can't be
/// set up, a `required` configuration exits with status 1; otherwise the
/// program runs once, unsupervised, and this function returns after it.
pub async fn run(config: Config) {
    let required = config.is_required();
    let verbosity = config.verbosity();
    let program = config.program();
    let addresses = config.raw_addresses();

    match run_err(config).await {
        Ok(()) => std::process::exit(0),
        Err(err) if required => {
            tracing::error!(error = %err, "Supervisor failed to start");
            std::process::exit(1);
        }
        Err(err) => {
            gated_warn!(verbosity, error = %err, "Disabled, run failed");
            program(RuntimeState::disabled(addresses).await).await;
        }
    }
}

/// Like [`run`], but bootstrap errors are returned instead of handled.
///
/// Returns `Ok` once a sanity check has been answered or the program
/// returned in a child. A supervisor exits the process itself.
pub async fn run_err(config: Config) -> Result<(), Error> {
    if write_sanity_answer() {
        return Ok(());
    }

    let (settings, fetcher) = config.validate()?;
    if !sys::SUPPORTED {
        return Err(Error::UnsupportedPlatform(std::env::consts::OS));
    }
    supervise(settings, fetcher).await
}

/// Answer a pending sanity check and exit, or return if none is pending.
///
/// Binaries that load settings or otherwise can fail before reaching [`run`]
/// call this first, so a staged build is judged on whether it starts, not on
/// the environment it is verified in.
pub fn answer_sanity_check() {
    if write_sanity_answer() {
        std::process::exit(0);
    }
}

fn write_sanity_answer() -> bool {
    let Some(token) = env::sanity_token() else {
        return false;
    };
    let mut stdout = std::io::stdout().lock();
    // Nothing to report to if stdout is gone; the check fails either way.
    let _ = stdout.write_all(token.as_bytes()).and_then(|()| stdout.flush());
    true
}

#[cfg(unix)]
async fn supervise(settings: Settings, fetcher: Option<Box<dyn Fetcher>>) -> Result<(), Error> {
    if env::is_child() {
        return child::run(settings).await;
    }
    let code = supervisor::Supervisor::new(settings, fetcher).run().await?;
    std::process::exit(code)
}

#[cfg(not(unix))]
async fn supervise(_settings: Settings, _fetcher: Option<Box<dyn Fetcher>>) -> Result<(), Error> {
    Err(Error::UnsupportedPlatform(std::env::consts::OS))
}
