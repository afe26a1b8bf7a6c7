//! Supervisor configuration.
//!
//! [`Config`] is built by the embedding binary and handed to
//! [`crate::run`]. Validation turns it into [`Settings`], the read-only
//! view shared by the supervisor, the update pipeline and the child
//! runtime.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::Error;
use crate::fetcher::Fetcher;
use crate::log::Verbosity;
use crate::state::RuntimeState;
use crate::sys;

/// Boxed error returned by user hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The service body. Runs once per child process.
pub type Program = Arc<dyn Fn(RuntimeState) -> BoxFuture<'static, ()> + Send + Sync>;

/// Veto point before a staged binary is committed.
pub type PreUpgrade = Arc<dyn Fn(&Path) -> Result<(), BoxError> + Send + Sync>;

pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MIN_FETCH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a supervised, self-upgrading program.
pub struct Config {
    program: Program,
    address: Option<String>,
    addresses: Vec<String>,
    restart_signal: Option<i32>,
    terminate_timeout: Option<Duration>,
    min_fetch_interval: Option<Duration>,
    verify_timeout: Option<Duration>,
    pre_upgrade: Option<PreUpgrade>,
    fetcher: Option<Box<dyn Fetcher>>,
    staging_dir: Option<PathBuf>,
    required: bool,
    no_restart: bool,
    no_restart_after_fetch: bool,
    debug: bool,
    no_warn: bool,
}

impl Config {
    pub fn new<F, Fut>(program: F) -> Self
    where
        F: Fn(RuntimeState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            program: Arc::new(move |state: RuntimeState| program(state).boxed()),
            address: None,
            addresses: Vec::new(),
            restart_signal: None,
            terminate_timeout: None,
            min_fetch_interval: None,
            verify_timeout: None,
            pre_upgrade: None,
            fetcher: None,
            staging_dir: None,
            required: false,
            no_restart: false,
            no_restart_after_fetch: false,
            debug: false,
            no_warn: false,
        }
    }

    /// Single zero-downtime listening address. Set this or [`Config::addresses`].
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Zero-downtime listening addresses, inherited by children in this order.
    pub fn addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Signal that triggers a graceful restart. Defaults to `SIGUSR2`.
    pub fn restart_signal(mut self, signal: i32) -> Self {
        self.restart_signal = Some(signal);
        self
    }

    /// How long a child gets to wind down before it is killed.
    pub fn terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = Some(timeout);
        self
    }

    /// Floor between two fetches. Fetchers throttle themselves beyond this.
    pub fn min_fetch_interval(mut self, interval: Duration) -> Self {
        self.min_fetch_interval = Some(interval);
        self
    }

    /// How long a staged binary gets to answer the sanity check.
    pub fn verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = Some(timeout);
        self
    }

    /// Runs against every staged binary; an error cancels the upgrade.
    pub fn pre_upgrade<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Path) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.pre_upgrade = Some(Arc::new(hook));
        self
    }

    pub fn fetcher(mut self, fetcher: impl Fetcher) -> Self {
        self.fetcher = Some(Box::new(fetcher));
        self
    }

    pub fn boxed_fetcher(mut self, fetcher: Box<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Directory new binaries are staged in. Defaults to the directory of
    /// the running binary, which keeps the final move a plain rename.
    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Refuse to fall back to running the program unsupervised.
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Disable restarts entirely; the restart signal becomes a shutdown signal.
    pub fn no_restart(mut self, no_restart: bool) -> Self {
        self.no_restart = no_restart;
        self
    }

    /// Keep running the old binary after an upgrade until a manual restart.
    pub fn no_restart_after_fetch(mut self, no_restart_after_fetch: bool) -> Self {
        self.no_restart_after_fetch = no_restart_after_fetch;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn no_warn(mut self, no_warn: bool) -> Self {
        self.no_warn = no_warn;
        self
    }

    pub(crate) fn is_required(&self) -> bool {
        self.required
    }

    pub(crate) fn verbosity(&self) -> Verbosity {
        Verbosity::new(self.debug, self.no_warn)
    }

    pub(crate) fn program(&self) -> Program {
        Arc::clone(&self.program)
    }

    /// Listening addresses as given, without validation.
    pub(crate) fn raw_addresses(&self) -> Vec<String> {
        match &self.address {
            Some(address) => vec![address.clone()],
            None => self.addresses.clone(),
        }
    }

    /// Apply defaults and reject ambiguous or unusable settings.
    pub(crate) fn validate(self) -> Result<(Settings, Option<Box<dyn Fetcher>>), Error> {
        let addresses = match (self.address, self.addresses.is_empty()) {
            (Some(_), false) => {
                return Err(Error::InvalidConfig(
                    "address and addresses can't both be set".into(),
                ))
            }
            (Some(address), true) => vec![address],
            (None, _) => self.addresses,
        };

        let restart_signal = self.restart_signal.unwrap_or(sys::DEFAULT_RESTART_SIGNAL);
        if restart_signal == sys::ACK_SIGNAL {
            return Err(Error::InvalidConfig(format!(
                "restart signal {} is reserved for the restart handshake",
                sys::signal_name(restart_signal)
            )));
        }
        if restart_signal <= 0 || sys::UNCATCHABLE_SIGNALS.contains(&restart_signal) {
            return Err(Error::InvalidConfig(format!(
                "restart signal {} can't be handled",
                sys::signal_name(restart_signal)
            )));
        }

        let settings = Settings {
            program: self.program,
            addresses,
            restart_signal,
            terminate_timeout: positive_or(self.terminate_timeout, DEFAULT_TERMINATE_TIMEOUT),
            min_fetch_interval: positive_or(self.min_fetch_interval, DEFAULT_MIN_FETCH_INTERVAL),
            verify_timeout: positive_or(self.verify_timeout, DEFAULT_VERIFY_TIMEOUT),
            pre_upgrade: self.pre_upgrade,
            staging_dir: self.staging_dir,
            no_restart: self.no_restart,
            no_restart_after_fetch: self.no_restart_after_fetch,
            verbosity: Verbosity::new(self.debug, self.no_warn),
        };
        Ok((settings, self.fetcher))
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("address", &self.address)
            .field("addresses", &self.addresses)
            .field("restart_signal", &self.restart_signal)
            .field("terminate_timeout", &self.terminate_timeout)
            .field("min_fetch_interval", &self.min_fetch_interval)
            .field("verify_timeout", &self.verify_timeout)
            .field("fetcher", &self.fetcher.is_some())
            .field("pre_upgrade", &self.pre_upgrade.is_some())
            .field("staging_dir", &self.staging_dir)
            .field("required", &self.required)
            .field("no_restart", &self.no_restart)
            .field("no_restart_after_fetch", &self.no_restart_after_fetch)
            .field("debug", &self.debug)
            .field("no_warn", &self.no_warn)
            .finish()
    }
}

fn positive_or(value: Option<Duration>, default: Duration) -> Duration {
    value.filter(|d| !d.is_zero()).unwrap_or(default)
}

/// Validated configuration, read-only after startup.
#[derive(Clone)]
pub(crate) struct Settings {
    pub program: Program,
    pub addresses: Vec<String>,
    pub restart_signal: i32,
    pub terminate_timeout: Duration,
    pub min_fetch_interval: Duration,
    pub verify_timeout: Duration,
    pub pre_upgrade: Option<PreUpgrade>,
    pub staging_dir: Option<PathBuf>,
    pub no_restart: bool,
    pub no_restart_after_fetch: bool,
    pub verbosity: Verbosity,
}

impl Settings {
    /// Whether a committed upgrade should restart the child right away.
    pub(crate) fn restart_after_fetch(&self) -> bool {
        !self.no_restart && !self.no_restart_after_fetch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new(|_state| async {})
    }

    #[test]
    fn test_defaults_applied() {
        let (settings, fetcher) = config().validate().unwrap();
        assert!(fetcher.is_none());
        assert!(settings.addresses.is_empty());
        assert_eq!(settings.restart_signal, sys::DEFAULT_RESTART_SIGNAL);
        assert_eq!(settings.terminate_timeout, DEFAULT_TERMINATE_TIMEOUT);
        assert_eq!(settings.min_fetch_interval, DEFAULT_MIN_FETCH_INTERVAL);
        assert_eq!(settings.verify_timeout, DEFAULT_VERIFY_TIMEOUT);
        assert!(settings.restart_after_fetch());
    }

    #[test]
    fn test_zero_durations_fall_back_to_defaults() {
        let (settings, _) = config()
            .terminate_timeout(Duration::ZERO)
            .min_fetch_interval(Duration::ZERO)
            .validate()
            .unwrap();
        assert_eq!(settings.terminate_timeout, DEFAULT_TERMINATE_TIMEOUT);
        assert_eq!(settings.min_fetch_interval, DEFAULT_MIN_FETCH_INTERVAL);
    }

    #[test]
    fn test_single_address_becomes_list() {
        let (settings, _) = config().address("127.0.0.1:3000").validate().unwrap();
        assert_eq!(settings.addresses, vec!["127.0.0.1:3000".to_string()]);
    }

    #[test]
    fn test_address_and_addresses_rejected() {
        let err = config()
            .address(":3000")
            .addresses([":3001"])
            .validate()
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidConfig(msg) if msg.contains("both")));
    }

    #[test]
    fn test_restart_signal_cannot_be_ack_signal() {
        let err = config().restart_signal(sys::ACK_SIGNAL).validate().err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(msg) if msg.contains("reserved")));
    }

    #[test]
    fn test_restart_signal_must_be_catchable() {
        for signal in sys::UNCATCHABLE_SIGNALS {
            assert!(config().restart_signal(*signal).validate().is_err());
        }
    }

    #[test]
    fn test_no_restart_suppresses_restart_after_fetch() {
        let (settings, _) = config().no_restart(true).validate().unwrap();
        assert!(!settings.restart_after_fetch());
        let (settings, _) = config().no_restart_after_fetch(true).validate().unwrap();
        assert!(!settings.restart_after_fetch());
    }
}
