//! Layered settings for the demo.
//!
//! Precedence, lowest first: built-in defaults, an optional TOML file,
//! `MOULT_DEMO_*` environment variables, command-line flags.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Self-upgrading TCP greeter
#[derive(Debug, Default, Parser)]
#[command(name = "moult-demo")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML settings file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to serve on (repeatable, e.g. 127.0.0.1:3000 or :3000)
    #[arg(short, long = "listen")]
    pub listen: Vec<String>,

    /// Watch this file for new builds
    #[arg(short, long)]
    pub watch: Option<PathBuf>,

    /// Poll this URL for new builds
    #[arg(short, long)]
    pub url: Option<String>,

    /// S3 bucket holding new builds (requires --s3-key)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// S3 object key of new builds
    #[arg(long)]
    pub s3_key: Option<String>,

    /// How often remote sources are polled (e.g. 30s, 5m)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub fetch_interval: Option<Duration>,

    /// Drain deadline for a retiring generation
    #[arg(long, value_parser = humantime::parse_duration)]
    pub terminate_timeout: Option<Duration>,

    /// Restart signal name or number
    #[arg(long)]
    pub restart_signal: Option<String>,

    /// Exit instead of running unsupervised when supervision fails
    #[arg(long)]
    pub required: bool,

    /// Stop when the child exits instead of restarting it
    #[arg(long)]
    pub no_restart: bool,

    /// Install new builds without restarting
    #[arg(long)]
    pub no_restart_after_fetch: bool,

    /// Verbose supervisor logging
    #[arg(long)]
    pub debug: bool,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct S3Settings {
    pub bucket: String,
    pub key: String,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub listen: Vec<String>,
    pub watch: Option<PathBuf>,
    pub url: Option<String>,
    pub s3: Option<S3Settings>,
    #[serde(with = "humantime_serde")]
    pub fetch_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub terminate_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub min_fetch_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub verify_timeout: Duration,
    pub restart_signal: String,
    pub required: bool,
    pub no_restart: bool,
    pub no_restart_after_fetch: bool,
    pub debug: bool,
    pub no_warn: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: vec!["127.0.0.1:3000".into()],
            watch: None,
            url: None,
            s3: None,
            fetch_interval: Duration::from_secs(5 * 60),
            terminate_timeout: moult::DEFAULT_TERMINATE_TIMEOUT,
            min_fetch_interval: moult::DEFAULT_MIN_FETCH_INTERVAL,
            verify_timeout: moult::DEFAULT_VERIFY_TIMEOUT,
            restart_signal: "SIGUSR2".into(),
            required: false,
            no_restart: false,
            no_restart_after_fetch: false,
            debug: false,
            no_warn: false,
        }
    }
}

impl Settings {
    /// Merge file and environment, then apply command-line overrides.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MOULT_DEMO")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("listen"),
        );
        let mut settings: Settings = builder
            .build()
            .context("Failed to read settings")?
            .try_deserialize()
            .context("Failed to parse settings")?;

        settings.apply(cli)?;
        Ok(settings)
    }

    fn apply(&mut self, cli: &Cli) -> Result<()> {
        if !cli.listen.is_empty() {
            self.listen = cli.listen.clone();
        }
        if let Some(watch) = &cli.watch {
            self.watch = Some(watch.clone());
        }
        if let Some(url) = &cli.url {
            self.url = Some(url.clone());
        }
        match (&cli.s3_bucket, &cli.s3_key) {
            (Some(bucket), Some(key)) => {
                let region = self.s3.as_ref().and_then(|s3| s3.region.clone());
                self.s3 = Some(S3Settings {
                    bucket: bucket.clone(),
                    key: key.clone(),
                    region,
                });
            }
            (None, None) => {}
            _ => bail!("--s3-bucket and --s3-key must be given together"),
        }
        if let Some(interval) = cli.fetch_interval {
            self.fetch_interval = interval;
        }
        if let Some(timeout) = cli.terminate_timeout {
            self.terminate_timeout = timeout;
        }
        if let Some(signal) = &cli.restart_signal {
            self.restart_signal = signal.clone();
        }
        self.required |= cli.required;
        self.no_restart |= cli.no_restart;
        self.no_restart_after_fetch |= cli.no_restart_after_fetch;
        self.debug |= cli.debug;
        Ok(())
    }

    pub fn restart_signal(&self) -> Result<i32> {
        moult::signal_from_name(&self.restart_signal)
            .with_context(|| format!("Unknown restart signal: {}", self.restart_signal))
    }
}
