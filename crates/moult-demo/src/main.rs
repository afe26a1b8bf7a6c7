//! Self-upgrading TCP greeter.
//!
//! Every connection is answered with the generation, pid and binary id of
//! the process that accepted it, which makes hand-overs easy to watch:
//!
//! ```text
//! moult-demo --listen 127.0.0.1:3000 --watch /tmp/next-build
//! while true; do nc 127.0.0.1 3000; sleep 0.2; done
//! ```

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use moult::{BoxError, Config, Fetcher};
use moult_fetch::{FileFetcher, HttpFetcher, Multiple, S3Fetcher};
use tracing::info;

mod serve;
mod settings;
mod telemetry;

use settings::{Cli, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    moult::answer_sanity_check();
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    telemetry::init(settings.debug)?;

    moult::run(build_config(&settings)?).await;
    Ok(())
}

fn build_config(settings: &Settings) -> Result<Config> {
    let mut config = Config::new(serve::serve)
        .addresses(settings.listen.clone())
        .restart_signal(settings.restart_signal()?)
        .terminate_timeout(settings.terminate_timeout)
        .min_fetch_interval(settings.min_fetch_interval)
        .verify_timeout(settings.verify_timeout)
        .pre_upgrade(|staged: &Path| -> Result<(), BoxError> {
            info!(staged = %staged.display(), "Installing new build");
            Ok(())
        })
        .required(settings.required)
        .no_restart(settings.no_restart)
        .no_restart_after_fetch(settings.no_restart_after_fetch)
        .debug(settings.debug)
        .no_warn(settings.no_warn);

    if let Some(fetcher) = build_fetcher(settings) {
        config = config.boxed_fetcher(fetcher);
    }
    Ok(config)
}

/// One fetcher per configured source; several sources race each other.
fn build_fetcher(settings: &Settings) -> Option<Box<dyn Fetcher>> {
    let mut sources: Vec<Box<dyn Fetcher>> = Vec::new();
    if let Some(path) = &settings.watch {
        sources.push(Box::new(FileFetcher::new(path)));
    }
    if let Some(url) = &settings.url {
        sources.push(Box::new(HttpFetcher::new(url).interval(settings.fetch_interval)));
    }
    if let Some(s3) = &settings.s3 {
        let mut fetcher = S3Fetcher::new(&s3.bucket, &s3.key).interval(settings.fetch_interval);
        if let Some(region) = &s3.region {
            fetcher = fetcher.region(region);
        }
        sources.push(Box::new(fetcher));
    }

    match sources.len() {
        0 => None,
        1 => sources.pop(),
        _ => Some(Box::new(Multiple::new(sources))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_no_sources_means_no_fetcher() {
        assert!(build_fetcher(&Settings::default()).is_none());
    }

    #[test]
    fn test_sources_are_combined() {
        let settings = Settings {
            watch: Some(PathBuf::from("/tmp/next")),
            url: Some("http://localhost/app".into()),
            ..Settings::default()
        };
        assert!(build_fetcher(&settings).is_some());
    }

    #[test]
    fn test_config_rejects_unknown_signal() {
        let settings = Settings {
            restart_signal: "SIGWHAT".into(),
            ..Settings::default()
        };
        assert!(build_config(&settings).is_err());
    }
}
