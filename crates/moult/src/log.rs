//! Verbosity gating on top of `tracing`.
//!
//! The library is embedded in someone else's binary, so its own chatter is
//! opt-in: debug events need `Config::debug`, warnings are on unless
//! `Config::no_warn` silences them.

/// Which of the crate's own events are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Verbosity {
    pub debug: bool,
    pub warn: bool,
}

impl Verbosity {
    pub(crate) fn new(debug: bool, no_warn: bool) -> Self {
        Self {
            debug,
            warn: debug || !no_warn,
        }
    }
}

macro_rules! gated_debug {
    ($verbosity:expr, $($arg:tt)+) => {
        if $verbosity.debug {
            tracing::debug!($($arg)+);
        }
    };
}

macro_rules! gated_warn {
    ($verbosity:expr, $($arg:tt)+) => {
        if $verbosity.warn {
            tracing::warn!($($arg)+);
        }
    };
}

pub(crate) use gated_debug;
pub(crate) use gated_warn;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_implies_warn() {
        assert_eq!(Verbosity::new(true, true), Verbosity { debug: true, warn: true });
        assert_eq!(Verbosity::new(false, true), Verbosity { debug: false, warn: false });
        assert_eq!(Verbosity::new(false, false), Verbosity { debug: false, warn: true });
    }
}
