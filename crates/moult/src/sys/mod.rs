//! Platform layer.
//!
//! Everything that talks to the OS about signals, process liveness,
//! descriptors and file ownership lives behind this module so the rest of
//! the crate reads the same on every target. Unix is the supported
//! platform; elsewhere `run` reports [`crate::Error::UnsupportedPlatform`]
//! and the program falls back to the disabled state.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::*;

#[cfg(not(unix))]
mod other;
#[cfg(not(unix))]
pub(crate) use other::*;

/// Resolve a signal name such as `USR2`, `SIGHUP` or `15` into its number.
pub fn signal_from_name(name: &str) -> Option<i32> {
    let name = name.trim();
    if let Ok(number) = name.parse::<i32>() {
        return (number > 0).then_some(number);
    }
    let upper = name.to_ascii_uppercase();
    let short = upper.strip_prefix("SIG").unwrap_or(&upper);
    SIGNAL_NAMES
        .iter()
        .find(|(candidate, _)| *candidate == short)
        .map(|(_, number)| *number)
}

/// Human readable name for a signal number, used in log fields.
pub(crate) fn signal_name(signal: i32) -> String {
    SIGNAL_NAMES
        .iter()
        .find(|(_, number)| *number == signal)
        .map(|(name, _)| format!("SIG{name}"))
        .unwrap_or_else(|| format!("signal {signal}"))
}
