//! Environment passed from the supervisor to its children.

use std::path::PathBuf;

use crate::error::Error;

pub(crate) const IS_CHILD: &str = "MOULT_IS_CHILD";
pub(crate) const GENERATION: &str = "MOULT_GENERATION";
pub(crate) const NUM_FDS: &str = "MOULT_NUM_FDS";
pub(crate) const BIN_ID: &str = "MOULT_BIN_ID";
pub(crate) const BIN_PATH: &str = "MOULT_BIN_PATH";
pub(crate) const BIN_CHECK: &str = "MOULT_BIN_CHECK";

/// Identity a child process was started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChildEnv {
    pub generation: u64,
    pub num_fds: usize,
    pub bin_id: String,
    pub bin_path: Option<PathBuf>,
}

impl ChildEnv {
    pub(crate) fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let generation = parse(&lookup, GENERATION)?;
        let num_fds = parse(&lookup, NUM_FDS)?;
        let bin_id = lookup(BIN_ID).unwrap_or_default();
        let bin_path = lookup(BIN_PATH)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            generation,
            num_fds,
            bin_id,
            bin_path,
        })
    }

    /// Variables to set on a child for this identity.
    pub(crate) fn vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (IS_CHILD, "1".to_string()),
            (GENERATION, self.generation.to_string()),
            (NUM_FDS, self.num_fds.to_string()),
            (BIN_ID, self.bin_id.clone()),
        ];
        if let Some(path) = &self.bin_path {
            vars.push((BIN_PATH, path.to_string_lossy().into_owned()));
        }
        vars
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<T, Error> {
    let value = lookup(name).unwrap_or_default();
    value
        .trim()
        .parse()
        .map_err(|_| Error::ChildEnvironment { name, value })
}

pub(crate) fn is_child() -> bool {
    std::env::var(IS_CHILD).is_ok_and(|value| value == "1")
}

/// Token requested by a sanity check, if this process is one.
pub(crate) fn sanity_token() -> Option<String> {
    std::env::var(BIN_CHECK).ok().filter(|token| !token.is_empty())
}
