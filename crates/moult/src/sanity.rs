//! Sanity check for staged binaries.
//!
//! A binary built against this crate answers `MOULT_BIN_CHECK=<token>` by
//! printing the token and exiting zero before doing anything else. Anything
//! else, including silence past the timeout, means the binary is not safe to
//! swap in.

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};

use crate::env;

const SPAWN_ATTEMPTS: u32 = 5;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SanityError {
    #[error("failed to run staged binary: {0}")]
    Spawn(#[source] io::Error),

    #[error("staged binary did not answer within {0:?}")]
    Timeout(Duration),

    #[error("staged binary exited with {status}: {output:?}")]
    Exit { status: ExitStatus, output: String },

    #[error("staged binary printed {output:?} instead of the token")]
    TokenMismatch { output: String },
}

/// Fresh random token for one check.
pub(crate) fn token() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// Run `path` with `args` and the check variable set to `token`, and
/// require it to print exactly `token` and exit zero within `timeout`.
pub(crate) async fn verify(
    path: &Path,
    args: &[OsString],
    token: &str,
    timeout: Duration,
) -> Result<(), SanityError> {
    let child = spawn_probe(path, args, token).await?;

    // Dropping the child on timeout kills it.
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| SanityError::Timeout(timeout))?
        .map_err(SanityError::Spawn)?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SanityError::Exit {
            status: output.status,
            output: format!("{stdout}{stderr}").trim().to_string(),
        });
    }
    if stdout != token {
        return Err(SanityError::TokenMismatch { output: stdout });
    }
    Ok(())
}

async fn spawn_probe(path: &Path, args: &[OsString], token: &str) -> Result<Child, SanityError> {
    let mut attempt = 1;
    loop {
        let spawned = Command::new(path)
            .args(args)
            .env(env::BIN_CHECK, token)
            .env_remove(env::IS_CHILD)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => return Ok(child),
            // A freshly written file can still be open for writing elsewhere.
            Err(err) if is_text_busy(&err) && attempt < SPAWN_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(SPAWN_RETRY_DELAY).await;
            }
            Err(err) => return Err(SanityError::Spawn(err)),
        }
    }
}

#[cfg(unix)]
fn is_text_busy(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(not(unix))]
fn is_text_busy(_err: &io::Error) -> bool {
    false
}
