//! The on-disk executable.
//!
//! [`BinaryStore`] owns the [`BinaryRecord`] of the running binary: where it
//! lives, its mode and owner, and the SHA-256 of its bytes. Candidate
//! binaries are staged next to it, verified, and committed with a rename so
//! anything exec'ing the path sees either the old file or the new one.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};

use crate::sanity::{self, SanityError};
use crate::sys;

/// Errors from identifying, staging or replacing the binary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to find binary path: {0}")]
    NotFound(#[source] io::Error),

    #[error("binary file is empty: {}", path.display())]
    Empty { path: PathBuf },

    #[error("failed to read binary {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("binary directory {} is not writable: {source}", path.display())]
    NotReplaceable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to stage binary: {0}")]
    Stage(#[source] io::Error),

    #[error("failed to copy permissions onto {}: {source}", path.display())]
    Permissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to overwrite binary {}: {source}", path.display())]
    MoveFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// SHA-256 digest of a binary's full contents.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BinaryHash([u8; 32]);

impl BinaryHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First twelve bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..12])
    }
}

impl fmt::Display for BinaryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BinaryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinaryHash({})", self.short())
    }
}

/// What the supervisor knows about the binary at `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRecord {
    pub path: PathBuf,
    pub mode: u32,
    /// `(uid, gid)` where the platform has them.
    pub owner: Option<(u32, u32)>,
    pub hash: BinaryHash,
}

impl BinaryRecord {
    /// Hex hash, as exported to children.
    pub fn id(&self) -> String {
        self.hash.to_hex()
    }

    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// A candidate binary written to the staging directory.
///
/// The file is removed when this is dropped without being committed.
#[derive(Debug)]
pub struct StagedBinary {
    path: TempPath,
    hash: BinaryHash,
    size: u64,
}

impl StagedBinary {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hash(&self) -> BinaryHash {
        self.hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Reader adapter hashing everything that passes through it.
pub(crate) struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    read: u64,
}

impl<R> HashingReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            read: 0,
        }
    }

    pub(crate) fn finish(self) -> (BinaryHash, u64) {
        (BinaryHash(self.hasher.finalize().into()), self.read)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            let fresh = &buf.filled()[before..];
            self.hasher.update(fresh);
            self.read += fresh.len() as u64;
        }
        polled
    }
}

/// Hash the file at `path`, rejecting empty files.
pub(crate) async fn hash_file(path: &Path) -> Result<(BinaryHash, u64), StoreError> {
    let unreadable = |source| StoreError::Unreadable {
        path: path.to_path_buf(),
        source,
    };
    let file = tokio::fs::File::open(path).await.map_err(unreadable)?;
    let mut reader = HashingReader::new(file);
    tokio::io::copy(&mut reader, &mut tokio::io::sink())
        .await
        .map_err(unreadable)?;
    let (hash, size) = reader.finish();
    if size == 0 {
        return Err(StoreError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok((hash, size))
}

/// Owner of the running binary's record and its replacement.
#[derive(Debug)]
pub struct BinaryStore {
    record: BinaryRecord,
    staging_dir: PathBuf,
}

impl BinaryStore {
    /// Identify the executable of the current process.
    pub async fn identify() -> Result<Self, StoreError> {
        let exe = std::env::current_exe().map_err(StoreError::NotFound)?;
        Self::open(exe).await
    }

    /// Identify the executable at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = tokio::fs::canonicalize(path.into())
            .await
            .map_err(StoreError::NotFound)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|source| StoreError::Unreadable {
                path: path.clone(),
                source,
            })?;
        if meta.len() == 0 {
            return Err(StoreError::Empty { path });
        }
        let (hash, _) = hash_file(&path).await?;

        let record = BinaryRecord {
            mode: sys::file_mode(&meta),
            owner: sys::file_owner(&meta),
            hash,
            path,
        };
        let staging_dir = record.dir().to_path_buf();
        Ok(Self {
            record,
            staging_dir,
        })
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn record(&self) -> &BinaryRecord {
        &self.record
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Confirm new files can be created next to the binary and in the
    /// staging directory.
    pub fn check_replaceable(&self) -> Result<(), StoreError> {
        for dir in [self.record.dir(), self.staging_dir.as_path()] {
            tempfile::Builder::new()
                .prefix(".moult-probe-")
                .tempfile_in(dir)
                .map_err(|source| StoreError::NotReplaceable {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Stream `reader` into a new staged file, hashing it on the way.
    pub async fn stage<R>(&self, reader: R) -> Result<StagedBinary, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let (file, path) = tempfile::Builder::new()
            .prefix(".moult-stage-")
            .tempfile_in(&self.staging_dir)
            .map_err(StoreError::Stage)?
            .into_parts();

        let mut file = tokio::fs::File::from_std(file);
        let mut reader = HashingReader::new(reader);
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(StoreError::Stage)?;
        file.flush().await.map_err(StoreError::Stage)?;
        file.sync_all().await.map_err(StoreError::Stage)?;

        let (hash, size) = reader.finish();
        if size == 0 {
            return Err(StoreError::Stage(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "fetched binary is empty",
            )));
        }
        Ok(StagedBinary { path, hash, size })
    }

    /// Copy the running binary's mode and owner onto the staged file.
    pub fn prepare(&self, staged: &StagedBinary) -> Result<(), StoreError> {
        let permissions = |source| StoreError::Permissions {
            path: staged.path().to_path_buf(),
            source,
        };
        let file = std::fs::File::open(staged.path()).map_err(permissions)?;
        sys::apply_mode(&file, self.record.mode).map_err(permissions)?;
        sys::apply_owner(&file, self.record.owner).map_err(permissions)?;
        Ok(())
    }

    /// Run the staged binary's sanity check with the current arguments.
    pub async fn verify(&self, staged: &StagedBinary, timeout: Duration) -> Result<(), SanityError> {
        let args: Vec<_> = std::env::args_os().skip(1).collect();
        sanity::verify(staged.path(), &args, &sanity::token(), timeout).await
    }

    /// Move the staged binary over the running one.
    ///
    /// The in-memory record only changes once the move has succeeded.
    /// Returns the hash that was replaced.
    pub async fn commit(&mut self, staged: StagedBinary) -> Result<BinaryHash, StoreError> {
        let target = self.record.path.clone();
        let mode = self.record.mode;
        let owner = self.record.owner;
        let hash = staged.hash;

        let moved = tokio::task::spawn_blocking({
            let target = target.clone();
            move || replace_file(staged.path, &target, mode, owner)
        })
        .await
        .unwrap_or_else(|join| Err(io::Error::other(join)));
        moved.map_err(|source| StoreError::MoveFailed {
            path: target,
            source,
        })?;

        let previous = self.record.hash;
        self.record.hash = hash;
        Ok(previous)
    }
}

#[cfg(not(windows))]
fn replace_file(staged: TempPath, target: &Path, mode: u32, owner: Option<(u32, u32)>) -> io::Result<()> {
    match staged.persist(target) {
        Ok(()) => Ok(()),
        // Usually a cross-device rename: copy next to the target first so
        // the final step is still a rename.
        Err(err) => copy_replace(&err.path, target, mode, owner),
    }
}

#[cfg(not(windows))]
fn copy_replace(staged: &Path, target: &Path, mode: u32, owner: Option<(u32, u32)>) -> io::Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let sibling = tempfile::Builder::new()
        .prefix(".moult-commit-")
        .tempfile_in(dir)?;
    {
        let mut source = std::fs::File::open(staged)?;
        let mut dest = sibling.as_file();
        io::copy(&mut source, &mut dest)?;
        sys::apply_mode(sibling.as_file(), mode)?;
        sys::apply_owner(sibling.as_file(), owner)?;
        sibling.as_file().sync_all()?;
    }
    sibling.into_temp_path().persist(target).map_err(|err| err.error)?;
    sys::sync_filesystem();
    Ok(())
}

/// A mapped executable can't be overwritten in place: move it aside,
/// move the new one in, then try to delete the old one.
#[cfg(windows)]
fn replace_file(staged: TempPath, target: &Path, _mode: u32, _owner: Option<(u32, u32)>) -> io::Result<()> {
    let aside = target.with_extension("old");
    let _ = std::fs::remove_file(&aside);
    std::fs::rename(target, &aside)?;
    if let Err(err) = staged.persist(target) {
        let _ = std::fs::rename(&aside, target);
        return Err(err.error);
    }
    let _ = std::fs::remove_file(&aside);
    Ok(())
}
