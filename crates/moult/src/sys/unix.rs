use std::fs::{File, Metadata, Permissions};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{MetadataExt, PermissionsExt};

pub(crate) const SUPPORTED: bool = true;

/// Sent by a child to its supervisor once its listeners are released.
pub(crate) const ACK_SIGNAL: i32 = libc::SIGUSR1;
pub(crate) const DEFAULT_RESTART_SIGNAL: i32 = libc::SIGUSR2;
pub(crate) const INTERRUPT_SIGNAL: i32 = libc::SIGINT;

/// Signals the supervisor listens for and forwards to the live child.
pub(crate) const FORWARDED_SIGNALS: &[i32] = &[
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGUSR1,
    libc::SIGUSR2,
];

/// Signals that can never be handled, so they can never trigger a restart.
pub(crate) const UNCATCHABLE_SIGNALS: &[i32] = &[libc::SIGKILL, libc::SIGSTOP];

pub(crate) const SIGNAL_NAMES: &[(&str, i32)] = &[
    ("HUP", libc::SIGHUP),
    ("INT", libc::SIGINT),
    ("QUIT", libc::SIGQUIT),
    ("KILL", libc::SIGKILL),
    ("USR1", libc::SIGUSR1),
    ("USR2", libc::SIGUSR2),
    ("TERM", libc::SIGTERM),
    ("STOP", libc::SIGSTOP),
    ("WINCH", libc::SIGWINCH),
];

/// First descriptor a child finds its inherited listeners at.
pub(crate) const LISTEN_FD_START: RawFd = 3;

/// Held listener copies live at or above this descriptor so that placing
/// them at `LISTEN_FD_START..` in a child never clobbers one another.
const HIGH_FD_BASE: RawFd = 100;

pub(crate) fn send_signal(pid: u32, signal: i32) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid as libc::pid_t, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn force_kill(pid: u32) -> io::Result<()> {
    send_signal(pid, libc::SIGKILL)
}

pub(crate) fn process_alive(pid: u32) -> bool {
    send_signal(pid, 0).is_ok()
}

pub(crate) fn parent_pid() -> u32 {
    // SAFETY: getppid(2) always succeeds.
    unsafe { libc::getppid() as u32 }
}

/// The parent is alive while we have not been reparented and it still
/// answers signal zero. The reparenting check catches a supervisor that
/// died but has not been reaped yet.
pub(crate) fn parent_alive(parent: u32) -> bool {
    parent_pid() == parent && process_alive(parent)
}

/// Duplicate `fd` into the high range with close-on-exec set.
pub(crate) fn dup_high(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: fcntl with F_DUPFD_CLOEXEC only reads `fd`.
    let duped = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, HIGH_FD_BASE) };
    if duped < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `duped` is a freshly created descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(duped) })
}

/// Place `fds` at `LISTEN_FD_START..` in the current process.
///
/// Runs between fork and exec, so it only performs async-signal-safe
/// calls. `dup2` clears close-on-exec on the target descriptor.
pub(crate) fn install_inherited(fds: &[RawFd]) -> io::Result<()> {
    for (index, fd) in fds.iter().enumerate() {
        let target = LISTEN_FD_START + index as RawFd;
        // SAFETY: dup2(2) is async-signal-safe and only touches descriptors.
        if unsafe { libc::dup2(*fd, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Whether `fd` refers to an open socket.
pub(crate) fn is_socket(fd: RawFd) -> bool {
    // SAFETY: an all-zero stat is a valid out-parameter for fstat.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fstat writes into `stat` and does not retain the pointer.
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

#[cfg(test)]
pub(crate) fn is_close_on_exec(fd: RawFd) -> bool {
    // SAFETY: F_GETFD only reads descriptor flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    flags >= 0 && flags & libc::FD_CLOEXEC != 0
}

/// Flush filesystem caches after a non-atomic replace.
pub(crate) fn sync_filesystem() {
    // SAFETY: sync(2) takes no arguments and cannot fail.
    unsafe { libc::sync() }
}

pub(crate) fn file_mode(meta: &Metadata) -> u32 {
    meta.permissions().mode()
}

pub(crate) fn file_owner(meta: &Metadata) -> Option<(u32, u32)> {
    Some((meta.uid(), meta.gid()))
}

pub(crate) fn apply_mode(file: &File, mode: u32) -> io::Result<()> {
    file.set_permissions(Permissions::from_mode(mode))
}

pub(crate) fn apply_owner(file: &File, owner: Option<(u32, u32)>) -> io::Result<()> {
    match owner {
        Some((uid, gid)) => std::os::unix::fs::fchown(file, Some(uid), Some(gid)),
        None => Ok(()),
    }
}
