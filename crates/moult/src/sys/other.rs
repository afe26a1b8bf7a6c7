use std::fs::{File, Metadata};
use std::io;

pub(crate) const SUPPORTED: bool = false;

// Signal numbers only carry meaning on unix; these keep configuration
// validation and logging uniform.
pub(crate) const ACK_SIGNAL: i32 = 10;
pub(crate) const DEFAULT_RESTART_SIGNAL: i32 = 12;
pub(crate) const UNCATCHABLE_SIGNALS: &[i32] = &[9, 19];

pub(crate) const SIGNAL_NAMES: &[(&str, i32)] = &[
    ("INT", 2),
    ("KILL", 9),
    ("USR1", 10),
    ("USR2", 12),
    ("TERM", 15),
];

pub(crate) fn sync_filesystem() {}

pub(crate) fn file_mode(meta: &Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o555
    } else {
        0o755
    }
}

pub(crate) fn file_owner(_meta: &Metadata) -> Option<(u32, u32)> {
    None
}

pub(crate) fn apply_mode(file: &File, mode: u32) -> io::Result<()> {
    let mut permissions = file.metadata()?.permissions();
    permissions.set_readonly(mode & 0o222 == 0);
    file.set_permissions(permissions)
}

pub(crate) fn apply_owner(_file: &File, _owner: Option<(u32, u32)>) -> io::Result<()> {
    Ok(())
}
