//! Shared helpers used by more than one module.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};

/// Resolves `relative` against a directory capability `dir` without ever
/// naming an absolute path.
///
/// Linux has no native `connectat`/`bindat` for Unix-domain sockets, so this
/// goes through `/proc/self/fd/<dirfd>/<relative>`, which the kernel treats
/// identically to a lookup rooted at `dirfd` — the capability-safe "bind-at a
/// directory descriptor" primitive §4.7 calls for, minus the sandbox layer
/// that would otherwise mediate it.
pub(crate) fn proc_fd_path(dir: BorrowedFd<'_>, relative: &Path) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", dir.as_raw_fd())).join(relative)
}
