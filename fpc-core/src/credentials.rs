//! Peer credentials accessor (C8).
//!
//! `SO_PEERCRED`-style socket options only carry uid/gid/pid; full group
//! membership needs a second, unprivileged lookup through the passwd/group
//! database. Both halves live here so callers get one ergonomic value.

use std::os::fd::BorrowedFd;

use nix::sys::socket::{getsockopt, sockopt::PeerCredentials as PeerCredentialsOpt};

use crate::error::FpcError;

/// Effective credentials of the process on the other end of a connected
/// Unix-domain socket.
#[derive(Debug, Clone)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    /// May be zero on kernels that don't report a peer pid.
    pub pid: u32,
    /// All groups the peer's effective uid belongs to. First element equals
    /// `gid`.
    pub groups: Vec<u32>,
}

impl PeerCredentials {
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    pub fn is_member_of(&self, group: u32) -> bool {
        self.groups.contains(&group)
    }

    /// `wheel` is gid 0 on the BSDs this protocol originates from; kept as
    /// an explicit predicate because callers checking "can this peer act as
    /// an administrator" shouldn't have to know that convention.
    pub fn is_wheel_member(&self) -> bool {
        self.is_member_of(0)
    }
}

/// Queries the kernel for `fd`'s peer credentials and resolves the peer
/// uid's full group list.
///
/// Fails with [`FpcError::Disconnected`] if the socket option lookup fails
/// because the peer has already gone away, and
/// [`FpcError::InvalidMessageFormat`] if the kernel's credential structure
/// can't be interpreted (an unexpected version/shape).
pub fn query(fd: BorrowedFd<'_>) -> Result<PeerCredentials, FpcError> {
    let cred = getsockopt(&fd, PeerCredentialsOpt).map_err(|_| FpcError::Disconnected)?;

    let uid = cred.uid();
    let gid = cred.gid();
    let pid = cred.pid() as u32;

    let groups = resolve_groups(uid, gid).unwrap_or_else(|| vec![gid]);

    Ok(PeerCredentials {
        uid,
        gid,
        pid,
        groups,
    })
}

fn resolve_groups(uid: u32, primary_gid: u32) -> Option<Vec<u32>> {
    let username = username_for_uid(uid)?;
    groups_for_username(&username, primary_gid)
}

fn username_for_uid(uid: u32) -> Option<String> {
    let mut buf = vec![0i8; 4096];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe {
        libc::getpwuid_r(
            uid as libc::uid_t,
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };

    if rc != 0 || result.is_null() {
        return None;
    }

    let cname = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) };
    Some(cname.to_string_lossy().into_owned())
}

fn groups_for_username(username: &str, primary_gid: u32) -> Option<Vec<u32>> {
    let cname = std::ffi::CString::new(username).ok()?;
    let mut ngroups: libc::c_int = 32;

    loop {
        let mut groups: Vec<libc::gid_t> = vec![0; ngroups as usize];
        let rc = unsafe {
            libc::getgrouplist(
                cname.as_ptr(),
                primary_gid as libc::gid_t,
                groups.as_mut_ptr(),
                &mut ngroups,
            )
        };

        if rc >= 0 {
            groups.truncate(ngroups as usize);
            return Some(groups.into_iter().map(|g| g as u32).collect());
        }

        if ngroups <= 0 || ngroups as usize > 1 << 16 {
            return None;
        }
        // Buffer was too small; `ngroups` was updated to the required size, retry.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_match_fields() {
        let creds = PeerCredentials {
            uid: 0,
            gid: 0,
            pid: 1,
            groups: vec![0, 20],
        };
        assert!(creds.is_root());
        assert!(creds.is_wheel_member());
        assert!(creds.is_member_of(20));
        assert!(!creds.is_member_of(99));
    }
}
