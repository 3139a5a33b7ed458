//! Out-of-line shared-memory payload engine (C4).
//!
//! Decides inline vs. shared-memory on send; allocates, sizes, writes,
//! rights-restricts and attaches the shm descriptor. On receive, maps the
//! attached descriptor read-only, copies out, and releases it.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::FpcError;

/// Seam for restricting a shared-memory descriptor's capability rights
/// before handing it to the peer (step 5 of the send path). The real
/// Capsicum-style limiter lives in the sandbox layer this crate doesn't
/// depend on; the default implementation is an intentional no-op on
/// platforms where no such mechanism is wired up.
pub trait ShmRightsLimiter: Send + Sync {
    /// Restricts `fd`'s rights to {mmap-read, fstat, seek}. Must be a no-op
    /// that returns `Ok(())` where the platform doesn't support it — never
    /// an error, since the spec treats this step as best-effort.
    fn restrict(&self, fd: RawFd) -> std::io::Result<()>;
}

/// Default limiter: performs no restriction. Installed automatically when
/// an endpoint isn't configured with a real one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopShmRightsLimiter;

impl ShmRightsLimiter for NoopShmRightsLimiter {
    fn restrict(&self, _fd: RawFd) -> std::io::Result<()> {
        Ok(())
    }
}

/// Allocates an anonymous shared-memory object, sizes it, fills it with
/// `payload`, and restricts its rights. Returns the descriptor ready to be
/// attached as the outgoing frame's descriptor 0.
///
/// On any failure after the memfd is created, the descriptor is closed
/// before the error is returned, so a failed send never leaks it.
pub fn prepare_send(payload: &[u8], limiter: &dyn ShmRightsLimiter) -> Result<OwnedFd, FpcError> {
    let fd = create_anonymous_shm()?;

    if let Err(e) = write_and_restrict(&fd, payload, limiter) {
        // Internally-allocated descriptor: our responsibility to clean up,
        // unlike caller-supplied descriptors (see endpoint.rs send path).
        drop(fd);
        return Err(e);
    }

    Ok(fd)
}

fn create_anonymous_shm() -> Result<OwnedFd, FpcError> {
    let name = CString::new("fpc-ool").unwrap();
    // MFD_CLOEXEC: this descriptor only ever needs to live across a
    // sendmsg/recvmsg pair, never across an exec.
    let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(FpcError::Io(std::io::Error::last_os_error()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn write_and_restrict(
    fd: &OwnedFd,
    payload: &[u8],
    limiter: &dyn ShmRightsLimiter,
) -> Result<(), FpcError> {
    let len = payload.len();

    if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
        return Err(FpcError::Io(std::io::Error::last_os_error()));
    }

    if len > 0 {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(FpcError::Io(std::io::Error::last_os_error()));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr as *mut u8, len);
            if libc::munmap(ptr, len) != 0 {
                return Err(FpcError::Io(std::io::Error::last_os_error()));
            }
        }
    }

    // Best-effort: the spec mandates this step run where available and be
    // a no-op otherwise, never a send failure.
    let _ = limiter.restrict(fd.as_raw_fd());

    Ok(())
}

/// Maps the received shm descriptor read-only, copies its contents out, and
/// closes it. `fd` is consumed regardless of outcome — the caller's
/// ownership of the descriptor ends here either way.
///
/// Fails with [`FpcError::InvalidMessageFormat`] if `fstat` fails, the
/// reported size isn't positive, or the mapping fails; the shm descriptor
/// is closed before the error is returned in every case.
pub fn receive_and_close(fd: OwnedFd) -> Result<Vec<u8>, FpcError> {
    let raw = fd.as_raw_fd();
    let result = read_mapped(raw);
    // `fd` drops here regardless of `result`, closing the descriptor.
    drop(fd);
    result
}

fn read_mapped(raw: RawFd) -> Result<Vec<u8>, FpcError> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(raw, &mut stat) } != 0 {
        return Err(FpcError::InvalidMessageFormat);
    }

    let len = stat.st_size;
    if len <= 0 {
        return Err(FpcError::InvalidMessageFormat);
    }
    let len = len as usize;

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ,
            libc::MAP_SHARED,
            raw,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(FpcError::InvalidMessageFormat);
    }

    let mut out = vec![0u8; len];
    unsafe {
        std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), len);
        if libc::munmap(ptr, len) != 0 {
            return Err(FpcError::InvalidMessageFormat);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shm_payload_roundtrips() {
        let payload = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let fd = prepare_send(&payload, &NoopShmRightsLimiter).unwrap();
        let out = receive_and_close(fd).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn empty_payload_is_rejected_on_receive() {
        // An OOL frame always carries a non-empty payload in practice (the
        // whole point is a payload too large to inline); a zero-length shm
        // object is treated as malformed rather than a valid empty OOL body.
        let fd = prepare_send(&[], &NoopShmRightsLimiter).unwrap();
        assert!(matches!(
            receive_and_close(fd),
            Err(FpcError::InvalidMessageFormat)
        ));
    }
}
