//! Socket holder (C3): owns exactly one connected SEQPACKET descriptor and
//! coordinates close with concurrent senders/receivers, without ever
//! holding a lock across blocking I/O.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio_seqpacket::UnixSeqpacket;
use tokio_seqpacket::ancillary::{AncillaryMessage, AncillaryMessageWriter};

use crate::credentials::{self, PeerCredentials};
use crate::error::FpcError;

/// Room for a `cmsghdr` plus up to [`crate::limits::MAX_DESCRIPTORS`] + 1
/// (the OOL slot) raw descriptors. Generous on purpose: SCM_RIGHTS ancillary
/// data is small relative to this, and under-sizing it just means
/// `add_fds`/the kernel truncates rather than corrupting anything.
const ANCILLARY_BUFFER_SIZE: usize = 4096;

/// Wraps one `SOCK_SEQPACKET` descriptor.
///
/// The closed flag is checked without serializing I/O; only [`close`](Self::close)
/// takes the close lock, and it holds that lock only long enough to flip the
/// flag and issue the half-close — never across a `send`/`recv`. This is
/// deliberate: holding a lock across I/O would serialize sends against
/// receives and can deadlock a pair of endpoints talking to each other.
pub struct SocketHolder {
    socket: UnixSeqpacket,
    closed: AtomicBool,
    close_lock: Mutex<()>,
}

impl SocketHolder {
    pub fn new(socket: UnixSeqpacket) -> Self {
        Self {
            socket,
            closed: AtomicBool::new(false),
            close_lock: Mutex::new(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Invokes `f` with the borrowed socket unless it's closed. No lock is
    /// held while `f` runs.
    pub fn with_socket<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&UnixSeqpacket) -> R,
    {
        if self.is_closed() {
            return None;
        }
        Some(f(&self.socket))
    }

    /// Same as [`with_socket`](Self::with_socket) but reports `disconnected`
    /// instead of returning `None`.
    pub fn with_socket_or_throw<F, R>(&self, f: F) -> Result<R, FpcError>
    where
        F: FnOnce(&UnixSeqpacket) -> R,
    {
        self.with_socket(f).ok_or(FpcError::Disconnected)
    }

    /// Idempotent. On the first call: sets the closed flag, half-closes the
    /// kernel socket in both directions (unblocking anything parked in a
    /// concurrent send/recv), then lets the descriptor go when the holder
    /// itself is dropped.
    pub fn close(&self) {
        let _guard = self.close_lock.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Best-effort: a peer that already went away makes this fail
        // harmlessly, and the fd is about to be released regardless.
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }

    pub fn peer_credentials(&self) -> Result<PeerCredentials, FpcError> {
        if self.is_closed() {
            return Err(FpcError::Disconnected);
        }
        let raw = self.socket.as_raw_fd();
        let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
        credentials::query(borrowed)
    }

    /// Writes one complete frame (already-encoded header+payload+trailer)
    /// plus its ancillary descriptors in a single `sendmsg`. `fds` are sent
    /// in order and are not consumed here — the caller decides what happens
    /// to its copies once the kernel has accepted them.
    ///
    /// No lock is held across the await: concurrent `send_frame` and
    /// `recv_frame` calls proceed independently, exactly as the socket
    /// holder's contract requires.
    pub async fn send_frame(&self, bytes: &[u8], fds: &[RawFd]) -> Result<(), FpcError> {
        if self.is_closed() {
            return Err(FpcError::Disconnected);
        }

        let mut ancillary_buf = [0u8; ANCILLARY_BUFFER_SIZE];
        let mut ancillary = AncillaryMessageWriter::new(&mut ancillary_buf);
        if !fds.is_empty() && !ancillary.add_fds(fds) {
            return Err(FpcError::Io(std::io::Error::other(
                "descriptor list does not fit in the ancillary buffer",
            )));
        }

        let iov = [IoSlice::new(bytes)];
        self.socket
            .send_vectored_with_ancillary(&iov, &mut ancillary)
            .await
            .map(|_| ())
            .map_err(FpcError::Io)
    }

    /// Reads one complete SEQPACKET datagram (frame bytes) plus any
    /// ancillary descriptors attached to it, sized to never truncate a
    /// well-formed frame (see [`crate::limits::max_frame_size`]).
    ///
    /// A zero-length read is reported as `disconnected`: SEQPACKET delivers
    /// an empty datagram when the peer performs an orderly shutdown.
    pub async fn recv_frame(&self, max_len: usize) -> Result<(Vec<u8>, Vec<OwnedFd>), FpcError> {
        if self.is_closed() {
            return Err(FpcError::Disconnected);
        }

        let mut buf = vec![0u8; max_len];
        let mut ancillary_buf = [0u8; ANCILLARY_BUFFER_SIZE];
        let mut iov = [IoSliceMut::new(&mut buf)];

        let (n, reader) = self
            .socket
            .recv_vectored_with_ancillary(&mut iov, &mut ancillary_buf)
            .await
            .map_err(FpcError::Io)?;

        if n == 0 {
            return Err(FpcError::Disconnected);
        }
        buf.truncate(n);

        let mut fds = Vec::new();
        for message in reader {
            if let AncillaryMessage::FileDescriptors(received) = message {
                fds.extend(received.map(|raw| unsafe { OwnedFd::from_raw_fd(raw) }));
            }
        }

        Ok((buf, fds))
    }
}

impl Drop for SocketHolder {
    fn drop(&mut self) {
        self.close();
    }
}
