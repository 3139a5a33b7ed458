//! Listener (C7): binds a `SOCK_SEQPACKET` socket, listens, and runs an
//! accept loop that yields freshly constructed, unstarted [`Endpoint`]s.
//!
//! Mirrors the lifecycle shape of [`crate::endpoint::Endpoint`]: an
//! `idle -> running -> stopped` state machine, a background task for the
//! blocking kernel work (here, `accept`), and a single-claim stream for
//! consumers plus a one-shot alternative.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_seqpacket::UnixSeqpacket;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, instrument, warn};

use crate::config::{EndpointConfig, ListenerConfig};
use crate::endpoint::Endpoint;
use crate::error::{FpcError, Result};
use crate::util::proc_fd_path;

/// Single-claim stream of accepted, unstarted endpoints. Terminates
/// (successfully or with an error already surfaced to the claimant) when the
/// listener stops or a fatal accept error occurs.
pub type ConnectionStream = UnboundedReceiverStream<Endpoint>;

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

enum ListenerState {
    Idle,
    Running,
    Stopped,
}

fn decode_state(raw: u8) -> ListenerState {
    match raw {
        STATE_IDLE => ListenerState::Idle,
        STATE_RUNNING => ListenerState::Running,
        _ => ListenerState::Stopped,
    }
}

struct ListenerInner {
    fd: AsyncFd<OwnedFd>,
    closed: AtomicBool,
    state: AtomicU8,
    endpoint_config: EndpointConfig,
    conn_tx: mpsc::UnboundedSender<Endpoint>,
    conn_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Endpoint>>>,
    conn_claimed: AtomicBool,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// A bound, listening `SOCK_SEQPACKET` socket.
///
/// Cheaply cloneable — every clone shares the same listening socket and
/// connection stream.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    /// Creates a `SOCK_SEQPACKET` socket, binds it to `path`, and calls
    /// `listen(backlog)`. Does not yet accept anything — call
    /// [`start`](Self::start) or [`accept`](Self::accept).
    pub fn bind(
        path: impl AsRef<Path>,
        config: ListenerConfig,
        endpoint_config: EndpointConfig,
    ) -> Result<Self> {
        let fd = bind_and_listen(path.as_ref(), config.backlog)?;
        Self::from_fd(fd, endpoint_config)
    }

    /// Directory-relative variant: binds under a directory capability rather
    /// than an absolute path, for callers inside a sandbox that only hold a
    /// directory descriptor. See [`crate::endpoint::Endpoint::connect_at`]
    /// for the matching connect-side primitive.
    pub fn bind_at(
        dir: BorrowedFd<'_>,
        relative_path: impl AsRef<Path>,
        config: ListenerConfig,
        endpoint_config: EndpointConfig,
    ) -> Result<Self> {
        let path = proc_fd_path(dir, relative_path.as_ref());
        Self::bind(path, config, endpoint_config)
    }

    fn from_fd(fd: OwnedFd, endpoint_config: EndpointConfig) -> Result<Self> {
        let async_fd = AsyncFd::new(fd).map_err(FpcError::Io)?;
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(ListenerInner {
                fd: async_fd,
                closed: AtomicBool::new(false),
                state: AtomicU8::new(STATE_IDLE),
                endpoint_config,
                conn_tx,
                conn_rx: parking_lot::Mutex::new(Some(conn_rx)),
                conn_claimed: AtomicBool::new(false),
                accept_task: parking_lot::Mutex::new(None),
            }),
        })
    }

    /// `idle -> running`. Spawns the accept loop. Idempotent once running;
    /// fails with [`FpcError::ListenerClosed`] if already stopped.
    pub fn start(&self) -> Result<()> {
        match self
            .inner
            .state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!("listener starting");
                let inner = self.inner.clone();
                let handle = tokio::spawn(Self::accept_loop(inner));
                *self.inner.accept_task.lock() = Some(handle);
                Ok(())
            }
            Err(STATE_RUNNING) => Ok(()),
            Err(_) => Err(FpcError::ListenerClosed),
        }
    }

    /// Idempotent. Closes the listening socket and finishes the connection
    /// stream.
    pub fn stop(&self) {
        Self::teardown(&self.inner);
    }

    fn teardown(inner: &Arc<ListenerInner>) {
        let was_open = inner.state.swap(STATE_STOPPED, Ordering::AcqRel) != STATE_STOPPED;
        if !was_open {
            return;
        }
        debug!("listener tearing down");
        inner.closed.store(true, Ordering::Release);
        // Best-effort: wakes anything parked in `readable()` waiting for the
        // next connection. A listening socket that the peer side never
        // touches doesn't strictly need a half-close, but this keeps the
        // shutdown story identical to `SocketHolder::close`.
        let _ = socket::shutdown(inner.fd.as_raw_fd(), socket::Shutdown::Both);
        drop(inner.conn_tx.clone());
        if let Some(handle) = inner.accept_task.lock().take() {
            handle.abort();
        }
    }

    /// Single-claim stream of accepted endpoints. Fails with
    /// [`FpcError::NotStarted`] before [`start`](Self::start), with
    /// [`FpcError::ListenerClosed`] after [`stop`](Self::stop), and with
    /// [`FpcError::StreamAlreadyClaimed`] on a second call during one run.
    pub fn connections(&self) -> Result<ConnectionStream> {
        match decode_state(self.inner.state.load(Ordering::Acquire)) {
            ListenerState::Idle => return Err(FpcError::NotStarted),
            ListenerState::Stopped => return Err(FpcError::ListenerClosed),
            ListenerState::Running => {}
        }

        if self.inner.conn_claimed.swap(true, Ordering::AcqRel) {
            return Err(FpcError::StreamAlreadyClaimed);
        }

        let rx = self
            .inner
            .conn_rx
            .lock()
            .take()
            .expect("claimed flag guards the single take");
        Ok(UnboundedReceiverStream::new(rx))
    }

    /// One-shot, suspending accept that returns a single unstarted endpoint
    /// without requiring [`start`](Self::start) or the connection stream.
    /// Fails with [`FpcError::ListenerClosed`] if the listener was stopped.
    pub async fn accept(&self) -> Result<Endpoint> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(FpcError::ListenerClosed);
        }
        let fd = accept_one(&self.inner.fd).await.map_err(|error| {
            if self.inner.closed.load(Ordering::Acquire) {
                FpcError::ListenerClosed
            } else {
                FpcError::Io(error)
            }
        })?;
        let socket = wrap_accepted(fd)?;
        Ok(Endpoint::from_socket(socket, self.inner.endpoint_config))
    }

    #[instrument(skip(inner))]
    async fn accept_loop(inner: Arc<ListenerInner>) {
        loop {
            let fd = match accept_one(&inner.fd).await {
                Ok(fd) => fd,
                Err(error) => {
                    if !inner.closed.load(Ordering::Acquire) {
                        warn!(%error, "listener accept loop ending");
                    }
                    Self::teardown(&inner);
                    return;
                }
            };

            let socket = match wrap_accepted(fd) {
                Ok(socket) => socket,
                Err(error) => {
                    warn!(%error, "failed to register accepted socket with the runtime");
                    continue;
                }
            };

            let endpoint = Endpoint::from_socket(socket, inner.endpoint_config);
            if inner.conn_tx.send(endpoint).is_err() {
                debug!("connection stream dropped; stopping accept loop");
                Self::teardown(&inner);
                return;
            }
        }
    }
}

fn wrap_accepted(fd: OwnedFd) -> Result<UnixSeqpacket> {
    // SAFETY: `fd` was just produced by `accept4` and is owned by nobody
    // else yet.
    unsafe { UnixSeqpacket::from_raw_fd(fd.into_raw_fd()) }.map_err(FpcError::Io)
}

async fn accept_one(fd: &AsyncFd<OwnedFd>) -> std::io::Result<OwnedFd> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| accept4_raw(inner.get_ref().as_raw_fd())) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

fn accept4_raw(listen_fd: RawFd) -> std::io::Result<OwnedFd> {
    let flags = SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC;
    socket::accept4(listen_fd, flags)
        .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) })
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

fn bind_and_listen(path: &Path, backlog: u32) -> Result<OwnedFd> {
    let io_err = |errno: nix::errno::Errno| FpcError::Io(std::io::Error::from_raw_os_error(errno as i32));

    let fd = socket::socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(io_err)?;

    let addr = UnixAddr::new(path).map_err(io_err)?;
    socket::bind(fd.as_raw_fd(), &addr).map_err(io_err)?;

    let backlog = Backlog::new(backlog as i32)
        .map_err(|_| FpcError::Io(std::io::Error::other("invalid backlog")))?;
    socket::listen(&fd, backlog).map_err(io_err)?;

    Ok(fd)
}
