//! Endpoint lifecycle (C6) and the send/request/reply surface built on top
//! of the correlation engine (C5).
//!
//! The endpoint's mutable state — the correlation counter and the
//! pending-reply/pending-timeout tables — is guarded by a single
//! `parking_lot::Mutex`, never held across an `.await`. That is this crate's
//! realization of the actor isolation the spec calls for: on a
//! `tokio` runtime there is no single OS thread to pin an "actor" to, so the
//! isolation is expressed as "exactly one critical section mutates the
//! tables at a time" rather than as a literal command-processing task. The
//! receive loop and every `send`/`request` call reach the kernel through
//! [`SocketHolder`], which never serializes I/O behind that same lock —
//! concurrent sends and receives are the tokio runtime's own thread pool
//! doing the spec's "I/O pool" job.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_seqpacket::UnixSeqpacket;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, instrument, warn};

use crate::config::EndpointConfig;
use crate::correlation::{CorrelationAllocator, PendingTables};
use crate::credentials::PeerCredentials;
use crate::descriptor::{DescriptorKind, OpaqueDescriptorRef};
use crate::error::{FpcError, RequestError, Result, SendFailure};
use crate::frame::{self, DecodedFrame};
use crate::limits::{FRAME_OVERHEAD, MAX_DESCRIPTORS, OOL_TAG};
use crate::message::{CorrelationId, Message, MessageId, ReplyToken, UNSOLICITED};
use crate::ool::{self, NoopShmRightsLimiter, ShmRightsLimiter};
use crate::socket::SocketHolder;
use crate::util::proc_fd_path;

/// The endpoint's three-state lifecycle. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Running,
    Stopped,
}

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

fn decode_state(raw: u8) -> ConnectionState {
    match raw {
        STATE_IDLE => ConnectionState::Idle,
        STATE_RUNNING => ConnectionState::Running,
        _ => ConnectionState::Stopped,
    }
}

/// Stream of inbound messages that are not replies to a pending request:
/// server-pushed events and incoming requests waiting for a local reply.
/// May be claimed exactly once per endpoint run — see
/// [`Endpoint::incoming`].
pub type UnsolicitedStream = UnboundedReceiverStream<Message>;

struct EndpointState {
    correlation: CorrelationAllocator,
    pending: PendingTables,
}

struct EndpointInner {
    socket: SocketHolder,
    state: parking_lot::Mutex<EndpointState>,
    connection: AtomicU8,
    config: EndpointConfig,
    limiter: Arc<dyn ShmRightsLimiter>,
    unsolicited_tx: mpsc::UnboundedSender<Message>,
    unsolicited_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    unsolicited_claimed: AtomicBool,
    recv_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// An FPC connection endpoint: one `SOCK_SEQPACKET` socket, the correlation
/// engine that multiplexes requests/replies over it, and the background
/// receive loop that drives both.
///
/// Cheaply cloneable — every clone shares the same underlying connection.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    /// Wraps an already-connected socket. The endpoint starts `idle`; call
    /// [`start`](Self::start) to spawn its receive loop.
    pub fn from_socket(socket: UnixSeqpacket, config: EndpointConfig) -> Self {
        let (unsolicited_tx, unsolicited_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(EndpointInner {
                socket: SocketHolder::new(socket),
                state: parking_lot::Mutex::new(EndpointState {
                    correlation: CorrelationAllocator::new(),
                    pending: PendingTables::new(),
                }),
                connection: AtomicU8::new(STATE_IDLE),
                config,
                limiter: Arc::new(NoopShmRightsLimiter),
                unsolicited_tx,
                unsolicited_rx: parking_lot::Mutex::new(Some(unsolicited_rx)),
                unsolicited_claimed: AtomicBool::new(false),
                recv_task: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Installs a non-default [`ShmRightsLimiter`] (the sandbox-layer seam
    /// for step 5 of the OOL send path). Only meaningful before
    /// [`start`](Self::start).
    pub fn with_shm_rights_limiter(mut self, limiter: Arc<dyn ShmRightsLimiter>) -> Self {
        // `Arc<EndpointInner>` is freshly constructed by `from_socket` and not
        // yet shared, so this is the only clone in existence.
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.limiter = limiter;
        }
        self
    }

    /// Connects to a Unix-domain SEQPACKET socket at `path`.
    pub async fn connect(path: impl AsRef<Path>, config: EndpointConfig) -> Result<Self> {
        let socket = UnixSeqpacket::connect(path).await.map_err(FpcError::Io)?;
        Ok(Self::from_socket(socket, config))
    }

    /// Connects relative to a directory descriptor — the capability-safe
    /// entry point for callers that hold a directory capability rather than
    /// an absolute path. Linux has no native `connectat`; this resolves the
    /// path through `/proc/self/fd/<dirfd>/<relative_path>`, which the
    /// kernel treats identically to a direct lookup rooted at `dirfd`.
    pub async fn connect_at(
        dir: BorrowedFd<'_>,
        relative_path: impl AsRef<Path>,
        config: EndpointConfig,
    ) -> Result<Self> {
        let path = proc_fd_path(dir, relative_path.as_ref());
        Self::connect(path, config).await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        decode_state(self.inner.connection.load(Ordering::Acquire))
    }

    /// `idle -> running`. Spawns the receive loop. Idempotent once running;
    /// fails with [`FpcError::Stopped`] if the endpoint already tore down —
    /// a stopped endpoint is terminal and cannot be restarted.
    #[instrument(skip(self), fields(fd = self.inner.socket.with_socket(|s| s.as_raw_fd()).unwrap_or(-1)))]
    pub fn start(&self) -> Result<()> {
        match self
            .inner
            .connection
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!("endpoint starting");
                let inner = self.inner.clone();
                let handle = tokio::spawn(Self::receive_loop(inner));
                *self.inner.recv_task.lock() = Some(handle);
                Ok(())
            }
            Err(STATE_RUNNING) => Ok(()),
            Err(_) => Err(FpcError::Stopped),
        }
    }

    /// `running -> stopped` (idempotent). Half-closes the socket, drains
    /// every pending waiter with [`FpcError::Stopped`], and finishes the
    /// unsolicited stream.
    pub fn stop(&self) {
        Self::teardown(&self.inner, FpcError::Stopped);
    }

    fn teardown(inner: &Arc<EndpointInner>, reason: FpcError) {
        let was_running_or_idle = inner
            .connection
            .swap(STATE_STOPPED, Ordering::AcqRel)
            != STATE_STOPPED;
        if !was_running_or_idle {
            return;
        }

        debug!(%reason, "endpoint tearing down");
        inner.socket.close();

        {
            let mut state = inner.state.lock();
            let make_err = || reason_clone(&reason);
            state.pending.drain_with_error(make_err);
        }

        // Dropping our sender side finishes the unsolicited stream for
        // whoever claimed it (or simply discards it if nobody did).
        drop(inner.unsolicited_tx.clone());
        if let Some(handle) = inner.recv_task.lock().take() {
            handle.abort();
        }
    }

    fn require_running(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Idle => Err(FpcError::NotStarted),
            ConnectionState::Running => Ok(()),
            ConnectionState::Stopped => Err(FpcError::Stopped),
        }
    }

    /// Fire-and-forget send. Does not allocate a correlation id and does
    /// not touch `message.correlation_id` — callers building a reply must
    /// set it themselves (see [`Message::reply_to`]) or use
    /// [`Endpoint::reply`].
    pub async fn send(&self, message: Message) -> std::result::Result<(), SendFailure> {
        if let Err(error) = self.require_running() {
            return Err(SendFailure {
                error,
                descriptors: message.descriptors,
            });
        }
        self.send_prepared(message).await
    }

    /// Builds a reply to `to` (a [`Message`] or [`ReplyToken`]) and sends it
    /// as an ordinary fire-and-forget send.
    pub async fn reply(
        &self,
        to: impl Into<ReplyToken>,
        id: MessageId,
        payload: Vec<u8>,
        descriptors: Vec<OpaqueDescriptorRef>,
    ) -> std::result::Result<(), SendFailure> {
        let token = to.into();
        let message = Message {
            id,
            correlation_id: token.correlation_id,
            payload,
            descriptors,
        };
        self.send(message).await
    }

    /// Issues a request and waits for its reply, a timeout, cancellation
    /// (the calling future being dropped), or endpoint teardown —
    /// whichever comes first.
    ///
    /// Registers the pending-reply entry *before* the frame is handed to
    /// the socket, closing the lost-reply race where a fast peer replies
    /// before the caller has parked.
    pub async fn request(
        &self,
        mut message: Message,
        timeout: Option<Duration>,
    ) -> std::result::Result<Message, RequestError> {
        self.require_running().map_err(RequestError::Transport)?;

        let id = {
            let mut state = self.inner.state.lock();
            state.correlation.allocate()
        };
        message.correlation_id = id;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            state.pending.register(id, reply_tx);
        }
        // Ensures the pending-reply/timeout entries are removed no matter
        // how this future exits — normal resolution, timeout, or the
        // caller dropping us outright (cooperative cancellation). Removal
        // is idempotent, so this is a no-op when something else already
        // resolved the waiter.
        let _guard = PendingGuard {
            inner: self.inner.clone(),
            id,
        };

        if let Some(duration) = timeout {
            let inner = self.inner.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let mut state = inner.state.lock();
                // Ignore the Err(_) case: the waiter already resolved for
                // some other reason between the sleep firing and this lock.
                let _ = state
                    .pending
                    .resolve(id, Err(RequestError::Transport(FpcError::Timeout)));
            });
            let mut state = self.inner.state.lock();
            state.pending.register_timeout(id, handle);
        }

        if let Err(failure) = self.send_prepared(message).await {
            let mut state = self.inner.state.lock();
            state.pending.remove(id);
            return Err(RequestError::SendFailed {
                error: failure.error,
                descriptors: failure.descriptors,
            });
        }

        match reply_rx.await {
            Ok(result) => result,
            // The sender side was dropped without resolving: teardown beat
            // us to it without going through `drain_with_error` (shouldn't
            // happen, but a disconnect is the honest answer either way).
            Err(_) => Err(RequestError::Transport(FpcError::Disconnected)),
        }
    }

    pub fn peer_credentials(&self) -> Result<PeerCredentials> {
        self.inner.socket.peer_credentials()
    }

    /// Claims the unsolicited-message stream. May be called exactly once
    /// per run; a second call fails with
    /// [`FpcError::StreamAlreadyClaimed`].
    pub fn incoming(&self) -> Result<UnsolicitedStream> {
        match self.state() {
            ConnectionState::Idle => return Err(FpcError::NotStarted),
            ConnectionState::Stopped => return Err(FpcError::Stopped),
            ConnectionState::Running => {}
        }

        if self
            .inner
            .unsolicited_claimed
            .swap(true, Ordering::AcqRel)
        {
            return Err(FpcError::StreamAlreadyClaimed);
        }

        let rx = self
            .inner
            .unsolicited_rx
            .lock()
            .take()
            .expect("claimed flag guards the single take");
        Ok(UnboundedReceiverStream::new(rx))
    }

    async fn send_prepared(&self, message: Message) -> std::result::Result<(), SendFailure> {
        let threshold = self.inner.config.inline_payload_threshold();
        let prepared = match prepare_frame(message, threshold, self.inner.limiter.as_ref()) {
            Ok(p) => p,
            Err((error, descriptors)) => return Err(SendFailure { error, descriptors }),
        };

        let raw_fds: Vec<RawFd> = prepared.fds.iter().map(|fd| fd.as_raw_fd()).collect();
        match self.inner.socket.send_frame(&prepared.bytes, &raw_fds).await {
            Ok(()) => Ok(()),
            Err(error) => Err(SendFailure {
                error,
                descriptors: prepared.into_caller_descriptors(),
            }),
        }
    }

    #[instrument(skip(inner))]
    async fn receive_loop(inner: Arc<EndpointInner>) {
        let max_len = FRAME_OVERHEAD + inner.config.inline_payload_threshold();

        loop {
            let (bytes, fds) = match inner.socket.recv_frame(max_len).await {
                Ok(v) => v,
                Err(error) => {
                    debug!(%error, "receive loop ending");
                    Self::teardown(&inner, error);
                    return;
                }
            };

            let decoded = match frame::decode(&bytes) {
                Ok(d) => d,
                Err(error) => {
                    warn!(%error, "peer sent a malformed frame");
                    Self::teardown(&inner, error);
                    return;
                }
            };

            if let Err(error) = frame::validate_descriptor_count(&decoded, fds.len()) {
                warn!(%error, "descriptor count mismatch");
                Self::teardown(&inner, error);
                return;
            }

            let message = match assemble_message(decoded, fds) {
                Ok(m) => m,
                Err(error) => {
                    warn!(%error, "failed to assemble OOL payload");
                    Self::teardown(&inner, error);
                    return;
                }
            };

            Self::dispatch(&inner, message);
        }
    }

    fn dispatch(inner: &Arc<EndpointInner>, message: Message) {
        let id = message.correlation_id;
        if id == UNSOLICITED {
            let _ = inner.unsolicited_tx.send(message);
            return;
        }

        let mut state = inner.state.lock();
        match state.pending.resolve(id, Ok(message)) {
            Ok(()) => {}
            Err(Ok(message)) => {
                drop(state);
                // No matching request: this is either an incoming request
                // from the peer expecting a reply, or a reply whose waiter
                // already gave up (an orphan, per the cancellation
                // semantics) — both are handed to the unsolicited stream,
                // since the transport itself cannot tell them apart.
                let _ = inner.unsolicited_tx.send(message);
            }
            Err(Err(_)) => unreachable!("resolve is always called with Ok(message) here"),
        }
    }
}

/// Removes a waiter's table entries on drop, however the enclosing future
/// exits. See [`Endpoint::request`].
struct PendingGuard {
    inner: Arc<EndpointInner>,
    id: CorrelationId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.pending.remove(self.id);
    }
}

fn reason_clone(reason: &FpcError) -> FpcError {
    match reason {
        FpcError::Stopped => FpcError::Stopped,
        FpcError::Disconnected => FpcError::Disconnected,
        other => FpcError::Io(std::io::Error::other(other.to_string())),
    }
}

/// An outgoing frame fully assembled: wire bytes plus the descriptors that
/// ride alongside it in `sendmsg` order.
struct PreparedFrame {
    bytes: Vec<u8>,
    /// Wire order: the OOL shm descriptor first (if `has_shm`), then the
    /// caller's own descriptors.
    fds: Vec<OwnedFd>,
    /// Kinds of the caller-supplied descriptors, in the same order as their
    /// tail of `fds` (i.e. excluding the OOL slot).
    caller_kinds: Vec<DescriptorKind>,
    has_shm: bool,
}

impl PreparedFrame {
    /// Reconstructs the caller's descriptors for a failed send, closing the
    /// internally-allocated OOL shm descriptor (if any) along the way.
    /// Caller-supplied descriptors are never the implementation's to clean
    /// up — they come back to the caller untouched.
    fn into_caller_descriptors(self) -> Vec<OpaqueDescriptorRef> {
        let mut fds = self.fds;
        if self.has_shm && !fds.is_empty() {
            drop(fds.remove(0));
        }
        fds.into_iter()
            .zip(self.caller_kinds)
            .map(|(fd, kind)| OpaqueDescriptorRef::new(kind, fd))
            .collect()
    }
}

/// Builds the wire frame for `message`, routing through the OOL engine when
/// `payload.len()` exceeds `inline_threshold`. On failure, returns the
/// caller's original descriptors so ownership never silently passes to the
/// implementation.
fn prepare_frame(
    message: Message,
    inline_threshold: usize,
    limiter: &dyn ShmRightsLimiter,
) -> std::result::Result<PreparedFrame, (FpcError, Vec<OpaqueDescriptorRef>)> {
    let Message {
        id,
        correlation_id,
        payload,
        descriptors,
    } = message;

    let is_ool = payload.len() > inline_threshold;
    let total_descriptors = descriptors.len() + usize::from(is_ool);
    if total_descriptors > MAX_DESCRIPTORS {
        return Err((FpcError::TooManyDescriptors(total_descriptors), descriptors));
    }

    if is_ool {
        let shm = match ool::prepare_send(&payload, limiter) {
            Ok(fd) => fd,
            Err(error) => return Err((error, descriptors)),
        };

        let caller_kinds: Vec<DescriptorKind> = descriptors.iter().map(|d| d.kind()).collect();
        let tags: Vec<u8> = std::iter::once(OOL_TAG)
            .chain(caller_kinds.iter().map(|k| k.to_tag()))
            .collect();

        let header = frame::build_header(id, correlation_id, 0, total_descriptors as u8, true);
        let bytes = frame::encode(&header, &[], &tags);

        let mut fds = Vec::with_capacity(total_descriptors);
        fds.push(shm);
        fds.extend(
            descriptors
                .into_iter()
                .map(|d| d.into_owned_fd().expect("descriptor not yet taken")),
        );

        Ok(PreparedFrame {
            bytes,
            fds,
            caller_kinds,
            has_shm: true,
        })
    } else {
        let caller_kinds: Vec<DescriptorKind> = descriptors.iter().map(|d| d.kind()).collect();
        let tags: Vec<u8> = caller_kinds.iter().map(|k| k.to_tag()).collect();

        let header = frame::build_header(
            id,
            correlation_id,
            payload.len() as u32,
            descriptors.len() as u8,
            false,
        );
        let bytes = frame::encode(&header, &payload, &tags);

        let fds: Vec<OwnedFd> = descriptors
            .into_iter()
            .map(|d| d.into_owned_fd().expect("descriptor not yet taken"))
            .collect();

        Ok(PreparedFrame {
            bytes,
            fds,
            caller_kinds,
            has_shm: false,
        })
    }
}

/// Turns a validated, decoded frame plus its ancillary descriptors into an
/// application-visible [`Message`], running OOL post-processing when the
/// frame carries its payload out-of-line.
fn assemble_message(decoded: DecodedFrame, mut fds: Vec<OwnedFd>) -> Result<Message> {
    let count = decoded.header.descriptor_count as usize;
    let kinds = frame::decode_trailer_kinds(&decoded.trailer, count);

    if decoded.is_ool() {
        // `frame::decode` already guaranteed `descriptor_count >= 1` and
        // `validate_descriptor_count` guaranteed `fds.len() ==
        // descriptor_count`, so this is always present.
        let shm_fd = fds.remove(0);
        let payload = ool::receive_and_close(shm_fd)?;

        let descriptors = fds
            .into_iter()
            .zip(kinds.into_iter().skip(1))
            .map(|(fd, kind)| OpaqueDescriptorRef::new(kind, fd))
            .collect();

        Ok(Message {
            id: MessageId(decoded.header.message_id),
            correlation_id: decoded.header.correlation_id,
            payload,
            descriptors,
        })
    } else {
        let descriptors = fds
            .into_iter()
            .zip(kinds)
            .map(|(fd, kind)| OpaqueDescriptorRef::new(kind, fd))
            .collect();

        Ok(Message {
            id: MessageId(decoded.header.message_id),
            correlation_id: decoded.header.correlation_id,
            payload: decoded.payload,
            descriptors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd(kind: DescriptorKind) -> OpaqueDescriptorRef {
        let null = std::fs::File::open("/dev/null").unwrap();
        OpaqueDescriptorRef::new(kind, null.into())
    }

    #[test]
    fn inline_frame_with_254_descriptors_is_accepted() {
        let descriptors: Vec<_> = (0..254).map(|_| fd(DescriptorKind::File)).collect();
        let message = Message::notification(MessageId::EVENT, vec![], descriptors);
        let prepared = prepare_frame(message, 1024, &NoopShmRightsLimiter).unwrap();
        assert!(!prepared.has_shm);
        assert_eq!(prepared.fds.len(), 254);
    }

    #[test]
    fn inline_frame_with_255_descriptors_is_rejected() {
        let descriptors: Vec<_> = (0..255).map(|_| fd(DescriptorKind::File)).collect();
        let message = Message::notification(MessageId::EVENT, vec![], descriptors);
        let err = prepare_frame(message, 1024, &NoopShmRightsLimiter).unwrap_err();
        assert!(matches!(err.0, FpcError::TooManyDescriptors(255)));
        // Caller-supplied descriptors are handed back untouched on rejection.
        assert_eq!(err.1.len(), 255);
    }

    #[test]
    fn ool_send_with_254_caller_descriptors_is_rejected_before_allocating_shm() {
        let descriptors: Vec<_> = (0..254).map(|_| fd(DescriptorKind::File)).collect();
        let message = Message::notification(MessageId::EVENT, vec![0u8; 4096], descriptors);
        let err = prepare_frame(message, 1024, &NoopShmRightsLimiter).unwrap_err();
        assert!(matches!(err.0, FpcError::TooManyDescriptors(255)));
        assert_eq!(err.1.len(), 254);
    }

    #[test]
    fn payload_at_threshold_stays_inline_one_over_goes_ool() {
        let at_threshold = Message::notification(MessageId::EVENT, vec![0u8; 64], vec![]);
        let prepared = prepare_frame(at_threshold, 64, &NoopShmRightsLimiter).unwrap();
        assert!(!prepared.has_shm);

        let over_threshold = Message::notification(MessageId::EVENT, vec![0u8; 65], vec![]);
        let prepared = prepare_frame(over_threshold, 64, &NoopShmRightsLimiter).unwrap();
        assert!(prepared.has_shm);
    }
}
