//! Error taxonomy shared by the endpoint, listener and credentials accessor.

use thiserror::Error;

/// Errors produced by the transport, correlation engine and listener.
///
/// Variants map directly onto the error kinds a caller can match on; there is
/// no catch-all "other" bucket beyond [`FpcError::Io`], which wraps syscall
/// failures that don't correspond to a named kind (e.g. `bind()` failing
/// because the path already exists).
#[derive(Debug, Error)]
pub enum FpcError {
    /// The remote peer closed the connection, or the receive loop hit a
    /// fatal error. Terminal: the endpoint has transitioned to `stopped`.
    #[error("disconnected")]
    Disconnected,

    /// `stop()` was called locally. Terminal, same as `Disconnected` but
    /// distinguished so a caller can tell a clean local shutdown from a
    /// peer-initiated one.
    #[error("endpoint stopped")]
    Stopped,

    /// The listener was stopped; its accept loop and connection stream have
    /// ended.
    #[error("listener closed")]
    ListenerClosed,

    /// An API that requires `start()` to have run was called on an `idle`
    /// endpoint or listener.
    #[error("not started")]
    NotStarted,

    /// `incoming()` or `connections()` was called a second time during a run.
    /// The first consumer is unaffected.
    #[error("stream already claimed")]
    StreamAlreadyClaimed,

    /// A received frame failed structural validation. Fatal for the receive
    /// loop: a peer that can't frame correctly is not trusted to
    /// resynchronize.
    #[error("invalid message format")]
    InvalidMessageFormat,

    /// The header names a protocol version this implementation doesn't
    /// understand. Fatal, same policy as `InvalidMessageFormat`.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    /// Reserved for application-level dispatch; the transport never raises
    /// this itself.
    #[error("unexpected message {0}")]
    UnexpectedMessage(u32),

    /// A `request()` deadline expired before a reply arrived. Local to the
    /// one waiter; the endpoint keeps running.
    #[error("request timed out")]
    Timeout,

    /// The caller's descriptor list (plus the OOL slot, if applicable)
    /// exceeds the 254-descriptor cap. Nothing was sent.
    #[error("too many descriptors: {0}")]
    TooManyDescriptors(usize),

    /// A syscall failed in a way that doesn't map onto a taxonomy entry
    /// above.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FpcError>;

/// Returned by a failed `send()`: the error plus the caller-supplied
/// descriptors.
///
/// Ownership of caller-supplied descriptors never passes to the
/// implementation on failure — only internally-allocated descriptors (the
/// OOL shared-memory object) are the implementation's to clean up. Handing
/// the descriptors back through the error is how that contract is expressed
/// in a language where passing a `Vec<T>` by value already moved them out of
/// the caller's own variables.
#[derive(Debug)]
pub struct SendFailure {
    pub error: FpcError,
    pub descriptors: Vec<crate::descriptor::OpaqueDescriptorRef>,
}

impl std::fmt::Display for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for SendFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// The outcome of a `request()` call as delivered to the pending-reply
/// table: either a transport-level failure (timeout, disconnect,
/// cancellation, an error reply) or a failure of the initial send, which
/// carries the caller's descriptors back per the same ownership contract as
/// [`SendFailure`].
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Transport(#[from] FpcError),

    #[error("send failed: {error}")]
    SendFailed {
        error: FpcError,
        descriptors: Vec<crate::descriptor::OpaqueDescriptorRef>,
    },
}
