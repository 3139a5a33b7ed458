#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

mod config;
mod correlation;
mod credentials;
mod descriptor;
mod endpoint;
mod error;
mod flags;
mod frame;
mod header;
mod limits;
mod listener;
mod message;
mod ool;
mod socket;
mod util;

pub use config::{EndpointConfig, ListenerConfig};
pub use correlation::{CorrelationAllocator, PendingTables, ReplyResult};
pub use credentials::{PeerCredentials, query as query_peer_credentials};
pub use descriptor::{DescriptorKind, OpaqueDescriptorRef, trailer_tag_for};
pub use endpoint::{ConnectionState, Endpoint, UnsolicitedStream};
pub use error::{FpcError, RequestError, Result, SendFailure};
pub use flags::FrameFlags;
pub use frame::{
    DecodedFrame, build_header, decode, decode_trailer_kinds, encode, validate_descriptor_count,
};
pub use header::WireHeader;
pub use limits::{
    FRAME_OVERHEAD, HEADER_SIZE, MAX_DESCRIPTORS, OOL_TAG, PROTOCOL_VERSION, TRAILER_SIZE,
    max_frame_size, max_inline_payload,
};
pub use listener::{ConnectionStream, Listener};
pub use message::{CorrelationId, Message, MessageId, ReplyToken, UNSOLICITED};
pub use ool::{NoopShmRightsLimiter, ShmRightsLimiter};
pub use socket::SocketHolder;
