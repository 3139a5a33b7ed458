//! Value types: message ids, messages, and reply tokens (C9).

use crate::descriptor::OpaqueDescriptorRef;

/// Thin wrapper over a 32-bit message tag, with the well-known constants
/// reserved by the protocol. Application-defined ids start at 256.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u32);

impl MessageId {
    pub const PING: MessageId = MessageId(1);
    pub const PONG: MessageId = MessageId(2);
    pub const LOOKUP: MessageId = MessageId(3);
    pub const LOOKUP_REPLY: MessageId = MessageId(4);
    pub const SUBSCRIBE: MessageId = MessageId(5);
    pub const SUBSCRIBE_ACK: MessageId = MessageId(6);
    pub const EVENT: MessageId = MessageId(7);
    pub const ERROR: MessageId = MessageId(255);

    /// First id an application is free to assign.
    pub const APPLICATION_START: u32 = 256;
}

impl From<u32> for MessageId {
    fn from(value: u32) -> Self {
        MessageId(value)
    }
}

impl From<MessageId> for u32 {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

/// Correlation id ties a reply to its request. Zero means unsolicited.
pub type CorrelationId = u64;

/// The reserved correlation id marking a message as unsolicited (a
/// notification or an incoming request with no prior local waiter).
pub const UNSOLICITED: CorrelationId = 0;

/// A message exchanged over an endpoint.
///
/// Value type: messages carry value semantics for their scalar fields, but
/// own their descriptors until those descriptors are sent or consumed — see
/// the descriptor ownership notes on [`OpaqueDescriptorRef`].
#[derive(Debug)]
pub struct Message {
    pub id: MessageId,
    pub correlation_id: CorrelationId,
    pub payload: Vec<u8>,
    pub descriptors: Vec<OpaqueDescriptorRef>,
}

impl Message {
    /// Builds an unsolicited request-shaped message (`correlation_id = 0`).
    /// The endpoint overwrites the correlation field only when the message
    /// is handed to `request(...)`.
    pub fn request(id: MessageId, payload: Vec<u8>, descriptors: Vec<OpaqueDescriptorRef>) -> Self {
        Message {
            id,
            correlation_id: UNSOLICITED,
            payload,
            descriptors,
        }
    }

    /// Builds a notification: always unsolicited, never correlated.
    pub fn notification(
        id: MessageId,
        payload: Vec<u8>,
        descriptors: Vec<OpaqueDescriptorRef>,
    ) -> Self {
        Message {
            id,
            correlation_id: UNSOLICITED,
            payload,
            descriptors,
        }
    }

    /// Builds a reply to `target`'s correlation id.
    pub fn reply_to(
        target: &Message,
        id: MessageId,
        payload: Vec<u8>,
        descriptors: Vec<OpaqueDescriptorRef>,
    ) -> Self {
        Message {
            id,
            correlation_id: target.correlation_id,
            payload,
            descriptors,
        }
    }

    /// Builds a reply to a bare [`ReplyToken`]'s correlation id.
    pub fn reply_to_token(
        target: &ReplyToken,
        id: MessageId,
        payload: Vec<u8>,
        descriptors: Vec<OpaqueDescriptorRef>,
    ) -> Self {
        Message {
            id,
            correlation_id: target.correlation_id,
            payload,
            descriptors,
        }
    }

    pub fn is_unsolicited(&self) -> bool {
        self.correlation_id == UNSOLICITED
    }
}

/// A lightweight value holding just a correlation id, extracted from a
/// received request so the application can discard the message body while
/// retaining the ability to reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyToken {
    pub correlation_id: CorrelationId,
}

impl From<&Message> for ReplyToken {
    fn from(message: &Message) -> Self {
        ReplyToken {
            correlation_id: message.correlation_id,
        }
    }
}
