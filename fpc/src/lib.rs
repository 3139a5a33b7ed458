#![doc = include_str!("../README.md")]

//! Application-facing facade over [`fpc_core`].
//!
//! Depend on this crate (`fpc`) rather than `fpc-core` directly — the split
//! mirrors the core/facade shape of this codebase's own RPC transport, where
//! applications reach for the top-level crate and the core crate stays an
//! implementation detail that can grow service-dispatch layers later without
//! disturbing callers.

pub use fpc_core::{
    ConnectionState, ConnectionStream, CorrelationId, DescriptorKind, Endpoint, EndpointConfig,
    FpcError, FrameFlags, Listener, ListenerConfig, Message, MessageId, NoopShmRightsLimiter,
    OpaqueDescriptorRef, PeerCredentials, ReplyToken, RequestError, Result, SendFailure,
    ShmRightsLimiter, UnsolicitedStream, query_peer_credentials,
};

/// Wildcard-importable surface for application code: `use fpc::prelude::*;`.
pub mod prelude {
    pub use crate::{
        ConnectionState, DescriptorKind, Endpoint, EndpointConfig, FpcError, Listener,
        ListenerConfig, Message, MessageId, OpaqueDescriptorRef, PeerCredentials, ReplyToken,
        RequestError, Result,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn ping_pong_round_trip() {
        let (a, b) = tokio_seqpacket::UnixSeqpacket::pair().unwrap();
        let a = Endpoint::from_socket(a, EndpointConfig::default());
        let b = Endpoint::from_socket(b, EndpointConfig::default());
        a.start().unwrap();
        b.start().unwrap();

        let mut b_incoming = b.incoming().unwrap();

        let b_task = tokio::spawn(async move {
            use tokio_stream::StreamExt;
            let request = b_incoming.next().await.unwrap();
            assert_eq!(request.id, MessageId::PING);
            b.reply(&request, MessageId::PONG, vec![0x04], vec![])
                .await
                .unwrap();
        });

        let reply = a
            .request(
                Message::request(MessageId::PING, vec![0x01, 0x02, 0x03], vec![]),
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert_eq!(reply.id, MessageId::PONG);
        assert_eq!(reply.payload, vec![0x04]);

        b_task.await.unwrap();
    }
}
