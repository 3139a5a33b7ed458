//! End-to-end scenarios exercised over real connected `SOCK_SEQPACKET`
//! sockets — socketpairs for the endpoint tests, a bound listener under a
//! temp directory for the listener/credentials tests. No mocked transport.

use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::time::Duration;

use fpc::prelude::*;
use fpc::ConnectionStream;
use tokio_stream::StreamExt;

fn pair(config: EndpointConfig) -> (Endpoint, Endpoint) {
    let (a, b) = tokio_seqpacket::UnixSeqpacket::pair().unwrap();
    let a = Endpoint::from_socket(a, config);
    let b = Endpoint::from_socket(b, config);
    a.start().unwrap();
    b.start().unwrap();
    (a, b)
}

#[tokio::test]
async fn unsolicited_event_reaches_incoming_stream() {
    let (a, b) = pair(EndpointConfig::default());
    let mut a_incoming = a.incoming().unwrap();

    b.send(Message::notification(MessageId::EVENT, b"hello".to_vec(), vec![]))
        .await
        .unwrap();

    let event = a_incoming.next().await.unwrap();
    assert_eq!(event.id, MessageId::EVENT);
    assert_eq!(event.payload, b"hello");
    assert!(event.is_unsolicited());
}

#[tokio::test]
async fn request_times_out_when_peer_never_replies() {
    let (a, b) = pair(EndpointConfig::default());
    let mut b_incoming = b.incoming().unwrap();

    let result = a
        .request(
            Message::request(MessageId::LOOKUP, vec![], vec![]),
            Some(Duration::from_millis(50)),
        )
        .await;

    assert!(matches!(
        result,
        Err(RequestError::Transport(FpcError::Timeout))
    ));

    // The request frame did arrive — b just chose never to answer it.
    let request = b_incoming.next().await.unwrap();
    assert_eq!(request.id, MessageId::LOOKUP);

    // The endpoint stays running after a timeout; a fresh request still works.
    b.reply(ReplyToken::from(&request), MessageId::ERROR, vec![], vec![])
        .await
        .unwrap();
    assert_eq!(a.state(), ConnectionState::Running);
}

#[tokio::test]
async fn cancelling_a_request_drops_its_pending_entry() {
    let (a, _b) = pair(EndpointConfig::default());

    let handle = tokio::spawn(async move {
        a.request(Message::request(MessageId::LOOKUP, vec![], vec![]), None)
            .await
    });

    // Give the request a moment to register before cancelling it.
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.abort();
    let result = handle.await;
    assert!(result.is_err() && result.unwrap_err().is_cancelled());
}

#[tokio::test]
async fn large_payload_round_trips_via_out_of_line_shared_memory() {
    // Force the OOL path deterministically regardless of the host's kernel
    // socket buffer ceiling.
    let config = EndpointConfig {
        inline_payload_threshold: Some(64),
    };
    let (a, b) = pair(config);
    let mut b_incoming = b.incoming().unwrap();

    let payload = vec![0x5a_u8; 1024 * 1024];
    let expected = payload.clone();
    a.send(Message::notification(MessageId::EVENT, payload, vec![]))
        .await
        .unwrap();

    let received = b_incoming.next().await.unwrap();
    assert_eq!(received.payload, expected);
    assert!(received.descriptors.is_empty());
}

#[tokio::test]
async fn stopping_the_peer_resolves_an_in_flight_request_with_disconnected() {
    let (a, b) = pair(EndpointConfig::default());

    let request = tokio::spawn(async move {
        a.request(Message::request(MessageId::LOOKUP, vec![], vec![]), None)
            .await
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    b.stop();

    let result = request.await.unwrap();
    assert!(matches!(
        result,
        Err(RequestError::Transport(FpcError::Disconnected))
    ));
}

#[tokio::test]
async fn listener_accepts_connections_over_a_real_socket_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fpc-test.sock");

    let listener = Listener::bind(&path, ListenerConfig::default(), EndpointConfig::default()).unwrap();
    listener.start().unwrap();
    let mut connections: ConnectionStream = listener.connections().unwrap();

    let client = Endpoint::connect(&path, EndpointConfig::default()).await.unwrap();
    client.start().unwrap();

    let server = connections.next().await.unwrap();
    server.start().unwrap();

    client
        .send(Message::notification(MessageId::PING, vec![1], vec![]))
        .await
        .unwrap();

    let mut server_incoming = server.incoming().unwrap();
    let message = server_incoming.next().await.unwrap();
    assert_eq!(message.id, MessageId::PING);

    listener.stop();
}

#[tokio::test]
async fn peer_credentials_report_the_local_process() {
    let (a, b) = pair(EndpointConfig::default());
    let creds = a.peer_credentials().unwrap();
    let _ = b.peer_credentials().unwrap();

    // Both ends of a socketpair belong to this same process.
    assert_eq!(creds.uid, unsafe { libc::getuid() });
    assert!(creds.groups.contains(&creds.gid));
}

#[tokio::test]
async fn incoming_stream_cannot_be_claimed_twice() {
    let (a, _b) = pair(EndpointConfig::default());
    let _first = a.incoming().unwrap();
    assert!(matches!(a.incoming(), Err(FpcError::StreamAlreadyClaimed)));
}

#[tokio::test]
async fn descriptor_attachment_round_trips_to_the_peer() {
    let (a, b) = pair(EndpointConfig::default());
    let mut b_incoming = b.incoming().unwrap();

    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    write!(tmp, "fpc descriptor payload").unwrap();
    tmp.flush().unwrap();
    // A fresh fd positioned at 0, independent of `tmp`'s own cursor.
    let owned: OwnedFd = tmp.reopen().unwrap().into();
    let descriptor = OpaqueDescriptorRef::new(DescriptorKind::File, owned);

    a.send(Message::notification(MessageId::EVENT, vec![], vec![descriptor]))
        .await
        .unwrap();

    let mut received = b_incoming.next().await.unwrap();
    assert_eq!(received.descriptors.len(), 1);
    assert_eq!(received.descriptors[0].kind(), DescriptorKind::File);

    let received_fd = received.descriptors.remove(0).into_owned_fd().unwrap();
    let mut received_file: std::fs::File = received_fd.into();
    let mut contents = String::new();
    received_file.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "fpc descriptor payload");
}
