//! End-to-end transfers between two CAP sockets over real UDP on localhost.

use cap::config::SockOpt;
use cap::error::CapError;
use cap::socket::CapSocket;
use std::net::SocketAddr;
use std::time::Duration;

fn any_local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn socket_pair() -> (CapSocket, CapSocket) {
    let server = CapSocket::bind(any_local()).await.unwrap();
    let client = CapSocket::bind(any_local()).await.unwrap();
    (server, client)
}

#[tokio::test]
async fn test_single_message_transfer() {
    let (server, client) = socket_pair().await;
    let server_addr = server.local_addr();

    server.listen().await;

    let client_task = tokio::spawn(async move {
        client.connect(server_addr).await.unwrap();
        client.sendto(b"HELLO").await.unwrap();
        client.close().await.unwrap();
    });

    let peer = server.accept().await.unwrap();
    assert_eq!(peer.ip(), server_addr.ip());

    assert_eq!(server.recv().await.unwrap(), b"HELLO".to_vec());
    assert_eq!(server.recv().await.unwrap_err(), CapError::ConnectionClosed);

    client_task.await.unwrap();
}

#[tokio::test]
async fn test_multiple_messages_arrive_in_order() {
    let (server, client) = socket_pair().await;
    let server_addr = server.local_addr();

    server.listen().await;

    let client_task = tokio::spawn(async move {
        client.connect(server_addr).await.unwrap();
        for i in 0..20u32 {
            client.sendto(format!("message {}", i).as_bytes()).await.unwrap();
        }
        client.close().await.unwrap();
    });

    server.accept().await.unwrap();
    for i in 0..20u32 {
        assert_eq!(server.recv().await.unwrap(), format!("message {}", i).into_bytes());
    }
    assert_eq!(server.recv().await.unwrap_err(), CapError::ConnectionClosed);

    client_task.await.unwrap();
}

#[tokio::test]
async fn test_large_message_spans_many_segments() {
    let (server, client) = socket_pair().await;
    let server_addr = server.local_addr();

    // a small payload cap and window force segmentation and window refills
    client.set_opt(SockOpt::PayloadMax(3)).await.unwrap();
    client.set_opt(SockOpt::Window(4)).await.unwrap();
    server.set_opt(SockOpt::PayloadMax(3)).await.unwrap();

    server.listen().await;

    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let client_task = tokio::spawn(async move {
        client.connect(server_addr).await.unwrap();
        client.sendto(&payload).await.unwrap();
        client.close().await.unwrap();
    });

    server.accept().await.unwrap();
    assert_eq!(server.recv().await.unwrap(), expected);

    client_task.await.unwrap();
}

#[tokio::test]
async fn test_message_of_exact_payload_multiple() {
    let (server, client) = socket_pair().await;
    let server_addr = server.local_addr();

    client.set_opt(SockOpt::PayloadMax(2)).await.unwrap();
    server.set_opt(SockOpt::PayloadMax(2)).await.unwrap();
    server.listen().await;

    let client_task = tokio::spawn(async move {
        client.connect(server_addr).await.unwrap();
        client.sendto(b"ABCD").await.unwrap();
        client.sendto(b"").await.unwrap();
        client.close().await.unwrap();
    });

    server.accept().await.unwrap();
    assert_eq!(server.recv().await.unwrap(), b"ABCD".to_vec());
    assert_eq!(server.recv().await.unwrap(), b"".to_vec());

    client_task.await.unwrap();
}

#[tokio::test]
async fn test_connect_without_listener_times_out() {
    let client = CapSocket::bind(any_local()).await.unwrap();

    // a blackholed peer: bound but never listening, so SYNs go unanswered
    let blackhole = CapSocket::bind(any_local()).await.unwrap();

    client.set_opt(SockOpt::RtoMin(Duration::from_millis(50))).await.unwrap();
    client.set_opt(SockOpt::RtoInitial(Duration::from_millis(50))).await.unwrap();
    client.set_opt(SockOpt::HandshakeRetries(2)).await.unwrap();

    let result = client.connect(blackhole.local_addr()).await;
    assert_eq!(result.unwrap_err(), CapError::ConnectTimeout);
}

#[tokio::test]
async fn test_send_before_connect_fails() {
    let socket = CapSocket::bind(any_local()).await.unwrap();
    assert_eq!(socket.sendto(b"X").await.unwrap_err(), CapError::NotConnected);
}

#[tokio::test]
async fn test_bind_same_address_twice_fails() {
    let first = CapSocket::bind(any_local()).await.unwrap();
    let result = CapSocket::bind(first.local_addr()).await;
    assert_eq!(result.unwrap_err(), CapError::AddressInUse);
}

#[tokio::test]
async fn test_get_opt_reflects_configuration() {
    let socket = CapSocket::bind(any_local()).await.unwrap();

    socket.set_opt(SockOpt::Window(7)).await.unwrap();
    assert_eq!(
        socket.get_opt(cap::config::SockOptKey::Window).await.unwrap(),
        SockOpt::Window(7)
    );

    // invalid settings are rejected and leave the previous value in place
    assert!(socket.set_opt(SockOpt::Window(0)).await.is_err());
    assert_eq!(
        socket.get_opt(cap::config::SockOptKey::Window).await.unwrap(),
        SockOpt::Window(7)
    );
}
