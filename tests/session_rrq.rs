//! RRQ wire-protocol tests against real bound UDP sockets.

use std::time::Duration;
use tokio::net::UdpSocket;
use tftpd::packet::{ErrorCode, Packet};
use tftpd::session;

fn default_timeout() -> Duration {
    Duration::from_secs(session::TIMEOUT_SECONDS)
}

async fn socket_pair() -> (UdpSocket, UdpSocket) {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    server.connect(client.local_addr().unwrap()).await.ok();
    (server, client)
}

#[tokio::test]
async fn small_file_round_trips_exact_wire_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.txt");
    tokio::fs::write(&path, b"hi").await.unwrap();

    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer = client.local_addr().unwrap();

    let file = tokio::fs::File::open(&path).await.unwrap();
    let server_task = tokio::spawn(async move { session::run_rrq(&server, peer, file, default_timeout(), session::MAX_RETRIES).await });

    let mut buf = vec![0u8; 600];
    let (n, from) = client.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], &[0x00, 0x03, 0x00, 0x01, b'h', b'i']);
    client
        .send_to(&Packet::Ack { block: 1 }.encode(), from)
        .await
        .unwrap();

    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn file_of_exactly_one_block_sends_terminal_zero_length_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exact.bin");
    tokio::fs::write(&path, vec![7u8; 512]).await.unwrap();

    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer = client.local_addr().unwrap();

    let file = tokio::fs::File::open(&path).await.unwrap();
    let server_task = tokio::spawn(async move { session::run_rrq(&server, peer, file, default_timeout(), session::MAX_RETRIES).await });

    let mut buf = vec![0u8; 600];

    let (n, from) = client.recv_from(&mut buf).await.unwrap();
    match Packet::decode(&buf[..n]).unwrap() {
        Packet::Data { block: 1, payload } => assert_eq!(payload.len(), 512),
        other => panic!("unexpected packet: {other:?}"),
    }
    client
        .send_to(&Packet::Ack { block: 1 }.encode(), from)
        .await
        .unwrap();

    let (n, from) = client.recv_from(&mut buf).await.unwrap();
    match Packet::decode(&buf[..n]).unwrap() {
        Packet::Data { block: 2, payload } => assert!(payload.is_empty()),
        other => panic!("unexpected packet: {other:?}"),
    }
    client
        .send_to(&Packet::Ack { block: 2 }.encode(), from)
        .await
        .unwrap();

    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn round_trips_various_sizes() {
    for size in [0usize, 1, 511, 512, 513, 1024, 1025, 4096] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let contents: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &contents).await.unwrap();

        let (server, client) = socket_pair().await;
        let peer = client.local_addr().unwrap();
        let file = tokio::fs::File::open(&path).await.unwrap();
        let server_task =
            tokio::spawn(async move { session::run_rrq(&server, peer, file, default_timeout(), session::MAX_RETRIES).await });

        let mut received = Vec::new();
        let mut block: u16 = 1;
        loop {
            let mut buf = vec![0u8; 600];
            let (n, from) = client.recv_from(&mut buf).await.unwrap();
            match Packet::decode(&buf[..n]).unwrap() {
                Packet::Data {
                    block: got_block,
                    payload,
                } => {
                    assert_eq!(got_block, block);
                    let terminal = payload.len() < 512;
                    received.extend_from_slice(&payload);
                    client
                        .send_to(&Packet::Ack { block }.encode(), from)
                        .await
                        .unwrap();
                    if terminal {
                        break;
                    }
                    block = block.wrapping_add(1);
                }
                other => panic!("unexpected packet: {other:?}"),
            }
        }

        server_task.await.unwrap().unwrap();
        assert_eq!(received, contents, "mismatch for size {size}");
    }
}

#[tokio::test]
async fn missing_file_sends_file_not_found_and_fails() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer = client.local_addr().unwrap();

    session::send_error(&server, peer, ErrorCode::FileNotFound, "file not found").await;

    let mut buf = vec![0u8; 600];
    let (n, _from) = client.recv_from(&mut buf).await.unwrap();
    match Packet::decode(&buf[..n]).unwrap() {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::FileNotFound),
        other => panic!("unexpected packet: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn timeout_triggers_retransmit_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recover.bin");
    tokio::fs::write(&path, b"abcdef").await.unwrap();

    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer = client.local_addr().unwrap();

    let file = tokio::fs::File::open(&path).await.unwrap();
    let server_task = tokio::spawn(async move { session::run_rrq(&server, peer, file, default_timeout(), session::MAX_RETRIES).await });

    let mut buf = vec![0u8; 600];
    // first DATA(1) is dropped by never reading it until the retransmit arrives
    let (n, from) = client.recv_from(&mut buf).await.unwrap();
    assert!(matches!(Packet::decode(&buf[..n]).unwrap(), Packet::Data { block: 1, .. }));

    // second DATA(1), the retransmit after the 5s timeout, gets ACKed
    let (n, from2) = client.recv_from(&mut buf).await.unwrap();
    assert_eq!(from, from2);
    assert!(matches!(Packet::decode(&buf[..n]).unwrap(), Packet::Data { block: 1, .. }));
    client
        .send_to(&Packet::Ack { block: 1 }.encode(), from)
        .await
        .unwrap();

    server_task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn unresponsive_peer_gives_up_after_max_retries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("giveup.bin");
    tokio::fs::write(&path, b"abcdef").await.unwrap();

    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer = client.local_addr().unwrap();

    let file = tokio::fs::File::open(&path).await.unwrap();
    let server_task = tokio::spawn(async move { session::run_rrq(&server, peer, file, default_timeout(), session::MAX_RETRIES).await });

    let mut buf = vec![0u8; 600];
    let mut sends = 0;
    loop {
        match client.recv_from(&mut buf).await {
            Ok((n, _)) => match Packet::decode(&buf[..n]) {
                Ok(Packet::Data { block: 1, .. }) => sends += 1,
                Ok(Packet::Error { .. }) => break,
                other => panic!("unexpected packet: {other:?}"),
            },
            Err(e) => panic!("recv failed: {e}"),
        }
    }

    // session::MAX_RETRIES retransmits plus the original send
    assert_eq!(sends, session::MAX_RETRIES as usize + 1);
    assert!(server_task.await.unwrap().is_err());
}
