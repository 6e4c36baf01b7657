//! §4.4/§4.5: the per-session RRQ/WRQ state machine. Everything here runs
//! inside one spawned task bound to one ephemeral socket; the only shared
//! state it touches is the `FileLock` its caller already acquired.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::audit::AuditLogger;
use crate::error::{Result, TftpError};
use crate::packet::{DEFAULT_BLOCK_SIZE, ErrorCode, MAX_PACKET_SIZE, Packet};

pub const TIMEOUT_SECONDS: u64 = 5;
pub const MAX_RETRIES: u32 = 4;

/// Sends `packet` to `peer` on `socket`, ignoring send errors (the caller
/// is already terminating and has nothing further to tell the peer).
/// §10.1: every ERROR packet sent to a peer is also an audit record.
pub async fn send_error(socket: &UdpSocket, peer: SocketAddr, code: ErrorCode, message: &str) {
    let wire = Packet::error(code, message).encode();
    if let Err(e) = socket.send_to(&wire, peer).await {
        warn!("failed to send ERROR to {peer}: {e}");
    }
    AuditLogger::error_sent(&peer.to_string(), &format!("{code:?}"), message);
}

/// Receives the next packet addressed to this session, silently rejecting
/// datagrams from any sender other than `peer` with an `UnknownTID` reply
/// (RFC 1350 §4; see §9). Never returns a packet from a stray sender.
async fn recv_from_peer(socket: &UdpSocket, peer: SocketAddr) -> Result<Packet> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        if from != peer {
            debug!("ignoring datagram from unexpected sender {from}, expected {peer}");
            let wire = Packet::error(ErrorCode::UnknownTid, "unknown transfer ID").encode();
            let _ = socket.send_to(&wire, from).await;
            continue;
        }
        return Packet::decode(&buf[..n]);
    }
}

/// §4.4: server-to-client transfer. `file` is already open for read;
/// preconditions (lock held, open succeeded) are the caller's
/// responsibility. `timeout`/`max_retries` come from `TftpConfig` (§10.2).
pub async fn run_rrq(
    socket: &UdpSocket,
    peer: SocketAddr,
    mut file: tokio::fs::File,
    timeout: Duration,
    max_retries: u32,
) -> Result<()> {
    let mut block_num: u16 = 1;
    loop {
        let mut payload = vec![0u8; DEFAULT_BLOCK_SIZE];
        let n = file.read(&mut payload).await?;
        payload.truncate(n);
        let terminal = n < DEFAULT_BLOCK_SIZE;
        let wire = Packet::Data {
            block: block_num,
            payload,
        }
        .encode();

        let mut attempt = 0u32;
        loop {
            socket.send_to(&wire, peer).await?;
            match tokio::time::timeout(timeout, wait_for_ack(socket, peer, block_num)).await {
                Ok(Ok(())) => break,
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => {
                    attempt += 1;
                    if attempt > max_retries {
                        send_error(socket, peer, ErrorCode::NotDefined, "timed out awaiting ACK")
                            .await;
                        return Err(TftpError::Tftp(format!(
                            "peer {peer} unresponsive after {max_retries} retries"
                        )));
                    }
                    debug!("ACK({block_num}) timed out, retransmitting (attempt {attempt})");
                }
            }
        }

        if terminal {
            return Ok(());
        }
        block_num = block_num.wrapping_add(1);
    }
}

/// Waits for the ACK matching `expected_block`. Stale ACKs (block numbers
/// behind `expected_block`) are discarded and waiting continues with no
/// retransmit and no effect on the caller's retry budget.
async fn wait_for_ack(socket: &UdpSocket, peer: SocketAddr, expected_block: u16) -> Result<()> {
    loop {
        match recv_from_peer(socket, peer).await? {
            Packet::Ack { block } if block == expected_block => return Ok(()),
            Packet::Ack { block } if block < expected_block => {
                debug!("discarding stale ACK({block}), awaiting ACK({expected_block})");
                continue;
            }
            Packet::Error { code, message } => {
                return Err(TftpError::Tftp(format!(
                    "peer sent ERROR {code:?}: {message}"
                )));
            }
            other => {
                send_error(socket, peer, ErrorCode::NotDefined, "unexpected packet").await;
                return Err(TftpError::Tftp(format!(
                    "unexpected packet while awaiting ACK({expected_block}): {other:?}"
                )));
            }
        }
    }
}

/// §4.5: client-to-server transfer. `file` is already open for write at
/// the session's temp path; the caller runs the atomic-write policy after
/// this returns. `timeout`/`max_retries` come from `TftpConfig` (§10.2).
pub async fn run_wrq(
    socket: &UdpSocket,
    peer: SocketAddr,
    mut file: tokio::fs::File,
    timeout: Duration,
    max_retries: u32,
) -> Result<()> {
    socket.send_to(&Packet::Ack { block: 0 }.encode(), peer).await?;
    let mut last_ack = Packet::Ack { block: 0 }.encode();
    let mut expected: u16 = 1;
    let mut retry = 0u32;

    loop {
        match tokio::time::timeout(timeout, recv_from_peer(socket, peer)).await {
            Ok(Ok(Packet::Data { block, payload })) if block == expected => {
                let written = file.write(&payload).await?;
                if written < payload.len() {
                    send_error(socket, peer, ErrorCode::DiskFull, "short write").await;
                    return Err(TftpError::Tftp(format!(
                        "short write for block {expected}: wrote {written} of {}",
                        payload.len()
                    )));
                }
                let terminal = payload.len() < DEFAULT_BLOCK_SIZE;
                last_ack = Packet::Ack { block: expected }.encode();
                socket.send_to(&last_ack, peer).await?;
                retry = 0;
                if terminal {
                    file.flush().await?;
                    return Ok(());
                }
                expected = expected.wrapping_add(1);
            }
            Ok(Ok(Packet::Data { block, .. })) if block == expected.wrapping_sub(1) => {
                debug!("re-emitting ACK({block}) for duplicate DATA");
                socket.send_to(&last_ack, peer).await?;
            }
            Ok(Ok(Packet::Data { block, .. })) => {
                send_error(socket, peer, ErrorCode::NotDefined, "block out of sequence").await;
                return Err(TftpError::Tftp(format!(
                    "unexpected block {block}, expected {expected}"
                )));
            }
            Ok(Ok(Packet::Error { code, message })) => {
                return Err(TftpError::Tftp(format!(
                    "peer sent ERROR {code:?}: {message}"
                )));
            }
            Ok(Ok(other)) => {
                send_error(socket, peer, ErrorCode::NotDefined, "unexpected packet").await;
                return Err(TftpError::Tftp(format!("unexpected packet: {other:?}")));
            }
            Ok(Err(e)) => return Err(e),
            Err(_elapsed) => {
                if retry >= max_retries {
                    return Err(TftpError::Tftp(format!(
                        "peer {peer} unresponsive after {max_retries} retries"
                    )));
                }
                retry += 1;
                debug!("DATA({expected}) timed out, retransmitting ACK (attempt {retry})");
                socket.send_to(&last_ack, peer).await?;
            }
        }
    }
}
