//! §4.7: the well-known-port listener. Owns the port-69 socket exclusively;
//! each accepted request gets its own ephemeral socket and task.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::audit::AuditLogger;
use crate::atomic_write;
use crate::error::Result;
use crate::packet::{ErrorCode, MAX_PACKET_SIZE, Packet};
use crate::registry::{ClientRegistry, FileRegistry};
use crate::session;

/// Minimum viable RRQ/WRQ envelope: 2 opcode + 1 filename + 1 NUL + 6
/// `octet` + 1 NUL.
const MIN_REQUEST_SIZE: usize = 11;

pub struct Dispatcher {
    socket: Arc<UdpSocket>,
    root_dir: PathBuf,
    max_file_size_bytes: u64,
    timeout: Duration,
    max_retries: u32,
    files: FileRegistry,
    clients: ClientRegistry,
}

impl Dispatcher {
    /// `timeout`/`max_retries` come from `TftpConfig` (§10.2) and are
    /// forwarded to every session this dispatcher spawns.
    pub async fn bind(
        bind_addr: SocketAddr,
        root_dir: PathBuf,
        max_file_size_bytes: u64,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            root_dir,
            max_file_size_bytes,
            timeout,
            max_retries,
            files: FileRegistry::new(),
            clients: ClientRegistry::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Runs forever, spawning one task per accepted request.
    pub async fn run(&self) -> Result<()> {
        info!("listening on {}", self.socket.local_addr()?);
        AuditLogger::server_started(
            &self.socket.local_addr()?.to_string(),
            &self.root_dir.display().to_string(),
        );

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await?;
            if n < MIN_REQUEST_SIZE {
                warn!("dropping undersized datagram ({n} bytes) from {peer}");
                continue;
            }
            let raw = buf[..n].to_vec();

            if !self.clients.try_register(peer, raw.clone()).await {
                AuditLogger::duplicate_request_suppressed(&peer.to_string());
                continue;
            }

            let local_ip = self.socket.local_addr()?.ip();
            let root_dir = self.root_dir.clone();
            let max_file_size_bytes = self.max_file_size_bytes;
            let timeout = self.timeout;
            let max_retries = self.max_retries;
            let files = self.files.clone();
            let clients = self.clients.clone();

            tokio::spawn(async move {
                let session_socket = match UdpSocket::bind((local_ip, 0)).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("failed to allocate ephemeral socket for {peer}: {e}");
                        clients.unregister(peer, &raw).await;
                        return;
                    }
                };

                if let Err(e) = handle_request(
                    &session_socket,
                    peer,
                    &raw,
                    &root_dir,
                    max_file_size_bytes,
                    timeout,
                    max_retries,
                    &files,
                )
                .await
                {
                    warn!("session with {peer} failed: {e}");
                }

                clients.unregister(peer, &raw).await;
            });
        }
    }
}

/// Resolves `filename` against `root_dir`, rejecting any path that escapes
/// it (absolute paths, `..` components).
fn resolve_path(root_dir: &Path, filename: &str) -> Option<PathBuf> {
    let candidate = Path::new(filename);
    if candidate
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir | std::path::Component::RootDir))
    {
        return None;
    }
    Some(root_dir.join(candidate))
}

async fn handle_request(
    socket: &UdpSocket,
    peer: SocketAddr,
    raw: &[u8],
    root_dir: &Path,
    max_file_size_bytes: u64,
    timeout: Duration,
    max_retries: u32,
    files: &FileRegistry,
) -> Result<()> {
    let packet = match Packet::decode(raw) {
        Ok(p) => p,
        Err(e) => {
            session::send_error(socket, peer, ErrorCode::NotDefined, "malformed packet").await;
            return Err(e);
        }
    };

    match packet {
        Packet::Rrq { filename, .. } => {
            handle_rrq(socket, peer, &filename, root_dir, timeout, max_retries, files).await
        }
        Packet::Wrq { filename, .. } => {
            handle_wrq(
                socket,
                peer,
                &filename,
                root_dir,
                max_file_size_bytes,
                timeout,
                max_retries,
                files,
            )
            .await
        }
        other => {
            session::send_error(socket, peer, ErrorCode::NotDefined, "unsupported opcode").await;
            Err(crate::error::TftpError::Tftp(format!(
                "unsupported opcode from {peer}: {other:?}"
            )))
        }
    }
}

async fn handle_rrq(
    socket: &UdpSocket,
    peer: SocketAddr,
    filename: &str,
    root_dir: &Path,
    timeout: Duration,
    max_retries: u32,
    files: &FileRegistry,
) -> Result<()> {
    AuditLogger::read_request(&peer.to_string(), filename);

    let Some(path) = resolve_path(root_dir, filename) else {
        session::send_error(socket, peer, ErrorCode::AccessViolation, "invalid path").await;
        return Err(crate::error::TftpError::Tftp(format!(
            "path escapes root: {filename}"
        )));
    };

    let lock = files.begin_read(filename).await;

    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            files.end_read(lock).await;
            session::send_error(socket, peer, ErrorCode::FileNotFound, "file not found").await;
            AuditLogger::transfer_failed(&peer.to_string(), filename, &e.to_string());
            return Err(e.into());
        }
    };

    let result = session::run_rrq(socket, peer, file, timeout, max_retries).await;
    files.end_read(lock).await;

    match &result {
        Ok(()) => {
            let bytes = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            AuditLogger::transfer_completed(&peer.to_string(), filename, bytes);
        }
        Err(e) => AuditLogger::transfer_failed(&peer.to_string(), filename, &e.to_string()),
    }
    result
}

/// §6: maps a failure to open the destination temp file onto the wire error
/// code that best describes its cause.
fn wrq_open_error_code(e: &std::io::Error) -> ErrorCode {
    match e.kind() {
        std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded => ErrorCode::DiskFull,
        _ => ErrorCode::AccessViolation,
    }
}

async fn handle_wrq(
    socket: &UdpSocket,
    peer: SocketAddr,
    filename: &str,
    root_dir: &Path,
    max_file_size_bytes: u64,
    timeout: Duration,
    max_retries: u32,
    files: &FileRegistry,
) -> Result<()> {
    AuditLogger::write_request(&peer.to_string(), filename);

    let Some(path) = resolve_path(root_dir, filename) else {
        session::send_error(socket, peer, ErrorCode::AccessViolation, "invalid path").await;
        return Err(crate::error::TftpError::Tftp(format!(
            "path escapes root: {filename}"
        )));
    };
    let tmp_path = atomic_write::temp_path(&path);

    let lock = files.begin_write(filename).await;

    let file = match tokio::fs::File::create(&tmp_path).await {
        Ok(f) => f,
        Err(e) => {
            files.end_write(lock).await;
            session::send_error(socket, peer, wrq_open_error_code(&e), "cannot open for write")
                .await;
            AuditLogger::transfer_failed(&peer.to_string(), filename, &e.to_string());
            return Err(e.into());
        }
    };

    let result = session::run_wrq(socket, peer, file, timeout, max_retries).await;

    if result.is_ok() {
        if let Ok(meta) = tokio::fs::metadata(&tmp_path).await
            && max_file_size_bytes > 0
            && meta.len() > max_file_size_bytes
        {
            atomic_write::discard(&tmp_path).await;
            files.end_write(lock).await;
            session::send_error(socket, peer, ErrorCode::DiskFull, "file exceeds maximum size")
                .await;
            let err = crate::error::TftpError::Tftp("file exceeds maximum size".into());
            AuditLogger::transfer_failed(&peer.to_string(), filename, &err.to_string());
            return Err(err);
        }
        atomic_write::publish(&path, &tmp_path).await;
    } else {
        atomic_write::discard(&tmp_path).await;
    }

    files.end_write(lock).await;

    match &result {
        Ok(()) => {
            let bytes = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            AuditLogger::transfer_completed(&peer.to_string(), filename, bytes);
        }
        Err(e) => AuditLogger::transfer_failed(&peer.to_string(), filename, &e.to_string()),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_rejects_parent_dir_traversal() {
        let root = Path::new("/srv/tftp");
        assert!(resolve_path(root, "../etc/passwd").is_none());
    }

    #[test]
    fn resolve_path_rejects_absolute_paths() {
        let root = Path::new("/srv/tftp");
        assert!(resolve_path(root, "/etc/passwd").is_none());
    }

    #[test]
    fn resolve_path_joins_relative_names() {
        let root = Path::new("/srv/tftp");
        assert_eq!(
            resolve_path(root, "firmware.bin").unwrap(),
            PathBuf::from("/srv/tftp/firmware.bin")
        );
    }

    #[tokio::test]
    async fn bind_reports_local_addr() {
        let d = Dispatcher::bind(
            "127.0.0.1:0".parse().unwrap(),
            PathBuf::from("/tmp"),
            0,
            Duration::from_secs(session::TIMEOUT_SECONDS),
            session::MAX_RETRIES,
        )
        .await
        .unwrap();
        assert!(d.local_addr().unwrap().port() > 0);
    }
}
