//! RFC 1350 packet encoding and decoding.
//!
//! Pure (de)serialization over byte buffers: no I/O, no locking. All
//! integers cross the wire in network byte order via the `bytes` crate.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TftpError};

pub const DEFAULT_BLOCK_SIZE: usize = 512;
pub const MAX_PACKET_SIZE: usize = DEFAULT_BLOCK_SIZE + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl Opcode {
    fn from_u16(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            other => Err(TftpError::Tftp(format!("unknown opcode {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOp = 4,
    UnknownTid = 5,
    FileExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined, see error message (if any)",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOp => "Illegal TFTP operation",
            ErrorCode::UnknownTid => "Unknown transfer ID",
            ErrorCode::FileExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

/// `netascii` is accepted but treated identically to `octet` at the byte
/// level; `mail` is an obsolete RFC 1350 mode we reject outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Netascii,
    Octet,
}

impl TransferMode {
    fn parse(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("octet") {
            Ok(TransferMode::Octet)
        } else if s.eq_ignore_ascii_case("netascii") {
            Ok(TransferMode::Netascii)
        } else {
            Err(TftpError::Tftp(format!("unsupported transfer mode: {s}")))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq { filename: String, mode: TransferMode },
    Wrq { filename: String, mode: TransferMode },
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
}

impl Packet {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut bytes = BytesMut::from(buf);
        if bytes.len() < 2 {
            return Err(TftpError::Tftp("packet too small".into()));
        }
        let opcode = Opcode::from_u16(bytes.get_u16())?;
        match opcode {
            Opcode::Rrq => Self::decode_request(&mut bytes, true),
            Opcode::Wrq => Self::decode_request(&mut bytes, false),
            Opcode::Data => {
                if bytes.remaining() < 2 {
                    return Err(TftpError::Tftp("truncated DATA packet".into()));
                }
                let block = bytes.get_u16();
                let payload = bytes.to_vec();
                if payload.len() > DEFAULT_BLOCK_SIZE {
                    return Err(TftpError::Tftp("DATA payload exceeds block size".into()));
                }
                Ok(Packet::Data { block, payload })
            }
            Opcode::Ack => {
                if bytes.remaining() < 2 {
                    return Err(TftpError::Tftp("truncated ACK packet".into()));
                }
                Ok(Packet::Ack {
                    block: bytes.get_u16(),
                })
            }
            Opcode::Error => {
                if bytes.remaining() < 2 {
                    return Err(TftpError::Tftp("truncated ERROR packet".into()));
                }
                let raw_code = bytes.get_u16();
                let code = match raw_code {
                    0 => ErrorCode::NotDefined,
                    1 => ErrorCode::FileNotFound,
                    2 => ErrorCode::AccessViolation,
                    3 => ErrorCode::DiskFull,
                    4 => ErrorCode::IllegalOp,
                    5 => ErrorCode::UnknownTid,
                    6 => ErrorCode::FileExists,
                    7 => ErrorCode::NoSuchUser,
                    other => return Err(TftpError::Tftp(format!("unknown error code {other}"))),
                };
                let message = parse_cstr(&mut bytes)?;
                Ok(Packet::Error { code, message })
            }
        }
    }

    fn decode_request(bytes: &mut BytesMut, is_read: bool) -> Result<Self> {
        let filename = parse_cstr(bytes)?;
        if filename.is_empty() {
            return Err(TftpError::Tftp("empty filename".into()));
        }
        let mode_str = parse_cstr(bytes)?;
        let mode = TransferMode::parse(&mode_str)?;
        Ok(if is_read {
            Packet::Rrq { filename, mode }
        } else {
            Packet::Wrq { filename, mode }
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MAX_PACKET_SIZE);
        match self {
            Packet::Rrq { filename, mode } => {
                buf.put_u16(Opcode::Rrq as u16);
                put_cstr(&mut buf, filename);
                put_cstr(&mut buf, mode_str(*mode));
            }
            Packet::Wrq { filename, mode } => {
                buf.put_u16(Opcode::Wrq as u16);
                put_cstr(&mut buf, filename);
                put_cstr(&mut buf, mode_str(*mode));
            }
            Packet::Data { block, payload } => {
                buf.put_u16(Opcode::Data as u16);
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            Packet::Ack { block } => {
                buf.put_u16(Opcode::Ack as u16);
                buf.put_u16(*block);
            }
            Packet::Error { code, message } => {
                buf.put_u16(Opcode::Error as u16);
                buf.put_u16(*code as u16);
                put_cstr(&mut buf, message);
            }
        }
        buf.to_vec()
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code,
            message: message.into(),
        }
    }
}

fn mode_str(mode: TransferMode) -> &'static str {
    match mode {
        TransferMode::Netascii => "netascii",
        TransferMode::Octet => "octet",
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn parse_cstr(bytes: &mut BytesMut) -> Result<String> {
    let zero = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::Tftp("unterminated string in packet".into()))?;
    let raw = bytes.split_to(zero);
    bytes.advance(1); // consume the NUL
    String::from_utf8(raw.to_vec()).map_err(|e| TftpError::Tftp(format!("invalid utf-8: {e}")))
}
