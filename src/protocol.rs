//! Wire framing and per-connection request dispatch.
//!
//! Frame layout (all integers little-endian):
//!
//! ```text
//! request header (13 bytes): op:1 klen:4 vlen:4 ttl:4
//! request body:              name[klen] value[vlen]
//! response header (8 bytes): code:4 n:4
//! ```

use std::io::{Read, Write};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;
use zeroize::Zeroize;

use crate::metrics::{LatencyTimer, Metrics, OpKind};
use crate::store::{Store, StoreError};
use crate::transport::{self, PeerCred, TransportError};

pub const REQUEST_HEADER_LEN: usize = 13;
pub const RESPONSE_HEADER_LEN: usize = 8;
pub const CODE_OK: u32 = 0;
pub const CODE_ERR: u32 = 1;
const MAX_NAME_LEN: u32 = 256;
const MAX_VALUE_LEN: u32 = 1 << 20;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown opcode {0}")]
    UnknownOp(u8),
    #[error("request field out of bounds")]
    BadLength,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Put,
    Get,
    Delete,
    List,
    Metrics,
}

impl Op {
    fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0 => Ok(Op::Put),
            1 => Ok(Op::Get),
            2 => Ok(Op::Delete),
            3 => Ok(Op::List),
            4 => Ok(Op::Metrics),
            other => Err(ProtocolError::UnknownOp(other)),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Op::Put => 0,
            Op::Get => 1,
            Op::Delete => 2,
            Op::List => 3,
            Op::Metrics => 4,
        }
    }

    fn as_kind(self) -> OpKind {
        match self {
            Op::Put => OpKind::Put,
            Op::Get => OpKind::Get,
            Op::Delete => OpKind::Delete,
            Op::List => OpKind::List,
            Op::Metrics => OpKind::Metrics,
        }
    }
}

struct RequestHeader {
    op: Op,
    klen: u32,
    vlen: u32,
    ttl: u32,
}

impl RequestHeader {
    fn decode(buf: &[u8; REQUEST_HEADER_LEN]) -> Result<Self, ProtocolError> {
        let op = Op::from_byte(buf[0])?;
        let klen = u32::from_le_bytes(buf[1..5].try_into().unwrap());
        let vlen = u32::from_le_bytes(buf[5..9].try_into().unwrap());
        let ttl = u32::from_le_bytes(buf[9..13].try_into().unwrap());
        if klen > MAX_NAME_LEN || vlen > MAX_VALUE_LEN {
            return Err(ProtocolError::BadLength);
        }
        Ok(Self { op, klen, vlen, ttl })
    }
}

fn encode_response_header(code: u32, n: u32) -> [u8; RESPONSE_HEADER_LEN] {
    let mut out = [0u8; RESPONSE_HEADER_LEN];
    out[0..4].copy_from_slice(&code.to_le_bytes());
    out[4..8].copy_from_slice(&n.to_le_bytes());
    out
}

fn read_exact_or_close<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    r.read_exact(buf).map_err(|e| ProtocolError::Transport(TransportError::Io(e)))
}

/// Drives one connection to completion: reads requests until EOF or an I/O
/// error, dispatching each to the store and metrics, per the state machine
/// `ACCEPTED -> READING_HEADER -> READING_BODY -> PROCESSING ->
/// WRITING_RESPONSE -> (READING_HEADER | CLOSED)`.
pub fn serve_connection(
    stream: &mut std::os::unix::net::UnixStream,
    peer: PeerCred,
    store: &Store,
    metrics: &Metrics,
) {
    loop {
        match serve_one_request(stream, &peer, store, metrics) {
            Ok(true) => continue,
            Ok(false) => return,
            Err(e) => {
                warn!(uid = peer.uid, gid = peer.gid, error = %e, "connection closed on error");
                return;
            }
        }
    }
}

/// Returns `Ok(true)` to keep reading, `Ok(false)` on clean EOF.
fn serve_one_request(
    stream: &mut std::os::unix::net::UnixStream,
    peer: &PeerCred,
    store: &Store,
    metrics: &Metrics,
) -> Result<bool, ProtocolError> {
    let mut header_buf = [0u8; REQUEST_HEADER_LEN];
    match stream.read_exact(&mut header_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(ProtocolError::Transport(TransportError::Io(e))),
    }

    let header = match RequestHeader::decode(&header_buf) {
        Ok(h) => h,
        Err(e) => {
            metrics.record_error("bad_op");
            return Err(e);
        }
    };

    let mut name_buf = vec![0u8; header.klen as usize];
    read_exact_or_close(stream, &mut name_buf)?;
    let name = String::from_utf8_lossy(&name_buf).to_string();

    let mut value_buf = vec![0u8; header.vlen as usize];
    read_exact_or_close(stream, &mut value_buf)?;

    let timer = LatencyTimer::start();
    let requester_id = peer.uid;

    match header.op {
        Op::Put => {
            let ttl = if header.ttl == 0 { None } else { Some(Duration::from_secs(header.ttl as u64)) };
            let result = store.put(&name, &value_buf, ttl, requester_id);
            finish_result(header.op, &result, metrics, &timer);
            write_simple_response(stream, result.is_ok())?;
        }
        Op::Get => {
            let result = store.open(&name, requester_id);
            finish_result(header.op, &result, metrics, &timer);
            match result {
                Ok(mut plaintext) => {
                    write_response_header(stream, CODE_OK, 0)?;
                    let send_res = transport::send_sealed_plaintext(stream, &name, &plaintext);
                    plaintext.zeroize();
                    send_res?;
                }
                Err(_) => write_response_header(stream, CODE_ERR, 0)?,
            }
        }
        Op::Delete => {
            let result = store.delete(&name, requester_id);
            finish_result(header.op, &result, metrics, &timer);
            write_simple_response(stream, result.is_ok())?;
        }
        Op::List => {
            metrics.record_op(OpKind::List);
            let names = store.list(requester_id);
            write_response_header(stream, CODE_OK, names.len() as u32)?;
            for name in names {
                let bytes = name.as_bytes();
                stream
                    .write_all(&(bytes.len() as u32).to_le_bytes())
                    .and_then(|_| stream.write_all(bytes))
                    .map_err(|e| ProtocolError::Transport(TransportError::Io(e)))?;
            }
        }
        Op::Metrics => {
            metrics.record_op(OpKind::Metrics);
            let body = metrics.render(store);
            write_response_header(stream, CODE_OK, body.len() as u32)?;
            stream
                .write_all(body.as_bytes())
                .map_err(|e| ProtocolError::Transport(TransportError::Io(e)))?;
        }
    }

    Ok(true)
}

fn finish_result<T>(
    op: Op,
    result: &Result<T, StoreError>,
    metrics: &Metrics,
    timer: &LatencyTimer,
) {
    metrics.observe_latency(op.as_kind(), timer.elapsed());
    match result {
        Ok(_) => metrics.record_op(op.as_kind()),
        Err(e) => metrics.record_error(error_kind(e)),
    }
}

fn error_kind(e: &StoreError) -> &'static str {
    match e {
        StoreError::NotFound => "not_found",
        StoreError::Forbidden => "forbidden",
        StoreError::Seal(_) => "seal",
        StoreError::Open(_) => "open",
    }
}

fn write_response_header(
    stream: &mut std::os::unix::net::UnixStream,
    code: u32,
    n: u32,
) -> Result<(), ProtocolError> {
    stream
        .write_all(&encode_response_header(code, n))
        .map_err(|e| ProtocolError::Transport(TransportError::Io(e)))
}

fn write_simple_response(
    stream: &mut std::os::unix::net::UnixStream,
    ok: bool,
) -> Result<(), ProtocolError> {
    write_response_header(stream, if ok { CODE_OK } else { CODE_ERR }, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        buf[0] = Op::Get.to_byte();
        buf[1..5].copy_from_slice(&7u32.to_le_bytes());
        buf[5..9].copy_from_slice(&0u32.to_le_bytes());
        buf[9..13].copy_from_slice(&30u32.to_le_bytes());
        let h = RequestHeader::decode(&buf).unwrap();
        assert_eq!(h.op, Op::Get);
        assert_eq!(h.klen, 7);
        assert_eq!(h.vlen, 0);
        assert_eq!(h.ttl, 30);
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        buf[0] = 99;
        assert!(matches!(RequestHeader::decode(&buf), Err(ProtocolError::UnknownOp(99))));
    }

    #[test]
    fn oversized_lengths_rejected() {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        buf[0] = Op::Put.to_byte();
        buf[1..5].copy_from_slice(&(MAX_NAME_LEN + 1).to_le_bytes());
        assert!(matches!(RequestHeader::decode(&buf), Err(ProtocolError::BadLength)));
    }
}
