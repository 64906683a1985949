//! Host-directed RPC wire framing: 8-byte ASCII command, fixed header, length-prefixed payload.
//! Responses are `OK`/`NO` (2 bytes) or `EXCEPT` framed as an 8-byte tag, `u32` length, UTF-8
//! message. All integers big-endian.

use crate::common::TransactionId;
use crate::error::{DbError, Result};
use crate::xa::tree::{Command, Tree};
use bytes::{Buf, BufMut, BytesMut};

const COMMAND_TAG_LEN: usize = 8;
const EXCEPT_TAG: &[u8; 8] = b"EXCEPT  ";

fn pad_tag(tag: &str) -> [u8; COMMAND_TAG_LEN] {
    let mut buf = [b' '; COMMAND_TAG_LEN];
    let bytes = tag.as_bytes();
    let n = bytes.len().min(COMMAND_TAG_LEN);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    No,
    Except(String),
}

/// A fully framed inbound broadcast request: command, transaction id, and the subtree the
/// recipient must further dispatch to.
#[derive(Debug, Clone)]
pub struct Request {
    pub command: Command,
    pub tx: TransactionId,
    pub subtree: Option<Tree>,
}

fn command_from_tag(tag: &[u8; COMMAND_TAG_LEN]) -> Result<Command> {
    std::str::from_utf8(tag)
        .ok()
        .and_then(Command::from_tag)
        .ok_or_else(|| DbError::Protocol(format!("unrecognized command tag {tag:?}")))
}

/// Encodes a request: `8-byte command | u64 tx | u32 subtree_len | subtree_bytes`.
pub fn encode_request(req: &Request) -> Result<Vec<u8>> {
    let subtree_bytes = match &req.subtree {
        Some(tree) => bincode::serde::encode_to_vec(tree, bincode::config::standard())?,
        None => Vec::new(),
    };

    let mut buf = BytesMut::with_capacity(COMMAND_TAG_LEN + 8 + 4 + subtree_bytes.len());
    buf.put_slice(&pad_tag(req.command.tag()));
    buf.put_u64(req.tx);
    buf.put_u32(subtree_bytes.len() as u32);
    buf.put_slice(&subtree_bytes);
    Ok(buf.to_vec())
}

/// Attempts to decode one request from `buf`, consuming the bytes it uses. Returns `Ok(None)` if
/// the buffer does not yet hold a full frame (caller should read more and retry).
pub fn try_decode_request(buf: &mut BytesMut) -> Result<Option<Request>> {
    if buf.len() < COMMAND_TAG_LEN + 8 + 4 {
        return Ok(None);
    }
    let mut peek = &buf[..];
    let mut tag = [0u8; COMMAND_TAG_LEN];
    tag.copy_from_slice(&peek[..COMMAND_TAG_LEN]);
    peek.advance(COMMAND_TAG_LEN);
    let tx = peek.get_u64();
    let subtree_len = peek.get_u32() as usize;

    let header_len = COMMAND_TAG_LEN + 8 + 4;
    if buf.len() < header_len + subtree_len {
        return Ok(None);
    }

    let command = command_from_tag(&tag)?;
    buf.advance(header_len);
    let subtree = if subtree_len > 0 {
        let (tree, _): (Tree, usize) =
            bincode::serde::decode_from_slice(&buf[..subtree_len], bincode::config::standard())?;
        Some(tree)
    } else {
        None
    };
    buf.advance(subtree_len);

    Ok(Some(Request { command, tx, subtree }))
}

pub fn encode_response(resp: &Response) -> Vec<u8> {
    match resp {
        Response::Ok => b"OK".to_vec(),
        Response::No => b"NO".to_vec(),
        Response::Except(msg) => {
            let mut buf = BytesMut::with_capacity(COMMAND_TAG_LEN + 4 + msg.len());
            buf.put_slice(EXCEPT_TAG);
            buf.put_u32(msg.len() as u32);
            buf.put_slice(msg.as_bytes());
            buf.to_vec()
        }
    }
}

pub fn try_decode_response(buf: &mut BytesMut) -> Result<Option<Response>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if &buf[..2] == b"OK" {
        buf.advance(2);
        return Ok(Some(Response::Ok));
    }
    if &buf[..2] == b"NO" {
        buf.advance(2);
        return Ok(Some(Response::No));
    }
    if buf.len() < COMMAND_TAG_LEN + 4 {
        return Ok(None);
    }
    if &buf[..COMMAND_TAG_LEN] != EXCEPT_TAG {
        return Err(DbError::Protocol("unrecognized response tag".into()));
    }
    let len = u32::from_be_bytes(buf[COMMAND_TAG_LEN..COMMAND_TAG_LEN + 4].try_into().unwrap()) as usize;
    if buf.len() < COMMAND_TAG_LEN + 4 + len {
        return Ok(None);
    }
    buf.advance(COMMAND_TAG_LEN + 4);
    let msg = String::from_utf8_lossy(&buf[..len]).into_owned();
    buf.advance(len);
    Ok(Some(Response::Except(msg)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xa::tree::make_tree;

    #[test]
    fn request_round_trips() {
        let tree = make_tree(&["a".into(), "b".into()], 4);
        let req = Request { command: Command::Prepare, tx: 77, subtree: Some(tree) };
        let bytes = encode_request(&req).unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        let decoded = try_decode_request(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.tx, 77);
        assert_eq!(decoded.command, Command::Prepare);
        assert!(buf.is_empty());
    }

    #[test]
    fn checktx_request_round_trips_with_no_subtree() {
        let req = Request { command: Command::CheckTx, tx: 42, subtree: None };
        let bytes = encode_request(&req).unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        let decoded = try_decode_request(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.tx, 42);
        assert_eq!(decoded.command, Command::CheckTx);
        assert!(decoded.subtree.is_none());
    }

    #[test]
    fn incomplete_request_returns_none() {
        let tree = make_tree(&["a".into()], 4);
        let req = Request { command: Command::MDelete, tx: 1, subtree: Some(tree) };
        let bytes = encode_request(&req).unwrap();
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(try_decode_request(&mut buf).unwrap().is_none());
    }

    #[test]
    fn response_round_trips() {
        for resp in [Response::Ok, Response::No, Response::Except("bad tx".into())] {
            let bytes = encode_response(&resp);
            let mut buf = BytesMut::from(&bytes[..]);
            assert_eq!(try_decode_response(&mut buf).unwrap().unwrap(), resp);
        }
    }
}
