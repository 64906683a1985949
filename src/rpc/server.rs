//! Tokio TCP listener dispatching inbound framed requests to the 2PC coordinator, tree
//! dispatcher, and DML executor; and the matching `Transport` client used to send outbound
//! broadcast branches.

use crate::error::{DbError, Result};
use crate::rpc::framing::{encode_request, encode_response, try_decode_request, Request, Response};
use crate::xa::tree::{Command, Tree, Transport, Vote};
use async_trait::async_trait;
use bytes::BytesMut;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// Handles one fully decoded inbound request and returns the response to send back. Implemented
/// by whatever owns the coordinator/dispatcher/executor for this node; kept as a trait so the
/// listener loop has no direct dependency on those types.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// `peer` is the address the request arrived from — for `PREPARE`, this is the coordinator
    /// that must be recorded in this node's durable `Ready`/`NotReady` vote.
    async fn handle(&self, req: Request, peer: SocketAddr) -> Result<Response>;
}

pub async fn serve(addr: SocketAddr, handler: std::sync::Arc<dyn RequestHandler>) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(DbError::Io)?;
    info!(%addr, "rpc listener bound");
    loop {
        let (socket, peer) = listener.accept().await.map_err(DbError::Io)?;
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(socket, peer, handler).await {
                warn!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

async fn serve_connection(mut socket: TcpStream, peer: SocketAddr, handler: std::sync::Arc<dyn RequestHandler>) -> Result<()> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(req) = try_decode_request(&mut buf)? {
            let resp = match handler.handle(req, peer).await {
                Ok(resp) => resp,
                Err(e) => Response::Except(e.to_string()),
            };
            socket.write_all(&encode_response(&resp)).await.map_err(DbError::Io)?;
            continue;
        }
        let mut chunk = [0u8; 4096];
        let n = socket.read(&mut chunk).await.map_err(DbError::Io)?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// TCP client `Transport`: connects to the subtree root with a bounded connect/read timeout
/// (required on the `PREPARE` branch, where an unreachable host must become a NO vote promptly
/// rather than hang the whole broadcast).
pub struct TcpTransport {
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TcpTransport {
    pub fn new(port: u16, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self { port, connect_timeout, read_timeout }
    }

    fn connect_blocking(&self, host: &str) -> std::io::Result<std::net::TcpStream> {
        let addr: SocketAddr = format!("{host}:{}", self.port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_read_timeout(Some(self.read_timeout))?;
        socket.connect_timeout(&addr.into(), self.connect_timeout)?;
        Ok(socket.into())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(
        &self,
        host: &str,
        command: Command,
        tx: crate::common::TransactionId,
        subtree: Option<&Tree>,
    ) -> Result<Vote> {
        let host = host.to_string();
        let subtree = subtree.cloned();
        let port = self.port;
        let connect_timeout = self.connect_timeout;
        let read_timeout = self.read_timeout;

        let response = tokio::task::spawn_blocking(move || -> Result<Response> {
            let transport = TcpTransport { port, connect_timeout, read_timeout };
            let mut stream = transport.connect_blocking(&host).map_err(DbError::Io)?;
            use std::io::{Read, Write};
            let req = Request { command, tx, subtree };
            stream.write_all(&encode_request(&req)?).map_err(DbError::Io)?;

            let mut buf = BytesMut::with_capacity(256);
            let mut chunk = [0u8; 256];
            loop {
                if let Some(resp) = crate::rpc::framing::try_decode_response(&mut buf)? {
                    return Ok(resp);
                }
                let n = stream.read(&mut chunk).map_err(DbError::Io)?;
                if n == 0 {
                    return Err(DbError::Network(format!("{host} closed connection without a response")));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        })
        .await
        .map_err(|e| DbError::Internal(format!("transport task panicked: {e}")))??;

        match response {
            Response::Ok => Ok(Vote::Ok),
            Response::No => Ok(Vote::No),
            Response::Except(msg) => {
                error!(host, %msg, "peer returned EXCEPT");
                Err(DbError::Protocol(msg))
            }
        }
    }
}
