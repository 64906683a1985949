//! Host-directed RPC: wire framing (`framing`) and the tokio listener/client (`server`).

pub mod framing;
pub mod server;

pub use framing::{Request, Response};
pub use server::{RequestHandler, TcpTransport};
