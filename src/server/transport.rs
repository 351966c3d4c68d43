//! Byte streams a connection can run over.
//!
//! Plain connections use the accepted `TcpStream` directly. Secure listeners
//! hand the socket to an application-supplied [`SecureAcceptor`] first, which
//! returns whatever encrypted stream it builds on top.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::router::BoxFuture;

pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn Transport>;

/// Performs the secure handshake for connections accepted on a
/// [`Protocol::Secure`](crate::config::Protocol::Secure) address.
///
/// Runs on the worker that owns the connection.
pub trait SecureAcceptor: Send + Sync + 'static {
    fn accept(&self, stream: TcpStream, peer: SocketAddr) -> BoxFuture<io::Result<BoxedStream>>;
}
