//! Ember - embeddable HTTP/1.1 and WebSocket server
//!
//! Listeners accept connections and hand them round-robin to a fixed pool of
//! single-threaded workers. Each connection is parsed, routed to an async
//! handler or served from a static directory, and may be upgraded to a
//! WebSocket session.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod router;
pub mod server;
pub mod static_files;
pub mod websocket;

pub use config::{Config, ListenAddress, Protocol};
pub use error::{BindError, ServerError};
pub use router::Router;
pub use server::{RunningServer, Server};
