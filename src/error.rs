//! Error taxonomy shared across the server.
//!
//! Protocol-level failures (`ParseError`, `FileError`, `WebSocketError`) live
//! next to the code that produces them and are recovered at the connection
//! boundary. The errors here are the ones that reach the embedding
//! application: configuration problems and listener start-up failures.

use std::io;

use crate::config::ListenAddress;

/// Failure to bind or start a single listener.
///
/// Fatal for that listener only: the server keeps serving on every address
/// that did bind and reports these through `RunningServer::bind_errors`.
#[derive(Debug, thiserror::Error)]
#[error("failed to bind {address}: {source}")]
pub struct BindError {
    pub address: ListenAddress,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configuration was rejected; no listener was started.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Every configured address failed to bind.
    #[error("no listener could be started ({} address(es) failed)", .0.len())]
    NoListeners(Vec<BindError>),

    /// A worker thread or its runtime could not be created.
    #[error("failed to start worker {worker}: {source}")]
    Worker {
        worker: usize,
        #[source]
        source: io::Error,
    },
}
