//! Request bodies read while they arrive.
//!
//! A streaming route gets a [`BodyStream`] instead of a buffered body. The
//! connection pushes each decoded piece into it as the parser produces
//! them; the stream ends once the body is complete, or yields a
//! [`BodyError`] when the connection gives up first.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::http::parser::ParseError;

/// Pieces in flight between the connection and the handler.
const STREAM_CAPACITY: usize = 8;

pub(crate) type BodySender = mpsc::Sender<Result<Bytes, BodyError>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BodyError {
    #[error("malformed body: {0}")]
    Malformed(ParseError),
    #[error("request timed out while reading the body")]
    TimedOut,
    #[error("peer closed the connection mid-body")]
    Disconnected,
}

#[derive(Debug)]
pub struct BodyStream {
    rx: mpsc::Receiver<Result<Bytes, BodyError>>,
}

impl BodyStream {
    pub(crate) fn channel() -> (BodySender, BodyStream) {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        (tx, BodyStream { rx })
    }

    /// A stream over a body that is already in memory.
    pub fn from_bytes(body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let (tx, stream) = Self::channel();
        if !body.is_empty() {
            // The channel is fresh, so the single piece always fits.
            let _ = tx.try_send(Ok(body));
        }
        stream
    }

    /// The next piece of the body, or `None` once it is complete.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, BodyError> {
        match self.rx.recv().await {
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Collects the rest of the body.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, BodyError> {
        let mut out = Vec::new();
        while let Some(data) = self.chunk().await? {
            out.extend_from_slice(&data);
        }
        Ok(out)
    }
}
