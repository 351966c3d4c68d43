//! WebSocket sessions (RFC 6455) over an upgraded connection.
//!
//! After a successful handshake the connection leaves the HTTP loop and is
//! handed to the route's [`WebSocketHandler`](crate::router::WebSocketHandler)
//! as a [`WebSocket`]. Fragmented messages are reassembled, pings are
//! answered, and protocol violations close the session with the matching
//! close code.

pub mod frame;
pub mod handshake;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::debug;

use crate::server::transport::BoxedStream;
use frame::{Frame, FrameDecoder, FrameError, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1002
    ProtocolError,
    /// 1003
    Unsupported,
    /// 1007
    InvalidPayload,
    /// 1008
    PolicyViolation,
    /// 1009
    MessageTooBig,
    /// 1011
    InternalError,
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::InternalError => 1011,
            CloseCode::Other(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::Unsupported,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1011 => CloseCode::InternalError,
            other => CloseCode::Other(other),
        }
    }

    /// Codes a peer may legitimately put on the wire.
    fn is_sendable(self) -> bool {
        matches!(self.as_u16(), 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseFrame>),
}

#[derive(Debug, thiserror::Error)]
pub enum WebSocketError {
    #[error("websocket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket protocol error: {0}")]
    Protocol(String),
    #[error("websocket frame rejected: {0}")]
    Frame(#[from] FrameError),
    #[error("text message is not valid UTF-8")]
    InvalidUtf8,
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("websocket is closed")]
    Closed,
}

/// An open WebSocket session.
///
/// Owned by the route handler. When it is dropped the connection takes the
/// transport back, sends close `1000` if no close was exchanged yet, and
/// shuts the transport down.
pub struct WebSocket {
    /// `None` only after the session was handed back on drop.
    stream: Option<BoxedStream>,
    buffer: BytesMut,
    decoder: FrameDecoder,
    max_message: usize,
    /// Data opcode and payload of a fragmented message in progress.
    partial: Option<(Opcode, Vec<u8>)>,
    close_sent: bool,
    closed: bool,
    on_drop: Option<oneshot::Sender<WebSocket>>,
}

impl WebSocket {
    /// `buffered` holds bytes read past the end of the upgrade request.
    pub(crate) fn new(stream: BoxedStream, buffered: BytesMut, max_payload: usize) -> Self {
        Self {
            stream: Some(stream),
            buffer: buffered,
            decoder: FrameDecoder::new(max_payload),
            max_message: max_payload,
            partial: None,
            close_sent: false,
            closed: false,
            on_drop: None,
        }
    }

    /// Arranges for the session to be sent back through the returned
    /// receiver when the handler drops it.
    pub(crate) fn handed_back(mut self) -> (Self, oneshot::Receiver<WebSocket>) {
        let (tx, rx) = oneshot::channel();
        self.on_drop = Some(tx);
        (self, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.close_sent
    }

    /// The next message from the client.
    ///
    /// Pings are answered and not returned. A close from the client is
    /// echoed and returned once as [`Message::Close`]; after that, and after
    /// the peer disconnects, this returns `Ok(None)`.
    pub async fn recv(&mut self) -> Result<Option<Message>, WebSocketError> {
        loop {
            if self.closed {
                return Ok(None);
            }

            let frame = match self.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.closed = true;
                    return Ok(None);
                }
                Err(WebSocketError::Frame(e)) => {
                    let code = e.close_code();
                    return Err(self.fail(code, WebSocketError::Frame(e)).await);
                }
                Err(e) => {
                    self.closed = true;
                    return Err(e);
                }
            };

            match frame.opcode {
                Opcode::Ping => {
                    if !self.close_sent {
                        self.write_frame(Frame::new(Opcode::Pong, frame.payload)).await?;
                    }
                }
                Opcode::Pong => return Ok(Some(Message::Pong(frame.payload))),
                Opcode::Close => return self.on_close(&frame.payload).await.map(Some),
                Opcode::Text | Opcode::Binary => {
                    if self.partial.is_some() {
                        let err = WebSocketError::Protocol("new message inside a fragmented one".into());
                        return Err(self.fail(CloseCode::ProtocolError, err).await);
                    }
                    if frame.fin {
                        return self.deliver(frame.opcode, frame.payload).await.map(Some);
                    }
                    self.partial = Some((frame.opcode, frame.payload));
                }
                Opcode::Continuation => {
                    let Some((opcode, mut data)) = self.partial.take() else {
                        let err = WebSocketError::Protocol("continuation without a message".into());
                        return Err(self.fail(CloseCode::ProtocolError, err).await);
                    };
                    let size = data.len() + frame.payload.len();
                    if size > self.max_message {
                        let err = WebSocketError::MessageTooLarge {
                            size,
                            limit: self.max_message,
                        };
                        return Err(self.fail(CloseCode::MessageTooBig, err).await);
                    }
                    data.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return self.deliver(opcode, data).await.map(Some);
                    }
                    self.partial = Some((opcode, data));
                }
            }
        }
    }

    pub async fn send(&mut self, message: Message) -> Result<(), WebSocketError> {
        let frame = match message {
            Message::Text(text) => Frame::new(Opcode::Text, text.into_bytes()),
            Message::Binary(data) => Frame::new(Opcode::Binary, data),
            Message::Ping(data) => Frame::new(Opcode::Ping, data),
            Message::Pong(data) => Frame::new(Opcode::Pong, data),
            Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (f.code, f.reason))
                    .unwrap_or((CloseCode::Normal, String::new()));
                return self.close(code, &reason).await;
            }
        };
        if self.is_closed() {
            return Err(WebSocketError::Closed);
        }
        self.write_frame(frame).await
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), WebSocketError> {
        self.send(Message::Text(text.into())).await
    }

    pub async fn send_binary(&mut self, data: impl Into<Vec<u8>>) -> Result<(), WebSocketError> {
        self.send(Message::Binary(data.into())).await
    }

    /// Sends a close frame. Calling it again is a no-op.
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), WebSocketError> {
        if self.close_sent || self.closed {
            return Ok(());
        }
        self.close_sent = true;

        let mut payload = code.as_u16().to_be_bytes().to_vec();
        // Control payloads are capped at 125 bytes.
        let mut end = reason.len().min(123);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        payload.extend_from_slice(&reason.as_bytes()[..end]);
        self.write_frame(Frame::new(Opcode::Close, payload)).await
    }

    /// Ends the session after the handler returns: closes with 1000 unless
    /// a close was already exchanged, then shuts the transport down.
    pub(crate) async fn finish(mut self) {
        if let Err(e) = self.close(CloseCode::Normal, "").await {
            debug!(error = %e, "websocket close frame not delivered");
        }
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.shutdown().await;
        }
    }

    async fn on_close(&mut self, payload: &[u8]) -> Result<Message, WebSocketError> {
        let close = match payload.len() {
            0 => None,
            1 => {
                let err = WebSocketError::Protocol("close payload of one byte".into());
                return Err(self.fail(CloseCode::ProtocolError, err).await);
            }
            _ => {
                let code = CloseCode::from_u16(u16::from_be_bytes([payload[0], payload[1]]));
                if !code.is_sendable() {
                    let err = WebSocketError::Protocol(format!("invalid close code {}", code.as_u16()));
                    return Err(self.fail(CloseCode::ProtocolError, err).await);
                }
                let Ok(reason) = std::str::from_utf8(&payload[2..]) else {
                    return Err(self.fail(CloseCode::InvalidPayload, WebSocketError::InvalidUtf8).await);
                };
                Some(CloseFrame {
                    code,
                    reason: reason.to_string(),
                })
            }
        };

        let echo = close.as_ref().map(|c| c.code).unwrap_or(CloseCode::Normal);
        let result = self.close(echo, "").await;
        self.closed = true;
        result.map(|_| Message::Close(close))
    }

    async fn deliver(&mut self, opcode: Opcode, data: Vec<u8>) -> Result<Message, WebSocketError> {
        if opcode == Opcode::Binary {
            return Ok(Message::Binary(data));
        }
        match String::from_utf8(data) {
            Ok(text) => Ok(Message::Text(text)),
            Err(_) => Err(self.fail(CloseCode::InvalidPayload, WebSocketError::InvalidUtf8).await),
        }
    }

    /// Closes with `code` and returns `err` for the caller to report.
    async fn fail(&mut self, code: CloseCode, err: WebSocketError) -> WebSocketError {
        debug!(close_code = code.as_u16(), error = %err, "closing websocket");
        if let Err(e) = self.close(code, "").await {
            debug!(error = %e, "websocket close frame not delivered");
        }
        self.closed = true;
        err
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>, WebSocketError> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }
            let Some(stream) = self.stream.as_mut() else {
                return Err(WebSocketError::Closed);
            };
            if stream.read_buf(&mut self.buffer).await? == 0 {
                return Ok(None);
            }
        }
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), WebSocketError> {
        let stream = self.stream.as_mut().ok_or(WebSocketError::Closed)?;
        let mut out = BytesMut::new();
        frame.encode(&mut out);
        while out.has_remaining() {
            let n = stream.write(&out).await?;
            if n == 0 {
                return Err(WebSocketError::Closed);
            }
            out.advance(n);
        }
        stream.flush().await?;
        Ok(())
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        let Some(tx) = self.on_drop.take() else {
            return;
        };
        let returned = WebSocket {
            stream: self.stream.take(),
            buffer: std::mem::take(&mut self.buffer),
            decoder: self.decoder,
            max_message: self.max_message,
            partial: None,
            close_sent: self.close_sent,
            closed: self.closed,
            on_drop: None,
        };
        // The connection may already be gone (worker aborted).
        let _ = tx.send(returned);
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("buffered", &self.buffer.len())
            .field("close_sent", &self.close_sent)
            .field("closed", &self.closed)
            .finish()
    }
}
