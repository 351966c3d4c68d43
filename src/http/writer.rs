use std::time::SystemTime;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::response::{Body, Response};
use crate::static_files::FileError;

const HTTP_VERSION: &str = "HTTP/1.1";
const SERVER_NAME: &str = concat!("ember/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("connection closed while writing")]
    Closed,
    #[error("socket write failed: {0}")]
    Io(#[from] std::io::Error),
    /// Reading the file body failed after part of the response was sent.
    #[error("file body aborted: {0}")]
    File(#[from] FileError),
}

/// What the response says about the connection after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// `Connection: close` is added.
    Close,
    /// HTTP/1.1 keeps the connection by default; nothing is added.
    KeepAlive,
    /// HTTP/1.0 peers close unless told `Connection: keep-alive`.
    KeepAliveHttp10,
}

impl Persistence {
    pub fn new(keep_alive: bool, version: &str) -> Self {
        match (keep_alive, version) {
            (false, _) => Persistence::Close,
            (true, "HTTP/1.0") => Persistence::KeepAliveHttp10,
            (true, _) => Persistence::KeepAlive,
        }
    }

    pub fn keep_alive(self) -> bool {
        self != Persistence::Close
    }
}

fn serialize_head(resp: &Response, persistence: Persistence) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    // Headers. Content-Length always reflects the body actually sent.
    let framed = resp.status.allows_body();
    for (k, v) in resp.headers.iter() {
        if framed && k.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        push_header(&mut buf, k, v);
    }
    if framed {
        push_header(&mut buf, "Content-Length", &resp.body.len().to_string());
    }
    if !resp.headers.contains_key("Date") {
        push_header(&mut buf, "Date", &httpdate::fmt_http_date(SystemTime::now()));
    }
    if !resp.headers.contains_key("Server") {
        push_header(&mut buf, "Server", SERVER_NAME);
    }
    if !resp.headers.contains_key("Connection") {
        match persistence {
            Persistence::Close => push_header(&mut buf, "Connection", "close"),
            Persistence::KeepAliveHttp10 => push_header(&mut buf, "Connection", "keep-alive"),
            Persistence::KeepAlive => {}
        }
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");

    buf
}

fn push_header(buf: &mut Vec<u8>, key: &str, value: &str) {
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

/// Serialises one response onto a stream.
///
/// In-memory bodies go out with the head in a single buffer; file bodies are
/// pulled from their [`FileStreamer`](crate::static_files::FileStreamer) one
/// chunk at a time and written in order.
pub struct ResponseWriter {
    buffer: Vec<u8>,
    written: usize,
    body: Body,
}

impl ResponseWriter {
    /// `head_only` drops the body (HEAD requests) but keeps its headers.
    pub fn new(response: Response, persistence: Persistence, head_only: bool) -> Self {
        let mut buffer = serialize_head(&response, persistence);
        let body = match response.body {
            _ if head_only || !response.status.allows_body() => Body::Empty,
            Body::Bytes(bytes) => {
                buffer.extend_from_slice(&bytes);
                Body::Empty
            }
            other => other,
        };

        Self {
            buffer,
            written: 0,
            body,
        }
    }

    /// Writes everything; returns the number of bytes sent.
    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> Result<u64, WriteError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        while self.written < self.buffer.len() {
            let n = stream.write(&self.buffer[self.written..]).await?;

            if n == 0 {
                return Err(WriteError::Closed);
            }

            self.written += n;
        }

        let mut total = self.written as u64;
        if let Body::File(file) = &mut self.body {
            while let Some(chunk) = file.next_chunk().await? {
                stream.write_all(chunk).await?;
                total += chunk.len() as u64;
            }
        }

        stream.flush().await?;
        Ok(total)
    }
}
