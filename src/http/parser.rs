//! Incremental HTTP/1.x request parser.
//!
//! [`RequestParser`] consumes bytes from a connection buffer as they arrive
//! and reports which part of the request it is waiting for, so the
//! connection state machine can follow along (request line, headers, body).
//! Bodies are delimited by `Content-Length` or chunked transfer coding, and
//! are either buffered into the request or handed out piece by piece.

use bytes::{Buf, Bytes, BytesMut};

use crate::config::{DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_HEADER_BYTES};
use crate::http::headers::Headers;
use crate::http::request::{Method, Request};
use crate::http::response::StatusCode;

const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request line")]
    InvalidRequest,
    #[error("unknown method")]
    InvalidMethod,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("malformed header")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("malformed chunked body")]
    InvalidChunk,
    #[error("header section too large")]
    HeadersTooLarge,
    #[error("body too large")]
    BodyTooLarge,
    #[error("incomplete request")]
    Incomplete,
}

impl ParseError {
    /// Status sent back (best effort) before the connection is closed.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::UnsupportedVersion => StatusCode::HttpVersionNotSupported,
            ParseError::HeadersTooLarge => StatusCode::RequestHeaderFieldsTooLarge,
            ParseError::BodyTooLarge => StatusCode::PayloadTooLarge,
            _ => StatusCode::BadRequest,
        }
    }
}

/// The part of the request the parser is currently waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePhase {
    RequestLine,
    Headers,
    Body,
}

#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    RequestLine,
    Headers,
    Body(BodyState),
}

#[derive(Debug, Clone, Copy)]
enum BodyState {
    Length(usize),
    Chunked(Chunk),
}

#[derive(Debug, Clone, Copy)]
enum Chunk {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

struct Head {
    method: Method,
    target: String,
    version: String,
    headers: Headers,
}

/// Output of [`RequestParser::parse_streaming`].
#[derive(Debug)]
pub enum Parsed {
    /// A complete request with its body buffered.
    Request(Request),
    /// Headers of a request whose body is still to come; read it with
    /// [`RequestParser::next_body_event`].
    Head(Request),
}

/// A piece of a streamed request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyEvent {
    Data(Bytes),
    End,
}

pub struct RequestParser {
    limits: ParserLimits,
    phase: Phase,
    head: Option<Head>,
    request: Option<Request>,
    body: Vec<u8>,
    header_bytes: usize,
    streaming: bool,
}

impl RequestParser {
    pub fn new(limits: ParserLimits) -> Self {
        Self {
            limits,
            phase: Phase::RequestLine,
            head: None,
            request: None,
            body: Vec::new(),
            header_bytes: 0,
            streaming: false,
        }
    }

    pub fn phase(&self) -> ParsePhase {
        match self.phase {
            Phase::RequestLine => ParsePhase::RequestLine,
            Phase::Headers => ParsePhase::Headers,
            Phase::Body(_) => ParsePhase::Body,
        }
    }

    /// True while the body of a request returned as [`Parsed::Head`] is
    /// still being read.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Discards any partially parsed request.
    pub fn reset(&mut self) {
        self.phase = Phase::RequestLine;
        self.head = None;
        self.request = None;
        self.body.clear();
        self.header_bytes = 0;
        self.streaming = false;
    }

    /// Consumes as much of `buf` as possible.
    ///
    /// Returns `Ok(Some(request))` once a request is complete (leaving any
    /// pipelined bytes in `buf`), `Ok(None)` when more input is needed.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Request>, ParseError> {
        match self.parse_streaming(buf, |_| false)? {
            Some(Parsed::Request(request)) | Some(Parsed::Head(request)) => Ok(Some(request)),
            None => Ok(None),
        }
    }

    /// Like [`parse`](Self::parse), but a request with a body for which
    /// `stream_body` returns true is handed out as soon as its headers are
    /// in. Streamed bodies are not bounded by `max_body_bytes`.
    pub fn parse_streaming(
        &mut self,
        buf: &mut BytesMut,
        stream_body: impl Fn(&Request) -> bool,
    ) -> Result<Option<Parsed>, ParseError> {
        loop {
            match self.phase {
                Phase::RequestLine => {
                    let Some(line) = self.take_head_line(buf)? else {
                        return Ok(None);
                    };
                    // Stray CRLFs between pipelined requests are ignored.
                    if line.is_empty() {
                        continue;
                    }
                    self.head = Some(parse_request_line(&line)?);
                    self.phase = Phase::Headers;
                }

                Phase::Headers => {
                    let Some(line) = self.take_head_line(buf)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        let state = self.body_state()?;
                        let request = self.take_request()?;
                        if matches!(state, BodyState::Length(0)) {
                            self.reset();
                            return Ok(Some(Parsed::Request(request)));
                        }
                        self.phase = Phase::Body(state);
                        if stream_body(&request) {
                            self.streaming = true;
                            return Ok(Some(Parsed::Head(request)));
                        }
                        if let BodyState::Length(n) = state {
                            if n > self.limits.max_body_bytes {
                                return Err(ParseError::BodyTooLarge);
                            }
                        }
                        self.request = Some(request);
                        continue;
                    }
                    let (name, value) = parse_header_line(&line)?;
                    if let Some(head) = self.head.as_mut() {
                        head.headers.append(name, value);
                    }
                }

                Phase::Body(_) if self.streaming => return Ok(None),

                Phase::Body(_) => match self.body_step(buf)? {
                    Some(BodyEvent::Data(data)) => self.body.extend_from_slice(&data),
                    Some(BodyEvent::End) => return Ok(Some(Parsed::Request(self.finish()?))),
                    None => return Ok(None),
                },
            }
        }
    }

    /// Reads the next piece of a streamed body.
    ///
    /// Returns `Ok(None)` when more input is needed. After
    /// [`BodyEvent::End`] the parser is ready for the next request.
    pub fn next_body_event(&mut self, buf: &mut BytesMut) -> Result<Option<BodyEvent>, ParseError> {
        if !self.streaming {
            return Err(ParseError::InvalidRequest);
        }
        let event = self.body_step(buf)?;
        if event == Some(BodyEvent::End) {
            self.reset();
        }
        Ok(event)
    }

    fn body_step(&mut self, buf: &mut BytesMut) -> Result<Option<BodyEvent>, ParseError> {
        loop {
            let Phase::Body(state) = self.phase else {
                return Err(ParseError::InvalidRequest);
            };
            match state {
                BodyState::Length(0) => return Ok(Some(BodyEvent::End)),

                BodyState::Length(remaining) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(buf.len());
                    self.phase = Phase::Body(BodyState::Length(remaining - n));
                    return Ok(Some(BodyEvent::Data(buf.split_to(n).freeze())));
                }

                BodyState::Chunked(chunk) => match chunk {
                    Chunk::Size => {
                        let Some(line) = take_line(buf, MAX_CHUNK_LINE, ParseError::InvalidChunk)?
                        else {
                            return Ok(None);
                        };
                        let size = parse_chunk_size(&line)?;
                        if size == 0 {
                            self.phase = Phase::Body(BodyState::Chunked(Chunk::Trailers));
                        } else {
                            if !self.streaming
                                && self.body.len().saturating_add(size) > self.limits.max_body_bytes
                            {
                                return Err(ParseError::BodyTooLarge);
                            }
                            self.phase = Phase::Body(BodyState::Chunked(Chunk::Data(size)));
                        }
                    }
                    Chunk::Data(remaining) => {
                        if buf.is_empty() {
                            return Ok(None);
                        }
                        let n = remaining.min(buf.len());
                        self.phase = if remaining == n {
                            Phase::Body(BodyState::Chunked(Chunk::DataEnd))
                        } else {
                            Phase::Body(BodyState::Chunked(Chunk::Data(remaining - n)))
                        };
                        return Ok(Some(BodyEvent::Data(buf.split_to(n).freeze())));
                    }
                    Chunk::DataEnd => {
                        if buf.len() < 2 {
                            return Ok(None);
                        }
                        if &buf[..2] != b"\r\n" {
                            return Err(ParseError::InvalidChunk);
                        }
                        buf.advance(2);
                        self.phase = Phase::Body(BodyState::Chunked(Chunk::Size));
                    }
                    Chunk::Trailers => {
                        let Some(line) = take_line(buf, MAX_CHUNK_LINE, ParseError::InvalidChunk)?
                        else {
                            return Ok(None);
                        };
                        // Trailer fields are accepted and dropped.
                        if line.is_empty() {
                            self.phase = Phase::Body(BodyState::Length(0));
                        }
                    }
                },
            }
        }
    }

    fn take_head_line(&mut self, buf: &mut BytesMut) -> Result<Option<String>, ParseError> {
        let budget = self.limits.max_header_bytes.saturating_sub(self.header_bytes);
        let before = buf.len();
        let line = take_line(buf, budget, ParseError::HeadersTooLarge)?;
        self.header_bytes += before - buf.len();
        Ok(line)
    }

    fn body_state(&self) -> Result<BodyState, ParseError> {
        let Some(head) = self.head.as_ref() else {
            return Err(ParseError::InvalidRequest);
        };
        let headers = &head.headers;

        if headers.contains_key("Transfer-Encoding") {
            let last = headers
                .get_all("Transfer-Encoding")
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .last();
            return match last {
                Some(coding) if coding.eq_ignore_ascii_case("chunked") => {
                    Ok(BodyState::Chunked(Chunk::Size))
                }
                _ => Err(ParseError::InvalidRequest),
            };
        }

        let mut length = None;
        for value in headers.get_all("Content-Length") {
            let n = value
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength)?;
            if length.is_some_and(|l| l != n) {
                return Err(ParseError::InvalidContentLength);
            }
            length = Some(n);
        }

        Ok(BodyState::Length(length.unwrap_or(0)))
    }

    fn take_request(&mut self) -> Result<Request, ParseError> {
        let head = self.head.take().ok_or(ParseError::InvalidRequest)?;
        Ok(Request::new(
            head.method,
            head.target,
            head.version,
            head.headers,
            Vec::new(),
        ))
    }

    fn finish(&mut self) -> Result<Request, ParseError> {
        let mut request = self.request.take().ok_or(ParseError::InvalidRequest)?;
        request.body = std::mem::take(&mut self.body);
        self.reset();
        Ok(request)
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new(ParserLimits::default())
    }
}

/// Parses one complete request from the start of `buf`.
///
/// Returns the request and the number of bytes it occupied, or
/// `ParseError::Incomplete` if `buf` ends before the request does.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let mut bytes = BytesMut::from(buf);
    let mut parser = RequestParser::default();
    match parser.parse(&mut bytes)? {
        Some(request) => Ok((request, buf.len() - bytes.len())),
        None => Err(ParseError::Incomplete),
    }
}

/// Removes one LF-terminated line (trailing CR stripped) from `buf`.
///
/// `budget` bounds the line including its terminator; exceeding it, with or
/// without a terminator in sight, yields `overflow`.
fn take_line(
    buf: &mut BytesMut,
    budget: usize,
    overflow: ParseError,
) -> Result<Option<String>, ParseError> {
    let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > budget {
            return Err(overflow);
        }
        return Ok(None);
    };
    if pos + 1 > budget {
        return Err(overflow);
    }

    let mut line = buf.split_to(pos + 1);
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        line.truncate(pos - 1);
    }

    String::from_utf8(line.to_vec())
        .map(Some)
        .map_err(|_| ParseError::InvalidHeader)
}

fn parse_request_line(line: &str) -> Result<Head, ParseError> {
    let mut parts = line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let target = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;

    let valid_target = target.starts_with('/')
        || target == "*"
        || target.starts_with("http://")
        || target.starts_with("https://");
    if !valid_target {
        return Err(ParseError::InvalidRequest);
    }

    match version {
        "HTTP/1.1" | "HTTP/1.0" => {}
        v if v.starts_with("HTTP/") => return Err(ParseError::UnsupportedVersion),
        _ => return Err(ParseError::InvalidRequest),
    }

    Ok(Head {
        method,
        target: target.to_string(),
        version: version.to_string(),
        headers: Headers::new(),
    })
}

fn parse_header_line(line: &str) -> Result<(&str, &str), ParseError> {
    // Obsolete line folding is rejected.
    if line.starts_with(' ') || line.starts_with('\t') {
        return Err(ParseError::InvalidHeader);
    }

    let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
    if key.is_empty() || key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(ParseError::InvalidHeader);
    }

    Ok((key, value.trim()))
}

fn parse_chunk_size(line: &str) -> Result<usize, ParseError> {
    let size = line.split(';').next().unwrap_or_default().trim();
    if size.is_empty() {
        return Err(ParseError::InvalidChunk);
    }
    usize::from_str_radix(size, 16).map_err(|_| ParseError::InvalidChunk)
}
