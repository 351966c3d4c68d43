use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, error, warn};

use crate::dispatch::{Dispatch, Dispatcher};
use crate::http::body::{BodyError, BodySender, BodyStream};
use crate::http::parser::{BodyEvent, ParseError, ParsePhase, Parsed, RequestParser};
use crate::http::request::{ConnectionInfo, Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::http::writer::{Persistence, ResponseWriter, WriteError};
use crate::router::{ErrorContext, WebSocketHandler};
use crate::server::transport::BoxedStream;
use crate::websocket::WebSocket;

const READ_BUFFER_SIZE: usize = 4096;

/// One client connection, driven to completion by its worker.
pub struct Connection {
    stream: BoxedStream,
    buffer: BytesMut,
    parser: RequestParser,
    state: ConnectionState,
    dispatcher: Arc<Dispatcher>,
    info: ConnectionInfo,
    shutdown: watch::Receiver<bool>,
    /// Deadline of the request in progress, armed when it starts.
    deadline: Option<Instant>,
}

pub enum ConnectionState {
    AwaitingRequestLine,
    ReadingHeaders,
    ReadingBody,
    Dispatching(Request),
    WritingResponse(ResponseWriter, bool), // bool = keep_alive?
    UpgradedWebSocket(Arc<dyn WebSocketHandler>, Request),
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::AwaitingRequestLine => "awaiting_request_line",
            ConnectionState::ReadingHeaders => "reading_headers",
            ConnectionState::ReadingBody => "reading_body",
            ConnectionState::Dispatching(_) => "dispatching",
            ConnectionState::WritingResponse(..) => "writing_response",
            ConnectionState::UpgradedWebSocket(..) => "upgraded_websocket",
            ConnectionState::Closed => "closed",
        }
    }
}

enum ReadOutcome {
    Data,
    Eof,
    TimedOut,
    Shutdown,
}

impl Connection {
    pub fn new(
        stream: BoxedStream,
        dispatcher: Arc<Dispatcher>,
        info: ConnectionInfo,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let parser = RequestParser::new(dispatcher.limits());
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            parser,
            state: ConnectionState::AwaitingRequestLine,
            dispatcher,
            info,
            shutdown,
            deadline: None,
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::UpgradedWebSocket(handler, req) => {
                    return self.into_websocket(handler, req).await;
                }
                ConnectionState::Closed => break,
                state => self.state = self.advance(state).await?,
            }
        }

        let _ = self.stream.shutdown().await;
        Ok(())
    }

    /// Performs one transition of the state machine.
    async fn advance(&mut self, state: ConnectionState) -> anyhow::Result<ConnectionState> {
        Ok(match state {
            ConnectionState::AwaitingRequestLine
            | ConnectionState::ReadingHeaders
            | ConnectionState::ReadingBody => self.receive().await?,

            ConnectionState::Dispatching(req) => self.dispatch(req).await,

            ConnectionState::WritingResponse(mut writer, keep_alive) => {
                if let Err(e) = writer.write_to_stream(&mut self.stream).await {
                    if let WriteError::File(file_error) = &e {
                        error!(conn = self.info.id, error = %file_error, "file body failed mid-response");
                    }
                    return Err(anyhow::Error::new(e).context("writing response"));
                }

                if keep_alive && !self.shutting_down() {
                    ConnectionState::AwaitingRequestLine // go back for next request
                } else {
                    ConnectionState::Closed
                }
            }

            other => other,
        })
    }

    /// The reading state matching what the parser waits for.
    fn reading_state(&self) -> ConnectionState {
        match self.parser.phase() {
            ParsePhase::RequestLine => ConnectionState::AwaitingRequestLine,
            ParsePhase::Headers => ConnectionState::ReadingHeaders,
            ParsePhase::Body => ConnectionState::ReadingBody,
        }
    }

    /// Parses what is buffered, reads once, and parses again.
    ///
    /// Yields `Dispatching` once a request (or, on a streaming route, its
    /// head) is complete, otherwise the reading state for what is missing.
    async fn receive(&mut self) -> anyhow::Result<ConnectionState> {
        if self.deadline.is_none() {
            self.deadline = self
                .dispatcher
                .request_timeout()
                .map(|t| Instant::now() + t);
        }

        if let Some(next) = self.parse_buffered().await {
            return Ok(next);
        }

        match self.read_more().await.context("reading request")? {
            ReadOutcome::Data => {}
            ReadOutcome::Eof => {
                let state = self.reading_state();
                if !matches!(state, ConnectionState::AwaitingRequestLine) || !self.buffer.is_empty() {
                    debug!(conn = self.info.id, state = state.name(), "peer closed mid-request");
                }
                return Ok(ConnectionState::Closed);
            }
            ReadOutcome::TimedOut => {
                debug!(conn = self.info.id, state = self.reading_state().name(), "request timed out");
                let ctx = ErrorContext::new(StatusCode::RequestTimeout);
                let response = self.dispatcher.error_response(&ctx);
                self.send_best_effort(response).await;
                return Ok(ConnectionState::Closed);
            }
            ReadOutcome::Shutdown => return Ok(ConnectionState::Closed),
        }

        match self.parse_buffered().await {
            Some(next) => Ok(next),
            None => Ok(self.reading_state()),
        }
    }

    /// `None` when the buffered bytes do not complete a request yet.
    async fn parse_buffered(&mut self) -> Option<ConnectionState> {
        let dispatcher = self.dispatcher.clone();
        match self
            .parser
            .parse_streaming(&mut self.buffer, |req| dispatcher.streams_body(req))
        {
            Ok(Some(Parsed::Request(req) | Parsed::Head(req))) => {
                Some(ConnectionState::Dispatching(req))
            }
            Ok(None) => None,
            Err(e) => {
                self.reject(e).await;
                Some(ConnectionState::Closed)
            }
        }
    }

    /// Reads more bytes unless the deadline passes first. An idle connection
    /// also gives up when the server starts shutting down.
    async fn read_more(&mut self) -> std::io::Result<ReadOutcome> {
        let idle = self.buffer.is_empty() && self.parser.phase() == ParsePhase::RequestLine;
        if idle && self.shutting_down() {
            return Ok(ReadOutcome::Shutdown);
        }

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            n = self.stream.read_buf(&mut self.buffer) => {
                Ok(if n? == 0 { ReadOutcome::Eof } else { ReadOutcome::Data })
            }
            _ = expired => Ok(ReadOutcome::TimedOut),
            _ = self.shutdown.changed(), if idle => Ok(ReadOutcome::Shutdown),
        }
    }

    async fn dispatch(&mut self, mut req: Request) -> ConnectionState {
        let mut keep_alive = req.keep_alive();
        let head_only = req.method == Method::HEAD;
        let version = req.version.clone();
        req.connection = Some(self.info);

        let method = req.method;
        let path = req.path.clone();
        let dispatcher = self.dispatcher.clone();

        let outcome = if self.parser.is_streaming() {
            let (tx, body) = BodyStream::channel();
            let handler = with_deadline(self.deadline, dispatcher.dispatch_streaming(req, body));
            let (outcome, pumped) = tokio::join!(handler, self.pump_body(tx));
            self.deadline = None;

            match pumped {
                Ok(()) => outcome,
                Err(BodyError::Disconnected) => return ConnectionState::Closed,
                Err(e) => {
                    keep_alive = false;
                    let status = match &e {
                        BodyError::Malformed(parse) => parse.status(),
                        _ => StatusCode::RequestTimeout,
                    };
                    let ctx = ErrorContext {
                        status,
                        method: Some(method),
                        path: Some(path.clone()),
                        error: Some(e.to_string()),
                    };
                    Some(Dispatch::Respond(dispatcher.error_response(&ctx)))
                }
            }
        } else {
            with_deadline(self.deadline.take(), dispatcher.dispatch(req)).await
        };

        let outcome = outcome.unwrap_or_else(|| {
            warn!(conn = self.info.id, method = %method, path = %path, "handler exceeded request timeout");
            keep_alive = false;
            let ctx = ErrorContext {
                status: StatusCode::ServiceUnavailable,
                method: Some(method),
                path: Some(path.clone()),
                error: Some("request timed out".into()),
            };
            Dispatch::Respond(dispatcher.error_response(&ctx))
        });

        match outcome {
            Dispatch::Respond(response) => {
                if response.headers.has_token("Connection", "close") {
                    keep_alive = false;
                }
                debug!(conn = self.info.id, status = response.status.as_u16(), "response ready");
                let persistence = Persistence::new(keep_alive, &version);
                let writer = ResponseWriter::new(response, persistence, head_only);
                ConnectionState::WritingResponse(writer, keep_alive)
            }
            Dispatch::Upgrade {
                response,
                handler,
                request,
            } => {
                let mut writer = ResponseWriter::new(response, Persistence::KeepAlive, false);
                match writer.write_to_stream(&mut self.stream).await {
                    Ok(_) => ConnectionState::UpgradedWebSocket(handler, request),
                    Err(e) => {
                        debug!(conn = self.info.id, error = %e, "upgrade response not delivered");
                        ConnectionState::Closed
                    }
                }
            }
        }
    }

    /// Feeds a streamed body to its handler until the body ends.
    ///
    /// Keeps reading after the handler drops its stream so the next request
    /// on the connection starts at the right byte.
    async fn pump_body(&mut self, tx: BodySender) -> Result<(), BodyError> {
        loop {
            let failure = match self.parser.next_body_event(&mut self.buffer) {
                Ok(Some(BodyEvent::Data(data))) => {
                    let _ = tx.send(Ok(data)).await;
                    continue;
                }
                Ok(Some(BodyEvent::End)) => return Ok(()),
                Ok(None) => match self.read_more().await {
                    Ok(ReadOutcome::Data) => continue,
                    Ok(ReadOutcome::TimedOut) => BodyError::TimedOut,
                    Ok(ReadOutcome::Eof | ReadOutcome::Shutdown) | Err(_) => {
                        BodyError::Disconnected
                    }
                },
                Err(e) => BodyError::Malformed(e),
            };

            debug!(conn = self.info.id, error = %failure, "streamed body aborted");
            self.parser.reset();
            let _ = tx.send(Err(failure.clone())).await;
            return Err(failure);
        }
    }

    async fn into_websocket(
        self,
        handler: Arc<dyn WebSocketHandler>,
        req: Request,
    ) -> anyhow::Result<()> {
        let Connection {
            stream,
            buffer,
            dispatcher,
            info,
            ..
        } = self;
        debug!(conn = info.id, path = %req.path, "switched to websocket");

        let socket = WebSocket::new(stream, buffer, dispatcher.max_frame_bytes());
        let (socket, returned) = socket.handed_back();
        let result = handler.call(req, socket).await;

        // The handler may keep the session alive in another task.
        if let Ok(socket) = returned.await {
            socket.finish().await;
        }
        result.context("websocket handler")
    }

    /// Answers a malformed request before closing.
    async fn reject(&mut self, error: ParseError) {
        debug!(conn = self.info.id, error = %error, "malformed request");
        let ctx = ErrorContext::new(error.status()).with_error(&error);
        let response = self.dispatcher.error_response(&ctx);
        self.send_best_effort(response).await;
    }

    async fn send_best_effort(&mut self, response: Response) {
        let mut writer = ResponseWriter::new(response, Persistence::Close, false);
        if let Err(e) = writer.write_to_stream(&mut self.stream).await {
            debug!(conn = self.info.id, error = %e, "error response not delivered");
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Runs `fut` until `deadline`; `None` means it ran out of time.
async fn with_deadline<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{DuplexStream, duplex};

    use super::*;
    use crate::config::{Config, ListenAddress};
    use crate::router::Router;
    use crate::static_files::FileStreamer;

    fn connection(router: Router) -> (Connection, DuplexStream, watch::Sender<bool>) {
        let config = Config::builder([ListenAddress::plain("127.0.0.1", 0)])
            .build()
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(&config, router));
        let (client, server) = duplex(64 * 1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let info = ConnectionInfo {
            id: 1,
            worker: 0,
            peer: None,
        };
        let conn = Connection::new(Box::new(server), dispatcher, info, shutdown_rx);
        (conn, client, shutdown_tx)
    }

    async fn step(conn: &mut Connection) -> &'static str {
        let state = std::mem::replace(&mut conn.state, ConnectionState::Closed);
        conn.state = conn.advance(state).await.unwrap();
        conn.state.name()
    }

    async fn read_response(client: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    async fn upload(req: Request) -> anyhow::Result<Response> {
        Ok(Response::ok(req.body))
    }

    async fn count_pieces(_req: Request, mut body: BodyStream) -> anyhow::Result<Response> {
        let mut pieces = 0;
        let mut total = 0;
        while let Some(data) = body.chunk().await? {
            pieces += 1;
            total += data.len();
        }
        Ok(Response::ok(format!("{pieces} {total}")))
    }

    #[tokio::test]
    async fn states_follow_the_request_as_it_arrives() {
        let mut router = Router::new();
        router.post("/upload", upload).unwrap();
        let (mut conn, mut client, _shutdown) = connection(router);
        assert_eq!(conn.state.name(), "awaiting_request_line");

        client
            .write_all(b"POST /upload HTTP/1.1\r\nHost: x\r\n")
            .await
            .unwrap();
        assert_eq!(step(&mut conn).await, "reading_headers");

        client.write_all(b"Content-Length: 4\r\n\r\nab").await.unwrap();
        assert_eq!(step(&mut conn).await, "reading_body");

        client.write_all(b"cd").await.unwrap();
        assert_eq!(step(&mut conn).await, "dispatching");
        assert_eq!(step(&mut conn).await, "writing_response");
        assert_eq!(step(&mut conn).await, "awaiting_request_line");

        let text = read_response(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nabcd"));
    }

    #[tokio::test]
    async fn partial_request_line_stays_awaiting() {
        let (mut conn, mut client, _shutdown) = connection(Router::new());

        client.write_all(b"GET /some").await.unwrap();
        assert_eq!(step(&mut conn).await, "awaiting_request_line");

        drop(client);
        assert_eq!(step(&mut conn).await, "closed");
    }

    #[tokio::test]
    async fn streamed_body_reaches_handler_while_arriving() {
        let mut router = Router::new();
        router.streaming([Method::PUT], "/blob", count_pieces).unwrap();
        let (mut conn, mut client, _shutdown) = connection(router);

        client
            .write_all(b"PUT /blob HTTP/1.1\r\nContent-Length: 6\r\n\r\nabc")
            .await
            .unwrap();
        assert_eq!(step(&mut conn).await, "dispatching");
        assert!(conn.parser.is_streaming());

        let late_half = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(b"def").await.unwrap();
        };
        let (state, ()) = tokio::join!(step(&mut conn), late_half);
        assert_eq!(state, "writing_response");
        assert!(!conn.parser.is_streaming());

        assert_eq!(step(&mut conn).await, "awaiting_request_line");
        let text = read_response(&mut client).await;
        assert!(text.ends_with("\r\n\r\n2 6"));
    }

    #[tokio::test]
    async fn malformed_streamed_body_is_rejected() {
        let mut router = Router::new();
        router.streaming([Method::PUT], "/blob", count_pieces).unwrap();
        let (mut conn, mut client, _shutdown) = connection(router);

        client
            .write_all(b"PUT /blob HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n")
            .await
            .unwrap();
        assert_eq!(step(&mut conn).await, "dispatching");
        assert_eq!(step(&mut conn).await, "writing_response");
        assert_eq!(step(&mut conn).await, "closed");

        let text = read_response(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn file_failure_mid_response_ends_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![7u8; 1000]).unwrap();

        let streamer = FileStreamer::open(&path, 100).await.unwrap();
        std::fs::File::create(&path).unwrap();

        let response = Response {
            status: StatusCode::Ok,
            headers: Default::default(),
            body: crate::http::response::Body::File(streamer),
        };
        let (mut conn, _client, _shutdown) = connection(Router::new());
        let writer = ResponseWriter::new(response, Persistence::KeepAlive, false);

        let err = conn
            .advance(ConnectionState::WritingResponse(writer, true))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<WriteError>(),
            Some(WriteError::File(_))
        ));
    }
}
