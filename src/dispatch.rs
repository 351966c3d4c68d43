//! Turns a parsed request into a response or an upgrade.
//!
//! Route handlers take precedence over static files: a path any route
//! matches is never served from disk, even when the method is wrong. Static
//! files answer GET and HEAD for paths no route claims.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::config::Config;
use crate::http::body::BodyStream;
use crate::http::parser::ParserLimits;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::router::{Endpoint, ErrorContext, RouteMatch, Router, WebSocketHandler};
use crate::static_files::{FileError, StaticFiles};
use crate::websocket::handshake;

pub enum Dispatch {
    Respond(Response),
    /// Send the `101` response, then hand the connection to `handler`.
    Upgrade {
        response: Response,
        handler: Arc<dyn WebSocketHandler>,
        request: Request,
    },
}

/// Read-only state shared by every worker.
pub struct Dispatcher {
    router: Router,
    static_files: Option<StaticFiles>,
    request_timeout: Option<Duration>,
    limits: ParserLimits,
    max_frame_bytes: usize,
}

impl Dispatcher {
    pub fn new(config: &Config, router: Router) -> Self {
        Self {
            router,
            static_files: config
                .public_dir()
                .map(|dir| StaticFiles::new(dir, config.file_reader_buffer_size())),
            request_timeout: config.request_timeout(),
            limits: ParserLimits {
                max_header_bytes: config.max_header_bytes(),
                max_body_bytes: config.max_body_bytes(),
            },
            max_frame_bytes: config.max_frame_bytes(),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn limits(&self) -> ParserLimits {
        self.limits
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn error_response(&self, ctx: &ErrorContext) -> Response {
        self.router.error_response(ctx)
    }

    /// Whether the body of this request should be streamed to its handler
    /// rather than buffered first.
    pub fn streams_body(&self, request: &Request) -> bool {
        self.router.streams_body(request.method, &request.path)
    }

    pub async fn dispatch(&self, request: Request) -> Dispatch {
        self.route(request, None).await
    }

    /// Dispatches a request whose body is still arriving through `body`.
    pub async fn dispatch_streaming(&self, request: Request, body: BodyStream) -> Dispatch {
        self.route(request, Some(body)).await
    }

    async fn route(&self, mut request: Request, body: Option<BodyStream>) -> Dispatch {
        match self.router.lookup(request.method, &request.path) {
            RouteMatch::Matched { endpoint, params } => {
                request.params = params;
                match endpoint {
                    Endpoint::Http(_) | Endpoint::Streaming(_) => {
                        Dispatch::Respond(self.call(endpoint, request, body).await)
                    }
                    Endpoint::WebSocket(handler) => self.upgrade(handler.clone(), request),
                }
            }
            RouteMatch::MethodNotAllowed { allowed } => {
                let ctx = ErrorContext::for_request(StatusCode::MethodNotAllowed, &request);
                let mut response = self.router.error_response(&ctx);
                let allow: Vec<&str> = allowed.iter().map(Method::as_str).collect();
                response.headers.insert("Allow", allow.join(", "));
                Dispatch::Respond(response)
            }
            RouteMatch::NotFound => Dispatch::Respond(self.fallback(&request).await),
        }
    }

    async fn call(
        &self,
        endpoint: &Endpoint,
        mut request: Request,
        body: Option<BodyStream>,
    ) -> Response {
        let method = request.method;
        let path = request.path.clone();

        let result = match endpoint {
            Endpoint::Streaming(handler) => {
                // A buffered body still reaches a streaming handler as a stream.
                let body = body.unwrap_or_else(|| {
                    BodyStream::from_bytes(std::mem::take(&mut request.body))
                });
                handler.call(request, body).await
            }
            Endpoint::Http(handler) => handler.call(request).await,
            Endpoint::WebSocket(_) => return Response::error(StatusCode::InternalServerError),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                error!(method = %method, path = %path, error = %e, "handler failed");
                let ctx = ErrorContext {
                    status: StatusCode::InternalServerError,
                    method: Some(method),
                    path: Some(path),
                    error: None,
                }
                .with_error(e);
                self.router.error_response(&ctx)
            }
        }
    }

    fn upgrade(&self, handler: Arc<dyn WebSocketHandler>, request: Request) -> Dispatch {
        if !request.is_websocket_upgrade() {
            let ctx = ErrorContext::for_request(StatusCode::UpgradeRequired, &request);
            let mut response = self.router.error_response(&ctx);
            response.headers.insert("Upgrade", "websocket");
            response.headers.insert("Connection", "Upgrade");
            return Dispatch::Respond(response);
        }

        let response = match handshake::validate(&request) {
            Ok(key) => handshake::accept_response(key),
            Err(e) => {
                warn!(path = %request.path, error = %e, "websocket handshake rejected");
                return Dispatch::Respond(handshake::reject_response(&e));
            }
        };
        Dispatch::Upgrade {
            response,
            handler,
            request,
        }
    }

    async fn fallback(&self, request: &Request) -> Response {
        let static_files = match &self.static_files {
            Some(files) if matches!(request.method, Method::GET | Method::HEAD) => files,
            _ => {
                let ctx = ErrorContext::for_request(StatusCode::NotFound, request);
                return self.router.error_response(&ctx);
            }
        };

        match static_files.serve(request).await {
            Ok(response) => response,
            Err(e) => {
                if let FileError::Io(io) = &e {
                    error!(path = %request.path, error = %io, "static file lookup failed");
                }
                let ctx = ErrorContext::for_request(e.status(), request).with_error(&e);
                self.router.error_response(&ctx)
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("router", &self.router)
            .field("static_files", &self.static_files)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}
