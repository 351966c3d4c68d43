//! Request routing.
//!
//! Routes map a method set and a path pattern to a handler. Literal patterns
//! are kept in their own table and always tried before regex patterns; within
//! each table the first registered match wins.

mod pattern;

pub use pattern::{ParamKind, ParamValue, PatternError, RouteParams, RoutePattern};

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::http::body::BodyStream;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::websocket::WebSocket;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// An HTTP request handler.
///
/// Implemented for any `Fn(Request) -> impl Future<Output = anyhow::Result<Response>>`.
/// An `Err` becomes a 500 for that request only.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request) -> BoxFuture<anyhow::Result<Response>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
{
    fn call(&self, request: Request) -> BoxFuture<anyhow::Result<Response>> {
        Box::pin(self(request))
    }
}

/// An HTTP handler that reads the request body as it arrives instead of
/// after it has been buffered.
pub trait StreamingHandler: Send + Sync + 'static {
    fn call(&self, request: Request, body: BodyStream) -> BoxFuture<anyhow::Result<Response>>;
}

impl<F, Fut> StreamingHandler for F
where
    F: Fn(Request, BodyStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
{
    fn call(&self, request: Request, body: BodyStream) -> BoxFuture<anyhow::Result<Response>> {
        Box::pin(self(request, body))
    }
}

/// Drives an upgraded WebSocket session until it returns.
pub trait WebSocketHandler: Send + Sync + 'static {
    fn call(&self, request: Request, socket: WebSocket) -> BoxFuture<anyhow::Result<()>>;
}

impl<F, Fut> WebSocketHandler for F
where
    F: Fn(Request, WebSocket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn call(&self, request: Request, socket: WebSocket) -> BoxFuture<anyhow::Result<()>> {
        Box::pin(self(request, socket))
    }
}

/// What an error handler gets to see.
///
/// Failures before a request is fully parsed (malformed input, timeouts)
/// have no method or path.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub status: StatusCode,
    pub method: Option<Method>,
    pub path: Option<String>,
    pub error: Option<String>,
}

impl ErrorContext {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            method: None,
            path: None,
            error: None,
        }
    }

    pub fn for_request(status: StatusCode, request: &Request) -> Self {
        Self {
            status,
            method: Some(request.method),
            path: Some(request.path.clone()),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

pub type ErrorHandler = Arc<dyn Fn(&ErrorContext) -> Response + Send + Sync>;

#[derive(Clone)]
pub enum Endpoint {
    Http(Arc<dyn Handler>),
    Streaming(Arc<dyn StreamingHandler>),
    WebSocket(Arc<dyn WebSocketHandler>),
}

impl Endpoint {
    pub fn is_websocket(&self) -> bool {
        matches!(self, Endpoint::WebSocket(_))
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Http(_) => f.write_str("Endpoint::Http"),
            Endpoint::Streaming(_) => f.write_str("Endpoint::Streaming"),
            Endpoint::WebSocket(_) => f.write_str("Endpoint::WebSocket"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route `{pattern}` has no methods")]
    NoMethods { pattern: String },
    #[error("invalid route pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: PatternError,
    },
}

enum Matcher {
    Exact(String),
    Pattern(RoutePattern),
}

impl Matcher {
    fn matches(&self, path: &str) -> Option<RouteParams> {
        match self {
            Matcher::Exact(p) => (p == path).then(RouteParams::default),
            Matcher::Pattern(p) => p.matches(path),
        }
    }
}

struct Route {
    methods: Vec<Method>,
    matcher: Matcher,
    endpoint: Endpoint,
}

impl Route {
    /// GET routes answer HEAD too; the writer drops the body.
    fn accepts(&self, method: Method) -> bool {
        self.methods.contains(&method)
            || (method == Method::HEAD && self.methods.contains(&Method::GET))
    }
}

#[derive(Debug)]
pub enum RouteMatch<'a> {
    Matched {
        endpoint: &'a Endpoint,
        params: RouteParams,
    },
    /// Some route matched the path, none accepted the method.
    MethodNotAllowed { allowed: Vec<Method> },
    NotFound,
}

#[derive(Default)]
pub struct Router {
    exact: Vec<Route>,
    patterns: Vec<Route>,
    error_handlers: HashMap<StatusCode, ErrorHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `methods` on `pattern`.
    ///
    /// ```
    /// # use ember::router::Router;
    /// # use ember::http::request::{Method, Request};
    /// # use ember::http::response::Response;
    /// async fn user(req: Request) -> anyhow::Result<Response> {
    ///     Ok(Response::ok(format!("user {}", req.params.int(0).unwrap_or_default())))
    /// }
    ///
    /// let mut router = Router::new();
    /// router.route([Method::GET, Method::PUT], "/users/{{i}}", user).unwrap();
    /// ```
    pub fn route<H: Handler>(
        &mut self,
        methods: impl IntoIterator<Item = Method>,
        pattern: &str,
        handler: H,
    ) -> Result<&mut Self, RouteError> {
        self.add(methods, pattern, Endpoint::Http(Arc::new(handler)))
    }

    pub fn get<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, RouteError> {
        self.route([Method::GET], pattern, handler)
    }

    pub fn post<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, RouteError> {
        self.route([Method::POST], pattern, handler)
    }

    /// Registers a handler that receives the body through a [`BodyStream`]
    /// while it is still being read. Such bodies skip `max_body_bytes`.
    pub fn streaming<H: StreamingHandler>(
        &mut self,
        methods: impl IntoIterator<Item = Method>,
        pattern: &str,
        handler: H,
    ) -> Result<&mut Self, RouteError> {
        self.add(methods, pattern, Endpoint::Streaming(Arc::new(handler)))
    }

    /// Registers a WebSocket endpoint. Upgrade requests are always `GET`.
    pub fn websocket<H: WebSocketHandler>(
        &mut self,
        pattern: &str,
        handler: H,
    ) -> Result<&mut Self, RouteError> {
        self.add([Method::GET], pattern, Endpoint::WebSocket(Arc::new(handler)))
    }

    /// Overrides the response generated for `status`.
    pub fn on_error<F>(&mut self, status: StatusCode, handler: F) -> &mut Self
    where
        F: Fn(&ErrorContext) -> Response + Send + Sync + 'static,
    {
        self.error_handlers.insert(status, Arc::new(handler));
        self
    }

    fn add(
        &mut self,
        methods: impl IntoIterator<Item = Method>,
        pattern: &str,
        endpoint: Endpoint,
    ) -> Result<&mut Self, RouteError> {
        let mut methods: Vec<Method> = methods.into_iter().collect();
        methods.dedup();
        if methods.is_empty() {
            return Err(RouteError::NoMethods {
                pattern: pattern.to_string(),
            });
        }

        if RoutePattern::is_literal(pattern) {
            self.exact.push(Route {
                methods,
                matcher: Matcher::Exact(pattern.to_string()),
                endpoint,
            });
        } else {
            let compiled =
                RoutePattern::parse(pattern).map_err(|source| RouteError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })?;
            self.patterns.push(Route {
                methods,
                matcher: Matcher::Pattern(compiled),
                endpoint,
            });
        }
        Ok(self)
    }

    pub fn lookup(&self, method: Method, path: &str) -> RouteMatch<'_> {
        let mut allowed = Vec::new();

        for route in self.exact.iter().chain(self.patterns.iter()) {
            let Some(params) = route.matcher.matches(path) else {
                continue;
            };
            if route.accepts(method) {
                return RouteMatch::Matched {
                    endpoint: &route.endpoint,
                    params,
                };
            }
            for m in &route.methods {
                if !allowed.contains(m) {
                    allowed.push(*m);
                }
            }
        }

        if allowed.is_empty() {
            RouteMatch::NotFound
        } else {
            RouteMatch::MethodNotAllowed { allowed }
        }
    }

    /// Whether a request for `method` and `path` goes to a streaming handler.
    pub fn streams_body(&self, method: Method, path: &str) -> bool {
        matches!(
            self.lookup(method, path),
            RouteMatch::Matched {
                endpoint: Endpoint::Streaming(_),
                ..
            }
        )
    }

    /// The response for an error status: the registered handler's, or a
    /// plain-text default.
    pub fn error_response(&self, ctx: &ErrorContext) -> Response {
        match self.error_handlers.get(&ctx.status) {
            Some(handler) => handler(ctx),
            None => Response::error(ctx.status),
        }
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("exact", &self.exact.len())
            .field("patterns", &self.patterns.len())
            .field("error_handlers", &self.error_handlers.len())
            .finish()
    }
}
