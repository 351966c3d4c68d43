use std::fmt;
use std::net::SocketAddr;

use crate::http::cookie::Cookies;
use crate::http::form::{FormData, FormError};
use crate::http::headers::Headers;
use crate::router::RouteParams;

/// HTTP request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// TRACE - Message loop-back test
    TRACE,
    /// CONNECT - Establish a tunnel
    CONNECT,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// Methods are case-sensitive, so only the upper-case spelling matches.
    ///
    /// # Example
    ///
    /// ```
    /// # use ember::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            "TRACE" => Some(Method::TRACE),
            "CONNECT" => Some(Method::CONNECT),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::TRACE => "TRACE",
            Method::CONNECT => "CONNECT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a request came from: the connection carrying it and the worker
/// that owns that connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Server-wide unique connection id, assigned on accept.
    pub id: u64,
    /// Index of the worker that owns the connection.
    pub worker: usize,
    pub peer: Option<SocketAddr>,
}

/// Decoded `application/x-www-form-urlencoded` query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn parse(query: &str) -> Self {
        Self {
            pairs: url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs
            .iter()
            .filter(move |(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// A parsed HTTP request.
///
/// Built by the parser once the head and body are complete and handed to
/// exactly one handler. The body is fully buffered (bounded by
/// `max_body_bytes`), except on streaming routes where `body` stays empty
/// and the handler reads a [`BodyStream`](crate::http::body::BodyStream).
#[derive(Debug, Clone)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// Percent-decoded path without the query string (e.g. `/index.html`)
    pub path: String,
    /// The raw request-target as it appeared on the request line
    pub target: String,
    /// HTTP version (`HTTP/1.0` or `HTTP/1.1`)
    pub version: String,
    pub headers: Headers,
    pub cookies: Cookies,
    pub query: QueryParams,
    /// Captures from the route pattern that matched, filled in at dispatch
    pub params: RouteParams,
    pub body: Vec<u8>,
    pub connection: Option<ConnectionInfo>,
}

impl Request {
    /// Assembles a request, deriving path, query and cookies from the target
    /// and headers.
    pub fn new(
        method: Method,
        target: impl Into<String>,
        version: impl Into<String>,
        headers: Headers,
        body: Vec<u8>,
    ) -> Self {
        let target = target.into();
        let (path, query) = split_target(&target);
        let cookies = Cookies::from_headers(headers.get_all("Cookie"));

        Self {
            method,
            path,
            query: QueryParams::parse(&query),
            target,
            version: version.into(),
            headers,
            cookies,
            params: RouteParams::default(),
            body,
            connection: None,
        }
    }

    /// Retrieves a header value by name (ASCII case-insensitive).
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name)
    }

    /// The Content-Length header parsed as a usize; 0 if missing or invalid.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Whether the connection should stay open after the response.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 defaults to close unless `Connection: keep-alive` is sent.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return false;
        }
        if self.version == "HTTP/1.0" {
            return self.headers.has_token("Connection", "keep-alive");
        }
        true
    }

    /// The request asks to switch to the WebSocket protocol.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers.has_token("Upgrade", "websocket")
            && self.headers.has_token("Connection", "upgrade")
    }

    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Decodes a urlencoded or multipart form body. Any other content type
    /// gives an empty form.
    pub fn form(&self) -> Result<FormData, FormError> {
        FormData::parse(self.header("Content-Type"), &self.body)
    }
}

/// Splits a request-target into its decoded path and raw query.
fn split_target(target: &str) -> (String, String) {
    if target.starts_with("http://") || target.starts_with("https://") {
        if let Ok(url) = url::Url::parse(target) {
            return (
                decode_path(url.path()),
                url.query().unwrap_or_default().to_string(),
            );
        }
    }

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    (decode_path(path), query.to_string())
}

fn decode_path(path: &str) -> String {
    urlencoding::decode(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Builder for constructing Request objects, mostly useful in tests.
pub struct RequestBuilder {
    method: Option<Method>,
    target: Option<String>,
    version: Option<String>,
    headers: Headers,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            target: None,
            version: None,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Request-target, which may include a query string.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.target = Some(path.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets a header, replacing earlier values.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn append_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        Ok(Request::new(
            self.method.ok_or("method missing")?,
            self.target.ok_or("path missing")?,
            self.version.unwrap_or_else(|| "HTTP/1.1".to_string()),
            self.headers,
            self.body,
        ))
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
