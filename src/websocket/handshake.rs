use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const SUPPORTED_VERSION: &str = "13";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("upgrade requires GET")]
    Method,
    #[error("upgrade requires HTTP/1.1")]
    Version,
    #[error("missing `Upgrade: websocket`")]
    UpgradeHeader,
    #[error("`Connection` does not contain `upgrade`")]
    ConnectionHeader,
    #[error("unsupported Sec-WebSocket-Version")]
    UnsupportedVersion,
    #[error("Sec-WebSocket-Key is missing or not 16 base64-encoded bytes")]
    InvalidKey,
}

/// `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Checks an upgrade request and returns its key.
pub fn validate(request: &Request) -> Result<&str, HandshakeError> {
    if request.method != Method::GET {
        return Err(HandshakeError::Method);
    }
    if request.version != "HTTP/1.1" {
        return Err(HandshakeError::Version);
    }
    if !request.headers.has_token("Upgrade", "websocket") {
        return Err(HandshakeError::UpgradeHeader);
    }
    if !request.headers.has_token("Connection", "upgrade") {
        return Err(HandshakeError::ConnectionHeader);
    }
    if request.header("Sec-WebSocket-Version").map(str::trim) != Some(SUPPORTED_VERSION) {
        return Err(HandshakeError::UnsupportedVersion);
    }

    let key = request
        .header("Sec-WebSocket-Key")
        .map(str::trim)
        .ok_or(HandshakeError::InvalidKey)?;
    match STANDARD.decode(key) {
        Ok(raw) if raw.len() == 16 => Ok(key),
        _ => Err(HandshakeError::InvalidKey),
    }
}

/// The `101 Switching Protocols` response completing the handshake.
pub fn accept_response(client_key: &str) -> Response {
    ResponseBuilder::new(StatusCode::SwitchingProtocols)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key(client_key))
        .build()
}

/// `400` for a failed handshake; advertises the version we speak.
pub fn reject_response(error: &HandshakeError) -> Response {
    let mut response = Response::text(StatusCode::BadRequest, format!("400 Bad Request: {error}"));
    response
        .headers
        .insert("Sec-WebSocket-Version", SUPPORTED_VERSION);
    response
}
