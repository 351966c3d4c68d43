//! HTTP/1.1 protocol implementation.
//!
//! # Architecture
//!
//! - **`connection`**: The per-connection state machine
//! - **`parser`**: Incremental request parser over a byte buffer
//! - **`request`**: Request representation, query and connection info
//! - **`body`**: Bodies handed to streaming routes while they arrive
//! - **`form`**: Form bodies (`urlencoded` and `multipart/form-data`)
//! - **`headers`**: Ordered, case-insensitive header list
//! - **`cookie`**: `Cookie` header parsing
//! - **`response`**: Response representation with builder pattern
//! - **`writer`**: Serializes and writes responses, streaming file bodies
//! - **`mime`**: MIME type detection based on file extensions
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────────────┐
//!        │ AwaitingRequestLine │ ← timer armed for the request
//!        └──────────┬──────────┘
//!                   ▼
//!        ┌─────────────────────┐
//!        │   ReadingHeaders    │
//!        └──────────┬──────────┘
//!                   ▼
//!        ┌─────────────────────┐
//!        │ ReadingBody (opt.)  │ ← skipped on streaming routes
//!        └──────────┬──────────┘
//!                   │ Request complete        (malformed → 4xx, Closed)
//!                   ▼                         (timer expiry → 408, Closed)
//!        ┌─────────────────────┐
//!        │     Dispatching     │ ← router, then static files; a streamed
//!        └──────────┬──────────┘   body is read alongside the handler
//!                   │
//!                   ├─ 101 ──────────→ UpgradedWebSocket
//!                   ▼
//!        ┌─────────────────────┐
//!        │   WritingResponse   │
//!        └──────────┬──────────┘
//!                   ├─ Keep-Alive → AwaitingRequestLine (same connection)
//!                   └─ Close → Closed
//! ```
//!
//! Each read moves the connection to the reading state matching what the
//! parser still waits for.

pub mod body;
pub mod connection;
pub mod cookie;
pub mod form;
pub mod headers;
pub mod mime;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
