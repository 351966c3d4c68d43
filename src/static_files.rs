//! Static file serving from the configured public directory.
//!
//! [`StaticFiles`] maps request paths onto files below the root, refusing
//! anything that would land outside it. [`FileStreamer`] then reads the file
//! with a single buffer of at most `file_reader_buffer_size` bytes, so memory
//! use does not depend on file size.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::http::request::Request;
use crate::http::response::{Response, ResponseBuilder, StatusCode};
use crate::http::mime;

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("file not found")]
    NotFound,
    #[error("path escapes the public directory")]
    Forbidden,
    #[error("I/O error while serving file: {0}")]
    Io(#[from] io::Error),
}

impl FileError {
    pub fn status(&self) -> StatusCode {
        match self {
            FileError::NotFound => StatusCode::NotFound,
            FileError::Forbidden => StatusCode::Forbidden,
            FileError::Io(_) => StatusCode::InternalServerError,
        }
    }

    fn from_lookup(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => FileError::NotFound,
            io::ErrorKind::PermissionDenied => FileError::Forbidden,
            _ => FileError::Io(e),
        }
    }
}

/// Serves files below a canonical root directory.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    buffer_size: usize,
}

impl StaticFiles {
    /// `root` should already be canonical; [`Config`](crate::config::Config)
    /// canonicalises `public_dir` when it is built.
    pub fn new(root: impl Into<PathBuf>, buffer_size: usize) -> Self {
        Self {
            root: root.into(),
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Maps a decoded request path to a regular file below the root.
    ///
    /// `..` segments are refused outright, and the canonical result must
    /// still start with the root so symlinks cannot escape it either. A
    /// directory resolves to its `index.html`.
    pub async fn resolve(&self, request_path: &str) -> Result<PathBuf, FileError> {
        let mut path = self.root.clone();
        for segment in request_path.split('/') {
            match segment {
                "" | "." => {}
                ".." => return Err(FileError::Forbidden),
                s if s.contains('\\') || s.contains('\0') => return Err(FileError::Forbidden),
                s => path.push(s),
            }
        }

        let canonical = tokio::fs::canonicalize(&path)
            .await
            .map_err(FileError::from_lookup)?;
        if !canonical.starts_with(&self.root) {
            return Err(FileError::Forbidden);
        }

        let meta = tokio::fs::metadata(&canonical)
            .await
            .map_err(FileError::from_lookup)?;
        if meta.is_dir() {
            let index = canonical.join("index.html");
            return match tokio::fs::metadata(&index).await {
                Ok(m) if m.is_file() => Ok(index),
                _ => Err(FileError::NotFound),
            };
        }
        if !meta.is_file() {
            return Err(FileError::NotFound);
        }
        Ok(canonical)
    }

    pub async fn open(&self, request_path: &str) -> Result<FileStreamer, FileError> {
        let path = self.resolve(request_path).await?;
        FileStreamer::open(path, self.buffer_size).await
    }

    /// Builds the response for a GET or HEAD of `request.path`.
    ///
    /// Honours `If-Modified-Since` with a `304`. The body is not read here;
    /// the writer pulls it chunk by chunk.
    pub async fn serve(&self, request: &Request) -> Result<Response, FileError> {
        let file = self.open(&request.path).await?;
        let modified = file.modified().map(truncate_to_seconds);

        if let (Some(modified), Some(since)) = (modified, if_modified_since(request)) {
            if modified <= since {
                return Ok(ResponseBuilder::new(StatusCode::NotModified)
                    .header("Last-Modified", httpdate::fmt_http_date(modified))
                    .build());
            }
        }

        let mut builder = ResponseBuilder::new(StatusCode::Ok)
            .header("Content-Type", mime::content_type(file.path()));
        if let Some(modified) = modified {
            builder = builder.header("Last-Modified", httpdate::fmt_http_date(modified));
        }
        Ok(builder.file(file).build())
    }
}

fn if_modified_since(request: &Request) -> Option<SystemTime> {
    request
        .header("If-Modified-Since")
        .and_then(|v| httpdate::parse_http_date(v).ok())
}

fn truncate_to_seconds(time: SystemTime) -> SystemTime {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// Reads an open file in order, one bounded chunk at a time.
#[derive(Debug)]
pub struct FileStreamer {
    file: File,
    path: PathBuf,
    len: u64,
    remaining: u64,
    modified: Option<SystemTime>,
    buffer: Vec<u8>,
}

impl FileStreamer {
    pub async fn open(path: impl Into<PathBuf>, buffer_size: usize) -> Result<Self, FileError> {
        let path = path.into();
        let file = File::open(&path).await.map_err(FileError::from_lookup)?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(FileError::NotFound);
        }

        let len = meta.len();
        // Never allocate more than the file needs.
        let capacity = (buffer_size.max(1) as u64).min(len.max(1)) as usize;

        Ok(Self {
            file,
            path,
            len,
            remaining: len,
            modified: meta.modified().ok(),
            buffer: vec![0; capacity],
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    /// Size of the read buffer actually allocated.
    pub fn chunk_capacity(&self) -> usize {
        self.buffer.len()
    }

    /// The next chunk of the file, or `None` once every byte was returned.
    ///
    /// A file that ends early (truncated while being served) is an error:
    /// the response already promised `len` bytes.
    pub async fn next_chunk(&mut self) -> Result<Option<&[u8]>, FileError> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let want = (self.buffer.len() as u64).min(self.remaining) as usize;
        let n = self.file.read(&mut self.buffer[..want]).await?;
        if n == 0 {
            return Err(FileError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "{} ended {} bytes early",
                    self.path.display(),
                    self.remaining
                ),
            )));
        }

        self.remaining -= n as u64;
        Ok(Some(&self.buffer[..n]))
    }
}
