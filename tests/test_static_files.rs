use std::path::PathBuf;

use ember::http::request::{Method, RequestBuilder};
use ember::http::response::{Body, StatusCode};
use ember::static_files::{FileError, FileStreamer, StaticFiles};
use tempfile::TempDir;

fn public_dir() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = std::fs::canonicalize(dir.path()).unwrap();
    (dir, root)
}

async fn read_all(mut streamer: FileStreamer) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = streamer.next_chunk().await.unwrap() {
        out.extend_from_slice(chunk);
    }
    out
}

#[tokio::test]
async fn test_chunked_read_is_byte_identical() {
    let (_dir, root) = public_dir();
    let contents: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(root.join("data.bin"), &contents).unwrap();

    for buffer_size in [1, 7, 4096, 1 << 20] {
        let files = StaticFiles::new(&root, buffer_size);
        let streamer = files.open("/data.bin").await.unwrap();

        assert_eq!(streamer.len(), contents.len() as u64);
        assert!(streamer.chunk_capacity() <= buffer_size);
        assert!(streamer.chunk_capacity() <= contents.len());
        assert_eq!(read_all(streamer).await, contents);
    }
}

#[tokio::test]
async fn test_chunks_never_exceed_buffer_size() {
    let (_dir, root) = public_dir();
    std::fs::write(root.join("a.txt"), b"abcdefghij").unwrap();

    let mut streamer = StaticFiles::new(&root, 3).open("/a.txt").await.unwrap();
    let mut sizes = Vec::new();
    while let Some(chunk) = streamer.next_chunk().await.unwrap() {
        sizes.push(chunk.len());
    }

    assert!(sizes.iter().all(|&n| n <= 3));
    assert_eq!(sizes.iter().sum::<usize>(), 10);
}

#[tokio::test]
async fn test_file_truncated_after_open_is_an_error() {
    let (_dir, root) = public_dir();
    let path = root.join("shrinking.bin");
    std::fs::write(&path, vec![9u8; 64]).unwrap();

    let mut streamer = StaticFiles::new(&root, 16).open("/shrinking.bin").await.unwrap();
    assert_eq!(streamer.next_chunk().await.unwrap().map(<[u8]>::len), Some(16));

    std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(20)
        .unwrap();

    let mut outcome = Ok(());
    for _ in 0..8 {
        match streamer.next_chunk().await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }
    assert!(matches!(outcome, Err(FileError::Io(_))));
}

#[tokio::test]
async fn test_traversal_is_forbidden() {
    let (_dir, root) = public_dir();
    let files = StaticFiles::new(&root, 1024);

    assert!(matches!(
        files.resolve("/../../etc/passwd").await,
        Err(FileError::Forbidden)
    ));
    assert!(matches!(
        files.resolve("/a/../../secret").await,
        Err(FileError::Forbidden)
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlink_outside_root_is_forbidden() {
    let (_dir, root) = public_dir();
    let (_outside, outside_root) = public_dir();
    std::fs::write(outside_root.join("secret.txt"), b"secret").unwrap();
    std::os::unix::fs::symlink(outside_root.join("secret.txt"), root.join("link.txt")).unwrap();

    let files = StaticFiles::new(&root, 1024);
    assert!(matches!(
        files.resolve("/link.txt").await,
        Err(FileError::Forbidden)
    ));
}

#[tokio::test]
async fn test_missing_file_and_directory_index() {
    let (_dir, root) = public_dir();
    std::fs::create_dir(root.join("docs")).unwrap();
    std::fs::create_dir(root.join("empty")).unwrap();
    std::fs::write(root.join("docs/index.html"), b"<h1>docs</h1>").unwrap();
    let files = StaticFiles::new(&root, 1024);

    assert!(matches!(
        files.resolve("/nope.txt").await,
        Err(FileError::NotFound)
    ));
    assert!(matches!(
        files.resolve("/empty").await,
        Err(FileError::NotFound)
    ));
    assert_eq!(
        files.resolve("/docs/").await.unwrap(),
        root.join("docs/index.html")
    );
    assert_eq!(FileError::NotFound.status(), StatusCode::NotFound);
    assert_eq!(FileError::Forbidden.status(), StatusCode::Forbidden);
}

#[tokio::test]
async fn test_serve_sets_type_and_length() {
    let (_dir, root) = public_dir();
    std::fs::write(root.join("style.css"), b"body{}").unwrap();
    let files = StaticFiles::new(&root, 1024);

    let request = RequestBuilder::new()
        .method(Method::GET)
        .path("/style.css")
        .build()
        .unwrap();
    let response = files.serve(&request).await.unwrap();

    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.headers.get("Content-Length"), Some("6"));
    assert!(response.headers.get("Content-Type").unwrap().starts_with("text/css"));
    assert!(response.headers.get("Last-Modified").is_some());
    assert!(matches!(response.body, Body::File(_)));
}

#[tokio::test]
async fn test_serve_not_modified() {
    let (_dir, root) = public_dir();
    std::fs::write(root.join("page.html"), b"<p>hi</p>").unwrap();
    let files = StaticFiles::new(&root, 1024);

    let first = RequestBuilder::new()
        .method(Method::GET)
        .path("/page.html")
        .build()
        .unwrap();
    let response = files.serve(&first).await.unwrap();
    let last_modified = response.headers.get("Last-Modified").unwrap().to_string();

    let conditional = RequestBuilder::new()
        .method(Method::GET)
        .path("/page.html")
        .header("If-Modified-Since", last_modified)
        .build()
        .unwrap();
    let response = files.serve(&conditional).await.unwrap();

    assert_eq!(response.status, StatusCode::NotModified);
    assert!(response.body.is_empty());
}
