use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ember::http::body::BodyStream;
use ember::http::request::{Method, Request};
use ember::http::response::{Response, StatusCode};
use ember::websocket::{Message, WebSocket};
use ember::{Config, ListenAddress, Router, RunningServer, Server, ServerError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn local() -> ListenAddress {
    ListenAddress::plain("127.0.0.1", 0)
}

async fn start(config: Config, router: Router) -> (RunningServer, SocketAddr) {
    let server = match Server::new(config, router).start().await {
        Ok(server) => server,
        Err(e) => panic!("server failed to start: {e}"),
    };
    let addr = server.local_addrs()[0];
    (server, addr)
}

/// Reads one response with a `Content-Length` body; `None` on EOF.
async fn read_response(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<(u16, String, Vec<u8>)> {
    loop {
        if let Some(end) = find(buf, b"\r\n\r\n") {
            let head = String::from_utf8(buf[..end].to_vec()).unwrap();
            let status: u16 = head[9..12].parse().unwrap();
            let length: usize = head
                .lines()
                .find_map(|l| {
                    let (k, v) = l.split_once(':')?;
                    k.eq_ignore_ascii_case("content-length")
                        .then(|| v.trim().parse().unwrap())
                })
                .unwrap_or(0);

            let total = end + 4 + length;
            while buf.len() < total {
                if read_some(stream, buf).await == 0 {
                    return None;
                }
            }
            let body = buf[end + 4..total].to_vec();
            buf.drain(..total);
            return Some((status, head, body));
        }

        if read_some(stream, buf).await == 0 {
            return None;
        }
    }
}

async fn read_some(stream: &mut TcpStream, buf: &mut Vec<u8>) -> usize {
    let mut chunk = [0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
        .await
        .expect("read timed out")
        .unwrap_or(0);
    buf.extend_from_slice(&chunk[..n]);
    n
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn get(stream: &mut TcpStream, buf: &mut Vec<u8>, path: &str) -> (u16, String, Vec<u8>) {
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    read_response(stream, buf).await.expect("connection closed")
}

async fn hello(_req: Request) -> anyhow::Result<Response> {
    Ok(Response::ok("hello"))
}

async fn whoami(req: Request) -> anyhow::Result<Response> {
    let info = req.connection.expect("connection info");
    Ok(Response::ok(format!("{}:{}", info.worker, info.id)))
}

async fn item(req: Request) -> anyhow::Result<Response> {
    Ok(Response::ok(format!("item {}", req.params.int(0).unwrap_or(-1))))
}

async fn fail(_req: Request) -> anyhow::Result<Response> {
    anyhow::bail!("database unavailable")
}

async fn echo(_req: Request, mut ws: WebSocket) -> anyhow::Result<()> {
    while let Some(message) = ws.recv().await? {
        match message {
            Message::Text(_) | Message::Binary(_) => ws.send(message).await?,
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_start_and_shutdown() {
    let mut router = Router::new();
    router.get("/", hello).unwrap();
    let config = Config::builder([local()]).worker_threads(2).build().unwrap();

    let (server, addr) = start(config, router).await;
    assert_eq!(server.worker_stats().len(), 2);
    assert!(server.bind_errors().is_empty());

    tokio::time::timeout(Duration::from_secs(5), server.shutdown())
        .await
        .expect("shutdown hung");

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_keep_alive_serves_requests_in_order() {
    let mut router = Router::new();
    router.get("/", hello).unwrap();
    router.get("/items/{{i}}", item).unwrap();
    let config = Config::builder([local()]).worker_threads(1).build().unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();

    // Two pipelined requests in one write.
    stream
        .write_all(b"GET /items/1 HTTP/1.1\r\nHost: a\r\n\r\nGET /items/2 HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();
    let (status, _, body) = read_response(&mut stream, &mut buf).await.unwrap();
    assert_eq!((status, body), (200, b"item 1".to_vec()));
    let (status, _, body) = read_response(&mut stream, &mut buf).await.unwrap();
    assert_eq!((status, body), (200, b"item 2".to_vec()));

    let (status, head, body) = get(&mut stream, &mut buf, "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"hello");
    assert!(!head.to_ascii_lowercase().contains("connection: close"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_connection_close_is_honoured() {
    let mut router = Router::new();
    router.get("/", hello).unwrap();
    let config = Config::builder([local()]).worker_threads(1).build().unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();
    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let (status, head, _) = read_response(&mut stream, &mut buf).await.unwrap();
    assert_eq!(status, 200);
    assert!(head.contains("Connection: close"));
    assert_eq!(read_some(&mut stream, &mut buf).await, 0);

    server.shutdown().await;
}

static SLOW_CLIENT_CALLS: AtomicUsize = AtomicUsize::new(0);

async fn counted(_req: Request) -> anyhow::Result<Response> {
    SLOW_CLIENT_CALLS.fetch_add(1, Ordering::SeqCst);
    Ok(Response::ok("never"))
}

async fn slow(_req: Request) -> anyhow::Result<Response> {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Ok(Response::ok("late"))
}

#[tokio::test]
async fn test_incomplete_request_times_out() {
    let mut router = Router::new();
    router.get("/", counted).unwrap();
    let config = Config::builder([local()])
        .worker_threads(1)
        .request_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();
    stream.write_all(b"GET / HT").await.unwrap();

    let (status, _, _) = read_response(&mut stream, &mut buf).await.unwrap();
    assert_eq!(status, 408);
    assert_eq!(read_some(&mut stream, &mut buf).await, 0);
    assert_eq!(SLOW_CLIENT_CALLS.load(Ordering::SeqCst), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_slow_handler_gets_503() {
    let mut router = Router::new();
    router.get("/slow", slow).unwrap();
    let config = Config::builder([local()])
        .worker_threads(1)
        .request_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();
    let (status, _, _) = get(&mut stream, &mut buf, "/slow").await;
    assert_eq!(status, 503);
    assert_eq!(read_some(&mut stream, &mut buf).await, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_handler_error_is_500_and_connection_survives() {
    let mut router = Router::new();
    router.get("/fail", fail).unwrap();
    router.get("/", hello).unwrap();
    let config = Config::builder([local()]).worker_threads(1).build().unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();

    let (status, _, _) = get(&mut stream, &mut buf, "/fail").await;
    assert_eq!(status, 500);
    let (status, _, body) = get(&mut stream, &mut buf, "/").await;
    assert_eq!((status, body), (200, b"hello".to_vec()));

    server.shutdown().await;
}

#[tokio::test]
async fn test_custom_error_handler_and_405() {
    let mut router = Router::new();
    router.post("/submit", hello).unwrap();
    router.on_error(StatusCode::NotFound, |_ctx| {
        Response::text(StatusCode::NotFound, "custom missing")
    });
    let config = Config::builder([local()]).worker_threads(1).build().unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();

    let (status, _, body) = get(&mut stream, &mut buf, "/nowhere").await;
    assert_eq!((status, body), (404, b"custom missing".to_vec()));

    let (status, head, _) = get(&mut stream, &mut buf, "/submit").await;
    assert_eq!(status, 405);
    assert!(head.contains("Allow: POST"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_request_gets_400() {
    let router = Router::new();
    let config = Config::builder([local()]).worker_threads(1).build().unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();
    stream.write_all(b"NONSENSE\r\n\r\n").await.unwrap();

    let (status, _, _) = read_response(&mut stream, &mut buf).await.unwrap();
    assert_eq!(status, 400);
    assert_eq!(read_some(&mut stream, &mut buf).await, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_connections_stay_on_one_worker() {
    const WORKERS: usize = 3;

    let mut router = Router::new();
    router.get("/whoami", whoami).unwrap();
    let config = Config::builder([local()])
        .worker_threads(WORKERS)
        .build()
        .unwrap();
    let (server, addr) = start(config, router).await;

    // All connections are open at once before any of them is used.
    let mut clients = Vec::new();
    for _ in 0..WORKERS * 10 {
        clients.push((TcpStream::connect(addr).await.unwrap(), Vec::new()));
    }

    let mut first_answers = Vec::new();
    for (stream, buf) in clients.iter_mut() {
        let (_, _, body) = get(stream, buf, "/whoami").await;
        first_answers.push(body);
    }

    let mut workers_seen = HashSet::new();
    let mut ids_seen = HashSet::new();
    for ((stream, buf), first) in clients.iter_mut().zip(first_answers) {
        let (_, _, second) = get(stream, buf, "/whoami").await;
        assert_eq!(first, second);

        let text = String::from_utf8(first).unwrap();
        let (worker, id) = text.split_once(':').unwrap();
        workers_seen.insert(worker.to_string());
        assert!(ids_seen.insert(id.to_string()), "connection id reused");
    }

    assert_eq!(workers_seen.len(), WORKERS);
    let accepted: u64 = server.worker_stats().iter().map(|s| s.accepted()).sum();
    assert_eq!(accepted, (WORKERS * 10) as u64);
    for stats in server.worker_stats() {
        assert_eq!(stats.accepted(), 10);
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_websocket_echo() {
    let mut router = Router::new();
    router.websocket("/ws", echo).unwrap();
    let config = Config::builder([local()]).worker_threads(1).build().unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let (status, head, _) = read_response(&mut stream, &mut buf).await.unwrap();
    assert_eq!(status, 101);
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    // Masked text frame "ping".
    let mask = [0x12, 0x34, 0x56, 0x78];
    let mut frame = vec![0x81, 0x80 | 4];
    frame.extend_from_slice(&mask);
    frame.extend(b"ping".iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    stream.write_all(&frame).await.unwrap();

    while buf.len() < 6 {
        assert!(read_some(&mut stream, &mut buf).await > 0);
    }
    assert_eq!(&buf[..6], &[0x81, 4, b'p', b'i', b'n', b'g']);
    buf.drain(..6);

    // Masked close frame with code 1000.
    let code = 1000u16.to_be_bytes();
    let mut close = vec![0x88, 0x80 | 2];
    close.extend_from_slice(&mask);
    close.extend(code.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    stream.write_all(&close).await.unwrap();

    while buf.len() < 4 {
        assert!(read_some(&mut stream, &mut buf).await > 0);
    }
    assert_eq!(&buf[..4], &[0x88, 2, 0x03, 0xE8]);
    buf.drain(..4);
    assert_eq!(read_some(&mut stream, &mut buf).await, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_plain_get_on_websocket_route_is_426() {
    let mut router = Router::new();
    router.websocket("/ws", echo).unwrap();
    let config = Config::builder([local()]).worker_threads(1).build().unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();
    let (status, _, _) = get(&mut stream, &mut buf, "/ws").await;
    assert_eq!(status, 426);

    server.shutdown().await;
}

#[tokio::test]
async fn test_static_files_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"static hello").unwrap();

    let mut router = Router::new();
    router.get("/", hello).unwrap();
    let config = Config::builder([local()])
        .worker_threads(1)
        .public_dir(dir.path())
        .file_reader_buffer_size(3)
        .build()
        .unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();

    let (status, head, body) = get(&mut stream, &mut buf, "/hello.txt").await;
    assert_eq!(status, 200);
    assert!(head.contains("Content-Type: text/plain"));
    assert_eq!(body, b"static hello");

    let (status, _, _) = get(&mut stream, &mut buf, "/%2e%2e/%2e%2e/etc/passwd").await;
    assert_ne!(status, 200);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();
    let (status, _, body) = get(&mut stream, &mut buf, "/missing.txt").await;
    assert_eq!(status, 404);
    assert_eq!(body, b"404 Not Found");

    server.shutdown().await;
}

#[tokio::test]
async fn test_route_shadows_static_file_with_same_path() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"static hello").unwrap();

    let mut router = Router::new();
    router.get("/hello.txt", hello).unwrap();
    let config = Config::builder([local()])
        .worker_threads(1)
        .public_dir(dir.path())
        .build()
        .unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();

    let (status, _, body) = get(&mut stream, &mut buf, "/hello.txt").await;
    assert_eq!((status, body), (200, b"hello".to_vec()));

    stream
        .write_all(b"POST /hello.txt HTTP/1.1\r\nHost: a\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    let (status, head, _) = read_response(&mut stream, &mut buf).await.unwrap();
    assert_eq!(status, 405);
    assert!(head.contains("Allow: GET"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_http10_keep_alive_is_announced() {
    let mut router = Router::new();
    router.get("/", hello).unwrap();
    let config = Config::builder([local()]).worker_threads(1).build().unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();

    for _ in 0..2 {
        stream
            .write_all(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .await
            .unwrap();
        let (status, head, body) = read_response(&mut stream, &mut buf).await.unwrap();
        assert_eq!((status, body), (200, b"hello".to_vec()));
        assert!(head.contains("Connection: keep-alive"));
    }

    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let (_, head, _) = read_response(&mut stream, &mut buf).await.unwrap();
    assert!(head.contains("Connection: close"));
    assert!(read_response(&mut stream, &mut buf).await.is_none());

    server.shutdown().await;
}

async fn checksum(_req: Request, mut body: BodyStream) -> anyhow::Result<Response> {
    let mut total = 0usize;
    let mut sum = 0u64;
    while let Some(data) = body.chunk().await? {
        total += data.len();
        sum += data.iter().map(|&b| b as u64).sum::<u64>();
    }
    Ok(Response::ok(format!("{total} {sum}")))
}

#[tokio::test]
async fn test_streaming_route_reads_body_beyond_buffer_limit() {
    let mut router = Router::new();
    router.streaming([Method::PUT], "/upload", checksum).unwrap();
    router.post("/buffered", hello).unwrap();
    let config = Config::builder([local()])
        .worker_threads(1)
        .max_body_bytes(1024)
        .build()
        .unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();

    stream
        .write_all(b"PUT /upload HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n")
        .await
        .unwrap();
    for _ in 0..16 {
        stream.write_all(b"400\r\n").await.unwrap();
        stream.write_all(&[1u8; 1024]).await.unwrap();
        stream.write_all(b"\r\n").await.unwrap();
    }
    stream.write_all(b"0\r\n\r\n").await.unwrap();

    let (status, _, body) = read_response(&mut stream, &mut buf).await.unwrap();
    assert_eq!((status, body), (200, b"16384 16384".to_vec()));

    // The same connection still serves buffered requests, which keep the limit.
    let (status, _, _) = get(&mut stream, &mut buf, "/missing").await;
    assert_eq!(status, 404);
    stream
        .write_all(b"POST /buffered HTTP/1.1\r\nHost: a\r\nContent-Length: 2048\r\n\r\n")
        .await
        .unwrap();
    let (status, _, _) = read_response(&mut stream, &mut buf).await.unwrap();
    assert_eq!(status, 413);

    server.shutdown().await;
}

#[tokio::test]
async fn test_head_request_has_no_body() {
    let mut router = Router::new();
    router.get("/", hello).unwrap();
    let config = Config::builder([local()]).worker_threads(1).build().unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"HEAD / HTTP/1.1\r\nHost: a\r\n\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    // HEAD advertises the length but sends no body, so the next bytes are
    // the GET response.
    loop {
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8(buf[..end].to_vec()).unwrap();
            assert!(head.starts_with("HTTP/1.1 200"));
            assert!(head.contains("Content-Length: 5"));
            buf.drain(..end + 4);
            break;
        }
        assert!(read_some(&mut stream, &mut buf).await > 0);
    }
    let (status, _, body) = read_response(&mut stream, &mut buf).await.unwrap();
    assert_eq!((status, body), (200, b"hello".to_vec()));

    server.shutdown().await;
}

#[tokio::test]
async fn test_secure_address_without_acceptor_is_reported() {
    let mut router = Router::new();
    router.get("/", hello).unwrap();
    let config = Config::builder([ListenAddress::secure("127.0.0.1", 0), local()])
        .worker_threads(1)
        .build()
        .unwrap();

    let server = match Server::new(config, router).start().await {
        Ok(server) => server,
        Err(e) => panic!("plain listener should have started: {e}"),
    };
    assert_eq!(server.bind_errors().len(), 1);
    assert_eq!(server.local_addrs().len(), 1);

    let mut stream = TcpStream::connect(server.local_addrs()[0]).await.unwrap();
    let mut buf = Vec::new();
    let (status, _, _) = get(&mut stream, &mut buf, "/").await;
    assert_eq!(status, 200);

    server.shutdown().await;
}

#[tokio::test]
async fn test_all_binds_failing_is_an_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let config = Config::builder([ListenAddress::plain("127.0.0.1", port)])
        .worker_threads(1)
        .build()
        .unwrap();

    match Server::new(config, Router::new()).start().await {
        Err(ServerError::NoListeners(errors)) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].address.port, port);
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("bind should have failed"),
    }
}

#[tokio::test]
async fn test_shutdown_closes_idle_connections() {
    let mut router = Router::new();
    router.get("/", hello).unwrap();
    let config = Config::builder([local()])
        .worker_threads(1)
        .shutdown_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let (server, addr) = start(config, router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();
    let (status, _, _) = get(&mut stream, &mut buf, "/").await;
    assert_eq!(status, 200);

    tokio::time::timeout(Duration::from_secs(5), server.shutdown())
        .await
        .expect("shutdown hung");
    assert_eq!(read_some(&mut stream, &mut buf).await, 0);
}
