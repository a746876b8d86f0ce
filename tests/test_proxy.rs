//! Tests for upstream proxy relay: framing disciplines, byte accounting,
//! and the connection-level proxy flow

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use outpost::backend::handler::Handlers;
use outpost::backend::proxy::{ChunkScanner, ProxySession, parse_reply_head};
use outpost::config::Limits;
use outpost::http::connection::Connection;
use outpost::http::writer::ConnectionWriter;
use outpost::routing::{Backend, Host, ProxySpec, RouteTable};
use outpost::server::{Registry, ServerContext};

#[test]
fn test_parse_reply_head_content_length() {
    let buf = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nrest";
    let head = parse_reply_head(buf).unwrap().unwrap();

    assert_eq!(head.status, 200);
    assert_eq!(head.content_len, Some(10));
    assert!(!head.chunked);
    assert_eq!(head.head_len, buf.len() - 4);
}

#[test]
fn test_parse_reply_head_chunked() {
    let buf = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
    let head = parse_reply_head(buf).unwrap().unwrap();

    assert!(head.chunked);
    assert_eq!(head.content_len, None);
}

#[test]
fn test_parse_reply_head_no_length() {
    let buf = b"HTTP/1.1 200 OK\r\nServer: thing\r\n\r\n";
    let head = parse_reply_head(buf).unwrap().unwrap();

    assert!(!head.chunked);
    assert_eq!(head.content_len, None);
}

#[test]
fn test_parse_reply_head_incomplete() {
    let buf = b"HTTP/1.1 200 OK\r\nContent-Le";
    assert!(parse_reply_head(buf).unwrap().is_none());
}

#[test]
fn test_parse_reply_head_rejects_garbage() {
    let buf = b"NONSENSE\r\n\r\n";
    assert!(parse_reply_head(buf).is_err());
}

#[test]
fn test_chunk_scanner_whole_body() {
    let body = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
    let mut scanner = ChunkScanner::new();

    let (consumed, done) = scanner.feed(body).unwrap();

    assert!(done);
    assert_eq!(consumed, body.len());
    assert_eq!(scanner.payload, 9);
}

#[test]
fn test_chunk_scanner_incremental_feeds() {
    // drive the scanner the way the relay does: consumed bytes leave the
    // front of the buffer, partial lines wait for more data
    let body: &[u8] = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
    let mut scanner = ChunkScanner::new();
    let mut buf: Vec<u8> = Vec::new();
    let mut relayed = 0;
    let mut fed = 0;

    loop {
        let (consumed, done) = scanner.feed(&buf).unwrap();
        relayed += consumed;
        buf.drain(..consumed);

        if done {
            break;
        }

        // one byte at a time is the worst case
        assert!(fed < body.len(), "scanner never finished");
        buf.push(body[fed]);
        fed += 1;
    }

    assert_eq!(relayed, body.len());
    assert_eq!(scanner.payload, 9);
}

#[test]
fn test_chunk_scanner_ignores_extensions_and_trailers() {
    let body = b"5;ext=1\r\nhello\r\n0\r\nX-Trailer: yes\r\n\r\n";
    let mut scanner = ChunkScanner::new();

    let (consumed, done) = scanner.feed(body).unwrap();

    assert!(done);
    assert_eq!(consumed, body.len());
    assert_eq!(scanner.payload, 5);
}

#[test]
fn test_chunk_scanner_rejects_bad_size() {
    let body = b"zz\r\ndata\r\n";
    let mut scanner = ChunkScanner::new();

    assert!(scanner.feed(body).is_err());
}

/// One-shot upstream: accepts a single connection, reads one request head,
/// writes `reply`, then closes.
async fn one_shot_upstream(reply: Vec<u8>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_head(&mut socket).await;
        socket.write_all(&reply).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    port
}

async fn read_head(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];

    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut tmp).await.unwrap();
        assert!(n > 0, "peer closed before a full head");
        buf.extend_from_slice(&tmp[..n]);
    }

    buf
}

async fn relay_through(port: u16) -> (anyhow::Result<outpost::backend::proxy::ReplyStats>, Vec<u8>) {
    let spec = ProxySpec {
        host: "127.0.0.1".to_string(),
        port,
    };

    let mut session = ProxySession::connect(&spec).await.unwrap();
    session
        .send(b"GET / HTTP/1.1\r\nHost: upstream\r\n\r\n")
        .await
        .unwrap();

    let (sink, mut capture) = tokio::io::duplex(1 << 20);
    let writer = ConnectionWriter::spawn(sink);

    let stats = session.relay_reply(&writer).await;
    drop(writer);

    let mut out = Vec::new();
    capture.read_to_end(&mut out).await.unwrap();
    (stats, out)
}

#[tokio::test]
async fn test_relay_exact_content_length() {
    let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789".to_vec();
    let port = one_shot_upstream(reply.clone()).await;

    let (stats, out) = relay_through(port).await;
    let stats = stats.unwrap();

    assert_eq!(stats.status, 200);
    assert_eq!(stats.body_len, 10);
    assert!(!stats.must_close);
    assert_eq!(out, reply);
}

#[tokio::test]
async fn test_relay_chunked_preserves_payload() {
    let reply = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n"
        .to_vec();
    let port = one_shot_upstream(reply.clone()).await;

    let (stats, out) = relay_through(port).await;
    let stats = stats.unwrap();

    assert_eq!(stats.body_len, 9);
    assert!(!stats.must_close);
    // framing relayed verbatim: payload bytes cannot have changed
    assert_eq!(out, reply);
}

#[tokio::test]
async fn test_relay_without_length_reads_until_close() {
    let reply = b"HTTP/1.1 200 OK\r\nServer: old\r\n\r\nsome bytes of unknown length".to_vec();
    let port = one_shot_upstream(reply.clone()).await;

    let (stats, out) = relay_through(port).await;
    let stats = stats.unwrap();

    assert!(stats.must_close);
    assert_eq!(stats.body_len, b"some bytes of unknown length".len() as u64);
    assert_eq!(out, reply);
}

#[tokio::test]
async fn test_relay_short_reply_is_an_error() {
    // upstream promises 100 bytes but sends 10
    let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n0123456789".to_vec();
    let port = one_shot_upstream(reply).await;

    let (stats, _) = relay_through(port).await;
    assert!(stats.is_err());
}

fn proxy_ctx(port: u16) -> Arc<ServerContext> {
    let mut table = RouteTable::new();
    let mut host = Host::new("localhost");
    host.add_route(
        "/",
        Arc::new(Backend::Proxy(ProxySpec {
            host: "127.0.0.1".to_string(),
            port,
        })),
    );
    let host = table.add_host(host);
    table.set_default_host(host);

    Arc::new(ServerContext {
        routes: Arc::new(table),
        registry: Registry::new(),
        handlers: Handlers::empty(),
        limits: Limits::default(),
        upload_store: None,
    })
}

async fn read_response(stream: &mut tokio::io::DuplexStream) -> (u16, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];

    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8(buf[..pos].to_vec()).unwrap();
            let status: u16 = head
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse().ok())
                .expect("bad status line");

            let content_length: usize = head
                .lines()
                .find_map(|l| {
                    let (k, v) = l.split_once(':')?;
                    k.eq_ignore_ascii_case("content-length")
                        .then(|| v.trim().parse().ok())?
                })
                .unwrap_or(0);

            let mut body = buf[pos + 4..].to_vec();

            while body.len() < content_length {
                let n = stream.read(&mut tmp).await.unwrap();
                assert!(n > 0, "eof mid body");
                body.extend_from_slice(&tmp[..n]);
            }

            body.truncate(content_length);
            return (status, body);
        }

        let n = stream.read(&mut tmp).await.unwrap();
        assert!(n > 0, "eof before response head");
        buf.extend_from_slice(&tmp[..n]);
    }
}

#[tokio::test]
async fn test_connection_proxies_and_reuses_upstream() {
    // a keep-alive upstream that answers two requests on one socket
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicUsize::new(0));
    let accepts_counted = accepts.clone();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        accepts_counted.fetch_add(1, Ordering::SeqCst);

        for reply in ["first", "second"] {
            read_head(&mut socket).await;
            let response =
                format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{reply}", reply.len());
            socket.write_all(response.as_bytes()).await.unwrap();
        }
    });

    let (mut client, server) = tokio::io::duplex(1 << 16);
    let conn = Connection::new(server, "127.0.0.1".to_string(), proxy_ctx(port));
    tokio::spawn(conn.run());

    client
        .write_all(b"GET /one HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"first");

    client
        .write_all(b"GET /two HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let (status, body) = read_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"second");

    // both requests rode one upstream connection
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connection_forwards_request_body_exactly() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (body_tx, body_rx) = tokio::sync::oneshot::channel::<Vec<u8>>();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut buf = read_head(&mut socket).await;
        let head_end = buf.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;

        while buf.len() < head_end + 100 {
            let mut tmp = [0u8; 1024];
            let n = socket.read(&mut tmp).await.unwrap();
            assert!(n > 0);
            buf.extend_from_slice(&tmp[..n]);
        }

        body_tx.send(buf[head_end..head_end + 100].to_vec()).unwrap();

        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
    });

    let (mut client, server) = tokio::io::duplex(1 << 16);
    let conn = Connection::new(server, "127.0.0.1".to_string(), proxy_ctx(port));
    tokio::spawn(conn.run());

    let body: Vec<u8> = (0..100u8).collect();
    client
        .write_all(b"POST /up HTTP/1.1\r\nHost: localhost\r\nContent-Length: 100\r\n\r\n")
        .await
        .unwrap();
    // body in two writes to force streaming past the buffered head
    client.write_all(&body[..30]).await.unwrap();
    client.write_all(&body[30..]).await.unwrap();

    let (status, resp_body) = read_response(&mut client).await;
    assert_eq!(status, 200);
    assert_eq!(resp_body, b"ok");

    assert_eq!(body_rx.await.unwrap(), body);
}

#[tokio::test]
async fn test_connection_closes_after_lengthless_reply() {
    let reply = b"HTTP/1.1 200 OK\r\n\r\neverything until close".to_vec();
    let port = one_shot_upstream(reply).await;

    let (mut client, server) = tokio::io::duplex(1 << 16);
    let conn = Connection::new(server, "127.0.0.1".to_string(), proxy_ctx(port));
    tokio::spawn(conn.run());

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    // read everything: the reply bytes, then a clean close
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();

    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.ends_with("everything until close"));
}

#[tokio::test]
async fn test_connection_unreachable_upstream_yields_502() {
    // a port with nothing listening on it
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (mut client, server) = tokio::io::duplex(1 << 16);
    let conn = Connection::new(server, "127.0.0.1".to_string(), proxy_ctx(port));
    tokio::spawn(conn.run());

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let (status, _) = read_response(&mut client).await;
    assert_eq!(status, 502);
}
