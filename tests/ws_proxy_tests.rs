//! Integration tests for the WebSocket upgrade path: the splice, upstream
//! rejections and connect failures.

use bytes::Bytes;
use heimdall_proxy::common::full_body;
use heimdall_proxy::{ProxyOptions, ProxyServer};
use http::header::{CONNECTION, UPGRADE};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Upstream that accepts the websocket upgrade and, after the first client
/// bytes arrive, answers with a fixed greeting.
async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let service = service_fn(|mut req: Request<hyper::body::Incoming>| async move {
                    let on_upgrade = hyper::upgrade::on(&mut req);
                    tokio::spawn(async move {
                        if let Ok(upgraded) = on_upgrade.await {
                            let mut io = TokioIo::new(upgraded);
                            let mut buf = [0u8; 64];
                            let _ = io.read(&mut buf).await;
                            let _ = io.write_all(b"Hello over websockets").await;
                        }
                    });
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(StatusCode::SWITCHING_PROTOCOLS)
                            .header(UPGRADE, "websocket")
                            .header(CONNECTION, "Upgrade")
                            .body(Full::new(Bytes::new()))
                            .unwrap(),
                    )
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });
    addr
}

/// Upstream that answers every request, upgrades included, with a 404.
async fn spawn_refusing_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let service = service_fn(|_req| async move {
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Full::new(Bytes::from("no such socket")))
                            .unwrap(),
                    )
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

fn upgrade_request(host: &str) -> String {
    format!(
        "GET /chat HTTP/1.1\r\nHost: {host}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// Read from `stream` until the end of the HTTP response head.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .expect("response head not received in time")
            .unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&head).to_string()
}

async fn wait_for(flag: &AtomicBool) {
    for _ in 0..100 {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected event did not fire");
}

#[tokio::test]
async fn websocket_echo_through_the_splice() {
    let upstream = spawn_echo_upstream().await;

    let mut options =
        ProxyOptions::with_target(&format!("ws://127.0.0.1:{}", upstream.port())).unwrap();
    options.ws = true;
    let proxy = Arc::new(ProxyServer::new(options));

    let opened = Arc::new(AtomicBool::new(false));
    let closed = Arc::new(AtomicBool::new(false));
    let open_flag = opened.clone();
    proxy.hooks().on_open(move || {
        open_flag.store(true, Ordering::SeqCst);
    });
    let close_flag = closed.clone();
    proxy.hooks().on_close(move |_| {
        close_flag.store(true, Ordering::SeqCst);
    });

    let addr = proxy
        .clone()
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(upgrade_request("front.example").as_bytes())
        .await
        .unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");

    stream.write_all(b"hello there").await.unwrap();
    let mut echoed = [0u8; 21];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .expect("echo not received in time")
        .unwrap();
    assert_eq!(&echoed, b"Hello over websockets");
    wait_for(&opened).await;

    // closing the client side tears down the splice
    drop(stream);
    wait_for(&closed).await;
    proxy.close();
}

#[tokio::test]
async fn upstream_rejecting_the_upgrade_is_relayed() {
    let upstream = spawn_refusing_upstream().await;

    let mut options =
        ProxyOptions::with_target(&format!("ws://127.0.0.1:{}", upstream.port())).unwrap();
    options.ws = true;
    let proxy = Arc::new(ProxyServer::new(options));
    proxy.hooks().on_error(|_, _, _| {});
    let addr = proxy
        .clone()
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(upgrade_request("front.example").as_bytes())
        .await
        .unwrap();

    // the status line and headers arrive ahead of any body bytes
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 404"), "{head}");

    let mut body = [0u8; 14];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut body))
        .await
        .expect("body not received in time")
        .unwrap();
    assert_eq!(&body, b"no such socket");
    proxy.close();
}

#[tokio::test]
async fn websocket_upstream_refused_emits_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let options = ProxyOptions::with_target(&format!("ws://127.0.0.1:{port}")).unwrap();
    let proxy = ProxyServer::new(options);

    let saw_refused = Arc::new(AtomicBool::new(false));
    let flag = saw_refused.clone();
    proxy.hooks().on_error(move |err, _, url| {
        if err.is_connection_refused() && url.is_some() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let req = Request::builder()
        .method("GET")
        .uri("/chat")
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .body(full_body(""))
        .unwrap();
    let result = proxy.ws(req, None).await;
    assert!(result.expect_err("connect should fail").is_connection_refused());
    assert!(saw_refused.load(Ordering::SeqCst));
}

#[tokio::test]
async fn malformed_upgrade_is_rejected_without_events() {
    let options = ProxyOptions::with_target("ws://127.0.0.1:1").unwrap();
    let proxy = ProxyServer::new(options);
    // no error listener: a malformed upgrade must not reach the hooks
    let req = Request::builder()
        .method("POST")
        .uri("/chat")
        .header(UPGRADE, "websocket")
        .body(full_body(""))
        .unwrap();
    let result = proxy.ws(req, None).await;
    assert!(matches!(
        result,
        Err(heimdall_proxy::ProxyError::MalformedUpgrade)
    ));
}
