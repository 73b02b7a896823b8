//! Integration tests for the HTTP proxying path, against real sockets.

use bytes::Bytes;
use heimdall_proxy::common::full_body;
use heimdall_proxy::{ProxyOptions, ProxyServer};
use http::header::HeaderMap;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Spawn a plain HTTP/1.1 upstream answering every request with `handler`.
/// Headers are written title-cased so case preservation is observable.
async fn spawn_upstream<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });
                let mut builder = hyper::server::conn::http1::Builder::new();
                builder.title_case_headers(true);
                let _ = builder
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// Send raw bytes and read until the peer closes.
async fn raw_exchange(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("response not finished in time")
        .unwrap();
    String::from_utf8_lossy(&buf).to_string()
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
async fn get_passthrough_preserves_header_case() {
    let upstream = spawn_upstream(|_req| async move {
        Response::builder()
            .header("Content-Type", "text/plain")
            .body(Full::new(Bytes::from("Hello from S")))
            .unwrap()
    })
    .await;

    let mut options =
        ProxyOptions::with_target(&format!("http://127.0.0.1:{}", upstream.port())).unwrap();
    options.preserve_header_key_case = true;
    let proxy = Arc::new(ProxyServer::new(options));

    let got_proxy_res = Arc::new(AtomicBool::new(false));
    let got_end = Arc::new(AtomicBool::new(false));
    let res_flag = got_proxy_res.clone();
    proxy.hooks().on_proxy_res(move |_, _| {
        res_flag.store(true, Ordering::SeqCst);
    });
    let end_flag = got_end.clone();
    proxy.hooks().on_end(move |_, _| {
        end_flag.store(true, Ordering::SeqCst);
    });

    let addr = proxy
        .clone()
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let response = raw_exchange(
        addr,
        "GET / HTTP/1.1\r\nHost: front.example\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("Content-Type: text/plain"), "{response}");
    assert!(response.ends_with("Hello from S"), "{response}");

    wait_for(&got_proxy_res).await;
    wait_for(&got_end).await;
    proxy.close();
}

#[tokio::test]
async fn xfwd_headers_reach_the_forward_upstream() {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<HeaderMap>(1);
    let upstream = spawn_upstream(move |req| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(req.headers().clone()).await;
            Response::new(Full::new(Bytes::new()))
        }
    })
    .await;

    let mut options =
        ProxyOptions::with_forward(&format!("http://127.0.0.1:{}", upstream.port())).unwrap();
    options.xfwd = true;
    let proxy = Arc::new(ProxyServer::new(options));
    let addr = proxy
        .clone()
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    // forward-only: the client response closes right away
    let response = raw_exchange(addr, "GET / HTTP/1.0\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.0 200") || response.starts_with("HTTP/1.1 200"));

    let headers = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("forward request never arrived")
        .unwrap();
    assert_eq!(headers.get("x-forwarded-for").unwrap(), "127.0.0.1");
    assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
    assert_eq!(headers.get("x-forwarded-port").unwrap(), "80");
    proxy.close();
}

#[tokio::test]
async fn timeout_tears_down_the_exchange() {
    let upstream = spawn_upstream(|_req| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Response::new(Full::new(Bytes::from("too late")))
    })
    .await;

    let mut options =
        ProxyOptions::with_target(&format!("http://127.0.0.1:{}", upstream.port())).unwrap();
    options.timeout_millis = Some(20);
    let proxy = ProxyServer::new(options);

    let saw_timeout = Arc::new(AtomicBool::new(false));
    let flag = saw_timeout.clone();
    proxy.hooks().on_error(move |err, _, _| {
        if err.is_timeout() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let req = Request::builder().uri("/").body(full_body("")).unwrap();
    let result = proxy.web(req, None).await;
    let err = result.expect_err("the exchange should have timed out");
    assert!(err.is_timeout(), "{err}");
    assert!(saw_timeout.load(Ordering::SeqCst));
}

#[tokio::test]
async fn upstream_refused_emits_error() {
    // bind then drop to find a port with nothing listening
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let options = ProxyOptions::with_target(&format!("http://127.0.0.1:{port}")).unwrap();
    let proxy = ProxyServer::new(options);

    let saw_refused = Arc::new(AtomicBool::new(false));
    let flag = saw_refused.clone();
    proxy.hooks().on_error(move |err, _, url| {
        if err.is_connection_refused() && url.is_some() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let req = Request::builder().uri("/").body(full_body("")).unwrap();
    let result = proxy.web(req, None).await;
    assert!(result.expect_err("connect should fail").is_connection_refused());
    assert!(saw_refused.load(Ordering::SeqCst));
}

#[tokio::test]
async fn per_call_callback_wins_over_hooks() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let options = ProxyOptions::with_target(&format!("http://127.0.0.1:{port}")).unwrap();
    // no error hook registered: without the callback this would panic
    let proxy = ProxyServer::new(options);

    let req = Request::builder().uri("/").body(full_body("")).unwrap();
    let response = proxy
        .web_with_callback(req, None, |_err, _req| {
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(full_body("upstream is down"))
                .unwrap()
        })
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn buffer_replaces_the_client_body() {
    let upstream = spawn_upstream(|req| async move {
        let body = req.into_body().collect().await.unwrap().to_bytes();
        Response::new(Full::new(body))
    })
    .await;

    let mut options =
        ProxyOptions::with_target(&format!("http://127.0.0.1:{}", upstream.port())).unwrap();
    options.buffer = Some(Bytes::from_static(b"buffered payload"));
    let proxy = ProxyServer::new(options);
    proxy.hooks().on_error(|_, _, _| {});

    let req = Request::builder()
        .method("POST")
        .uri("/")
        .header("content-length", "16")
        .body(full_body(""))
        .unwrap();
    let response = proxy.web(req, None).await.unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"buffered payload");
}

#[tokio::test]
async fn self_handle_response_skips_outgoing_passes() {
    let upstream = spawn_upstream(|_req| async move {
        Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header("location", "http://backend.internal/next")
            .body(Full::new(Bytes::new()))
            .unwrap()
    })
    .await;

    let mut options =
        ProxyOptions::with_target(&format!("http://127.0.0.1:{}", upstream.port())).unwrap();
    options.self_handle_response = true;
    options.host_rewrite = Some("public.example".to_string());
    let proxy = ProxyServer::new(options);
    proxy.hooks().on_error(|_, _, _| {});

    let req = Request::builder().uri("/").body(full_body("")).unwrap();
    let response = proxy.web(req, None).await.unwrap();
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    // untouched: host_rewrite did not run
    assert_eq!(
        response.headers().get("location").unwrap(),
        "http://backend.internal/next"
    );
}

#[tokio::test]
async fn follow_redirects_chases_the_location() {
    let upstream = spawn_upstream(|req| async move {
        if req.uri().path() == "/old" {
            Response::builder()
                .status(StatusCode::FOUND)
                .header("location", "/new")
                .body(Full::new(Bytes::new()))
                .unwrap()
        } else {
            Response::new(Full::new(Bytes::from("fresh content")))
        }
    })
    .await;

    let mut options =
        ProxyOptions::with_target(&format!("http://127.0.0.1:{}", upstream.port())).unwrap();
    options.follow_redirects = true;
    let proxy = ProxyServer::new(options);
    proxy.hooks().on_error(|_, _, _| {});

    let req = Request::builder().uri("/old").body(full_body("")).unwrap();
    let response = proxy.web(req, None).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"fresh content");
}
