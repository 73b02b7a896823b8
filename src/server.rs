//! The proxy server facade: owns the pass pipelines and the hook table,
//! dispatches HTTP and WebSocket transactions, and optionally runs its own
//! listener.

use crate::common::{boxed_request, is_websocket_upgrade, BoxError, ClientMeta, ProxyBody};
use crate::config::{ListenerTls, ProxyOptions};
use crate::error::ProxyError;
use crate::events::Hooks;
use crate::io::{load_certs, load_private_key, TimeoutIo};
use crate::passes::{
    run_pipeline, web_incoming, web_outgoing, ws_incoming, ErrorCallback, OutgoingPass, Pass,
    PassKind, ProxyContext,
};
use bytes::Bytes;
use http::request::Parts as RequestParts;
use http::{Request, Response};
use http_body::Body;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use log::{debug, error, info};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

type PooledClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, ProxyBody>;

/// Pooled upstream client handle. Passing one in [`ProxyOptions::agent`]
/// reuses upstream connections across requests; without one every request
/// dials a dedicated connection closed after the exchange.
#[derive(Clone)]
pub struct Agent {
    client: PooledClient,
}

impl Agent {
    pub fn new(
        pool_max_idle_per_host: usize,
        pool_idle_timeout: Duration,
    ) -> Result<Agent, ProxyError> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| ProxyError::Tls(format!("failed to load native roots: {e}")))?
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .pool_idle_timeout(pool_idle_timeout)
            .pool_timer(TokioTimer::new())
            .build(https);
        Ok(Agent { client })
    }

    pub(crate) async fn request(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, ProxyError> {
        self.client
            .request(req)
            .await
            .map_err(|e| ProxyError::Http(format!("pooled client error: {e}")))
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Agent")
    }
}

/// A programmable reverse proxy. Configure it (global options, extra
/// passes via [`before`](Self::before)/[`after`](Self::after), listeners on
/// [`hooks`](Self::hooks)), then either embed [`web`](Self::web)/
/// [`ws`](Self::ws) in your own server or wrap it in an `Arc` and
/// [`listen`](Self::listen).
pub struct ProxyServer {
    options: ProxyOptions,
    web_passes: Vec<Pass>,
    ws_passes: Vec<Pass>,
    web_outgoing: Arc<Vec<OutgoingPass>>,
    hooks: Arc<Hooks>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyServer {
    /// Per-instance copies of the pass lists, so later insertions never
    /// leak into sibling instances.
    pub fn new(options: ProxyOptions) -> ProxyServer {
        ProxyServer {
            options,
            web_passes: web_incoming::passes(),
            ws_passes: ws_incoming::passes(),
            web_outgoing: Arc::new(web_outgoing::passes()),
            hooks: Arc::new(Hooks::default()),
            listener: Mutex::new(None),
        }
    }

    /// Event listeners. With no `error` listener registered (and no
    /// per-call callback), a failing transaction panics; errors must be
    /// handled somewhere.
    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Proxy one HTTP request. `Ok` carries the response to relay; `Err`
    /// means the client connection must be destroyed without a response.
    pub async fn web<B>(
        &self,
        req: Request<B>,
        per_call: Option<ProxyOptions>,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        self.dispatch(PassKind::Web, boxed_request(req), per_call, None)
            .await
    }

    /// Like [`web`](Self::web), with a callback mapping a proxy error to
    /// the response the client should receive. The callback wins over the
    /// `error` hooks.
    pub async fn web_with_callback<B>(
        &self,
        req: Request<B>,
        per_call: Option<ProxyOptions>,
        callback: impl FnOnce(&ProxyError, &RequestParts) -> Response<ProxyBody> + Send + 'static,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        self.dispatch(
            PassKind::Web,
            boxed_request(req),
            per_call,
            Some(Box::new(callback) as ErrorCallback),
        )
        .await
    }

    /// Proxy one WebSocket upgrade request. On success the returned `101`
    /// response commits the client upgrade and the splice runs in the
    /// background; a non-101 upstream answer is relayed as-is.
    pub async fn ws<B>(
        &self,
        req: Request<B>,
        per_call: Option<ProxyOptions>,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        self.dispatch(PassKind::Ws, boxed_request(req), per_call, None)
            .await
    }

    pub async fn ws_with_callback<B>(
        &self,
        req: Request<B>,
        per_call: Option<ProxyOptions>,
        callback: impl FnOnce(&ProxyError, &RequestParts) -> Response<ProxyBody> + Send + 'static,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        self.dispatch(
            PassKind::Ws,
            boxed_request(req),
            per_call,
            Some(Box::new(callback) as ErrorCallback),
        )
        .await
    }

    async fn dispatch(
        &self,
        kind: PassKind,
        req: Request<ProxyBody>,
        per_call: Option<ProxyOptions>,
        callback: Option<ErrorCallback>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let options = match per_call {
            Some(per_call) => self.options.merged_with(&per_call),
            None => self.options.clone(),
        };
        options.require_upstream()?;

        let mut ctx = ProxyContext::new(kind, req, self.web_outgoing.clone(), callback);
        let passes = match kind {
            PassKind::Web => &self.web_passes,
            PassKind::Ws => &self.ws_passes,
        };
        run_pipeline(passes, &mut ctx, &options, &self.hooks).await
    }

    fn pass_list_mut(&mut self, kind: PassKind) -> &mut Vec<Pass> {
        match kind {
            PassKind::Web => &mut self.web_passes,
            PassKind::Ws => &mut self.ws_passes,
        }
    }

    /// Splice `pass` in before the pass named `name` (the last match when
    /// the name is duplicated).
    pub fn before(&mut self, kind: PassKind, name: &str, pass: Pass) -> Result<(), ProxyError> {
        let list = self.pass_list_mut(kind);
        let idx = list
            .iter()
            .rposition(|p| p.name() == name)
            .ok_or_else(|| ProxyError::NoSuchPass(name.to_string()))?;
        list.insert(idx, pass);
        Ok(())
    }

    /// Splice `pass` in after the pass named `name`.
    pub fn after(&mut self, kind: PassKind, name: &str, pass: Pass) -> Result<(), ProxyError> {
        let list = self.pass_list_mut(kind);
        let idx = list
            .iter()
            .rposition(|p| p.name() == name)
            .ok_or_else(|| ProxyError::NoSuchPass(name.to_string()))?;
        list.insert(idx + 1, pass);
        Ok(())
    }

    /// Bind a listener and serve in a background task. Returns the bound
    /// address (useful with port 0). HTTPS when `ssl` is configured;
    /// upgrade requests route through the ws pipeline when `ws` is set.
    pub async fn listen(self: Arc<Self>, addr: SocketAddr) -> Result<SocketAddr, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let acceptor = match &self.options.ssl {
            Some(ssl) => Some(TlsAcceptor::from(Arc::new(server_tls_config(ssl)?))),
            None => None,
        };

        let server = self.clone();
        let handle = tokio::spawn(async move {
            server.accept_loop(listener, acceptor).await;
        });
        if let Ok(mut guard) = self.listener.lock() {
            *guard = Some(handle);
        }
        info!(
            "proxy listening on {}{}",
            local,
            if self.options.ssl.is_some() { " (tls)" } else { "" }
        );
        Ok(local)
    }

    /// Stop the listener started by [`listen`](Self::listen). In-flight
    /// transactions on already-accepted connections finish on their own.
    pub fn close(&self) {
        if let Ok(mut guard) = self.listener.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            };
            let server = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let _ = stream.set_nodelay(true);
                server.serve_accepted(stream, remote_addr, acceptor).await;
            });
        }
    }

    async fn serve_accepted(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        acceptor: Option<TlsAcceptor>,
    ) {
        let meta = ClientMeta {
            remote_addr: Some(remote_addr),
            secure: acceptor.is_some(),
        };
        match acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => self.serve_stream(tls_stream, meta).await,
                Err(e) => error!("TLS accept from {remote_addr} failed: {e}"),
            },
            None => self.serve_stream(stream, meta).await,
        }
    }

    async fn serve_stream<S>(self: Arc<Self>, stream: S, meta: ClientMeta)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server = self.clone();
        let service = service_fn(move |mut req: Request<Incoming>| {
            let server = server.clone();
            async move {
                req.extensions_mut().insert(meta);
                if server.options.ws && is_websocket_upgrade(req.headers()) {
                    server.ws(req, None).await
                } else {
                    server.web(req, None).await
                }
            }
        });

        let mut builder = hyper::server::conn::http1::Builder::new();
        builder.preserve_header_case(true);

        // idle clients are cut off at the socket, mirroring the upstream
        // side's proxy_timeout
        let result = match self.options.timeout_millis {
            Some(ms) => {
                let io = TokioIo::new(TimeoutIo::new(stream, Duration::from_millis(ms)));
                builder.serve_connection(io, service).with_upgrades().await
            }
            None => {
                builder
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
            }
        };
        if let Err(e) = result {
            debug!("client connection ended: {e}");
        }
    }
}

fn server_tls_config(ssl: &ListenerTls) -> Result<rustls::ServerConfig, ProxyError> {
    let certs = load_certs(&ssl.cert)?;
    let key = load_private_key(&ssl.key)?;
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Config(format!("failed to create TLS config: {e}")))
}
