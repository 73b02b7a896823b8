use crate::config::{Protocol, ProxyOptions, RewriteRules, Target};
use crate::error::ProxyError;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, HOST, UPGRADE};
use http::request::Parts as RequestParts;
use http::{HeaderMap, Method, Request, Uri};
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use pin_project_lite::pin_project;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Unified body type flowing through the pipelines in both directions.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never: Infallible| -> BoxError { match never {} })
        .boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| -> BoxError { match never {} })
        .boxed()
}

/// Box any compatible request body into a [`ProxyBody`].
pub fn boxed_request<B>(req: Request<B>) -> Request<ProxyBody>
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    req.map(|b| b.map_err(Into::into).boxed())
}

/// Per-connection details the listener knows but the request does not
/// carry; inserted into request extensions before dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientMeta {
    pub remote_addr: Option<SocketAddr>,
    /// The client connected over TLS.
    pub secure: bool,
}

/// True when `port` must appear in a Host header for `protocol`.
pub fn requires_port(port: u16, protocol: Protocol) -> bool {
    port != protocol.default_port()
}

/// True when a `Connection` header value carries an `upgrade` token,
/// comma-delimited ("keep-alive, Upgrade" matches, "not upgrade" does not).
pub fn has_upgrade_token(connection: &str) -> bool {
    connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Join two path segments with a single `/`, collapsing duplicate slashes
/// while keeping the scheme's `//` intact. The query string of the last
/// segment is split off first and re-attached untouched, so this function
/// edits paths, never queries.
pub fn url_join(target_path: &str, client_path: &str) -> String {
    let mut parts = client_path.splitn(2, '?');
    let client = parts.next().unwrap_or("");
    let query = parts.next();

    let joined = [target_path, client]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/");

    let mut collapsed = String::with_capacity(joined.len());
    let mut prev_slash = false;
    for c in joined.chars() {
        if c == '/' {
            if !prev_slash {
                collapsed.push(c);
            }
            prev_slash = true;
        } else {
            collapsed.push(c);
            prev_slash = false;
        }
    }
    let collapsed = collapsed
        .replacen("http:/", "http://", 1)
        .replacen("https:/", "https://", 1);

    match query {
        Some(q) => format!("{collapsed}?{q}"),
        None => collapsed,
    }
}

/// Rewrite a `;<property>=<value>` clause of a `Set-Cookie` header value
/// according to `rules`. An empty replacement removes the clause entirely;
/// an unmatched value leaves the header untouched.
pub fn rewrite_cookie_property(header: &str, rules: &RewriteRules, property: &str) -> String {
    let bytes = header.as_bytes();
    let mut i = 0;
    while let Some(off) = header[i..].find(';') {
        let semi = i + off;
        let mut j = semi + 1;
        while j < bytes.len() && (bytes[j] as char).is_ascii_whitespace() {
            j += 1;
        }
        let name_end = j + property.len();
        if name_end < bytes.len()
            && bytes[j..name_end].eq_ignore_ascii_case(property.as_bytes())
            && bytes[name_end] == b'='
        {
            let value_start = name_end + 1;
            let value_end = header[value_start..]
                .find(';')
                .map(|o| value_start + o)
                .unwrap_or(header.len());
            let value = &header[value_start..value_end];
            return match rules.lookup(value) {
                Some("") => format!("{}{}", &header[..semi], &header[value_end..]),
                Some(new) => format!("{}{}{}", &header[..value_start], new, &header[value_end..]),
                None => header.to_string(),
            };
        }
        i = semi + 1;
    }
    header.to_string()
}

/// Which upstream an outgoing descriptor is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Target,
    Forward,
}

/// Upstream request descriptor produced by [`setup_outgoing`]. Everything
/// the dialer and the HTTP client need, independent of how the connection
/// is made.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// Path plus query, already joined with the target path.
    pub path: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub socket_path: Option<PathBuf>,
    pub local_address: Option<IpAddr>,
    /// Verify the upstream certificate when dialing TLS.
    pub reject_unauthorized: bool,
    pub tls: crate::config::TargetTls,
    /// Sent through the pooled agent rather than a dedicated connection.
    pub pooled: bool,
}

impl OutgoingRequest {
    pub fn host_header(&self) -> String {
        if requires_port(self.port, self.protocol) {
            format!("{}:{}", self.host, self.port)
        } else {
            self.host.clone()
        }
    }

    /// Absolute URL form, used for events and error reporting.
    pub fn url_string(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol.as_str(),
            self.host,
            self.port,
            self.path
        )
    }

    fn request_uri(&self) -> Result<Uri, ProxyError> {
        let s = if self.path.starts_with("http://") || self.path.starts_with("https://") {
            // toProxy forwards the absolute request-target verbatim
            self.path.clone()
        } else if self.pooled {
            let scheme = if self.protocol.is_secure() { "https" } else { "http" };
            format!("{}://{}:{}{}", scheme, self.host, self.port, leading_slash(&self.path))
        } else {
            leading_slash(&self.path).into_owned()
        };
        s.parse::<Uri>().map_err(|e| ProxyError::Uri(e.to_string()))
    }

    /// Materialize the descriptor into an HTTP request carrying `body`.
    pub(crate) fn into_request(self, body: ProxyBody) -> Result<Request<ProxyBody>, ProxyError> {
        let uri = self.request_uri()?;
        let host = self.host_header();
        let mut req = Request::new(body);
        *req.method_mut() = self.method;
        *req.uri_mut() = uri;
        *req.headers_mut() = self.headers;
        if !req.headers().contains_key(HOST) {
            req.headers_mut().insert(
                HOST,
                HeaderValue::from_str(&host).map_err(|e| ProxyError::Http(e.to_string()))?,
            );
        }
        Ok(req)
    }
}

fn leading_slash(path: &str) -> std::borrow::Cow<'_, str> {
    if path.is_empty() {
        std::borrow::Cow::Borrowed("/")
    } else if path.starts_with('/') {
        std::borrow::Cow::Borrowed(path)
    } else {
        std::borrow::Cow::Owned(format!("/{path}"))
    }
}

/// Build the upstream request descriptor from configuration and the client
/// request head.
///
/// The contract, in order: port defaulting by scheme; connection fields
/// copied from the target; method override; client headers merged with
/// static headers and `auth`; listener CA propagation; certificate
/// verification from `secure`; `Connection: close` when no agent is pooled
/// (unless the client is upgrading); local address; path composition via
/// [`url_join`]; Host rewrite for `change_origin`.
pub fn setup_outgoing(
    options: &ProxyOptions,
    req: &RequestParts,
    role: Role,
) -> Result<OutgoingRequest, ProxyError> {
    let target: &Target = match role {
        Role::Target => options.target.as_ref(),
        Role::Forward => options.forward.as_ref(),
    }
    .ok_or_else(|| ProxyError::Config(format!("no {role:?} upstream configured")))?;

    let port = target.port_or_default();

    let method = match &options.method {
        Some(m) => Method::from_bytes(m.as_bytes())
            .map_err(|e| ProxyError::Http(format!("invalid method override: {e}")))?,
        None => req.method.clone(),
    };

    let mut headers = req.headers.clone();
    if let Some(extra) = &options.headers {
        for (name, value) in extra {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ProxyError::Http(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ProxyError::Http(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }
    }
    if let Some(auth) = &options.auth {
        let encoded = general_purpose::STANDARD.encode(auth.as_bytes());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}"))
                .map_err(|e| ProxyError::Http(e.to_string()))?,
        );
    }

    let mut tls = target.tls.clone();
    if tls.ca.is_none() {
        if let Some(ssl) = &options.ssl {
            tls.ca = ssl.ca.clone();
        }
    }

    let pooled = options.agent.is_some();
    if !pooled {
        let upgrading = headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(has_upgrade_token)
            .unwrap_or(false);
        if !upgrading {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }
    }

    let target_path = if options.prepend_path() && !target.path.is_empty() {
        target.path.as_str()
    } else {
        ""
    };
    let absolute;
    let mut client_path: &str = if options.to_proxy {
        absolute = req.uri.to_string();
        &absolute
    } else {
        req.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("")
    };
    if options.ignore_path {
        client_path = "";
    }
    let path = url_join(target_path, client_path);

    if options.change_origin {
        let host = if requires_port(port, target.protocol) {
            format!("{}:{}", target.host, port)
        } else {
            target.host.clone()
        };
        headers.insert(
            HOST,
            HeaderValue::from_str(&host).map_err(|e| ProxyError::Http(e.to_string()))?,
        );
    }

    Ok(OutgoingRequest {
        protocol: target.protocol,
        host: target.host.clone(),
        port,
        path,
        method,
        headers,
        socket_path: target.socket_path.clone(),
        local_address: options.local_address,
        reject_unauthorized: options.secure(),
        tls,
        pooled,
    })
}

pin_project! {
    /// Body adapter that runs a callback exactly once, after the wrapped
    /// body has been fully delivered. An erroring body never completes, so
    /// the callback is dropped instead.
    pub struct EndBody<B, F>
    where
        F: FnOnce(),
    {
        #[pin]
        inner: B,
        on_end: Option<F>,
    }
}

impl<B, F: FnOnce()> EndBody<B, F> {
    pub fn new(inner: B, on_end: F) -> Self {
        Self {
            inner,
            on_end: Some(on_end),
        }
    }
}

impl<B, F> Body for EndBody<B, F>
where
    B: Body<Data = Bytes>,
    F: FnOnce(),
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        let this = self.project();
        match this.inner.poll_frame(cx) {
            Poll::Ready(None) => {
                if let Some(on_end) = this.on_end.take() {
                    on_end();
                }
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.on_end.take();
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pin_project! {
    /// Body adapter flagging when the wrapped (client) body failed, so a
    /// later upstream reset can be told apart from a client abort.
    pub struct WatchBody<B> {
        #[pin]
        inner: B,
        gone: Arc<AtomicBool>,
    }
}

impl<B> WatchBody<B> {
    pub fn new(inner: B, gone: Arc<AtomicBool>) -> Self {
        Self { inner, gone }
    }
}

impl<B> Body for WatchBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        let this = self.project();
        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Err(e))) => {
                this.gone.store(true, Ordering::SeqCst);
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
