//! The web-incoming pipeline: `delete_length`, `timeout`, `x_headers` and
//! the `stream` pass that dispatches the upstream request and relays the
//! response.

use crate::common::{
    empty_body, full_body, setup_outgoing, BoxError, EndBody, OutgoingRequest, ProxyBody, Role,
    WatchBody,
};
use crate::config::ProxyOptions;
use crate::error::ProxyError;
use crate::events::Hooks;
use crate::io::{connect_upstream, handshake, AsyncStream, TimeoutIo};
use crate::passes::{
    run_web_outgoing, OutgoingContext, OutgoingPass, Pass, PassFlow, PassFuture, PassKind,
    ProxyContext,
};
use crate::server::Agent;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, LOCATION, TRANSFER_ENCODING};
use http::request::Parts as RequestParts;
use http::{HeaderMap, Method, Response};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// The ordered web-incoming pass list.
pub fn passes() -> Vec<Pass> {
    vec![
        Pass::new("delete_length", delete_length_entry),
        Pass::new("timeout", timeout_entry),
        x_headers_pass(),
        Pass::new("stream", stream_entry),
    ]
}

fn delete_length_entry<'a>(
    ctx: &'a mut ProxyContext,
    _options: &'a ProxyOptions,
    _hooks: &'a Arc<Hooks>,
) -> PassFuture<'a> {
    Box::pin(async move { delete_length(ctx) })
}

fn timeout_entry<'a>(
    ctx: &'a mut ProxyContext,
    options: &'a ProxyOptions,
    _hooks: &'a Arc<Hooks>,
) -> PassFuture<'a> {
    Box::pin(async move { timeout(ctx, options) })
}

fn x_headers_entry<'a>(
    ctx: &'a mut ProxyContext,
    options: &'a ProxyOptions,
    _hooks: &'a Arc<Hooks>,
) -> PassFuture<'a> {
    Box::pin(async move { x_headers(ctx, options) })
}

fn stream_entry<'a>(
    ctx: &'a mut ProxyContext,
    options: &'a ProxyOptions,
    hooks: &'a Arc<Hooks>,
) -> PassFuture<'a> {
    Box::pin(stream(ctx, options, hooks))
}

/// DELETE and OPTIONS requests without a body get an explicit
/// `Content-Length: 0` so upstream parsers do not wait for a chunked body.
fn delete_length(ctx: &mut ProxyContext) -> Result<PassFlow, ProxyError> {
    let req = ctx.request_mut()?;
    if (req.method() == Method::DELETE || req.method() == Method::OPTIONS)
        && !req.headers().contains_key(CONTENT_LENGTH)
    {
        req.headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        req.headers_mut().remove(TRANSFER_ENCODING);
    }
    Ok(PassFlow::Continue)
}

/// Arm the incoming exchange deadline; the stream pass enforces it.
fn timeout(ctx: &mut ProxyContext, options: &ProxyOptions) -> Result<PassFlow, ProxyError> {
    if let Some(ms) = options.timeout_millis {
        ctx.deadline = Some(Duration::from_millis(ms));
    }
    Ok(PassFlow::Continue)
}

/// Shared by the web and ws pipelines; the ws variant reports `ws`/`wss`
/// in `X-Forwarded-Proto` and does not touch `X-Forwarded-Host`.
pub(crate) fn x_headers_pass() -> Pass {
    Pass::new("x_headers", x_headers_entry)
}

fn x_headers(ctx: &mut ProxyContext, options: &ProxyOptions) -> Result<PassFlow, ProxyError> {
    if !options.xfwd {
        return Ok(PassFlow::Continue);
    }
    let kind = ctx.kind;
    let meta = ctx.meta;
    let req = ctx.request_mut()?;
    let headers = req.headers_mut();

    let host_port = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.rsplit_once(':'))
        .and_then(|(_, p)| p.parse::<u16>().ok());
    let port_value = match host_port {
        Some(p) => p.to_string(),
        None => if meta.secure { "443" } else { "80" }.to_string(),
    };
    let proto_value = match (kind, meta.secure) {
        (PassKind::Web, true) => "https",
        (PassKind::Web, false) => "http",
        (PassKind::Ws, true) => "wss",
        (PassKind::Ws, false) => "ws",
    };

    if let Some(addr) = meta.remote_addr {
        append_header(headers, "x-forwarded-for", &addr.ip().to_string())?;
    }
    append_header(headers, "x-forwarded-port", &port_value)?;
    append_header(headers, "x-forwarded-proto", proto_value)?;

    if kind == PassKind::Web && !headers.contains_key("x-forwarded-host") {
        let host = headers
            .get(HOST)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(""));
        headers.insert(HeaderName::from_static("x-forwarded-host"), host);
    }
    Ok(PassFlow::Continue)
}

/// Append `value` to an existing comma-separated header chain.
fn append_header(
    headers: &mut HeaderMap,
    name: &'static str,
    value: &str,
) -> Result<(), ProxyError> {
    let name = HeaderName::from_static(name);
    let combined = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing},{value}"),
        _ => value.to_string(),
    };
    let value = HeaderValue::from_str(&combined)
        .map_err(|e| ProxyError::Http(format!("invalid forwarded header value: {e}")))?;
    headers.insert(name, value);
    Ok(())
}

struct StreamError {
    err: ProxyError,
    url: Option<String>,
    client_gone: bool,
}

impl StreamError {
    fn config(err: ProxyError) -> Self {
        Self {
            err,
            url: None,
            client_gone: false,
        }
    }
}

/// Dispatch the upstream request(s) and produce the client response.
async fn stream(
    ctx: &mut ProxyContext,
    options: &ProxyOptions,
    hooks: &Arc<Hooks>,
) -> Result<PassFlow, ProxyError> {
    let req = ctx.take_request()?;
    let (parts, body) = req.into_parts();

    let announced = options
        .target
        .as_ref()
        .or(options.forward.as_ref())
        .map(|t| t.url_string())
        .unwrap_or_default();
    hooks.emit_start(&parts, &announced);

    let deadline = ctx.deadline;
    let callback = ctx.callback.take();
    let outgoing_passes = ctx.outgoing_passes.clone();

    let exchange = stream_exchange(&parts, body, options, hooks, outgoing_passes);
    let result = match deadline {
        Some(d) => match tokio::time::timeout(d, exchange).await {
            Ok(result) => result,
            Err(_) => Err(StreamError {
                err: ProxyError::Timeout(d),
                url: Some(announced.clone()),
                client_gone: false,
            }),
        },
        None => exchange.await,
    };

    match result {
        Ok(res) => Ok(PassFlow::Respond(res)),
        Err(failure) => {
            if failure.client_gone && failure.err.is_connection_reset() {
                // the client is gone too; swallow the reset
                hooks.emit_econnreset(&failure.err, &parts, failure.url.as_deref().unwrap_or(""));
                return Err(failure.err);
            }
            if let Some(cb) = callback {
                return Ok(PassFlow::Respond(cb(&failure.err, &parts)));
            }
            hooks.emit_error(&failure.err, &parts, failure.url.as_deref());
            Err(failure.err)
        }
    }
}

async fn stream_exchange(
    parts: &RequestParts,
    body: ProxyBody,
    options: &ProxyOptions,
    hooks: &Arc<Hooks>,
    outgoing_passes: Arc<Vec<OutgoingPass>>,
) -> Result<Response<ProxyBody>, StreamError> {
    let mut client_body = body;

    if options.forward.is_some() {
        let forward = setup_outgoing(options, parts, Role::Forward).map_err(StreamError::config)?;
        let forward_url = forward.url_string();

        // the same bytes may be needed by both upstreams
        let forward_body: ProxyBody = if let Some(buf) = &options.buffer {
            full_body(buf.clone())
        } else if options.target.is_some() {
            let collected = collect_bytes(&mut client_body).await?;
            client_body = full_body(collected.clone());
            full_body(collected)
        } else {
            std::mem::replace(&mut client_body, empty_body())
        };

        let hooks = hooks.clone();
        let req_parts = parts.clone();
        let agent = options.agent.clone();
        let proxy_timeout = options.proxy_timeout_millis;
        let preserve_case = options.preserve_header_key_case;
        tokio::spawn(async move {
            match dispatch_request(&forward, forward_body, agent.as_ref(), proxy_timeout, preserve_case)
                .await
            {
                Ok(_) => debug!("forward request to {forward_url} dispatched"),
                Err(e) => hooks.emit_error(&e, &req_parts, Some(&forward_url)),
            }
        });

        if options.target.is_none() {
            // forward-only: the client response is closed right away
            return Ok(Response::new(empty_body()));
        }
    }

    let mut outgoing = setup_outgoing(options, parts, Role::Target).map_err(StreamError::config)?;
    // an Expect-ing request has already committed to its exchange; no
    // last-chance mutation window for it
    if !outgoing.headers.contains_key(http::header::EXPECT) {
        hooks.emit_proxy_req(&mut outgoing, parts);
    }
    let url = outgoing.url_string();

    let client_gone = Arc::new(AtomicBool::new(false));
    let response = if options.follow_redirects {
        let replay = match &options.buffer {
            Some(buf) => buf.clone(),
            None => collect_bytes(&mut client_body).await?,
        };
        follow_redirects(outgoing, replay, options).await
    } else {
        let send_body: ProxyBody = match &options.buffer {
            Some(buf) => full_body(buf.clone()),
            None => WatchBody::new(client_body, client_gone.clone()).boxed(),
        };
        dispatch_request(
            &outgoing,
            send_body,
            options.agent.as_ref(),
            options.proxy_timeout_millis,
            options.preserve_header_key_case,
        )
        .await
    };
    let response = response.map_err(|err| StreamError {
        client_gone: client_gone.load(Ordering::SeqCst),
        url: Some(url.clone()),
        err,
    })?;

    let (mut up_parts, up_body) = response.into_parts();
    hooks.emit_proxy_res(&mut up_parts, parts);
    debug!(
        "{} {} -> {} {}",
        parts.method, parts.uri, url, up_parts.status
    );

    if options.self_handle_response {
        // the caller takes the raw upstream response from here
        return Ok(Response::from_parts(
            up_parts,
            up_body.map_err(|e| Box::new(e) as BoxError).boxed(),
        ));
    }

    let (mut res_parts, ()) = Response::new(()).into_parts();
    {
        let mut octx = OutgoingContext {
            client_req: parts,
            upstream: &mut up_parts,
            res: &mut res_parts,
            options,
        };
        run_web_outgoing(&outgoing_passes, &mut octx);
    }

    let end_hooks = hooks.clone();
    let end_req = parts.clone();
    let end_res = up_parts.clone();
    let relayed = EndBody::new(
        up_body.map_err(|e| Box::new(e) as BoxError),
        move || end_hooks.emit_end(&end_req, &end_res),
    );
    Ok(Response::from_parts(res_parts, relayed.boxed()))
}

async fn collect_bytes(body: &mut ProxyBody) -> Result<Bytes, StreamError> {
    let collected = std::mem::replace(body, empty_body())
        .collect()
        .await
        .map_err(|e| StreamError::config(ProxyError::Http(format!("failed to read request body: {e}"))))?;
    Ok(collected.to_bytes())
}

/// Issue a single upstream request, through the pooled agent when one is
/// configured, otherwise over a dedicated connection with the optional
/// upstream idle timeout.
pub(crate) async fn dispatch_request(
    outgoing: &OutgoingRequest,
    body: ProxyBody,
    agent: Option<&Agent>,
    proxy_timeout_millis: Option<u64>,
    preserve_header_case: bool,
) -> Result<Response<Incoming>, ProxyError> {
    if let Some(agent) = agent {
        let req = outgoing.clone().into_request(body)?;
        return agent.request(req).await;
    }
    let stream = connect_upstream(outgoing).await?;
    match proxy_timeout_millis {
        Some(ms) => {
            send_over(
                TimeoutIo::new(stream, Duration::from_millis(ms)),
                outgoing,
                body,
                preserve_header_case,
            )
            .await
        }
        None => send_over(stream, outgoing, body, preserve_header_case).await,
    }
}

async fn send_over<S: AsyncStream + 'static>(
    stream: S,
    outgoing: &OutgoingRequest,
    body: ProxyBody,
    preserve_header_case: bool,
) -> Result<Response<Incoming>, ProxyError> {
    let (mut send, _conn) = handshake(stream, preserve_header_case).await?;
    let req = outgoing.clone().into_request(body)?;
    send.ready().await?;
    Ok(send.send_request(req).await?)
}

/// In-crate redirect following over the same dial path. 301/302/303 demote
/// the method to GET; the replayed body is re-sent for 307/308.
async fn follow_redirects(
    mut outgoing: OutgoingRequest,
    replay: Bytes,
    options: &ProxyOptions,
) -> Result<Response<Incoming>, ProxyError> {
    const MAX_REDIRECTS: usize = 10;
    let mut demoted = false;

    for _ in 0..=MAX_REDIRECTS {
        let body = if demoted {
            empty_body()
        } else {
            full_body(replay.clone())
        };
        let response = dispatch_request(
            &outgoing,
            body,
            options.agent.as_ref(),
            options.proxy_timeout_millis,
            options.preserve_header_key_case,
        )
        .await?;

        let status = response.status().as_u16();
        if !matches!(status, 301 | 302 | 303 | 307 | 308) {
            return Ok(response);
        }
        let Some(location) = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
        else {
            return Ok(response);
        };
        let Ok(base) = Url::parse(&outgoing.url_string()) else {
            return Ok(response);
        };
        let Ok(next) = base.join(location) else {
            return Ok(response);
        };
        let Some(protocol) = crate::config::Protocol::from_scheme(next.scheme()) else {
            return Ok(response);
        };
        let Some(host) = next.host_str() else {
            return Ok(response);
        };

        outgoing.protocol = protocol;
        outgoing.host = host.to_string();
        outgoing.port = next.port().unwrap_or_else(|| protocol.default_port());
        let mut path = next.path().to_string();
        if let Some(q) = next.query() {
            path.push('?');
            path.push_str(q);
        }
        outgoing.path = path;
        let host_header = outgoing.host_header();
        outgoing.headers.insert(
            HOST,
            HeaderValue::from_str(&host_header)
                .map_err(|e| ProxyError::Http(e.to_string()))?,
        );

        if status == 303 || (matches!(status, 301 | 302) && outgoing.method != Method::GET && outgoing.method != Method::HEAD)
        {
            outgoing.method = Method::GET;
            outgoing.headers.remove(CONTENT_LENGTH);
            outgoing.headers.remove(TRANSFER_ENCODING);
            demoted = true;
        }
        debug!("following redirect {status} to {}", outgoing.url_string());
    }
    Err(ProxyError::Http("too many redirects".to_string()))
}
