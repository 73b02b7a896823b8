//! The ws-incoming pipeline: `check_method_and_header`, `x_headers` and
//! the `stream` pass that performs the upgrade splice.

use crate::common::{empty_body, setup_outgoing, BoxError, ProxyBody, Role};
use crate::config::ProxyOptions;
use crate::error::ProxyError;
use crate::events::Hooks;
use crate::io::{connect_upstream, handshake, BoxedStream, TimeoutIo};
use crate::passes::web_incoming::x_headers_pass;
use crate::passes::{Pass, PassFlow, PassFuture, ProxyContext};
use http::header::UPGRADE;
use http::request::Parts as RequestParts;
use http::{Method, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use log::{debug, error};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::copy_bidirectional;

/// The ordered ws-incoming pass list.
pub fn passes() -> Vec<Pass> {
    vec![
        Pass::new("check_method_and_header", check_method_and_header_entry),
        x_headers_pass(),
        Pass::new("stream", stream_entry),
    ]
}

fn check_method_and_header_entry<'a>(
    ctx: &'a mut ProxyContext,
    _options: &'a ProxyOptions,
    _hooks: &'a Arc<Hooks>,
) -> PassFuture<'a> {
    Box::pin(async move { check_method_and_header(ctx) })
}

fn stream_entry<'a>(
    ctx: &'a mut ProxyContext,
    options: &'a ProxyOptions,
    hooks: &'a Arc<Hooks>,
) -> PassFuture<'a> {
    Box::pin(stream(ctx, options, hooks))
}

/// The single gatekeeper for malformed upgrades: anything that is not a
/// `GET` with `Upgrade: websocket` destroys the client socket, silently.
fn check_method_and_header(ctx: &mut ProxyContext) -> Result<PassFlow, ProxyError> {
    let req = ctx.request_mut()?;
    if req.method() != Method::GET {
        return Err(ProxyError::MalformedUpgrade);
    }
    let websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase() == "websocket")
        .unwrap_or(false);
    if !websocket {
        return Err(ProxyError::MalformedUpgrade);
    }
    Ok(PassFlow::Continue)
}

async fn stream(
    ctx: &mut ProxyContext,
    options: &ProxyOptions,
    hooks: &Arc<Hooks>,
) -> Result<PassFlow, ProxyError> {
    let mut req = ctx.take_request()?;
    let callback = ctx.callback.take();
    let client_upgrade = hyper::upgrade::on(&mut req);
    let (parts, _body) = req.into_parts();

    match ws_exchange(&parts, client_upgrade, options, hooks).await {
        Ok(res) => Ok(PassFlow::Respond(res)),
        Err((err, url)) => {
            if let Some(cb) = callback {
                return Ok(PassFlow::Respond(cb(&err, &parts)));
            }
            hooks.emit_error(&err, &parts, url.as_deref());
            // the client socket is closed by the failing connection
            Err(err)
        }
    }
}

async fn ws_exchange(
    parts: &RequestParts,
    client_upgrade: OnUpgrade,
    options: &ProxyOptions,
    hooks: &Arc<Hooks>,
) -> Result<Response<ProxyBody>, (ProxyError, Option<String>)> {
    let mut outgoing =
        setup_outgoing(options, parts, Role::Target).map_err(|e| (e, None))?;
    hooks.emit_proxy_req_ws(&mut outgoing, parts);
    let url = outgoing.url_string();

    let stream = connect_upstream(&outgoing)
        .await
        .map_err(|e| (e, Some(url.clone())))?;
    let stream: BoxedStream = match options.proxy_timeout_millis {
        Some(ms) => Box::new(TimeoutIo::new(stream, Duration::from_millis(ms))),
        None => stream,
    };

    let (mut send, _conn) = handshake(stream, options.preserve_header_key_case)
        .await
        .map_err(|e| (e, Some(url.clone())))?;
    let req = outgoing
        .clone()
        .into_request(empty_body())
        .map_err(|e| (e, Some(url.clone())))?;
    send.ready()
        .await
        .map_err(|e| (ProxyError::from(e), Some(url.clone())))?;
    let mut response = send
        .send_request(req)
        .await
        .map_err(|e| (ProxyError::from(e), Some(url.clone())))?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        // the upstream answered the upgrade with a real response; its
        // status line and headers reach the client before any body bytes
        debug!("upstream {url} refused the upgrade with {}", response.status());
        return Ok(response.map(|b| b.map_err(|e| Box::new(e) as BoxError).boxed()));
    }

    let upstream_upgrade = hyper::upgrade::on(&mut response);
    let (up_parts, _body) = response.into_parts();

    let hooks = hooks.clone();
    let close_parts = up_parts.clone();
    tokio::spawn(async move {
        match (client_upgrade.await, upstream_upgrade.await) {
            (Ok(client), Ok(upstream)) => {
                hooks.emit_open();
                let mut client_io = TokioIo::new(client);
                let mut upstream_io = TokioIo::new(upstream);
                // either side failing ends the other cleanly
                if let Err(e) = copy_bidirectional(&mut client_io, &mut upstream_io).await {
                    debug!("websocket splice ended with error: {e}");
                }
                hooks.emit_close(&close_parts);
            }
            (Err(e), _) => error!("client websocket upgrade failed: {e}"),
            (_, Err(e)) => error!("upstream websocket upgrade failed: {e}"),
        }
    });

    Ok(Response::from_parts(up_parts, empty_body()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::PassKind;
    use http::Request;

    fn ws_ctx(req: Request<ProxyBody>) -> ProxyContext {
        ProxyContext::new(PassKind::Ws, req, Arc::new(Vec::new()), None)
    }

    #[test]
    fn rejects_non_get_methods() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/sock")
            .header(UPGRADE, "websocket")
            .body(empty_body())
            .unwrap();
        let mut ctx = ws_ctx(req);
        assert!(matches!(
            check_method_and_header(&mut ctx),
            Err(ProxyError::MalformedUpgrade)
        ));
    }

    #[test]
    fn rejects_missing_or_wrong_upgrade_header() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/sock")
            .body(empty_body())
            .unwrap();
        let mut ctx = ws_ctx(req);
        assert!(matches!(
            check_method_and_header(&mut ctx),
            Err(ProxyError::MalformedUpgrade)
        ));

        let req = Request::builder()
            .method(Method::GET)
            .uri("/sock")
            .header(UPGRADE, "h2c")
            .body(empty_body())
            .unwrap();
        let mut ctx = ws_ctx(req);
        assert!(matches!(
            check_method_and_header(&mut ctx),
            Err(ProxyError::MalformedUpgrade)
        ));
    }

    #[test]
    fn accepts_websocket_upgrade_case_insensitively() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/sock")
            .header(UPGRADE, "WebSocket")
            .body(empty_body())
            .unwrap();
        let mut ctx = ws_ctx(req);
        assert!(matches!(
            check_method_and_header(&mut ctx),
            Ok(PassFlow::Continue)
        ));
    }
}
