//! The pass pipelines. A pass is a named step; returning
//! [`PassFlow::Respond`] halts the pipeline with a response for the
//! client, an error destroys the client connection. Third parties insert
//! their own passes by name through `ProxyServer::before`/`after`.

pub mod web_incoming;
pub mod web_outgoing;
pub mod ws_incoming;

use crate::common::{ClientMeta, ProxyBody};
use crate::config::ProxyOptions;
use crate::error::ProxyError;
use crate::events::Hooks;
use http::request::Parts as RequestParts;
use http::response::Parts as ResponseParts;
use http::{Request, Response};
use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type PassFuture<'a> = Pin<Box<dyn Future<Output = Result<PassFlow, ProxyError>> + Send + 'a>>;

/// Outcome of a single pass.
pub enum PassFlow {
    /// Hand over to the next pass in the list.
    Continue,
    /// Halt the pipeline; this response goes to the client.
    Respond(Response<ProxyBody>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Web,
    Ws,
}

/// Maps a proxy error to the response the client should receive, supplied
/// per call. When present it wins over the `error` hooks.
pub type ErrorCallback = Box<dyn FnOnce(&ProxyError, &RequestParts) -> Response<ProxyBody> + Send>;

/// Per-transaction state threaded through a pipeline. The request is owned
/// here until the stream pass consumes it.
pub struct ProxyContext {
    pub kind: PassKind,
    pub meta: ClientMeta,
    req: Option<Request<ProxyBody>>,
    pub(crate) deadline: Option<Duration>,
    pub(crate) callback: Option<ErrorCallback>,
    pub(crate) outgoing_passes: Arc<Vec<OutgoingPass>>,
}

impl ProxyContext {
    pub(crate) fn new(
        kind: PassKind,
        req: Request<ProxyBody>,
        outgoing_passes: Arc<Vec<OutgoingPass>>,
        callback: Option<ErrorCallback>,
    ) -> Self {
        let meta = req
            .extensions()
            .get::<ClientMeta>()
            .copied()
            .unwrap_or_default();
        Self {
            kind,
            meta,
            req: Some(req),
            deadline: None,
            callback,
            outgoing_passes,
        }
    }

    /// The in-flight client request. Fails once the stream pass has taken
    /// ownership; passes inserted after `stream` never see the request.
    pub fn request_mut(&mut self) -> Result<&mut Request<ProxyBody>, ProxyError> {
        self.req
            .as_mut()
            .ok_or_else(|| ProxyError::Http("request already consumed by the stream pass".to_string()))
    }

    pub(crate) fn take_request(&mut self) -> Result<Request<ProxyBody>, ProxyError> {
        self.req
            .take()
            .ok_or_else(|| ProxyError::Http("request already consumed by the stream pass".to_string()))
    }
}

type PassFn =
    dyn for<'a> Fn(&'a mut ProxyContext, &'a ProxyOptions, &'a Arc<Hooks>) -> PassFuture<'a>
        + Send
        + Sync;

/// A named step in the web or ws incoming pipeline.
pub struct Pass {
    name: Cow<'static, str>,
    run: Box<PassFn>,
}

impl Pass {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        run: impl for<'a> Fn(&'a mut ProxyContext, &'a ProxyOptions, &'a Arc<Hooks>) -> PassFuture<'a>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Run `passes` in order until one responds or fails.
pub(crate) async fn run_pipeline(
    passes: &[Pass],
    ctx: &mut ProxyContext,
    options: &ProxyOptions,
    hooks: &Arc<Hooks>,
) -> Result<Response<ProxyBody>, ProxyError> {
    for pass in passes {
        match (pass.run)(ctx, options, hooks).await? {
            PassFlow::Continue => {}
            PassFlow::Respond(res) => return Ok(res),
        }
    }
    Err(ProxyError::Http(
        "pass pipeline completed without producing a response".to_string(),
    ))
}

/// State for the web-outgoing passes: the upstream response head is
/// rewritten in place, then copied onto the client-facing head.
pub struct OutgoingContext<'a> {
    pub client_req: &'a RequestParts,
    pub upstream: &'a mut ResponseParts,
    pub res: &'a mut ResponseParts,
    pub options: &'a ProxyOptions,
}

/// A named synchronous step of the web-outgoing pipeline. Returning true
/// halts the remaining passes.
pub struct OutgoingPass {
    name: Cow<'static, str>,
    run: Box<dyn Fn(&mut OutgoingContext<'_>) -> bool + Send + Sync>,
}

impl OutgoingPass {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        run: impl Fn(&mut OutgoingContext<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub(crate) fn run_web_outgoing(passes: &[OutgoingPass], ctx: &mut OutgoingContext<'_>) {
    for pass in passes {
        if (pass.run)(ctx) {
            break;
        }
    }
}
