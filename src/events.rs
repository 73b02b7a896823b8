//! Typed hook table for observing and mutating in-flight proxy
//! transactions. Each event owns a slice of listeners; registration
//! happens on the [`crate::server::ProxyServer`] before serving starts,
//! emission from any task holding the shared table.

use crate::common::OutgoingRequest;
use crate::error::ProxyError;
use http::request::Parts as RequestParts;
use http::response::Parts as ResponseParts;
use std::sync::RwLock;

type Listeners<F: ?Sized> = RwLock<Vec<Box<F>>>;

#[derive(Default)]
pub struct Hooks {
    start: Listeners<dyn Fn(&RequestParts, &str) + Send + Sync>,
    proxy_req: Listeners<dyn Fn(&mut OutgoingRequest, &RequestParts) + Send + Sync>,
    proxy_req_ws: Listeners<dyn Fn(&mut OutgoingRequest, &RequestParts) + Send + Sync>,
    proxy_res: Listeners<dyn Fn(&mut ResponseParts, &RequestParts) + Send + Sync>,
    open: Listeners<dyn Fn() + Send + Sync>,
    close: Listeners<dyn Fn(&ResponseParts) + Send + Sync>,
    end: Listeners<dyn Fn(&RequestParts, &ResponseParts) + Send + Sync>,
    error: Listeners<dyn Fn(&ProxyError, &RequestParts, Option<&str>) + Send + Sync>,
    econnreset: Listeners<dyn Fn(&ProxyError, &RequestParts, &str) + Send + Sync>,
}

impl Hooks {
    pub fn on_start(&self, f: impl Fn(&RequestParts, &str) + Send + Sync + 'static) {
        if let Ok(mut list) = self.start.write() {
            list.push(Box::new(f));
        }
    }

    pub fn on_proxy_req(
        &self,
        f: impl Fn(&mut OutgoingRequest, &RequestParts) + Send + Sync + 'static,
    ) {
        if let Ok(mut list) = self.proxy_req.write() {
            list.push(Box::new(f));
        }
    }

    pub fn on_proxy_req_ws(
        &self,
        f: impl Fn(&mut OutgoingRequest, &RequestParts) + Send + Sync + 'static,
    ) {
        if let Ok(mut list) = self.proxy_req_ws.write() {
            list.push(Box::new(f));
        }
    }

    pub fn on_proxy_res(
        &self,
        f: impl Fn(&mut ResponseParts, &RequestParts) + Send + Sync + 'static,
    ) {
        if let Ok(mut list) = self.proxy_res.write() {
            list.push(Box::new(f));
        }
    }

    pub fn on_open(&self, f: impl Fn() + Send + Sync + 'static) {
        if let Ok(mut list) = self.open.write() {
            list.push(Box::new(f));
        }
    }

    pub fn on_close(&self, f: impl Fn(&ResponseParts) + Send + Sync + 'static) {
        if let Ok(mut list) = self.close.write() {
            list.push(Box::new(f));
        }
    }

    pub fn on_end(&self, f: impl Fn(&RequestParts, &ResponseParts) + Send + Sync + 'static) {
        if let Ok(mut list) = self.end.write() {
            list.push(Box::new(f));
        }
    }

    pub fn on_error(
        &self,
        f: impl Fn(&ProxyError, &RequestParts, Option<&str>) + Send + Sync + 'static,
    ) {
        if let Ok(mut list) = self.error.write() {
            list.push(Box::new(f));
        }
    }

    pub fn on_econnreset(
        &self,
        f: impl Fn(&ProxyError, &RequestParts, &str) + Send + Sync + 'static,
    ) {
        if let Ok(mut list) = self.econnreset.write() {
            list.push(Box::new(f));
        }
    }

    pub(crate) fn emit_start(&self, req: &RequestParts, target: &str) {
        if let Ok(list) = self.start.read() {
            for f in list.iter() {
                f(req, target);
            }
        }
    }

    pub(crate) fn emit_proxy_req(&self, outgoing: &mut OutgoingRequest, req: &RequestParts) {
        if let Ok(list) = self.proxy_req.read() {
            for f in list.iter() {
                f(outgoing, req);
            }
        }
    }

    pub(crate) fn emit_proxy_req_ws(&self, outgoing: &mut OutgoingRequest, req: &RequestParts) {
        if let Ok(list) = self.proxy_req_ws.read() {
            for f in list.iter() {
                f(outgoing, req);
            }
        }
    }

    pub(crate) fn emit_proxy_res(&self, res: &mut ResponseParts, req: &RequestParts) {
        if let Ok(list) = self.proxy_res.read() {
            for f in list.iter() {
                f(res, req);
            }
        }
    }

    pub(crate) fn emit_open(&self) {
        if let Ok(list) = self.open.read() {
            for f in list.iter() {
                f();
            }
        }
    }

    pub(crate) fn emit_close(&self, upstream: &ResponseParts) {
        if let Ok(list) = self.close.read() {
            for f in list.iter() {
                f(upstream);
            }
        }
    }

    pub(crate) fn emit_end(&self, req: &RequestParts, upstream: &ResponseParts) {
        if let Ok(list) = self.end.read() {
            for f in list.iter() {
                f(req, upstream);
            }
        }
    }

    /// Errors must be handled. With no listener registered this panics, the
    /// crate's rendition of the reference "rethrow when only the default
    /// listener is attached" policy.
    pub(crate) fn emit_error(&self, err: &ProxyError, req: &RequestParts, url: Option<&str>) {
        let Ok(list) = self.error.read() else {
            return;
        };
        if list.is_empty() {
            panic!("unhandled proxy error (register an error listener or pass a callback): {err}");
        }
        for f in list.iter() {
            f(err, req, url);
        }
    }

    pub(crate) fn emit_econnreset(&self, err: &ProxyError, req: &RequestParts, url: &str) {
        if let Ok(list) = self.econnreset.read() {
            for f in list.iter() {
                f(err, req, url);
            }
        }
    }
}
