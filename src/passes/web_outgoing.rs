//! The web-outgoing pipeline, run on the upstream response head before the
//! client sees it: `remove_chunked`, `set_connection`,
//! `set_redirect_host_rewrite`, `write_headers`, `write_status_code`.

use crate::common::rewrite_cookie_property;
use crate::passes::{OutgoingContext, OutgoingPass};
use http::header::{HeaderValue, CONNECTION, HOST, LOCATION, SET_COOKIE, TRANSFER_ENCODING};
use http::Version;
use url::Url;

/// The ordered web-outgoing pass list.
pub fn passes() -> Vec<OutgoingPass> {
    vec![
        OutgoingPass::new("remove_chunked", remove_chunked),
        OutgoingPass::new("set_connection", set_connection),
        OutgoingPass::new("set_redirect_host_rewrite", set_redirect_host_rewrite),
        OutgoingPass::new("write_headers", write_headers),
        OutgoingPass::new("write_status_code", write_status_code),
    ]
}

/// HTTP/1.0 clients cannot consume chunked transfer coding.
fn remove_chunked(ctx: &mut OutgoingContext<'_>) -> bool {
    if ctx.client_req.version == Version::HTTP_10 {
        ctx.upstream.headers.remove(TRANSFER_ENCODING);
    }
    false
}

fn set_connection(ctx: &mut OutgoingContext<'_>) -> bool {
    let client_connection = ctx.client_req.headers.get(CONNECTION).cloned();
    if ctx.client_req.version == Version::HTTP_10 {
        ctx.upstream.headers.insert(
            CONNECTION,
            client_connection.unwrap_or_else(|| HeaderValue::from_static("close")),
        );
    } else if ctx.client_req.version != Version::HTTP_2
        && ctx.client_req.version != Version::HTTP_3
        && !ctx.upstream.headers.contains_key(CONNECTION)
    {
        ctx.upstream.headers.insert(
            CONNECTION,
            client_connection.unwrap_or_else(|| HeaderValue::from_static("keep-alive")),
        );
    }
    false
}

/// Rewrite the `Location` header of an on-target redirect according to
/// `host_rewrite`/`auto_rewrite`/`protocol_rewrite`. Redirects pointing at
/// a different host are left alone.
fn set_redirect_host_rewrite(ctx: &mut OutgoingContext<'_>) -> bool {
    let options = ctx.options;
    if options.host_rewrite.is_none() && !options.auto_rewrite && options.protocol_rewrite.is_none()
    {
        return false;
    }
    let Some(target) = &options.target else {
        return false;
    };
    if !matches!(ctx.upstream.status.as_u16(), 201 | 301 | 302 | 307 | 308) {
        return false;
    }
    let Some(location) = ctx
        .upstream
        .headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    // a relative Location has no host to compare and is never rewritten
    let Ok(mut url) = Url::parse(location) else {
        return false;
    };
    let location_host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => return false,
    };
    let target_host = match target.port {
        Some(port) => format!("{}:{}", target.host, port),
        None => target.host.clone(),
    };
    if location_host != target_host {
        return false;
    }

    if let Some(host) = &options.host_rewrite {
        set_host_port(&mut url, host);
    } else if options.auto_rewrite {
        if let Some(host) = ctx.client_req.headers.get(HOST).and_then(|v| v.to_str().ok()) {
            set_host_port(&mut url, host);
        }
    }
    if let Some(protocol) = &options.protocol_rewrite {
        let _ = url.set_scheme(protocol.trim_end_matches(':'));
    }
    if let Ok(value) = HeaderValue::from_str(url.as_str()) {
        ctx.upstream.headers.insert(LOCATION, value);
    }
    false
}

/// `host` may carry an explicit port ("example.com:8080").
fn set_host_port(url: &mut Url, host: &str) {
    let (host, port) = match host.rsplit_once(':') {
        Some((h, p)) => match p.parse::<u16>() {
            Ok(p) => (h, Some(p)),
            Err(_) => (host, None),
        },
        None => (host, None),
    };
    let _ = url.set_host(Some(host));
    let _ = url.set_port(port);
}

/// Copy the (rewritten) upstream headers onto the client response,
/// applying the `Set-Cookie` domain/path rules. Transfer framing is left
/// to the relaying connection. Response extensions move across so original
/// header casing and the status reason phrase survive the relay.
fn write_headers(ctx: &mut OutgoingContext<'_>) -> bool {
    for (name, value) in ctx.upstream.headers.iter() {
        if name == TRANSFER_ENCODING {
            continue;
        }
        let value = if name == SET_COOKIE {
            match value.to_str() {
                Ok(s) => {
                    let mut s = s.to_string();
                    if let Some(rules) = &ctx.options.cookie_domain_rewrite {
                        s = rewrite_cookie_property(&s, rules, "domain");
                    }
                    if let Some(rules) = &ctx.options.cookie_path_rewrite {
                        s = rewrite_cookie_property(&s, rules, "path");
                    }
                    HeaderValue::from_str(&s).unwrap_or_else(|_| value.clone())
                }
                Err(_) => value.clone(),
            }
        } else {
            value.clone()
        };
        ctx.res.headers.append(name.clone(), value);
    }
    ctx.res.extensions = std::mem::take(&mut ctx.upstream.extensions);
    false
}

fn write_status_code(ctx: &mut OutgoingContext<'_>) -> bool {
    ctx.res.status = ctx.upstream.status;
    false
}
