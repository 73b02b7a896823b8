use crate::error::ProxyError;
use crate::server::Agent;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use url::Url;

/// Scheme of an upstream target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Ws,
    Wss,
}

impl Protocol {
    pub fn from_scheme(scheme: &str) -> Option<Protocol> {
        match scheme.trim_end_matches(':') {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            "ws" => Some(Protocol::Ws),
            "wss" => Some(Protocol::Wss),
            _ => None,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Protocol::Https | Protocol::Wss)
    }

    pub fn default_port(self) -> u16 {
        if self.is_secure() {
            443
        } else {
            80
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }
}

/// TLS material for a single upstream target, as PEM files.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetTls {
    #[serde(default)]
    pub ca: Option<PathBuf>,
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

impl TargetTls {
    pub fn is_empty(&self) -> bool {
        self.ca.is_none() && self.cert.is_none() && self.key.is_none()
    }
}

/// A structured upstream target. Deserializes from either a URL string or
/// the structured form.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "TargetRepr")]
pub struct Target {
    pub protocol: Protocol,
    pub host: String,
    pub port: Option<u16>,
    /// Pathname plus query string, exactly as it will be prepended.
    pub path: String,
    /// Unix-domain socket path; when set, `host`/`port` are ignored for
    /// dialing but still used for the Host header.
    pub socket_path: Option<PathBuf>,
    pub tls: TargetTls,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TargetRepr {
    Url(String),
    Structured {
        protocol: Protocol,
        host: String,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        path: String,
        #[serde(default)]
        socket_path: Option<PathBuf>,
        #[serde(default)]
        tls: TargetTls,
    },
}

impl TryFrom<TargetRepr> for Target {
    type Error = ProxyError;

    fn try_from(repr: TargetRepr) -> Result<Target, ProxyError> {
        match repr {
            TargetRepr::Url(s) => Target::parse(&s),
            TargetRepr::Structured {
                protocol,
                host,
                port,
                path,
                socket_path,
                tls,
            } => Ok(Target {
                protocol,
                host,
                port,
                path,
                socket_path,
                tls,
            }),
        }
    }
}

impl Target {
    pub fn parse(s: &str) -> Result<Target, ProxyError> {
        let url = Url::parse(s)?;
        let protocol = Protocol::from_scheme(url.scheme())
            .ok_or_else(|| ProxyError::Config(format!("unsupported target scheme: {}", url.scheme())))?;
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("target URL has no host: {s}")))?
            .to_string();
        // pathname + search, the legacy `path` convention
        let mut path = url.path().to_string();
        if let Some(q) = url.query() {
            path.push('?');
            path.push_str(q);
        }
        if path == "/" && !s.trim_end_matches('?').ends_with('/') {
            // Url::parse normalizes an empty path to "/"; keep it empty so
            // path joining does not invent a trailing slash.
            path.clear();
        }
        Ok(Target {
            protocol,
            host,
            port: url.port(),
            path,
            socket_path: None,
            tls: TargetTls::default(),
        })
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// `host[:port]`, the port included only when non-standard for the scheme.
    pub fn host_header(&self) -> String {
        let port = self.port_or_default();
        if crate::common::requires_port(port, self.protocol) {
            format!("{}:{}", self.host, port)
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
            self.port_or_default(),
            self.path
        )
    }
}

/// `Set-Cookie` domain/path rewrite rules. Deserializes from `false`
/// (rewriting disabled), a bare string (wildcard sugar for `{"*": s}`), or
/// a map rewriting exact values with `"*"` as fallback.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RewriteRulesRepr")]
pub enum RewriteRules {
    Disabled,
    Single(String),
    Map(HashMap<String, String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RewriteRulesRepr {
    Bool(bool),
    Single(String),
    Map(HashMap<String, String>),
}

impl TryFrom<RewriteRulesRepr> for RewriteRules {
    type Error = ProxyError;

    fn try_from(repr: RewriteRulesRepr) -> Result<RewriteRules, ProxyError> {
        match repr {
            RewriteRulesRepr::Bool(false) => Ok(RewriteRules::Disabled),
            RewriteRulesRepr::Bool(true) => Err(ProxyError::Config(
                "cookie rewrite accepts false, a string, or a mapping".to_string(),
            )),
            RewriteRulesRepr::Single(s) => Ok(RewriteRules::Single(s)),
            RewriteRulesRepr::Map(m) => Ok(RewriteRules::Map(m)),
        }
    }
}

impl RewriteRules {
    /// The replacement for `value`, or None to leave it unchanged.
    pub fn lookup(&self, value: &str) -> Option<&str> {
        match self {
            RewriteRules::Disabled => None,
            RewriteRules::Single(s) => Some(s.as_str()),
            RewriteRules::Map(m) => m.get(value).or_else(|| m.get("*")).map(String::as_str),
        }
    }
}

/// TLS configuration for the listening side, consumed by `listen`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerTls {
    pub key: PathBuf,
    pub cert: PathBuf,
    #[serde(default)]
    pub ca: Option<PathBuf>,
}

/// Proxy configuration. Per-call options are merged over the server's
/// global options by [`ProxyOptions::merged_with`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProxyOptions {
    /// Primary upstream. Required unless `forward` is set.
    pub target: Option<Target>,
    /// Secondary fire-and-forget upstream; its response is discarded.
    pub forward: Option<Target>,
    /// Pooled upstream client. Absent means a fresh connection per request
    /// with `Connection: close`.
    #[serde(skip)]
    pub agent: Option<Agent>,
    /// TLS for the listening side.
    pub ssl: Option<ListenerTls>,
    /// Route upgrade requests through the WebSocket pipeline in `listen`.
    pub ws: bool,
    /// Append `X-Forwarded-{For,Port,Proto,Host}`.
    pub xfwd: bool,
    /// Verify upstream TLS certificates. Defaults to true.
    pub secure: Option<bool>,
    /// Treat the incoming request URI as a full absolute URL to forward
    /// verbatim (proxy chaining).
    pub to_proxy: bool,
    /// Prepend the target path to the request path. Defaults to true.
    pub prepend_path: Option<bool>,
    /// Discard the client path; use only the target path.
    pub ignore_path: bool,
    /// Bind outgoing connections to this local address.
    pub local_address: Option<IpAddr>,
    /// Overwrite the upstream Host header with the target host.
    pub change_origin: bool,
    /// Relay upstream header names with their original casing.
    pub preserve_header_key_case: bool,
    /// `user:pass` for an upstream `Authorization: Basic` header.
    pub auth: Option<String>,
    /// Rewrite the redirect Location host to this value.
    pub host_rewrite: Option<String>,
    /// Rewrite the redirect Location host to the incoming Host header.
    pub auto_rewrite: bool,
    /// Force this scheme on redirect Locations.
    pub protocol_rewrite: Option<String>,
    pub cookie_domain_rewrite: Option<RewriteRules>,
    pub cookie_path_rewrite: Option<RewriteRules>,
    /// Static headers added to the upstream request.
    pub headers: Option<HashMap<String, String>>,
    /// Override the HTTP method on the upstream request.
    pub method: Option<String>,
    /// Upstream socket idle timeout; on fire the upstream request is
    /// destroyed.
    pub proxy_timeout_millis: Option<u64>,
    /// Incoming exchange timeout; on fire the client connection is
    /// destroyed.
    pub timeout_millis: Option<u64>,
    /// Follow upstream redirects instead of relaying them.
    pub follow_redirects: bool,
    /// Skip the web-outgoing passes and body relay; the caller receives the
    /// raw upstream response.
    pub self_handle_response: bool,
    /// Pre-buffered request body sent upstream in place of the client body.
    #[serde(skip)]
    pub buffer: Option<Bytes>,
}

impl ProxyOptions {
    pub fn with_target(url: &str) -> Result<ProxyOptions, ProxyError> {
        Ok(ProxyOptions {
            target: Some(Target::parse(url)?),
            ..ProxyOptions::default()
        })
    }

    pub fn with_forward(url: &str) -> Result<ProxyOptions, ProxyError> {
        Ok(ProxyOptions {
            forward: Some(Target::parse(url)?),
            ..ProxyOptions::default()
        })
    }

    pub fn secure(&self) -> bool {
        self.secure.unwrap_or(true)
    }

    pub fn prepend_path(&self) -> bool {
        self.prepend_path.unwrap_or(true)
    }

    /// Per-call options merged over these global options. Options set on
    /// the per-call side win; flags combine with OR.
    pub fn merged_with(&self, per_call: &ProxyOptions) -> ProxyOptions {
        ProxyOptions {
            target: per_call.target.clone().or_else(|| self.target.clone()),
            forward: per_call.forward.clone().or_else(|| self.forward.clone()),
            agent: per_call.agent.clone().or_else(|| self.agent.clone()),
            ssl: per_call.ssl.clone().or_else(|| self.ssl.clone()),
            ws: per_call.ws || self.ws,
            xfwd: per_call.xfwd || self.xfwd,
            secure: per_call.secure.or(self.secure),
            to_proxy: per_call.to_proxy || self.to_proxy,
            prepend_path: per_call.prepend_path.or(self.prepend_path),
            ignore_path: per_call.ignore_path || self.ignore_path,
            local_address: per_call.local_address.or(self.local_address),
            change_origin: per_call.change_origin || self.change_origin,
            preserve_header_key_case: per_call.preserve_header_key_case
                || self.preserve_header_key_case,
            auth: per_call.auth.clone().or_else(|| self.auth.clone()),
            host_rewrite: per_call
                .host_rewrite
                .clone()
                .or_else(|| self.host_rewrite.clone()),
            auto_rewrite: per_call.auto_rewrite || self.auto_rewrite,
            protocol_rewrite: per_call
                .protocol_rewrite
                .clone()
                .or_else(|| self.protocol_rewrite.clone()),
            cookie_domain_rewrite: per_call
                .cookie_domain_rewrite
                .clone()
                .or_else(|| self.cookie_domain_rewrite.clone()),
            cookie_path_rewrite: per_call
                .cookie_path_rewrite
                .clone()
                .or_else(|| self.cookie_path_rewrite.clone()),
            headers: per_call.headers.clone().or_else(|| self.headers.clone()),
            method: per_call.method.clone().or_else(|| self.method.clone()),
            proxy_timeout_millis: per_call.proxy_timeout_millis.or(self.proxy_timeout_millis),
            timeout_millis: per_call.timeout_millis.or(self.timeout_millis),
            follow_redirects: per_call.follow_redirects || self.follow_redirects,
            self_handle_response: per_call.self_handle_response || self.self_handle_response,
            buffer: per_call.buffer.clone().or_else(|| self.buffer.clone()),
        }
    }

    /// A target or forward must be resolved before the stream pass runs.
    pub fn require_upstream(&self) -> Result<(), ProxyError> {
        if self.target.is_none() && self.forward.is_none() {
            return Err(ProxyError::Config(
                "either target or forward must be set".to_string(),
            ));
        }
        Ok(())
    }
}
