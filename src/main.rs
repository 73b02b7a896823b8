use clap::Parser;
use heimdall_proxy::config::ProxyOptions;
use heimdall_proxy::logging::{self, LogFormat};
use heimdall_proxy::server::ProxyServer;
use log::{error, info};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Programmable HTTP/HTTPS/WebSocket reverse proxy with an extensible pass pipeline"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8080)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "URL", help = "Primary upstream target URL")]
    target: Option<String>,

    #[clap(short, long, value_name = "URL", help = "Fire-and-forget forward upstream URL")]
    forward: Option<String>,

    #[clap(long, help = "Proxy WebSocket upgrades")]
    ws: bool,

    #[clap(long, help = "Append X-Forwarded-* headers")]
    xfwd: bool,

    #[clap(long, help = "Rewrite the upstream Host header to the target host")]
    change_origin: bool,

    #[clap(long, help = "Skip upstream TLS certificate verification")]
    insecure: bool,

    #[clap(long, value_name = "MILLIS", help = "Incoming connection idle timeout")]
    timeout: Option<u64>,

    #[clap(long, value_name = "MILLIS", help = "Upstream connection idle timeout")]
    proxy_timeout: Option<u64>,

    #[clap(short, long, value_name = "FILE", help = "JSON configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,
}

#[derive(Deserialize)]
struct FileConfig {
    listen_addr: SocketAddr,
    options: ProxyOptions,
}

impl FileConfig {
    fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let format = match &args.log_format {
        Some(f) => logging::parse_log_format(f)?,
        None => LogFormat::default(),
    };
    logging::init(args.log_level.as_deref(), format)?;

    let (listen_addr, options) = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {config_file}").into());
        }
        let config = FileConfig::from_file(config_file)?;
        (config.listen_addr, config.options)
    } else {
        (
            args.listen
                .as_deref()
                .unwrap_or("127.0.0.1:8080")
                .parse::<SocketAddr>()?,
            options_from_args(&args)?,
        )
    };

    options.require_upstream()?;

    info!("Starting proxy server...");
    let proxy = Arc::new(ProxyServer::new(options));
    proxy.hooks().on_error(|err, req, url| {
        error!(
            "proxy error for {} {}: {} (upstream: {})",
            req.method,
            req.uri,
            err,
            url.unwrap_or("-")
        );
    });

    proxy.clone().listen(listen_addr).await?;

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    proxy.close();
    Ok(())
}

fn options_from_args(args: &Args) -> Result<ProxyOptions, Box<dyn std::error::Error>> {
    let mut options = match &args.target {
        Some(url) => ProxyOptions::with_target(url)?,
        None => ProxyOptions::default(),
    };
    if let Some(url) = &args.forward {
        options.forward = Some(heimdall_proxy::Target::parse(url)?);
    }
    options.ws = args.ws;
    options.xfwd = args.xfwd;
    options.change_origin = args.change_origin;
    if args.insecure {
        options.secure = Some(false);
    }
    options.timeout_millis = args.timeout;
    options.proxy_timeout_millis = args.proxy_timeout;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use heimdall_proxy::config::RewriteRules;
    use std::io::Write;

    #[test]
    fn file_config_loads_options() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"{
  "listen_addr": "127.0.0.1:8080",
  "options": {
    "target": "http://backend.example:3000/api",
    "ws": true,
    "xfwd": true,
    "change_origin": true,
    "secure": false,
    "cookie_domain_rewrite": false,
    "cookie_path_rewrite": {"/internal": "/"},
    "timeout_millis": 5000
  }
}"#,
        )
        .unwrap();

        let config = FileConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());

        let options = config.options;
        let target = options.target.as_ref().unwrap();
        assert_eq!(target.host, "backend.example");
        assert_eq!(target.port, Some(3000));
        assert_eq!(target.path, "/api");
        assert!(options.ws);
        assert!(options.xfwd);
        assert!(options.change_origin);
        assert!(!options.secure());
        assert!(matches!(
            options.cookie_domain_rewrite,
            Some(RewriteRules::Disabled)
        ));
        assert_eq!(
            options.cookie_path_rewrite.as_ref().unwrap().lookup("/internal"),
            Some("/")
        );
        assert_eq!(options.timeout_millis, Some(5000));
    }

    #[test]
    fn file_config_rejects_missing_file() {
        assert!(FileConfig::from_file("/no/such/config.json").is_err());
    }
}
