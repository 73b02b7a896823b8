use crate::error::ProxyError;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::io::Write;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

/// Initialize env_logger with the given default level and line format.
/// `RUST_LOG` still overrides the level.
pub fn init(level: Option<&str>, format: LogFormat) -> Result<(), ProxyError> {
    let level = level.unwrap_or("info");

    match format {
        LogFormat::Json => {
            let mut builder =
                env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
            builder.format(|buf, record| {
                let timestamp: DateTime<Utc> = Utc::now();
                let entry = json!({
                    "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                    "level": record.level().to_string().to_lowercase(),
                    "target": record.target(),
                    "module": record.module_path().unwrap_or("unknown"),
                    "message": record.args().to_string(),
                });
                writeln!(buf, "{}", entry)
            });
            builder
                .try_init()
                .map_err(|e| ProxyError::Config(format!("logger already initialized: {e}")))
        }
        LogFormat::Text => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
                .try_init()
                .map_err(|e| ProxyError::Config(format!("logger already initialized: {e}")))
        }
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, ProxyError> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(ProxyError::Config(format!(
            "invalid log format: {s}. Must be one of: text, json"
        ))),
    }
}
