use std::error::Error as _;
use std::io::ErrorKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("connect to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream error: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no such pass: {0}")]
    NoSuchPass(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("URI error: {0}")]
    Uri(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed upgrade request")]
    MalformedUpgrade,
}

impl From<http::Error> for ProxyError {
    fn from(e: http::Error) -> Self {
        ProxyError::Http(e.to_string())
    }
}

impl ProxyError {
    fn io_kind(&self) -> Option<ErrorKind> {
        match self {
            ProxyError::Io(e) => Some(e.kind()),
            ProxyError::Connect { source, .. } => Some(source.kind()),
            ProxyError::Upstream(e) => e
                .source()
                .and_then(|s| s.downcast_ref::<std::io::Error>())
                .map(|e| e.kind()),
            _ => None,
        }
    }

    /// The upstream (or its network path) reset the connection.
    pub fn is_connection_reset(&self) -> bool {
        matches!(
            self.io_kind(),
            Some(ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe)
        ) || matches!(self, ProxyError::Upstream(e) if e.is_incomplete_message())
    }

    pub fn is_connection_refused(&self) -> bool {
        matches!(self.io_kind(), Some(ErrorKind::ConnectionRefused))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout(_)) || matches!(self.io_kind(), Some(ErrorKind::TimedOut))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_reset() {
        let err = ProxyError::Io(std::io::Error::new(ErrorKind::ConnectionReset, "reset"));
        assert!(err.is_connection_reset());
        assert!(!err.is_connection_refused());
    }

    #[test]
    fn classifies_connection_refused_through_connect() {
        let err = ProxyError::Connect {
            url: "http://127.0.0.1:1".to_string(),
            source: std::io::Error::new(ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.is_connection_refused());
        assert!(!err.is_connection_reset());
    }

    #[test]
    fn timeout_is_timeout() {
        assert!(ProxyError::Timeout(Duration::from_millis(3)).is_timeout());
    }
}
