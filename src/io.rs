//! Upstream connection plumbing: dialing over TCP, Unix sockets and TLS,
//! an idle-timeout stream wrapper, and the HTTP/1.1 client handshake.

use crate::common::{OutgoingRequest, ProxyBody};
use crate::error::ProxyError;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_rustls::TlsConnector;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Open a raw stream to the upstream described by `outgoing`: Unix socket
/// when `socket_path` is set, otherwise TCP (optionally bound to a local
/// address), wrapped in TLS for secure schemes.
pub async fn connect_upstream(outgoing: &OutgoingRequest) -> Result<BoxedStream, ProxyError> {
    #[cfg(unix)]
    if let Some(path) = &outgoing.socket_path {
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|e| ProxyError::Connect {
                url: path.display().to_string(),
                source: e,
            })?;
        return Ok(Box::new(stream));
    }

    let stream = dial_tcp(outgoing).await?;
    stream.set_nodelay(true)?;

    if outgoing.protocol.is_secure() {
        let connector = tls_connector(outgoing)?;
        let server_name = ServerName::try_from(outgoing.host.clone())
            .map_err(|e| ProxyError::Tls(format!("invalid server name {}: {e}", outgoing.host)))?;
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ProxyError::Connect {
                url: outgoing.url_string(),
                source: e,
            })?;
        Ok(Box::new(tls))
    } else {
        Ok(Box::new(stream))
    }
}

async fn dial_tcp(outgoing: &OutgoingRequest) -> Result<TcpStream, ProxyError> {
    let authority = format!("{}:{}", outgoing.host, outgoing.port);
    let connect_err = |e: std::io::Error| ProxyError::Connect {
        url: outgoing.url_string(),
        source: e,
    };

    match outgoing.local_address {
        None => TcpStream::connect(authority.as_str()).await.map_err(connect_err),
        Some(local) => {
            let mut last = None;
            for addr in lookup_host(authority.as_str()).await.map_err(connect_err)? {
                if addr.is_ipv4() != local.is_ipv4() {
                    continue;
                }
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()
                } else {
                    TcpSocket::new_v6()
                }?;
                socket.bind(std::net::SocketAddr::new(local, 0))?;
                match socket.connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last = Some(e),
                }
            }
            Err(connect_err(last.unwrap_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "no address matching the local address family",
                )
            })))
        }
    }
}

pub(crate) fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let file = File::open(path).map_err(|e| {
        ProxyError::Config(format!("failed to open certificate file {}: {e}", path.display()))
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("failed to read certificate {}: {e}", path.display())))
}

pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let file = File::open(path).map_err(|e| {
        ProxyError::Config(format!("failed to open private key file {}: {e}", path.display()))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ProxyError::Config(format!("failed to read private key {}: {e}", path.display())))?
        .ok_or_else(|| ProxyError::Config(format!("no valid private key found in {}", path.display())))
}

fn tls_connector(outgoing: &OutgoingRequest) -> Result<TlsConnector, ProxyError> {
    let config = if !outgoing.reject_unauthorized {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca) = &outgoing.tls.ca {
            for cert in load_certs(ca)? {
                roots
                    .add(cert)
                    .map_err(|e| ProxyError::Tls(format!("invalid CA certificate: {e}")))?;
            }
        }
        let builder = ClientConfig::builder().with_root_certificates(roots);
        match (&outgoing.tls.cert, &outgoing.tls.key) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
                .map_err(|e| ProxyError::Tls(format!("invalid client certificate: {e}")))?,
            _ => builder.with_no_client_auth(),
        }
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts anything, backing `secure: false`.
#[derive(Debug)]
struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

/// Perform the HTTP/1.1 client handshake over `stream` and drive the
/// connection in a background task, with upgrade support.
pub(crate) async fn handshake<S: AsyncStream + 'static>(
    stream: S,
    preserve_header_case: bool,
) -> Result<(http1::SendRequest<ProxyBody>, JoinHandle<()>), ProxyError> {
    let mut builder = http1::Builder::new();
    builder.preserve_header_case(preserve_header_case);
    let (send, conn) = builder.handshake(TokioIo::new(stream)).await?;
    let task = tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("upstream connection ended with error: {e}");
        }
    });
    Ok((send, task))
}

/// Stream wrapper enforcing an idle timeout: whenever the underlying
/// stream makes no read/write progress for the configured duration, the
/// next poll fails with `TimedOut` and the connection dies.
pub struct TimeoutIo<S> {
    inner: S,
    timeout: Duration,
    idle: Pin<Box<Sleep>>,
}

impl<S> TimeoutIo<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            idle: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    fn touch(&mut self) {
        let deadline = Instant::now() + self.timeout;
        self.idle.as_mut().reset(deadline);
    }

    fn poll_idle(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Error> {
        match self.idle.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "socket idle timeout expired",
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimeoutIo<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.touch();
                Poll::Ready(result)
            }
            Poll::Pending => match this.poll_idle(cx) {
                Poll::Ready(e) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimeoutIo<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.touch();
                Poll::Ready(result)
            }
            Poll::Pending => match this.poll_idle(cx) {
                Poll::Ready(e) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn timeout_io_passes_traffic_through() {
        let (client, server) = tokio::io::duplex(64);
        let mut wrapped = TimeoutIo::new(client, Duration::from_secs(5));
        let mut server = server;

        wrapped.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_io_fails_when_idle() {
        let (client, _server) = tokio::io::duplex(64);
        let mut wrapped = TimeoutIo::new(client, Duration::from_millis(50));

        let mut buf = [0u8; 4];
        let err = wrapped.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }
}
