//! Socket setup for `rtmp://` (TCP) and `rtmps://` (TLS over TCP)

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

use super::config::{ClientConfig, RtmpUri};

/// A bidirectional byte stream the connection runs over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Open the socket for `uri`, wrapping it in TLS for `rtmps`
pub async fn open(uri: &RtmpUri, config: &ClientConfig) -> Result<BoxedTransport> {
    let addr = (uri.host(), uri.port());

    let socket = timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(Error::Io)?;

    if config.tcp_nodelay {
        socket.set_nodelay(true)?;
    }

    if !uri.is_secure() {
        return Ok(Box::new(socket));
    }

    let connector = tls_connector()?;
    let server_name = ServerName::try_from(uri.host().to_string())
        .map_err(|_| Error::Config(format!("invalid TLS server name: {}", uri.host())))?;

    let stream = timeout(config.connect_timeout, connector.connect(server_name, socket))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(Error::Io)?;

    tracing::debug!(host = uri.host(), "TLS session established");
    Ok(Box::new(stream))
}

fn tls_connector() -> Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Io(io::Error::other(e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}
