use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use rustls::crypto::ring;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use rustls_native_certs as native_certs;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::util::timeout_with_context;

use super::target::{Scheme, UpstreamTarget};

pub(crate) enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Client TLS settings for HTTPS upstreams, trusting the system certificate store.
pub fn build_tls_client_config() -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (_, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }
    ensure!(
        !root_store.is_empty(),
        "no trust anchors available; install system certificates to reach an https upstream"
    );

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Tries each address in order and returns the first connection that succeeds.
pub(crate) async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY on upstream stream"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected to upstream");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err = Some(anyhow!(err).context(format!("failed to connect to {addr}")));
            }
            Err(_) => {
                last_err = Some(anyhow!("connection to {addr} timed out"));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses provided for upstream connect")))
}

pub(crate) async fn open_connection(
    target: &UpstreamTarget,
    tls: Option<&TlsConnector>,
    connect_timeout: Duration,
) -> Result<(UpstreamIo, SocketAddr)> {
    let addrs: Vec<SocketAddr> = timeout_with_context(
        connect_timeout,
        tokio::net::lookup_host((target.host(), target.port())),
        format!("resolving upstream host {}", target.host()),
    )
    .await?
    .collect();
    let (tcp, peer) = connect_to_addrs(&addrs, connect_timeout).await?;

    if target.scheme() == Scheme::Http {
        return Ok((UpstreamIo::Plain(tcp), peer));
    }
    let connector = tls.ok_or_else(|| anyhow!("https upstream configured without TLS settings"))?;
    let server_name = ServerName::try_from(target.host())
        .map_err(|_| anyhow!("invalid upstream host for TLS '{}'", target.host()))?
        .to_owned();
    let stream = timeout(connect_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| anyhow!("TLS handshake with upstream timed out"))?
        .with_context(|| format!("failed to establish TLS with upstream {}", target.authority()))?;
    Ok((UpstreamIo::Tls(Box::new(stream)), peer))
}
