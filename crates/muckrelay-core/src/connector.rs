//! Dialing the remote server.
//!
//! Produces a duplex byte stream, either plain TCP or TLS. Keep-alive is
//! enabled on the underlying socket so long-idle sessions survive NAT and
//! firewall timeouts.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;

use crate::Session;

/// Keep-alive idle time, and the retry interval where the platform allows it.
pub const KEEPALIVE: Duration = Duration::from_secs(15 * 60);

/// A live duplex stream to the remote server.
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayStream for T {}

/// Transport-agnostic connection handed to the engine.
pub type Connection = Box<dyn RelayStream>;

/// Connector error.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to resolve {target}: {source}")]
    Resolve { target: String, source: io::Error },
    #[error("Failed to connect to {target}: {source}")]
    Connect { target: String, source: io::Error },
    #[error("Failed to configure socket: {0}")]
    Socket(#[source] io::Error),
    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("TLS handshake with {target} failed: {source}")]
    Handshake { target: String, source: io::Error },
}

/// Dial the session's server using its security mode.
///
/// # Errors
/// Returns error if the host cannot be resolved, every address refuses the
/// connection, or the TLS handshake fails. There is no retry.
pub async fn connect(session: &Session) -> Result<Connection, ConnectError> {
    let tcp = connect_tcp(session).await?;

    if !session.secure() {
        return Ok(Box::new(tcp));
    }

    let tls = connect_tls(session, tcp).await?;
    Ok(Box::new(tls))
}

/// Resolve and open a TCP connection with keep-alive enabled.
///
/// # Errors
/// Returns error if resolution or every connection attempt fails.
pub async fn connect_tcp(session: &Session) -> Result<TcpStream, ConnectError> {
    let target = session.to_string();
    let addrs = resolve(session).await?;
    tracing::debug!(%target, ?addrs, "server resolved");

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tracing::debug!(%addr, "connected to server");
                enable_keepalive(&stream)?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connection attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(ConnectError::Connect {
        target,
        source: last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses to dial")),
    })
}

async fn resolve(session: &Session) -> Result<Vec<SocketAddr>, ConnectError> {
    let target = session.to_string();
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((session.host(), session.port()))
        .await
        .map_err(|source| ConnectError::Resolve {
            target: target.clone(),
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(ConnectError::Resolve {
            target,
            source: io::Error::new(io::ErrorKind::NotFound, "host has no addresses"),
        });
    }
    Ok(addrs)
}

fn enable_keepalive(stream: &TcpStream) -> Result<(), ConnectError> {
    stream.set_nodelay(true).map_err(ConnectError::Socket)?;
    SockRef::from(stream)
        .set_tcp_keepalive(&keepalive_params())
        .map_err(ConnectError::Socket)?;
    tracing::debug!(period = ?KEEPALIVE, "keep-alive enabled");
    Ok(())
}

/// Keep-alive idle time and retry interval, both `KEEPALIVE`.
fn keepalive_params() -> TcpKeepalive {
    let params = TcpKeepalive::new().with_time(KEEPALIVE);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
    ))]
    let params = params.with_interval(KEEPALIVE);
    params
}

async fn connect_tls(
    session: &Session,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ConnectError> {
    let config = tls_config(session.insecure_tls())?;
    let server_name = ServerName::try_from(session.host())
        .map_err(|_| ConnectError::InvalidServerName(session.host().to_string()))?
        .to_owned();

    let stream = TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await
        .map_err(|source| ConnectError::Handshake {
            target: session.to_string(),
            source,
        })?;

    tracing::debug!(insecure = session.insecure_tls(), "TLS session established");
    Ok(stream)
}

/// Build the TLS client configuration.
///
/// With `insecure` set, any server certificate is accepted; handshake
/// signatures are still checked.
///
/// # Errors
/// Returns error if the crypto provider rejects the protocol versions.
pub fn tls_config(insecure: bool) -> Result<ClientConfig, ConnectError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let config = if insecure {
        tracing::warn!("TLS certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(config)
}

/// Verifier for self-signed test servers.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
