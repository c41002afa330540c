//! TCP and TLS plumbing for the server connection.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn};

use super::dns::{ConnectionMode, ServerEndpoint};
use crate::error::{SessionError, SessionResult};

/// TCP connect timeout for server connections.
///
/// Without it the OS default applies, which can be minutes for unreachable
/// hosts. SRV lookups often yield several endpoints, so a dead one must not
/// hold up the next for long.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Install the ring crypto provider once per process.
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Accepts any server certificate. Only used with `tls_verify = false`.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// TLS connector backed by the system root store, or by no verification at
/// all when `verify` is off.
pub fn create_tls_connector(verify: bool) -> SessionResult<TlsConnector> {
    init_crypto_provider();
    if !verify {
        warn!("TLS certificate verification DISABLED");
        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
            .with_no_client_auth();
        return Ok(TlsConnector::from(Arc::new(config)));
    }

    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(SessionError::tls(
            "no system root certificates found; install the CA certificates package",
        ));
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| SessionError::tls(format!("failed to add root certificate: {}", e)))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run the TLS handshake on `tcp`, checking the certificate against `name`.
pub async fn upgrade_to_tls(
    tcp: TcpStream,
    name: &str,
    verify: bool,
) -> SessionResult<TlsStream<TcpStream>> {
    let connector = create_tls_connector(verify)?;
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|e| SessionError::tls(format!("invalid server name '{}': {}", name, e)))?;

    connector.connect(server_name, tcp).await.map_err(|e| {
        let detail = e.to_string();
        let classification = if detail.contains("ertificate") {
            "certificate_error"
        } else if detail.contains("timed out") || detail.contains("timeout") {
            "timeout"
        } else if detail.contains("refused") || detail.contains("reset") {
            "connection_refused"
        } else {
            "other"
        };
        error!(name, error = %e, error_class = classification, "TLS handshake failed");
        SessionError::tls(format!("handshake with {} failed ({}): {}", name, classification, e))
    })
}

/// Server connection, plain or encrypted.
#[derive(Default)]
pub enum Transport {
    #[default]
    Closed,
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Local address of the underlying socket, advertised for bytestreams.
    pub fn local_ip(&self) -> Option<IpAddr> {
        let tcp = match self {
            Self::Closed => return None,
            Self::Plain(tcp) => tcp,
            Self::Tls(tls) => tls.get_ref().0,
        };
        tcp.local_addr().ok().map(|a| a.ip())
    }

    /// Upgrade a plain connection in place after `<proceed/>`.
    pub async fn starttls(&mut self, name: &str, verify: bool) -> SessionResult<()> {
        match std::mem::take(self) {
            Self::Plain(tcp) => {
                let tls = upgrade_to_tls(tcp, name, verify).await?;
                info!(name, "STARTTLS upgrade complete");
                *self = Self::Tls(Box::new(tls));
                Ok(())
            }
            Self::Tls(tls) => {
                *self = Self::Tls(tls);
                Err(SessionError::tls("STARTTLS requested on an encrypted stream"))
            }
            Self::Closed => Err(SessionError::tls("STARTTLS requested on a closed stream")),
        }
    }
}

/// Connect to one endpoint, finishing the TLS handshake for direct TLS.
pub async fn connect_endpoint(endpoint: &ServerEndpoint, verify: bool) -> SessionResult<Transport> {
    let mode = match endpoint.mode {
        ConnectionMode::Tcp => "tcp",
        ConnectionMode::DirectTls => "direct_tls",
    };
    let tcp = tokio::time::timeout(
        TCP_CONNECT_TIMEOUT,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| {
        error!(
            host = %endpoint.host, port = endpoint.port, mode,
            timeout_secs = TCP_CONNECT_TIMEOUT.as_secs(),
            "TCP connect timed out"
        );
        SessionError::ConnectTimeout {
            host: endpoint.host.clone(),
            port: endpoint.port,
            secs: TCP_CONNECT_TIMEOUT.as_secs(),
        }
    })?
    .map_err(|e| {
        error!(
            host = %endpoint.host, port = endpoint.port, mode,
            error = %e, error_kind = ?e.kind(),
            "TCP connect failed"
        );
        SessionError::Io(e)
    })?;
    let _ = tcp.set_nodelay(true);

    match endpoint.mode {
        ConnectionMode::Tcp => {
            info!(host = %endpoint.host, port = endpoint.port, "Connected (TCP)");
            Ok(Transport::Plain(tcp))
        }
        ConnectionMode::DirectTls => {
            let tls = upgrade_to_tls(tcp, endpoint.tls_name(), verify).await?;
            info!(host = %endpoint.host, port = endpoint.port,
                tls_name = endpoint.tls_name(), "Connected (direct TLS)");
            Ok(Transport::Tls(Box::new(tls)))
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Closed => Poll::Ready(Err(closed())),
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Closed => Poll::Ready(Err(closed())),
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Closed => Poll::Ready(Ok(())),
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Closed => Poll::Ready(Ok(())),
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
