//! Worker-side connector for the check-in stream.
//!
//! Turns a [`ConnectionInfo`] blob into an authenticated framed stream: the
//! manager CA pins the server certificate, the worker presents its
//! per-component client certificate, and the single-use token is sent as the
//! opening `Hello` frame.

use std::sync::{Arc, Once};

use futures_util::SinkExt;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;

use crate::codec::FrameCodec;
use crate::conninfo::ConnectionInfo;
use crate::error::WireError;
use crate::frames::{Frame, Hello};

/// Framed worker end of the check-in stream.
pub type WorkerStream = Framed<tokio_rustls::client::TlsStream<TcpStream>, FrameCodec>;

static INIT_CRYPTO: Once = Once::new();

/// Install the ring crypto provider exactly once per process.
pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// Errors raised while establishing the worker connection.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Connect to the manager, complete the TLS handshake, and send the opening
/// `Hello` frame.
pub async fn connect(info: &ConnectionInfo) -> Result<WorkerStream, ClientError> {
    init_crypto_provider();

    let mut roots = RootCertStore::empty();
    roots.add(CertificateDer::from(info.ca_der()?))?;

    let certs = vec![CertificateDer::from(info.cert_der()?)];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(info.key_der()?));

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;

    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect(&info.addr).await?;
    let server_name = ServerName::try_from(info.server_name.clone())
        .map_err(|_| ClientError::InvalidServerName(info.server_name.clone()))?;
    let tls = connector.connect(server_name, tcp).await?;

    let mut stream = Framed::new(tls, FrameCodec::new());
    stream
        .send(Frame::Hello(Hello {
            token: info.token.clone(),
        }))
        .await?;

    Ok(stream)
}
