//! Check-in server.
//!
//! Accepts TLS connections from workers, verifies the client certificate
//! chains to the manager CA, reads the opening `Hello` frame, and hands the
//! framed stream to the runtime owning the token. Tokens are single-use per
//! live worker instance: they are taken from the registry on first use and
//! invalidated when the worker is replaced.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use foreman_wire::{Frame, FrameCodec};

/// Framed manager end of a worker stream.
pub(crate) type WorkerConnection = Framed<tokio_rustls::server::TlsStream<TcpStream>, FrameCodec>;

/// How long a connection gets to complete the TLS handshake and present its
/// token.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Single-use token → stream handoff registry.
#[derive(Default)]
pub(crate) struct TokenRegistry {
    inner: Mutex<HashMap<String, mpsc::Sender<WorkerConnection>>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for the next worker instance of a component.
    pub fn register(&self, token: String, handoff: mpsc::Sender<WorkerConnection>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(token, handoff);
    }

    /// Take a token. Single use: a second connection presenting the same
    /// token is rejected.
    pub fn take(&self, token: &str) -> Option<mpsc::Sender<WorkerConnection>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(token)
    }

    /// Invalidate a token that was never used (worker replaced or stopped).
    pub fn unregister(&self, token: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(token);
    }
}

/// Accept loop for the check-in listener. Runs until shutdown.
pub(crate) async fn run_checkin_server(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    registry: Arc<TokenRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let acceptor = TlsAcceptor::from(tls_config);
    let local_addr = listener.local_addr().ok();
    info!(addr = ?local_addr, "check-in server listening");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("check-in server shutting down");
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((tcp, peer)) => {
                        let acceptor = acceptor.clone();
                        let registry = Arc::clone(&registry);
                        tokio::spawn(async move {
                            handle_connection(acceptor, tcp, peer, registry).await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    peer: SocketAddr,
    registry: Arc<TokenRegistry>,
) {
    let tls = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(err)) => {
            debug!(%peer, error = %err, "tls handshake failed");
            return;
        }
        Err(_) => {
            debug!(%peer, "tls handshake timed out");
            return;
        }
    };

    let mut framed = Framed::new(tls, FrameCodec::new());

    let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(Frame::Hello(hello)))) => hello,
        Ok(Some(Ok(other))) => {
            debug!(%peer, frame = ?other, "expected hello as first frame");
            return;
        }
        Ok(Some(Err(err))) => {
            debug!(%peer, error = %err, "failed to read hello frame");
            return;
        }
        Ok(None) => {
            debug!(%peer, "connection closed before hello");
            return;
        }
        Err(_) => {
            debug!(%peer, "timed out waiting for hello");
            return;
        }
    };

    match registry.take(&hello.token) {
        Some(handoff) => {
            if handoff.send(framed).await.is_err() {
                debug!(%peer, "owning runtime is gone; dropping stream");
            }
        }
        None => {
            debug!(%peer, "unknown or already-used token");
        }
    }
}
