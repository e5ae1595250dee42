//! Connection info handed to a worker process on launch.
//!
//! The manager writes this blob to the child's stdin as a single JSON
//! document and closes the pipe; EOF terminates the document. Certificate
//! material travels as base64-encoded DER.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::WireError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Manager check-in address, `host:port`.
    pub addr: String,

    /// TLS server name expected on the manager certificate.
    pub server_name: String,

    /// Single-use stream token for this worker instance.
    pub token: String,

    /// How often the worker must check in, in milliseconds.
    pub checkin_period_ms: u64,

    /// Manager CA certificate (base64 DER).
    pub ca_cert: String,

    /// This worker's client certificate (base64 DER).
    pub cert: String,

    /// This worker's private key (base64 PKCS#8 DER).
    pub key: String,
}

impl ConnectionInfo {
    pub fn checkin_period(&self) -> Duration {
        Duration::from_millis(self.checkin_period_ms)
    }

    /// Serialize for writing to a child's stdin.
    pub fn to_json(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Read a blob from the given reader until EOF and parse it. Workers
    /// call this with their stdin.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, WireError> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn ca_der(&self) -> Result<Vec<u8>, WireError> {
        Ok(BASE64.decode(&self.ca_cert)?)
    }

    pub fn cert_der(&self) -> Result<Vec<u8>, WireError> {
        Ok(BASE64.decode(&self.cert)?)
    }

    pub fn key_der(&self) -> Result<Vec<u8>, WireError> {
        Ok(BASE64.decode(&self.key)?)
    }

    /// Encode raw DER for embedding in a blob.
    pub fn encode_der(der: &[u8]) -> String {
        BASE64.encode(der)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blob_round_trips_through_a_pipe() {
        let info = ConnectionInfo {
            addr: "127.0.0.1:6789".to_string(),
            server_name: "localhost".to_string(),
            token: "tok".to_string(),
            checkin_period_ms: 500,
            ca_cert: ConnectionInfo::encode_der(b"ca"),
            cert: ConnectionInfo::encode_der(b"cert"),
            key: ConnectionInfo::encode_der(b"key"),
        };

        let raw = info.to_json().unwrap();
        let mut reader = std::io::Cursor::new(raw);
        let back = ConnectionInfo::read_from(&mut reader).await.unwrap();

        assert_eq!(back, info);
        assert_eq!(back.checkin_period(), Duration::from_millis(500));
        assert_eq!(back.ca_der().unwrap(), b"ca");
        assert_eq!(back.cert_der().unwrap(), b"cert");
        assert_eq!(back.key_der().unwrap(), b"key");
    }
}
