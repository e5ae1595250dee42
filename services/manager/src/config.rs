use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// Manager configuration, loaded from `FOREMAN_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the check-in server binds to. Workers are handed the bound
    /// address, so `127.0.0.1:0` is fine for tests.
    pub listen_addr: String,

    /// TLS server name presented on the check-in listener and expected by
    /// workers.
    pub server_name: String,

    /// Root directory for per-component working directories.
    pub run_root: PathBuf,

    /// Cadence at which workers are told to check in. Independent of the
    /// per-component check-in timeout that drives the health machine.
    pub worker_checkin_period: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr =
            std::env::var("FOREMAN_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:0".to_string());

        let server_name =
            std::env::var("FOREMAN_SERVER_NAME").unwrap_or_else(|_| "localhost".to_string());

        let run_root = std::env::var("FOREMAN_RUN_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/foreman/run"));

        let worker_checkin_period = std::env::var("FOREMAN_CHECKIN_PERIOD_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(30));

        Ok(Self {
            listen_addr,
            server_name,
            run_root,
            worker_checkin_period,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            server_name: "localhost".to_string(),
            run_root: PathBuf::from("/var/lib/foreman/run"),
            worker_checkin_period: Duration::from_secs(30),
        }
    }
}
