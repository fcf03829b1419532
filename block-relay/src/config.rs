use std::{net::SocketAddr, path::PathBuf, time::Duration};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
pub const DEFAULT_SERVER: &str = "127.0.0.1:8080";
pub const DEFAULT_DATABASE: &str = "./blockchain.db";
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_AUDIT_INTERVAL_SECS: u64 = 10;

/// Everything the relay needs at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub database: PathBuf,
    /// Upper bound on a single peer write during broadcast.
    pub write_timeout: Option<Duration>,
    /// How often to log the contents of the record log, if at all.
    pub audit_interval: Option<Duration>,
}

impl RelayConfig {
    pub fn new(listen: SocketAddr, database: impl Into<PathBuf>) -> Self {
        Self {
            listen,
            database: database.into(),
            write_timeout: Some(Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS)),
            audit_interval: Some(Duration::from_secs(DEFAULT_AUDIT_INTERVAL_SECS)),
        }
    }
}

/// Maps the command line convention "0 disables" onto an optional duration.
pub(crate) fn nonzero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}
