use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    handler::ConnectionHandler,
    registry::PeerRegistry,
    store::RecordStore,
};

/// Owns the listening socket and the shared state every handler uses.
pub struct Server {
    listener: TcpListener,
    store: Arc<RecordStore>,
    registry: Arc<PeerRegistry>,
    audit_interval: Option<Duration>,
}

impl Server {
    pub fn new(listener: TcpListener, store: Arc<RecordStore>, registry: Arc<PeerRegistry>) -> Self {
        Self {
            listener,
            store,
            registry,
            audit_interval: None,
        }
    }

    /// Opens the record store and binds the listener described by `config`.
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let store = RecordStore::open(&config.database).with_context(|| {
            format!("failed to open record store at {}", config.database.display())
        })?;
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;

        let server = Self::new(
            listener,
            Arc::new(store),
            Arc::new(PeerRegistry::new(config.write_timeout)),
        );
        Ok(match config.audit_interval {
            Some(interval) => server.with_audit_interval(interval),
            None => server,
        })
    }

    pub fn with_audit_interval(mut self, interval: Duration) -> Self {
        self.audit_interval = Some(interval);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Accepts connections until `shutdown` resolves. Handlers already
    /// running are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            store,
            registry,
            audit_interval,
        } = self;
        tokio::pin!(shutdown);

        let audit = audit_interval.map(|interval| spawn_audit(Arc::clone(&store), interval));

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &store, &registry).await;
                }
            }
        }

        if let Some(audit) = audit {
            audit.abort();
        }
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    store: &Arc<RecordStore>,
    registry: &Arc<PeerRegistry>,
) {
    match result {
        Ok((stream, addr)) => spawn_connection_handler(stream, addr, store, registry).await,
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

/// Registers the peer before its handler starts, so it receives every
/// broadcast from then on.
async fn spawn_connection_handler(
    stream: TcpStream,
    addr: SocketAddr,
    store: &Arc<RecordStore>,
    registry: &Arc<PeerRegistry>,
) {
    let (reader, writer) = stream.into_split();
    let peer = registry.register(writer, Some(addr)).await;

    let handler = ConnectionHandler::new(
        BufReader::new(reader),
        peer,
        Arc::clone(store),
        Arc::clone(registry),
    );
    tokio::spawn(handler.run());
}

fn spawn_audit(store: Arc<RecordStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; skip it so the first audit
        // lands one interval after startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let store = Arc::clone(&store);
            match tokio::task::spawn_blocking(move || store.all()).await {
                Ok(Ok(records)) => {
                    info!(records = records.len(), "record log audit");
                    for record in &records {
                        if record.verify() {
                            debug!(id = record.id, hash = %record.hash, message = %record.message, "record");
                        } else {
                            warn!(id = record.id, hash = %record.hash, "record hash does not match its message");
                        }
                    }
                }
                Ok(Err(error)) => warn!(%error, "record log audit failed"),
                Err(error) => warn!(%error, "record log audit task failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::sha256_hex;

    #[tokio::test]
    async fn bind_creates_store_and_listener() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = RelayConfig::new("127.0.0.1:0".parse().expect("addr"), dir.path().join("relay.db"));
        config.audit_interval = Some(Duration::from_secs(60));

        let server = Server::bind(&config).await.expect("bind");
        assert_ne!(server.local_addr().expect("addr").port(), 0);
        assert_eq!(server.audit_interval, Some(Duration::from_secs(60)));
        assert_eq!(server.store().count().expect("count"), 0);
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn bind_fails_for_unopenable_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RelayConfig::new(
            "127.0.0.1:0".parse().expect("addr"),
            dir.path().join("missing").join("relay.db"),
        );
        assert!(Server::bind(&config).await.is_err());
    }

    #[tokio::test]
    async fn audit_runs_without_disturbing_the_store() {
        let store = Arc::new(RecordStore::in_memory().expect("store"));
        store.insert(&sha256_hex("a"), "a").expect("insert");

        let audit = spawn_audit(Arc::clone(&store), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        audit.abort();

        assert_eq!(store.count().expect("count"), 1);
    }
}
