use std::sync::Arc;

use tokio::{io::AsyncBufRead, select};
use tracing::{debug, info, warn};

use crate::{
    error::StorageError,
    protocol::{read_line, Request, BLOCK_NOT_FOUND, RETRIEVE_FAILED},
    record::{sha256_hex, Record, RecordId},
    registry::{PeerHandle, PeerRegistry},
    store::RecordStore,
};

/// Where a connection is in its life. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Reading,
    Closed,
}

/// Per-connection read loop: frames lines, classifies them and dispatches
/// to the store or the broadcast path.
pub struct ConnectionHandler<R> {
    reader: R,
    peer: PeerHandle,
    store: Arc<RecordStore>,
    registry: Arc<PeerRegistry>,
}

impl<R> ConnectionHandler<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(
        reader: R,
        peer: PeerHandle,
        store: Arc<RecordStore>,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            reader,
            peer,
            store,
            registry,
        }
    }

    /// Reads until the connection closes, then removes the peer from the
    /// registry and shuts its outbound stream down.
    pub async fn run(mut self) {
        info!(peer = self.peer.id(), addr = ?self.peer.addr(), "peer connected");

        let mut state = ConnectionState::Reading;
        while state == ConnectionState::Reading {
            state = self.step().await;
        }

        self.peer.close();
        self.registry.deregister(self.peer.id()).await;
        if let Err(error) = self.peer.shutdown().await {
            debug!(peer = self.peer.id(), %error, "failed to shut down peer stream");
        }
        info!(peer = self.peer.id(), addr = ?self.peer.addr(), "peer disconnected");
    }

    /// Handles exactly one inbound line, or notices that the peer was closed
    /// by a failed write elsewhere.
    pub async fn step(&mut self) -> ConnectionState {
        let read = select! {
            biased;
            () = self.peer.closed() => {
                info!(peer = self.peer.id(), "peer closed after a failed write");
                return ConnectionState::Closed;
            }
            read = read_line(&mut self.reader) => read,
        };

        let line = match read {
            Ok(Some(line)) => line,
            Ok(None) => return ConnectionState::Closed,
            Err(error) => {
                warn!(peer = self.peer.id(), %error, "failed to read from peer");
                return ConnectionState::Closed;
            }
        };

        match Request::parse(&line) {
            Ok(None) => ConnectionState::Reading,
            Ok(Some(Request::Retrieve(id))) => self.retrieve(id).await,
            Ok(Some(Request::Publish(message))) => {
                self.publish(message).await;
                ConnectionState::Reading
            }
            Err(error) => {
                warn!(peer = self.peer.id(), %error, "malformed retrieval request, closing connection");
                ConnectionState::Closed
            }
        }
    }

    async fn retrieve(&self, id: RecordId) -> ConnectionState {
        debug!(peer = self.peer.id(), id, "retrieval requested");

        let reply = match lookup(&self.store, id).await {
            Ok(Some(record)) => match record.to_line() {
                Ok(line) => line,
                Err(error) => {
                    warn!(id, %error, "failed to encode record");
                    RETRIEVE_FAILED.to_string()
                }
            },
            Ok(None) => BLOCK_NOT_FOUND.to_string(),
            Err(error) => {
                warn!(id, %error, "failed to look up record");
                RETRIEVE_FAILED.to_string()
            }
        };

        match self.peer.send_line(&reply).await {
            Ok(()) => ConnectionState::Reading,
            Err(error) => {
                debug!(peer = self.peer.id(), %error, "failed to reply to peer");
                ConnectionState::Closed
            }
        }
    }

    async fn publish(&self, message: String) {
        match publish(&self.store, &self.registry, message).await {
            Ok(record) => debug!(peer = self.peer.id(), id = record.id, "record published"),
            Err(error) => warn!(peer = self.peer.id(), %error, "failed to store record"),
        }
    }
}

/// Hashes and persists `message`, then broadcasts it to every registered
/// peer. Nothing is broadcast if the insert fails.
pub async fn publish(
    store: &Arc<RecordStore>,
    registry: &PeerRegistry,
    message: String,
) -> Result<Record, StorageError> {
    let hash = sha256_hex(&message);
    let record = {
        let store = Arc::clone(store);
        tokio::task::spawn_blocking(move || {
            let id = store.insert(&hash, &message)?;
            Ok::<_, StorageError>(Record { id, hash, message })
        })
        .await??
    };

    match record.to_line() {
        Ok(line) => {
            let delivered = registry.broadcast(&line).await;
            debug!(id = record.id, delivered, "record broadcast");
        }
        Err(error) => warn!(id = record.id, %error, "failed to encode record"),
    }

    Ok(record)
}

pub async fn lookup(store: &Arc<RecordStore>, id: RecordId) -> Result<Option<Record>, StorageError> {
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || store.lookup(id)).await?
}
