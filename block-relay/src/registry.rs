//! Connected peers and the broadcast fan-out.
//!
//! A single lock guards the peer map, and `broadcast` holds it for the whole
//! sweep so that every peer sees records in the same order. Each peer also
//! carries its own writer lock, which the connection handler takes for
//! direct replies; the handler never takes the registry lock while holding
//! it, so the two cannot deadlock.
//!
//! A peer whose write fails or times out is closed, not just forgotten: its
//! stream may end in a partial line, so its handler must stop as well.

use std::{
    collections::BTreeMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{watch, Mutex},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::protocol::write_line;

pub type PeerId = u64;

type PeerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The outbound half of one connection plus what the transport told us
/// about the other end.
#[derive(Clone)]
pub struct PeerHandle {
    id: PeerId,
    addr: Option<SocketAddr>,
    writer: Arc<Mutex<PeerWriter>>,
    write_timeout: Option<Duration>,
    closed: Arc<watch::Sender<bool>>,
}

impl PeerHandle {
    fn new(
        id: PeerId,
        addr: Option<SocketAddr>,
        writer: PeerWriter,
        write_timeout: Option<Duration>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            addr,
            writer: Arc::new(Mutex::new(writer)),
            write_timeout,
            closed: Arc::new(closed),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Writes one line to this peer only, bounded by the write timeout.
    ///
    /// Any failure closes the peer, since the stream may now hold a partial
    /// line.
    pub async fn send_line(&self, line: &str) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "peer is closed"));
        }

        let result = match self.write_timeout {
            Some(limit) => timeout(limit, self.write(line))
                .await
                .unwrap_or_else(|_| {
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("write did not finish within {limit:?}"),
                    ))
                }),
            None => self.write(line).await,
        };

        if result.is_err() {
            self.close();
        }
        result
    }

    async fn write(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        write_line(&mut *writer, line).await
    }

    /// Marks the peer closed; its handler stops at the next line boundary.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the peer has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Shuts down the outbound stream so the other end sees end of stream.
    pub async fn shutdown(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await
    }
}

pub struct PeerRegistry {
    peers: Mutex<BTreeMap<PeerId, PeerHandle>>,
    next_id: AtomicU64,
    write_timeout: Option<Duration>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PeerRegistry {
    /// `write_timeout` bounds every write to a peer, broadcast or direct
    /// reply; `None` waits as long as the peer takes.
    pub fn new(write_timeout: Option<Duration>) -> Self {
        Self {
            peers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            write_timeout,
        }
    }

    fn next_id(&self) -> PeerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds a peer. Ids grow monotonically, so the map iterates in
    /// registration order.
    pub async fn register<W>(&self, writer: W, addr: Option<SocketAddr>) -> PeerHandle
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let handle = PeerHandle::new(self.next_id(), addr, Box::new(writer), self.write_timeout);

        let mut peers = self.peers.lock().await;
        peers.insert(handle.id, handle.clone());
        debug!(peer = handle.id, ?addr, total = peers.len(), "peer registered");
        handle
    }

    /// Removes a peer. Returns false if it was already gone, e.g. dropped by
    /// a failed broadcast write.
    pub async fn deregister(&self, id: PeerId) -> bool {
        let mut peers = self.peers.lock().await;
        let removed = peers.remove(&id).is_some();
        if removed {
            debug!(peer = id, total = peers.len(), "peer deregistered");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    /// Writes `line` to every registered peer in registration order and
    /// returns how many peers received it.
    ///
    /// A failed or timed-out write is logged, and that peer is closed and
    /// dropped from the registry; delivery to the remaining peers continues.
    pub async fn broadcast(&self, line: &str) -> usize {
        let mut peers = self.peers.lock().await;
        let mut failed = Vec::new();

        for (id, peer) in peers.iter() {
            match peer.send_line(line).await {
                Ok(()) => {}
                Err(error) => {
                    warn!(peer = id, addr = ?peer.addr, %error, "failed to deliver record to peer");
                    failed.push(*id);
                }
            }
        }

        for id in &failed {
            peers.remove(id);
        }
        if !failed.is_empty() {
            info!(dropped = failed.len(), remaining = peers.len(), "dropped unreachable peers");
        }

        peers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::*;

    /// A writer whose every operation fails, standing in for a dead socket.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn next_line<R>(reader: &mut BufReader<R>) -> String
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read line");
        line
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer() {
        let registry = PeerRegistry::default();
        let (tx_one, rx_one) = tokio::io::duplex(256);
        let (tx_two, rx_two) = tokio::io::duplex(256);
        registry.register(tx_one, None).await;
        registry.register(tx_two, None).await;

        assert_eq!(registry.broadcast("record").await, 2);

        assert_eq!(next_line(&mut BufReader::new(rx_one)).await, "record\n");
        assert_eq!(next_line(&mut BufReader::new(rx_two)).await, "record\n");
    }

    #[tokio::test]
    async fn failed_peer_is_dropped_without_blocking_others() {
        let registry = PeerRegistry::default();
        let (tx_before, rx_before) = tokio::io::duplex(256);
        let (tx_after, rx_after) = tokio::io::duplex(256);
        registry.register(tx_before, None).await;
        let broken = registry.register(BrokenPipe, None).await;
        registry.register(tx_after, None).await;

        assert_eq!(registry.broadcast("first").await, 2);
        assert_eq!(registry.len().await, 2);
        assert!(broken.is_closed());
        assert!(!registry.deregister(broken.id()).await);

        assert_eq!(registry.broadcast("second").await, 2);

        let mut before = BufReader::new(rx_before);
        let mut after = BufReader::new(rx_after);
        assert_eq!(next_line(&mut before).await, "first\n");
        assert_eq!(next_line(&mut before).await, "second\n");
        assert_eq!(next_line(&mut after).await, "first\n");
        assert_eq!(next_line(&mut after).await, "second\n");
    }

    #[tokio::test]
    async fn stalled_peer_times_out() {
        let registry = PeerRegistry::new(Some(Duration::from_millis(50)));
        // Nobody reads this side, so the tiny buffer fills and writes stall.
        let (tx_stalled, _rx_stalled) = tokio::io::duplex(4);
        let (tx_live, rx_live) = tokio::io::duplex(256);
        let stalled = registry.register(tx_stalled, None).await;
        let live = registry.register(tx_live, None).await;

        assert_eq!(registry.broadcast("longer than four bytes").await, 1);
        assert!(stalled.is_closed());
        assert!(!live.is_closed());
        // A closed peer refuses further writes instead of appending to the
        // partial line already in its stream.
        let refused = stalled.send_line("direct reply").await.expect_err("peer is closed");
        assert_eq!(refused.kind(), io::ErrorKind::NotConnected);
        assert_eq!(
            next_line(&mut BufReader::new(rx_live)).await,
            "longer than four bytes\n"
        );
    }

    #[tokio::test]
    async fn closed_resolves_after_close() {
        let registry = PeerRegistry::default();
        let (tx, _rx) = tokio::io::duplex(64);
        let peer = registry.register(tx, None).await;

        let waiter = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.closed().await })
        };
        peer.close();

        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed should resolve")
            .expect("waiter task");
        // Already closed: resolves immediately.
        timeout(Duration::from_secs(1), peer.closed())
            .await
            .expect("closed should resolve again");
    }

    #[tokio::test]
    async fn deregister_removes_peer() {
        let registry = PeerRegistry::default();
        let (tx, _rx) = tokio::io::duplex(64);
        let peer = registry.register(tx, None).await;
        assert_eq!(registry.len().await, 1);

        assert!(registry.deregister(peer.id()).await);
        assert!(registry.is_empty().await);
        assert_eq!(registry.broadcast("nobody").await, 0);
    }

    #[tokio::test]
    async fn peer_ids_follow_registration_order() {
        let registry = PeerRegistry::default();
        let (a, _ra) = tokio::io::duplex(64);
        let (b, _rb) = tokio::io::duplex(64);
        let first = registry.register(a, None).await;
        let second = registry.register(b, None).await;
        assert!(first.id() < second.id());
    }
}
