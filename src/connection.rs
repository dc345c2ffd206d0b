//! Connection record: one client/upstream relay in progress.
//!
//! A record is always owned by exactly one place, either the work queue or
//! the worker that dequeued it. It moves by value between the two, so no
//! locking is needed around it. Both sockets are closed when the record is
//! dropped, which happens exactly once.

use crate::metrics::EngineMetrics;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Forwarding,
    Complete,
    Failed,
}

impl ConnectionState {
    /// Complete and Failed records are retired, never stepped again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Complete | ConnectionState::Failed)
    }

    /// States only move forward. Complete is reachable from Forwarding only.
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Uninitialized, Forwarding)
                | (Uninitialized, Failed)
                | (Forwarding, Complete)
                | (Forwarding, Failed)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Uninitialized => write!(f, "uninitialized"),
            ConnectionState::Forwarding => write!(f, "forwarding"),
            ConnectionState::Complete => write!(f, "complete"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToUpstream => write!(f, "client->upstream"),
            Direction::UpstreamToClient => write!(f, "upstream->client"),
        }
    }
}

/// Upstream address derived from the client's request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub struct ConnectionRecord {
    id: ConnectionId,
    peer: SocketAddr,
    client: TcpStream,
    upstream: Option<TcpStream>,
    state: ConnectionState,
    target: Option<Target>,
    accepted_at: Instant,
    pub(crate) client_eof: bool,
    pub(crate) upstream_eof: bool,
    pub(crate) bytes_to_upstream: u64,
    pub(crate) bytes_to_client: u64,
    /// Bytes read from the client that the upstream has not accepted yet.
    pub(crate) pending_to_upstream: BytesMut,
    /// Bytes read from the upstream that the client has not accepted yet.
    pub(crate) pending_to_client: BytesMut,
    metrics: Arc<EngineMetrics>,
}

/// Mutable view of a forwarding record's sockets and write backlogs.
pub(crate) struct Pipes<'a> {
    pub client: &'a mut TcpStream,
    pub upstream: &'a mut TcpStream,
    pub to_upstream: &'a mut BytesMut,
    pub to_client: &'a mut BytesMut,
}

impl ConnectionRecord {
    /// Wrap a freshly accepted client stream. The record starts `Uninitialized`.
    pub fn new(client: TcpStream, peer: SocketAddr, metrics: Arc<EngineMetrics>) -> Self {
        metrics.socket_opened();
        Self {
            id: ConnectionId::next(),
            peer,
            client,
            upstream: None,
            state: ConnectionState::Uninitialized,
            target: None,
            accepted_at: Instant::now(),
            client_eof: false,
            upstream_eof: false,
            bytes_to_upstream: 0,
            bytes_to_client: 0,
            pending_to_upstream: BytesMut::new(),
            pending_to_client: BytesMut::new(),
            metrics,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Only meaningful once the record has left `Uninitialized`.
    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }

    pub fn bytes_to_upstream(&self) -> u64 {
        self.bytes_to_upstream
    }

    pub fn bytes_to_client(&self) -> u64 {
        self.bytes_to_client
    }

    pub fn has_upstream(&self) -> bool {
        self.upstream.is_some()
    }

    /// Number of sockets this record currently owns.
    pub fn socket_count(&self) -> usize {
        1 + usize::from(self.upstream.is_some())
    }

    pub(crate) fn client_mut(&mut self) -> &mut TcpStream {
        &mut self.client
    }

    /// Relayed bytes still waiting for a slow reader, both directions.
    pub fn pending_bytes(&self) -> usize {
        self.pending_to_upstream.len() + self.pending_to_client.len()
    }

    /// Both streams and their backlogs at once, for relaying. `None` until
    /// an upstream is attached.
    pub(crate) fn pipes_mut(&mut self) -> Option<Pipes<'_>> {
        let upstream = self.upstream.as_mut()?;
        Some(Pipes {
            client: &mut self.client,
            upstream,
            to_upstream: &mut self.pending_to_upstream,
            to_client: &mut self.pending_to_client,
        })
    }

    pub(crate) fn set_target(&mut self, target: Target) {
        self.target = Some(target);
    }

    /// Hand a connected, request-primed upstream to the record.
    pub(crate) fn attach_upstream(&mut self, upstream: TcpStream) {
        debug_assert!(self.upstream.is_none(), "upstream attached twice");
        self.metrics.socket_opened();
        self.upstream = Some(upstream);
        self.advance(ConnectionState::Forwarding);
    }

    pub(crate) fn mark_failed(&mut self) {
        self.advance(ConnectionState::Failed);
    }

    pub(crate) fn mark_complete(&mut self) {
        self.advance(ConnectionState::Complete);
    }

    fn advance(&mut self, next: ConnectionState) {
        if !self.state.can_advance_to(next) {
            debug_assert!(false, "{}: illegal transition {} -> {}", self.id, self.state, next);
            log::error!("{}: refusing transition {} -> {}", self.id, self.state, next);
            return;
        }
        self.state = next;
    }

    /// Close both sockets and discard the record. Returns the number of
    /// sockets closed.
    pub fn retire(self) -> usize {
        let closed = self.socket_count();
        match self.state {
            ConnectionState::Complete => self.metrics.record_completed(),
            ConnectionState::Failed => self.metrics.record_failed(),
            _ => {}
        }
        log::debug!(
            "{}: retiring in state {} ({} -> {}, {} bytes up, {} bytes down, {} unsent, {:?} old)",
            self.id,
            self.state,
            self.peer,
            self.target.as_ref().map(|t| t.to_string()).unwrap_or_else(|| "-".to_string()),
            self.bytes_to_upstream,
            self.bytes_to_client,
            self.pending_bytes(),
            self.age()
        );
        drop(self);
        closed
    }
}

impl Drop for ConnectionRecord {
    fn drop(&mut self) {
        // The streams themselves close when the fields drop right after this.
        for _ in 0..self.socket_count() {
            self.metrics.socket_closed();
        }
        self.metrics.record_retired();
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("target", &self.target)
            .field("has_upstream", &self.upstream.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    #[test]
    fn test_state_transitions_only_move_forward() {
        use ConnectionState::*;
        assert!(Uninitialized.can_advance_to(Forwarding));
        assert!(Uninitialized.can_advance_to(Failed));
        assert!(Forwarding.can_advance_to(Complete));
        assert!(Forwarding.can_advance_to(Failed));

        assert!(!Uninitialized.can_advance_to(Complete));
        assert!(!Forwarding.can_advance_to(Uninitialized));
        assert!(!Complete.can_advance_to(Forwarding));
        assert!(!Failed.can_advance_to(Complete));
        assert!(!Complete.can_advance_to(Failed));
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
        assert!(a.to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn test_retire_closes_every_owned_socket() {
        let metrics = Arc::new(EngineMetrics::new());
        let (_client_side, accepted, peer) = loopback_pair().await;
        let (_upstream_side, upstream, _) = loopback_pair().await;

        let mut record = ConnectionRecord::new(accepted, peer, metrics.clone());
        assert_eq!(record.state(), ConnectionState::Uninitialized);
        assert_eq!(metrics.open_sockets(), 1);

        record.set_target(Target { host: "localhost".to_string(), port: 80 });
        record.attach_upstream(upstream);
        assert_eq!(record.state(), ConnectionState::Forwarding);
        assert_eq!(metrics.open_sockets(), 2);

        record.mark_complete();
        assert_eq!(record.retire(), 2);
        assert_eq!(metrics.open_sockets(), 0);
        assert_eq!(metrics.summary().connections_completed, 1);
    }

    #[tokio::test]
    async fn test_dropping_a_record_closes_the_client() {
        let metrics = Arc::new(EngineMetrics::new());
        let (mut client_side, accepted, peer) = loopback_pair().await;

        let record = ConnectionRecord::new(accepted, peer, metrics.clone());
        drop(record);

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 8];
        let n = client_side.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(metrics.open_sockets(), 0);
    }
}
