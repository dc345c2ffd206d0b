//! Listening socket and the accept loop feeding the work queue.

use crate::connection::ConnectionRecord;
use crate::error::ProxyError;
use crate::metrics::EngineMetrics;
use crate::queue::WorkQueue;
use crate::shutdown::ShutdownSignal;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};

/// Pause after a failed accept (e.g. out of file descriptors) before retrying.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub struct Acceptor {
    listener: TcpListener,
    queue: Arc<WorkQueue>,
    metrics: Arc<EngineMetrics>,
}

impl Acceptor {
    /// Bind a listening socket with `SO_REUSEADDR` and the given backlog.
    pub fn bind(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ProxyError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .map_err(|source| ProxyError::Bind { addr, source })?;
        socket
            .listen(backlog)
            .map_err(|source| ProxyError::Bind { addr, source })
    }

    pub fn new(listener: TcpListener, queue: Arc<WorkQueue>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            listener,
            queue,
            metrics,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until shutdown is triggered, wrapping each one in a new
    /// `Uninitialized` record. Returns the number of clients accepted. The
    /// listening socket is closed when this returns.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> u64 {
        let mut accepted = 0u64;

        while !shutdown.is_triggered() {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        self.metrics.record_accept();
                        let record = ConnectionRecord::new(stream, peer, self.metrics.clone());
                        debug!("{}: accepted {}", record.id(), peer);
                        self.queue.enqueue(record);
                        accepted += 1;
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        info!("Stopped accepting connections after {} client(s)", accepted);
        accepted
    }
}
