//! Shared helpers for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use forward_relay::error::{ProxyError, ResolveError};
use forward_relay::metrics::EngineMetrics;
use forward_relay::resolver::Resolver;
use forward_relay::shutdown::DrainReport;
use forward_relay::{Config, ForwardProxy, Shutdown};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Resolver answering from a fixed table; unknown hosts fail.
#[derive(Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Ipv4Addr>,
    lookups: AtomicUsize,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, ip: Ipv4Addr) -> Self {
        self.hosts.insert(host.to_string(), ip);
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Ipv4Addr, ResolveError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.hosts
            .get(host)
            .copied()
            .ok_or_else(|| ResolveError::NoAddress(host.to_string()))
    }
}

pub fn test_config(workers: usize) -> Config {
    Config {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        worker_threads: workers,
        connect_timeout_secs: 2,
        request_timeout_secs: 2,
        shutdown_grace_secs: 1,
        ..Config::default()
    }
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub metrics: Arc<EngineMetrics>,
    handle: JoinHandle<Result<DrainReport, ProxyError>>,
}

impl TestProxy {
    pub async fn start(config: Config, resolver: Arc<dyn Resolver>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = ForwardProxy::with_resolver(config, resolver);
        let metrics = proxy.metrics();
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(proxy.serve(listener, shutdown.clone()));

        Self {
            addr,
            shutdown,
            metrics,
            handle,
        }
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    /// Trigger shutdown and wait for the drain to finish.
    pub async fn stop(self, signum: i32) -> DrainReport {
        self.shutdown.trigger(signum);
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("proxy did not stop in time")
            .unwrap()
            .unwrap()
    }
}

/// Upstream that accepts `connections` clients, reads each request head,
/// reports it and answers with `response`, then closes.
pub async fn spawn_upstream(
    response: &'static [u8],
    connections: usize,
) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        for _ in 0..connections {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                let _ = tx.send(head);
                let _ = stream.write_all(response).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, rx)
}

/// Read until the blank line ending an HTTP head, or EOF.
pub async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") && !head.ends_with(b"\n\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    head
}

/// Read everything until the peer closes.
pub async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("peer did not close in time")
        .ok();
    out
}

/// Poll `cond` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
