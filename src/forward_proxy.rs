use crate::acceptor::Acceptor;
use crate::config::Config;
use crate::error::ProxyError;
use crate::metrics::EngineMetrics;
use crate::queue::WorkQueue;
use crate::resolver::{Resolver, SystemResolver};
use crate::shutdown::{DrainReport, Shutdown, ShutdownCoordinator};
use crate::worker::{Dispatcher, WorkerPool};
use log::info;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Forwarding HTTP proxy: acceptor, shared queue and worker pool.
pub struct ForwardProxy {
    config: Config,
    resolver: Arc<dyn Resolver>,
    metrics: Arc<EngineMetrics>,
}

impl ForwardProxy {
    pub fn new(config: Config) -> Self {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    pub fn with_resolver(config: Config, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            config,
            resolver,
            metrics: Arc::new(EngineMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    /// Bind the configured address and serve until `shutdown` is triggered.
    pub async fn run(self, shutdown: Shutdown) -> Result<DrainReport, ProxyError> {
        let listener = Acceptor::bind(self.config.listen_addr, self.config.listen_backlog)?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener. Returns once shutdown has been
    /// triggered and every in-flight connection has been retired.
    pub async fn serve(self, listener: TcpListener, shutdown: Shutdown) -> Result<DrainReport, ProxyError> {
        let local_addr = listener.local_addr()?;
        let queue = Arc::new(WorkQueue::new());
        let dispatcher = Arc::new(Dispatcher::new(&self.config, self.resolver.clone(), self.metrics.clone()));

        let workers = WorkerPool::spawn(
            self.config.worker_threads,
            queue.clone(),
            dispatcher,
            shutdown.subscribe(),
        );

        info!("HTTP forward proxy listening on: {}", local_addr);
        Acceptor::new(listener, queue.clone(), self.metrics.clone())
            .run(shutdown.subscribe())
            .await;

        let report = ShutdownCoordinator::new(self.config.shutdown_grace())
            .drain(&queue, workers)
            .await;

        info!("Final metrics: {}", self.metrics.summary().to_json());
        Ok(report)
    }
}
