//! The daemon: one router plus the transports it listens on.

use std::net::SocketAddr;
use std::sync::Arc;

use meshbus_router::Router;
use meshbus_transport::TcpTransport;
use tracing::info;

use crate::config::NodeConfig;
use crate::error::NodeError;

pub struct Node {
    config: NodeConfig,
    router: Router,
    tcp_addrs: Vec<SocketAddr>,
    started: bool,
}

/// Stops a running [`Node`] from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    router: Router,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.router.stop();
    }
}

impl Node {
    /// Build the router from `config`. Fails on bad key material.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let credentials = config.security.credentials()?;
        let router = Router::new(config.router.clone(), Arc::new(credentials));
        Ok(Self {
            config,
            router,
            tcp_addrs: Vec::new(),
            started: false,
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Bound TCP addresses, in configuration order. Empty before [`start`](Self::start).
    pub fn tcp_addrs(&self) -> &[SocketAddr] {
        &self.tcp_addrs
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            router: self.router.clone(),
        }
    }

    /// Start the router and bind every configured listener.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if self.started {
            return Err(NodeError::AlreadyRunning);
        }
        self.router.start().await?;
        self.started = true;

        for entry in &self.config.listen.tcp {
            let transport = TcpTransport::bind(entry.to_tcp_config()?).await?;
            self.tcp_addrs.push(transport.local_addr());
            self.router.listen(transport).await?;
        }
        info!(
            bus = %self.router.bus_name(),
            tcp_listeners = self.tcp_addrs.len(),
            mechanisms = ?self.config.router.mechanisms,
            "node started"
        );
        Ok(())
    }

    /// Run until a [`ShutdownHandle`] fires, then wind the router down.
    pub async fn run(self) {
        self.router.join().await;
        info!("node stopped");
    }

    /// Stop and wait for every task to finish.
    pub async fn shutdown(self) {
        info!("shutting down node");
        self.router.stop();
        self.run().await;
    }
}
