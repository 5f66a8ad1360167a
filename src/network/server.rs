//! TCP server for the broker control channel.

use super::connection::ConnectionHandler;
use crate::broker::Broker;
use crate::metrics;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Control server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address
    pub bind_addr: SocketAddr,

    /// Maximum concurrent client connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7411".parse().unwrap(),
            max_connections: 256,
        }
    }
}

/// Control-channel server: accepts client connections and runs one
/// handler task per connection.
pub struct ControlServer {
    config: ServerConfig,
    handler: Arc<ConnectionHandler>,
    connection_semaphore: Arc<Semaphore>,
}

impl ControlServer {
    pub fn new(config: ServerConfig, broker: Arc<Broker>) -> Self {
        let handler = Arc::new(ConnectionHandler::new(broker));
        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));

        Self {
            config,
            handler,
            connection_semaphore,
        }
    }

    /// Bind the configured address. Kept separate from `serve_on` so
    /// callers binding port 0 can learn the real address first.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!(
            "membroker control channel listening on {}",
            listener.local_addr()?
        );
        Ok(listener)
    }

    pub async fn serve(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve_on(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<()> {
        loop {
            let permit = self.connection_semaphore.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    let handler = self.handler.clone();

                    tokio::spawn(async move {
                        debug!("accepted connection from {}", addr);
                        metrics::ACTIVE_CONNECTIONS.inc();

                        if let Err(e) = handler.handle(stream).await {
                            error!("connection error from {}: {}", addr, e);
                        }

                        metrics::ACTIVE_CONNECTIONS.dec();
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                    // Keep accepting; a bad accept is not fatal.
                }
            }
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    pub fn available_connections(&self) -> usize {
        self.connection_semaphore.available_permits()
    }
}
