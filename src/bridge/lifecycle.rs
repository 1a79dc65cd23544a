//! Bridge lifecycle with statum state machine
//!
//! Wires the connection manager, outbound queue, publisher loop and HTTP
//! listener together and tears them down in order on shutdown.
//!
//! # State Machine
//!
//! ```text
//! Starting ──► Serving ──► Draining ──► Stopped
//!    │                        ▲
//!    └── connect/bind error   │
//!        (fatal, no serving)  └── interrupt or HTTP listener failure
//! ```
//!
//! # Shutdown Order
//!
//! 1. Close the outbound queue (new enqueues are rejected with 503)
//! 2. Stop accepting HTTP connections; in-flight requests may finish
//! 3. Wait for the publisher loop to drain everything already queued
//! 4. Give the HTTP listener `shutdown_grace` to finish
//! 5. Disconnect from the broker

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use statum::{machine, state};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::publisher::PublisherLoop;
use super::queue::OutboundQueue;
use crate::config::BridgeConfig;
use crate::ingest;
use crate::mqtt::connection_manager::{ConnectError, ConnectionManager};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Unable to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("HTTP listener failed: {0}")]
    Server(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum BridgeState {
    Starting, // Nothing connected yet
    Serving,  // Broker connected, HTTP listener accepting
    Draining, // Shutdown requested, queue being emptied
    Stopped,  // Everything released
}

#[machine]
pub struct Bridge<S: BridgeState> {
    config: BridgeConfig,
    connection: Option<Arc<ConnectionManager>>,
    queue: Option<OutboundQueue>,
    publisher: Option<JoinHandle<usize>>,
    server: Option<JoinHandle<io::Result<()>>>,
    http_shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
    fault: Option<BridgeError>,
    published: usize,
}

impl Bridge<Starting> {
    pub fn create(config: BridgeConfig) -> Self {
        Self::new(
            config,
            None,                     // connection
            None,                     // queue
            None,                     // publisher
            None,                     // server
            CancellationToken::new(), // http_shutdown
            None,                     // local_addr
            None,                     // fault
            0,                        // published
        )
    }

    /// Connects to the broker, then opens the HTTP listener.
    ///
    /// The broker connection comes first so that an unreachable broker or
    /// rejected credentials abort startup before any request is accepted.
    pub async fn start(mut self) -> Result<Bridge<Serving>, BridgeError> {
        let connection = Arc::new(ConnectionManager::connect(&self.config.mqtt).await?);

        let addr = self.config.listen_addr;
        let (listener, local_addr) = match listen(addr).await {
            Ok(bound) => bound,
            Err(source) => {
                connection.close().await;
                return Err(BridgeError::Bind { addr, source });
            }
        };

        let (queue, receiver) = OutboundQueue::bounded(self.config.queue_capacity);
        debug!("Outbound queue capacity: {}", queue.capacity());
        let publisher = PublisherLoop::spawn(receiver, connection.clone());

        let app = ingest::router(queue.clone(), self.config.max_body_bytes);
        let shutdown = self.http_shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        });

        info!("Listening on {}", local_addr);

        self.connection = Some(connection);
        self.queue = Some(queue);
        self.publisher = Some(publisher);
        self.server = Some(server);
        self.local_addr = Some(local_addr);
        Ok(self.transition())
    }
}

async fn listen(addr: SocketAddr) -> io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

impl Bridge<Serving> {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Serves until `shutdown_signal` resolves or the HTTP listener dies.
    pub async fn run_until_shutdown<F>(mut self, shutdown_signal: F) -> Bridge<Draining>
    where
        F: Future<Output = ()>,
    {
        let server_exit = match self.server.as_mut() {
            Some(server) => tokio::select! {
                _ = shutdown_signal => None,
                exit = server => Some(exit),
            },
            None => {
                shutdown_signal.await;
                None
            }
        };

        match server_exit {
            None => info!("Shutdown signal received"),
            Some(exit) => {
                self.server = None;
                let reason = match exit {
                    Ok(Ok(())) => "listener stopped unexpectedly".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => format!("listener task panicked: {}", e),
                };
                error!("HTTP listener failed: {}", reason);
                self.fault = Some(BridgeError::Server(reason));
            }
        }

        self.transition()
    }
}

impl Bridge<Draining> {
    /// Closes the queue, waits for the publisher loop to drain it and releases
    /// the listener and the broker connection.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Server`] after a complete drain if the HTTP
    /// listener failed while serving.
    pub async fn drain(mut self) -> Result<Bridge<Stopped>, BridgeError> {
        if let Some(queue) = &self.queue {
            queue.close();
        }
        self.http_shutdown.cancel();

        if let Some(publisher) = self.publisher.take() {
            match publisher.await {
                Ok(published) => self.published = published,
                Err(e) => error!("Publisher loop panicked: {}", e),
            }
        }

        if let Some(mut server) = self.server.take() {
            let grace = self.config.shutdown_grace;
            match tokio::time::timeout(grace, &mut server).await {
                Ok(Ok(Ok(()))) => debug!("HTTP listener stopped"),
                Ok(Ok(Err(e))) => error!("HTTP listener failed during shutdown: {}", e),
                Ok(Err(e)) => error!("HTTP listener task panicked: {}", e),
                Err(_) => {
                    warn!("HTTP listener did not stop within {:?}, aborting", grace);
                    server.abort();
                }
            }
        }

        if let Some(connection) = &self.connection {
            connection.close().await;
        }

        info!("Finished");
        match self.fault.take() {
            Some(fault) => Err(fault),
            None => Ok(self.transition()),
        }
    }
}

impl Bridge<Stopped> {
    /// Messages forwarded to the broker over the bridge's lifetime.
    pub fn published(&self) -> usize {
        self.published
    }
}
