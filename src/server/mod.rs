//! Server lifecycle: binding listeners, starting workers, shutting down.
//!
//! ```no_run
//! use ember::{Config, ListenAddress, Router, Server};
//! use ember::http::request::Request;
//! use ember::http::response::Response;
//!
//! async fn hello(_req: Request) -> anyhow::Result<Response> {
//!     Ok(Response::ok("hello"))
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::builder([ListenAddress::plain("127.0.0.1", 8080)]).build()?;
//! let mut router = Router::new();
//! router.get("/", hello)?;
//!
//! let server = Server::new(config, router).start().await?;
//! tokio::signal::ctrl_c().await?;
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod listener;
pub mod transport;
pub mod worker;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, Protocol};
use crate::dispatch::Dispatcher;
use crate::error::{BindError, ServerError};
use crate::router::Router;
pub use transport::{BoxedStream, SecureAcceptor, Transport};
pub use worker::WorkerStats;
use worker::WorkerPool;

pub struct Server {
    config: Config,
    router: Router,
    acceptor: Option<Arc<dyn SecureAcceptor>>,
}

impl Server {
    pub fn new(config: Config, router: Router) -> Self {
        Self {
            config,
            router,
            acceptor: None,
        }
    }

    /// Handshake used for every [`Protocol::Secure`] address.
    pub fn with_secure_acceptor(mut self, acceptor: Arc<dyn SecureAcceptor>) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Binds every configured address and starts the workers.
    ///
    /// An address that fails to bind is skipped and reported through
    /// [`RunningServer::bind_errors`]; only when none bind is this an error.
    pub async fn start(self) -> Result<RunningServer, ServerError> {
        let Server {
            config,
            router,
            acceptor,
        } = self;

        let mut listeners = Vec::new();
        let mut bind_errors = Vec::new();

        for address in config.addresses() {
            if address.protocol == Protocol::Secure && acceptor.is_none() {
                bind_errors.push(BindError {
                    address: address.clone(),
                    source: io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "secure address configured without a secure acceptor",
                    ),
                });
                continue;
            }

            match listener::bind(address).await {
                Ok(l) => listeners.push((address.clone(), l)),
                Err(e) => bind_errors.push(e),
            }
        }

        for e in &bind_errors {
            error!("{}", e);
        }
        if listeners.is_empty() {
            return Err(ServerError::NoListeners(bind_errors));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::new(Dispatcher::new(&config, router));
        let pool = Arc::new(WorkerPool::start(
            config.worker_threads(),
            dispatcher,
            shutdown_rx.clone(),
            config.shutdown_timeout(),
        )?);

        let mut local_addrs = Vec::with_capacity(listeners.len());
        let mut tasks = Vec::with_capacity(listeners.len());
        for (address, l) in listeners {
            local_addrs.push(l.local_addr().map_err(|source| {
                ServerError::NoListeners(vec![BindError {
                    address: address.clone(),
                    source,
                }])
            })?);
            let acceptor = match address.protocol {
                Protocol::Secure => acceptor.clone(),
                Protocol::Plain => None,
            };
            tasks.push(tokio::spawn(listener::run(
                l,
                address,
                pool.clone(),
                acceptor,
                shutdown_rx.clone(),
            )));
        }

        info!(listeners = local_addrs.len(), workers = pool.len(), "server started");

        Ok(RunningServer {
            local_addrs,
            bind_errors,
            shutdown_tx,
            listeners: tasks,
            pool,
        })
    }
}

/// Handle to a started server.
pub struct RunningServer {
    local_addrs: Vec<SocketAddr>,
    bind_errors: Vec<BindError>,
    shutdown_tx: watch::Sender<bool>,
    listeners: Vec<JoinHandle<()>>,
    pool: Arc<WorkerPool>,
}

impl RunningServer {
    /// Addresses actually bound, in configuration order (port `0` resolved).
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn bind_errors(&self) -> &[BindError] {
        &self.bind_errors
    }

    pub fn worker_stats(&self) -> &[Arc<WorkerStats>] {
        self.pool.stats()
    }

    /// Stops accepting, closes idle connections, lets in-flight responses
    /// finish within `shutdown_timeout`, aborts stragglers and joins the
    /// worker threads.
    pub async fn shutdown(self) {
        info!("Shutting down");
        let _ = self.shutdown_tx.send(true);

        for task in self.listeners {
            if let Err(e) = task.await {
                warn!(error = %e, "listener task failed");
            }
        }

        let pool = self.pool;
        if let Err(e) = tokio::task::spawn_blocking(move || pool.join()).await {
            error!(error = %e, "joining workers failed");
        }
        info!("Shutdown complete");
    }
}
