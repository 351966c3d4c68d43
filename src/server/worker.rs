//! Worker pool
//!
//! A fixed set of OS threads, each running its own current-thread runtime
//! with a `LocalSet`. Accepted sockets are handed to one worker over that
//! worker's channel and live on it until they close; nothing about a
//! connection is shared between workers.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinSet, LocalSet};
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::ServerError;
use crate::http::connection::Connection;
use crate::http::request::ConnectionInfo;
use crate::server::transport::{BoxedStream, SecureAcceptor};

/// An accepted socket on its way to a worker.
struct Assignment {
    stream: std::net::TcpStream,
    peer: SocketAddr,
    id: u64,
    acceptor: Option<Arc<dyn SecureAcceptor>>,
}

/// Counters for one worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Connections currently owned by the worker
    live: AtomicUsize,

    /// Connections ever assigned to the worker
    accepted: AtomicU64,
}

impl WorkerStats {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

/// Decrements the live counter when a connection task ends, however it ends.
struct LiveGuard(Arc<WorkerStats>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct WorkerPool {
    /// One assignment channel per worker
    senders: Mutex<Vec<mpsc::UnboundedSender<Assignment>>>,

    /// Round-robin cursor
    next: AtomicUsize,

    /// Connection ids, unique for the life of the pool
    next_id: AtomicU64,

    stats: Vec<Arc<WorkerStats>>,

    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `workers` threads.
    ///
    /// Each worker stops taking assignments when `shutdown` flips, then
    /// gives its connections `shutdown_timeout` to finish before aborting
    /// the rest.
    pub fn start(
        workers: usize,
        dispatcher: Arc<Dispatcher>,
        shutdown: watch::Receiver<bool>,
        shutdown_timeout: Duration,
    ) -> Result<Self, ServerError> {
        let mut senders = Vec::with_capacity(workers);
        let mut stats = Vec::with_capacity(workers);
        let mut threads = Vec::with_capacity(workers);

        for worker in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker_stats = Arc::new(WorkerStats::default());

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|source| ServerError::Worker { worker, source })?;

            let ctx = WorkerContext {
                id: worker,
                dispatcher: dispatcher.clone(),
                shutdown: shutdown.clone(),
                shutdown_timeout,
                stats: worker_stats.clone(),
            };

            let handle = std::thread::Builder::new()
                .name(format!("ember-worker-{worker}"))
                .spawn(move || {
                    let local = LocalSet::new();
                    local.block_on(&runtime, ctx.run(rx));
                })
                .map_err(|source| ServerError::Worker { worker, source })?;

            senders.push(tx);
            stats.push(worker_stats);
            threads.push(handle);
        }

        info!(workers, "worker pool started");

        Ok(Self {
            senders: Mutex::new(senders),
            next: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            stats,
            threads: Mutex::new(threads),
        })
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn stats(&self) -> &[Arc<WorkerStats>] {
        &self.stats
    }

    /// Hands an accepted socket to the next worker in round-robin order and
    /// returns that worker's index.
    pub fn submit(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: Option<Arc<dyn SecureAcceptor>>,
    ) -> io::Result<usize> {
        let stream = stream.into_std()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let senders = self
            .senders
            .lock()
            .map_err(|_| io::Error::other("worker pool poisoned"))?;
        if senders.is_empty() {
            return Err(io::Error::other("worker pool is shut down"));
        }

        let worker = self.next.fetch_add(1, Ordering::Relaxed) % senders.len();
        let assignment = Assignment {
            stream,
            peer,
            id,
            acceptor,
        };
        self.stats[worker].accepted.fetch_add(1, Ordering::Relaxed);
        senders[worker]
            .send(assignment)
            .map_err(|_| io::Error::other(format!("worker {worker} has stopped")))?;

        Ok(worker)
    }

    /// Closes every assignment channel and waits for the threads to exit.
    ///
    /// Blocks; call it from a blocking context.
    pub fn join(&self) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.clear();
        }

        let threads = match self.threads.lock() {
            Ok(mut threads) => std::mem::take(&mut *threads),
            Err(_) => return,
        };
        for (worker, handle) in threads.into_iter().enumerate() {
            if handle.join().is_err() {
                error!(worker, "worker thread panicked");
            }
        }
        info!("worker pool stopped");
    }
}

struct WorkerContext {
    id: usize,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Receiver<bool>,
    shutdown_timeout: Duration,
    stats: Arc<WorkerStats>,
}

impl WorkerContext {
    async fn run(mut self, mut assignments: mpsc::UnboundedReceiver<Assignment>) {
        let mut connections = JoinSet::new();

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                assignment = assignments.recv() => match assignment {
                    Some(assignment) => self.spawn(&mut connections, assignment),
                    None => break,
                },
                _ = self.shutdown.changed() => break,
                Some(res) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            error!(worker = self.id, "connection task panicked");
                        }
                    }
                }
            }
        }

        // Stop taking assignments; queued sockets are dropped and close.
        drop(assignments);
        self.drain(connections).await;
        debug!(worker = self.id, "worker exited");
    }

    fn spawn(&self, connections: &mut JoinSet<()>, assignment: Assignment) {
        let Assignment {
            stream,
            peer,
            id,
            acceptor,
        } = assignment;

        self.stats.live.fetch_add(1, Ordering::Relaxed);
        let guard = LiveGuard(self.stats.clone());
        let info = ConnectionInfo {
            id,
            worker: self.id,
            peer: Some(peer),
        };
        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        let worker = self.id;

        connections.spawn_local(async move {
            let _guard = guard;

            let stream = match open_transport(stream, peer, acceptor).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(worker, peer = %peer, error = %e, "connection setup failed");
                    return;
                }
            };

            let conn = Connection::new(stream, dispatcher, info, shutdown);
            if let Err(e) = conn.run().await {
                debug!(worker, peer = %peer, "Connection error from {}: {:#}", peer, e);
            }
        });
    }

    /// Lets in-flight connections finish within the shutdown timeout, then
    /// aborts the rest.
    async fn drain(&self, mut connections: JoinSet<()>) {
        if connections.is_empty() {
            return;
        }

        let remaining = connections.len();
        debug!(worker = self.id, remaining, "draining connections");

        let finished = tokio::time::timeout(self.shutdown_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            warn!(
                worker = self.id,
                aborted = connections.len(),
                "connections still open after shutdown timeout; aborting"
            );
            connections.shutdown().await;
        }
    }
}

async fn open_transport(
    stream: std::net::TcpStream,
    peer: SocketAddr,
    acceptor: Option<Arc<dyn SecureAcceptor>>,
) -> io::Result<BoxedStream> {
    let stream = TcpStream::from_std(stream)?;
    let _ = stream.set_nodelay(true);

    match acceptor {
        Some(acceptor) => acceptor.accept(stream, peer).await,
        None => Ok(Box::new(stream)),
    }
}
