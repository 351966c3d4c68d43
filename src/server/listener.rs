use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ListenAddress;
use crate::error::BindError;
use crate::server::transport::SecureAcceptor;
use crate::server::worker::WorkerPool;

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub async fn bind(address: &ListenAddress) -> Result<TcpListener, BindError> {
    TcpListener::bind(address.authority())
        .await
        .map_err(|source| BindError {
            address: address.clone(),
            source,
        })
}

/// Accepts connections until `shutdown` flips, handing each to the pool.
pub async fn run(
    listener: TcpListener,
    address: ListenAddress,
    pool: Arc<WorkerPool>,
    acceptor: Option<Arc<dyn SecureAcceptor>>,
    mut shutdown: watch::Receiver<bool>,
) {
    match listener.local_addr() {
        Ok(local) => info!("Listening on {} ({})", local, address.protocol),
        Err(_) => info!("Listening on {}", address),
    }

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    match pool.submit(socket, peer, acceptor.clone()) {
                        Ok(worker) => debug!(peer = %peer, worker, "Accepted connection"),
                        Err(e) => warn!(peer = %peer, error = %e, "Could not hand off connection"),
                    }
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    info!("Stopped listening on {}", address);
}
