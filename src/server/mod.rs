//! HTTP surfaces
//!
//! Every internal stage runs the generic task worker router; the ingress
//! stage runs the client request API instead.

mod body;
mod context;
mod ingress;
mod worker;

use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::http::Uri;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::error::PipelineError;

pub use body::MAX_BODY_BYTES;
pub use context::{prepare_queue, IngressContext, StageContext};
pub use ingress::ingress_router;
pub use worker::{run_task, worker_router, QUEUE_NAME_HEADER, TASK_NAME_HEADER};

/// Liveness body
pub fn running(service: &str) -> String {
    format!("\"{}\" service running", service)
}

async fn not_found(uri: Uri) -> PipelineError {
    PipelineError::NotFound(uri.path().to_string())
}

/// Serve `router` on an already bound listener until `shutdown` resolves
pub async fn serve_listener<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .with_context(|| format!("Server on {} failed", addr))
}

/// Bind `addr` and serve `router` until `shutdown` resolves
pub async fn serve<F>(router: Router, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    serve_listener(listener, router, shutdown).await
}

/// Fan-out of a single shutdown request to every server and loop in the process
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Resolves once shutdown was requested or the sender is gone
    pub async fn wait(mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Resolve on Ctrl-C
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_quotes_service_name() {
        assert_eq!(running("transcription"), "\"transcription\" service running");
    }

    #[tokio::test]
    async fn shutdown_reaches_every_clone() {
        let (tx, shutdown) = Shutdown::channel();
        let waiters: Vec<_> = (0..3).map(|_| tokio::spawn(shutdown.clone().wait())).collect();

        tx.send(true).unwrap();
        for waiter in waiters {
            waiter.await.unwrap();
        }
    }
}
