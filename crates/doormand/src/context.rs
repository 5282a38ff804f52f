//! Shared daemon state and the background task spawner.

use crate::pending::PendingCache;
use doorman_core::{Config, IdentityStore, RecognitionEngine};
use doorman_hw::Relay;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Everything the capture loop, approval workflow and listener share.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub store: Arc<IdentityStore>,
    pub engine: Arc<RecognitionEngine>,
    pub relay: Arc<Relay>,
    pub pending: Arc<PendingCache>,
    pub tasks: Tasks,
}

/// Spawns fire-and-forget work onto the runtime, logging failures at the
/// task boundary.
#[derive(Clone)]
pub struct Tasks {
    handle: Handle,
}

impl Tasks {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Capture the runtime of the calling task.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn spawn<F, E>(&self, name: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let task = self.handle.spawn(future);
        self.handle.spawn(async move {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "background task failed"),
                Err(e) if e.is_panic() => tracing::error!(task = name, "background task panicked"),
                Err(_) => tracing::debug!(task = name, "background task cancelled"),
            }
        })
    }

    /// Run `f` to completion on the blocking pool.
    pub fn blocking<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.handle.spawn_blocking(f)
    }
}

/// Resolve once `signal` reads `true` or its sender is gone.
pub async fn stopped(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|stop| *stop).await;
}
