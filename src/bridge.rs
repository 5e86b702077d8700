//! Blocking bridge over the async I/O runtime
//!
//! Callers on the application thread cannot await. [`SyncBridge::run_blocking`]
//! spawns the work on the runtime and parks the calling thread on a one-shot
//! channel until the work reports back exactly once.

use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use thiserror::Error;
use tracing::debug;

/// Name given to the runtime's worker threads
pub const IO_THREAD_NAME: &str = "mqtt-io";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to start the I/O runtime")]
    RuntimeStart(#[source] std::io::Error),
    #[error("Blocking call issued from inside the I/O runtime")]
    CalledFromRuntime,
    #[error("Async operation ended without reporting a result")]
    Abandoned,
    #[error("Failed to start the dispatch thread")]
    DispatcherStart(#[source] std::io::Error),
}

/// Runs async work to completion on behalf of a blocking caller
#[derive(Debug)]
pub struct SyncBridge {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl SyncBridge {
    /// Create a bridge that owns a multi-threaded runtime
    pub fn new(worker_threads: usize) -> Result<Self, BridgeError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(IO_THREAD_NAME)
            .enable_all()
            .build()
            .map_err(BridgeError::RuntimeStart)?;
        let handle = runtime.handle().clone();

        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    /// Create a bridge onto a runtime owned elsewhere
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            runtime: None,
            handle,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `work` on the runtime and block until it completes.
    ///
    /// There is no timeout: if `work` never completes the caller stays
    /// blocked. Bound the work itself when that matters.
    pub fn run_blocking<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<BridgeError> + Send + 'static,
    {
        // Blocking a runtime thread on work scheduled on that same runtime
        // can starve it
        if Handle::try_current().is_ok() {
            return Err(BridgeError::CalledFromRuntime.into());
        }

        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let result = work.await;
            if tx.send(result).is_err() {
                debug!("Blocking caller went away before the result arrived");
            }
        });

        match rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Abandoned.into()),
        }
    }
}

impl Drop for SyncBridge {
    fn drop(&mut self) {
        // shutdown_background never blocks, so dropping the bridge is safe
        // from any context
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
