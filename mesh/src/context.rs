//! Process-scoped mesh context.
//!
//! Every long-lived component receives the same [`MeshContext`] at construction
//! and spawns its background tasks through it, so a single `stop()` cancels and
//! drains them all.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn, Instrument};

use crate::error::{MeshError, MeshResult};

#[derive(Debug)]
pub struct MeshContext {
    handle: Handle,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    stopped: AtomicBool,
}

impl MeshContext {
    /// Create a context bound to the current tokio runtime.
    pub fn new() -> MeshResult<Arc<Self>> {
        let handle = Handle::try_current()
            .map_err(|e| MeshError::Config(format!("mesh context needs a tokio runtime: {e}")))?;
        Ok(Self::with_handle(handle))
    }

    pub fn with_handle(handle: Handle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Token cancelled when the context stops. Components derive their own
    /// child tokens from it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Spawn a tracked task inside a span named after the component.
    pub fn spawn<F>(&self, name: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let span = tracing::info_span!("mesh_task", task = name);
        self.tasks.spawn_on(future.instrument(span), &self.handle)
    }

    /// Cancel every task spawned through this context and wait for them to
    /// finish, up to `grace`.
    pub async fn stop(&self, grace: Duration) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Stopping mesh context");
        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!(
                "{} mesh tasks still running after {:?}",
                self.tasks.len(),
                grace
            );
        }
    }
}
