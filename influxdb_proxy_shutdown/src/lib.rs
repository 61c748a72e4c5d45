//! Ordered shutdown of the proxy process.
//!
//! The proxy has two halves that must stop in order. The HTTP frontend accepts writes and
//! queries; the cluster behind it owns routing tasks that may still be forwarding rows to
//! backends, a statistics loop, and the backend handles themselves. When a signal arrives the
//! cluster side is told first via [`ShutdownToken::wait_for_shutdown`], drains its in-flight work,
//! and acknowledges with [`ShutdownToken::complete`]. Only once every registered component has
//! completed does [`ShutdownManager::join`] cancel the frontend token, which lets the HTTP server
//! finish its graceful shutdown.
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::info;

/// Wait for a `SIGTERM` or `SIGINT` on UNIX systems.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
    }
    Ok(())
}

/// Wait for a `ctrl+c` on Windows systems.
#[cfg(windows)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received SIGINT");
    Ok(())
}

/// Coordinates shutdown between the cluster components and the HTTP frontend.
#[derive(Debug)]
pub struct ShutdownManager {
    frontend_shutdown: CancellationToken,
    backend_shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownManager {
    /// Create a [`ShutdownManager`] that cancels `frontend_shutdown` once every registered
    /// component has completed.
    pub fn new(frontend_shutdown: CancellationToken) -> Self {
        Self {
            frontend_shutdown,
            backend_shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Create a [`ShutdownManager`] with its own frontend token, for tests.
    pub fn new_testing() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Register a component that must finish work before the frontend stops.
    ///
    /// The caller must invoke [`complete`][ShutdownToken::complete] on the returned token or
    /// [`join`][Self::join] never resolves.
    pub fn register(&self) -> ShutdownToken {
        let (tx, rx) = oneshot::channel();
        self.tasks.spawn(rx);
        ShutdownToken::new(self.backend_shutdown.clone(), tx)
    }

    /// Wait for all registered components, then signal the frontend.
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.frontend_shutdown.cancel();
    }

    /// Begin shutdown by waking every registered component.
    pub fn shutdown(&self) {
        self.backend_shutdown.cancel();
    }

    /// The token the frontend waits on.
    pub fn frontend_token(&self) -> CancellationToken {
        self.frontend_shutdown.clone()
    }
}

/// Handle given to a component by [`ShutdownManager::register`].
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    token: CancellationToken,
    complete_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownToken {
    fn new(token: CancellationToken, complete_tx: oneshot::Sender<()>) -> Self {
        Self {
            token,
            complete_tx: Arc::new(Mutex::new(Some(complete_tx))),
        }
    }

    /// Ask the whole process to shut down, e.g. after an unrecoverable error.
    pub fn trigger_shutdown(&self) {
        self.token.cancel();
    }

    /// Resolves once shutdown has begun.
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Whether shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Tell the [`ShutdownManager`] this component is done. Later calls are no-ops.
    pub fn complete(&self) {
        if let Some(s) = self.complete_tx.lock().take() {
            let _ = s.send(());
        }
    }
}
