//! Daemon task lifecycle and ordered shutdown.
//!
//! Trellis data flows KvStore → Decision → route observers, and teardown
//! walks the same direction: the per-area store loops stop first so no
//! further publications are produced and API calls fail fast, then the
//! stop broadcast drains the decision engine, then the observer tasks
//! behind it. This guarantees consumers only go away after their
//! producers have.

use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use trellis_kvstore::KvStore;

/// Waits for Ctrl-C or, on Unix, SIGTERM.
///
/// If a handler cannot be installed its signal is simply never observed;
/// the daemon keeps running on whichever signals remain rather than
/// refusing to start.
pub async fn wait_for_signal() {
    let interrupted = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::error!(%error, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminated = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    tokio::select! {
        _ = interrupted => tracing::info!("interrupt received, shutting down"),
        _ = terminated => tracing::info!("terminate received, shutting down"),
    }
}

/// Owns the daemon's task handles and tears them down in dependency
/// order.
pub struct DaemonTasks {
    stop_tx: broadcast::Sender<()>,
    engine: Option<JoinHandle<()>>,
    observers: Vec<JoinHandle<()>>,
}

impl DaemonTasks {
    /// Creates an empty task registry.
    pub fn new() -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self { stop_tx, engine: None, observers: Vec::new() }
    }

    /// A stop receiver for a task about to be registered.
    pub fn stop_signal(&self) -> broadcast::Receiver<()> {
        self.stop_tx.subscribe()
    }

    /// Registers the decision engine task. It drains before the
    /// observers consuming its route deltas.
    pub fn set_engine(&mut self, handle: JoinHandle<()>) {
        self.engine = Some(handle);
    }

    /// Registers an observer task (route-delta drain, event watchers).
    pub fn add_observer(&mut self, handle: JoinHandle<()>) {
        self.observers.push(handle);
    }

    /// Tears the daemon down in data-flow order.
    ///
    /// The store stops first: area loops abandon pending syncs, initiate
    /// no new flooding, and stop serving API calls. Only then are the
    /// engine and observers told to drain, so everything still in flight
    /// reaches its consumer.
    pub async fn shutdown(self, store: KvStore) {
        store.stop().await;
        let _ = self.stop_tx.send(());
        if let Some(engine) = self.engine {
            let _ = engine.await;
        }
        for observer in self.observers {
            let _ = observer.await;
        }
    }
}

impl Default for DaemonTasks {
    fn default() -> Self {
        Self::new()
    }
}
