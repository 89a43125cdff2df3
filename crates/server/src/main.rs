//! Trellis daemon binary.
//!
//! Launches the per-area KvStore databases and the Decision engine,
//! subscribes the engine to the store's publication stream, and logs the
//! resulting route deltas. The FIB programmer, neighbor discovery, and
//! peer transport are external collaborators: discovery feeds peers in
//! through the store API, and a FIB agent would consume the route update
//! channel this binary drains into the log.
//!
//! # Usage
//!
//! ```bash
//! # Single area, plain text logs
//! trellisd --node-name node1
//!
//! # Multiple areas with flood rate limiting and Prometheus metrics
//! TRELLIS__AREAS=spine,pod1 trellisd \
//!     --node-name node1 --flood-msg-per-sec 500 --metrics-addr 0.0.0.0:9090
//! ```

mod config;
mod shutdown;

use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;
use trellis_decision::Decision;
use trellis_kvstore::{KvStore, LoopbackClientFactory};
use trellis_types::FacadeMetrics;

use config::{Cli, LogFormat};
use shutdown::{DaemonTasks, wait_for_signal};

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let kvstore_config = cli.kvstore_config()?;
    let decision_config = cli.decision_config()?;

    if let Some(metrics_addr) = cli.metrics_addr {
        PrometheusBuilder::new().with_http_listener(metrics_addr).install()?;
        tracing::info!(%metrics_addr, "prometheus exporter listening");
    }

    tracing::info!(
        node = %cli.node_name,
        areas = ?cli.areas,
        "starting trellis daemon"
    );

    let metrics = Arc::new(FacadeMetrics);
    let client_factory = Arc::new(LoopbackClientFactory::new());
    let store = KvStore::spawn(
        kvstore_config,
        cli.areas.iter().cloned(),
        client_factory.clone(),
        metrics.clone(),
    )?;
    store.register_loopback(&client_factory);
    let handle = store.handle();

    let mut tasks = DaemonTasks::new();

    // Wire the decision engine to the store's publication stream.
    let (route_updates_tx, mut route_updates_rx) = tokio::sync::mpsc::unbounded_channel();
    let engine = Decision::new(cli.node_name.clone(), decision_config, metrics);
    tasks.set_engine(engine.spawn(handle.subscribe(), route_updates_tx, tasks.stop_signal()));

    // Drain route deltas; a FIB programmer would sit here.
    let mut fib_stop = tasks.stop_signal();
    tasks.add_observer(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = fib_stop.recv() => break,
                update = route_updates_rx.recv() => {
                    let Some(update) = update else { break };
                    tracing::info!(
                        unicast_updates = update.unicast_to_update.len(),
                        unicast_deletes = update.unicast_to_delete.len(),
                        mpls_updates = update.mpls_to_update.len(),
                        mpls_deletes = update.mpls_to_delete.len(),
                        "route update ready for fib"
                    );
                }
            }
        }
    }));

    // Surface initialization progress.
    let mut init_events = handle.initialization_events();
    let mut init_stop = tasks.stop_signal();
    tasks.add_observer(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = init_stop.recv() => break,
                changed = init_events.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let event = *init_events.borrow();
                    tracing::info!(?event, "kvstore initialization event");
                }
            }
        }
    }));

    wait_for_signal().await;
    tracing::info!("shutting down");

    tasks.shutdown(store).await;
    Ok(())
}
