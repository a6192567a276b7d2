use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::{Store, UsageRow};
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy)]
pub struct MetricsWorkerConfig {
    pub buffer_size: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for MetricsWorkerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            batch_size: 50,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Single background consumer of a bounded usage-row queue. The producer
/// side never blocks: a full queue drops the row, because live request
/// latency must not depend on metrics persistence.
pub struct MetricsWorker {
    tx: mpsc::Sender<UsageRow>,
    shutdown_tx: watch::Sender<bool>,
    pending: Mutex<Option<Pending>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Pending {
    store: Store,
    config: MetricsWorkerConfig,
    rx: mpsc::Receiver<UsageRow>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MetricsWorker {
    pub fn new(store: Store, config: MetricsWorkerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            tx,
            shutdown_tx,
            pending: Mutex::new(Some(Pending {
                store,
                config,
                rx,
                shutdown_rx,
            })),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the consumer loop. Call once after construction.
    pub fn start(&self) {
        let Some(pending) = self.pending.lock().unwrap().take() else {
            return;
        };
        let handle = tokio::spawn(run(
            pending.store,
            pending.config,
            pending.rx,
            pending.shutdown_rx,
        ));
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Non-blocking enqueue; a full queue drops the row
    pub fn record(&self, row: UsageRow) -> Result<(), GatewayError> {
        self.tx.try_send(row).map_err(|_| GatewayError::DropMetric)
    }

    /// Stop the consumer: drain the queue, flush the final batch, exit
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("metrics worker stopped");
    }
}

async fn run(
    store: Store,
    config: MetricsWorkerConfig,
    mut rx: mpsc::Receiver<UsageRow>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut batch: Vec<UsageRow> = Vec::with_capacity(config.batch_size);
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            maybe_row = rx.recv() => {
                match maybe_row {
                    Some(row) => {
                        batch.push(row);
                        if batch.len() >= config.batch_size {
                            flush_batch(&store, &mut batch).await;
                        }
                    }
                    None => {
                        flush_batch(&store, &mut batch).await;
                        return;
                    }
                }
            }

            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush_batch(&store, &mut batch).await;
                }
            }

            _ = shutdown_rx.changed() => {
                while let Ok(row) = rx.try_recv() {
                    batch.push(row);
                }
                flush_batch(&store, &mut batch).await;
                return;
            }
        }
    }
}

/// Write each row individually; per-row failures are logged and the batch
/// continues. Durability is best-effort by design.
async fn flush_batch(store: &Store, batch: &mut Vec<UsageRow>) {
    if batch.is_empty() {
        return;
    }

    let mut success = 0usize;
    let mut failed = 0usize;
    for row in batch.drain(..) {
        match store.insert_metric(&row).await {
            Ok(()) => success += 1,
            Err(e) => {
                error!(request_id = %row.request_id, error = %e, "failed to insert usage row");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        warn!(success, failed, "usage batch flushed with errors");
    } else {
        info!(success, "usage batch flushed");
    }
}
