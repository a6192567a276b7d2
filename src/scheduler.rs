use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::db::Store;

/// Daily-reset scheduler: sleeps until the next UTC midnight, runs the
/// transactional counter reset, repeats. Not a cron; one loop per instance.
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn start(store: Store) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            loop {
                let wait = duration_until_next_utc_midnight(Utc::now());
                info!(
                    sleep_secs = wait.as_secs(),
                    "next daily reset scheduled"
                );

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        run_daily_reset(&store).await;
                    }
                    _ = shutdown_rx.changed() => {
                        info!("daily reset scheduler stopped");
                        return;
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_daily_reset(store: &Store) {
    let started = std::time::Instant::now();
    match store.reset_daily_counters().await {
        Ok(outcome) => {
            info!(
                users_reset = outcome.users_reset,
                users_unblocked = outcome.users_unblocked,
                counters_reset = outcome.counters_reset,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "daily reset completed"
            );
        }
        Err(e) => {
            error!(error = %e, "daily reset failed");
        }
    }
}

/// Time remaining until the next 00:00:00 UTC
pub fn duration_until_next_utc_midnight(now: DateTime<Utc>) -> std::time::Duration {
    let next_midnight = (now + ChronoDuration::days(1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc();
    (next_midnight - now)
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(0))
}
