use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

// Periodic background job owned by whoever started it.
//
// Nothing is process-global: the loop lives until `stop` is awaited or
// the ticker is dropped. Runs on tokio time, so tests can drive it with
// `tokio::time::pause` / `advance`.
pub struct Ticker {
    name: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn start<F, Fut>(name: &'static str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately; skip it
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = interval.tick() => {
                        debug!(ticker = name, "tick");
                        job().await;
                    }
                }
            }
        });
        info!(ticker = name, period_ms = period.as_millis() as u64, "ticker started");
        Self {
            name,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    // Stop and wait for an in-progress tick to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!(ticker = self.name, "ticker stopped");
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
