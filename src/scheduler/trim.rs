use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::store::Store;

use super::{Running, StopSignal};

/// Deletes posts older than the retention window, once at start and then
/// on every interval.
pub struct TrimScheduler {
    store: Arc<Store>,
    interval: Duration,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl TrimScheduler {
    pub fn new(store: Arc<Store>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(Running::is_alive) {
            return Err(AppError::AlreadyRunning);
        }

        let store = Arc::clone(&self.store);
        let interval = self.interval;
        *running = Some(Running::spawn(move |stop| trim_loop(store, interval, stop)));
        info!("trimming every {:?}", interval);
        Ok(())
    }

    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.shutdown().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(Running::is_alive)
    }
}

async fn trim_loop(store: Arc<Store>, interval: Duration, mut stop: StopSignal) {
    loop {
        let next = Instant::now() + interval;
        // The store logs the failure itself.
        if let Err(e) = store.trim_expired().await {
            debug!("trim failed, retrying next interval: {}", e);
        }
        if stop.stopped_before(next).await {
            break;
        }
    }
}
