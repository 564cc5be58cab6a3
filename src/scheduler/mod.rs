//! Background loops: the crawl scheduler and the periodic post trim.
//!
//! Both follow the same lifecycle. `start` spawns the loop, `stop` signals
//! it and waits for it to exit. The loop only looks at the stop signal while
//! it is waiting between runs, so work already in progress always finishes.

mod crawl;
mod trim;

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::error;

pub use crawl::{CrawlScheduler, CrawlSettings, CycleReport, MAX_CONCURRENT_FEEDS};
pub use trim::TrimScheduler;

/// Receiving side of a stop request.
pub(crate) struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// Wait until `deadline`. Returns `true` if a stop was requested first.
    pub(crate) async fn stopped_before(&mut self, deadline: Instant) -> bool {
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        loop {
            if *self.0.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = &mut sleep => return false,
                changed = self.0.changed() => {
                    // A dropped sender counts as a stop.
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }
}

/// A spawned loop and the means to stop it.
pub(crate) struct Running {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Running {
    pub(crate) fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, rx) = watch::channel(false);
        let task = tokio::spawn(body(StopSignal(rx)));
        Self { stop, task }
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    pub(crate) async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!("background task ended abnormally: {}", e);
        }
    }
}
