use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::checker::Checker;

/// Periodic driver for [`Checker::check_and_push`].
pub struct Scheduler {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the timer task. The first cycle runs one `interval` after start.
    pub fn start(checker: Arc<Checker>, interval: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "auto check started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stopped.changed() => break,
                }
                if *stopped.borrow() {
                    break;
                }
                // a panicking cycle must not take the timer down with it
                let checker = checker.clone();
                let cycle = tokio::spawn(async move { checker.check_and_push().await });
                match cycle.await {
                    Ok(Ok(report)) => info!(updates = report.updates, "scheduled check done"),
                    Ok(Err(err)) => warn!(%err, "scheduled check skipped"),
                    Err(err) => error!(?err, "scheduled check aborted"),
                }
            }
            info!("auto check stopped");
        });
        Self { stop, handle }
    }

    /// Cancel the pending sleep and wait for the timer task to exit. A cycle
    /// that is already running is allowed to finish first.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.handle.await {
            error!(?err, "scheduler task failed");
        }
    }
}
