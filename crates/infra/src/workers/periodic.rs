use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handle to stop and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the current tick to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(worker = self.name, error = %e, "worker task ended abnormally");
            }
        }
    }
}

/// Runs a tick function on a fixed interval until shut down.
///
/// A slow tick delays the next one instead of bursting to catch up. Tick
/// errors are logged and the loop carries on.
#[derive(Debug)]
pub struct PeriodicWorker;

impl PeriodicWorker {
    pub fn spawn<F, Fut, T, E>(name: &'static str, every: Duration, mut tick: F) -> WorkerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: core::fmt::Debug + Send + 'static,
        E: core::fmt::Display + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(worker = name, every_ms = every.as_millis() as u64, "worker started");

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match tick().await {
                            Ok(outcome) => debug!(worker = name, ?outcome, "tick complete"),
                            Err(err) => warn!(worker = name, error = %err, "tick failed"),
                        }
                    }
                }
            }
            info!(worker = name, "worker stopped");
        });

        WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticks_until_shutdown_and_survives_errors() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = PeriodicWorker::spawn("test", Duration::from_millis(100), move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n % 2 == 0 { Err(format!("tick {n} failed")) } else { Ok(n) }
            }
        });

        tokio::time::sleep(Duration::from_millis(450)).await;
        handle.shutdown().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 4, "only {seen} ticks");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
