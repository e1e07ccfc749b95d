//! Background decay worker.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};

use crate::decay::DecayScheduler;
use crate::error::{CounterError, CounterResult};

/// A named thread that runs a decay scan on every tick until stopped.
pub(crate) struct DecayWorker {
    shutdown: Sender<()>,
    join: JoinHandle<()>,
}

impl DecayWorker {
    pub(crate) fn start(scheduler: Arc<DecayScheduler>, interval: Duration) -> CounterResult<Self> {
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let join = thread::Builder::new()
            .name("kyrocount-decay".to_string())
            .spawn(move || {
                let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
                tracing::info!(interval_ms, "decay worker started");
                loop {
                    select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if scheduler.is_cancelled() {
                                break;
                            }
                            if let Err(err) = scheduler.run_once() {
                                tracing::warn!(error = %err, "decay scan failed");
                            }
                        }
                    }
                }
                tracing::info!("decay worker stopped");
            })
            .map_err(|e| CounterError::internal(format!("failed to spawn decay worker: {e}")))?;

        Ok(Self { shutdown, join })
    }

    /// Signal the thread and wait for it. A scan in progress notices the
    /// scheduler's cancellation flag, which the caller sets first.
    pub(crate) fn stop(self) {
        // Either the send wakes the select, or the disconnect does.
        let _ = self.shutdown.try_send(());
        drop(self.shutdown);
        if self.join.join().is_err() {
            tracing::error!("decay worker panicked");
        }
    }
}
