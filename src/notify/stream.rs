use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::error::{CounterError, CounterResult, ExecutionError};

use super::bus::NotificationBus;
use super::event::{SubscriptionId, TriggerFired};

/// A bounded stream of trigger notifications.
///
/// Dropping this stream unsubscribes it.
#[derive(Debug)]
pub struct TriggerStream {
    subscription_id: SubscriptionId,
    rx: Receiver<TriggerFired>,
    bus: Weak<NotificationBus>,
    unregistered: AtomicBool,
}

impl TriggerStream {
    pub(crate) fn new(subscription_id: SubscriptionId, rx: Receiver<TriggerFired>, bus: Weak<NotificationBus>) -> Self {
        Self {
            subscription_id,
            rx,
            bus,
            unregistered: AtomicBool::new(false),
        }
    }

    /// The subscription id backing this stream.
    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Explicit unsubscription. Idempotent; buffered events can still be read.
    pub fn unsubscribe(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.subscription_id);
        }
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> CounterResult<TriggerFired> {
        self.rx
            .recv()
            .map_err(|_| CounterError::Execution(ExecutionError::EngineStopped))
    }

    /// Receive the next event with a timeout.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    pub fn recv_timeout(&self, timeout: Duration) -> CounterResult<Option<TriggerFired>> {
        match self.rx.recv_timeout(timeout) {
            Ok(ev) => Ok(Some(ev)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CounterError::Execution(ExecutionError::EngineStopped)),
        }
    }

    /// Take an already buffered event, if any.
    pub fn try_recv(&self) -> CounterResult<Option<TriggerFired>> {
        match self.rx.try_recv() {
            Ok(ev) => Ok(Some(ev)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(CounterError::Execution(ExecutionError::EngineStopped)),
        }
    }

    /// Drain every buffered event.
    #[must_use]
    pub fn drain(&self) -> Vec<TriggerFired> {
        self.rx.try_iter().collect()
    }
}

impl Drop for TriggerStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
